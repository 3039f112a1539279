use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::arch::dpu::DpuOptions;
use crate::arch::profile::Generation;
use crate::simulator::sim::mode::{SimConfig, StepMode, TargetSource};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

/// 环境变量前缀，例如 DPUSIM_SIMULATION__THREADS=4
const ENV_PREFIX: &str = "DPUSIM";

/// 模拟配置部分
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulationSection {
  #[serde(default = "default_target")]
  pub target: String,
  #[serde(default)]
  pub quiet: bool,
  #[serde(default)]
  pub step_mode: bool,
  #[serde(default)]
  pub trace_file: String,
  #[serde(default)]
  pub output_file: String,
  /// 0 表示使用 rayon 默认线程数
  #[serde(default)]
  pub threads: usize,
  #[serde(default)]
  pub double_write_check: bool,
  #[serde(default = "default_ddr_line_width")]
  pub ddr_line_width: usize,
}

fn default_target() -> String {
  "XV2DPU".to_string()
}

fn default_ddr_line_width() -> usize {
  16
}

impl Default for SimulationSection {
  fn default() -> Self {
    Self {
      target: default_target(),
      quiet: false,
      step_mode: false,
      trace_file: String::new(),
      output_file: String::new(),
      threads: 0,
      double_write_check: false,
      ddr_line_width: default_ddr_line_width(),
    }
  }
}

/// 目标硬件部分
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TargetSection {
  /// 非空时用该TOML文件替换内置的硬件描述
  #[serde(default)]
  pub profile_file: String,
}

/// 统一的应用配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
  #[serde(default)]
  pub simulation: SimulationSection,
  #[serde(default)]
  pub target: TargetSection,
}

impl AppConfig {
  pub fn to_sim_config(&self) -> SimConfig {
    let path = |s: &str| if s.is_empty() { None } else { Some(PathBuf::from(s)) };
    let s = &self.simulation;
    SimConfig {
      target: match path(&self.target.profile_file) {
        Some(file) => TargetSource::File(file),
        None => TargetSource::Builtin(s.target.clone()),
      },
      quiet: s.quiet,
      step_mode: if s.step_mode { StepMode::Step } else { StepMode::Continuous },
      trace_file: path(&s.trace_file),
      output_file: path(&s.output_file),
      dpu: DpuOptions {
        threads: s.threads,
        double_write_check: s.double_write_check,
        ddr_line_width: s.ddr_line_width,
      },
    }
  }
}

/// 命令行可覆写的选项
#[derive(Debug, Clone, Default)]
pub struct CliOverrides<'a> {
  pub quiet: bool,
  pub step: bool,
  pub target: Option<&'a str>,
  pub trace_file: Option<&'a str>,
  pub output_file: Option<&'a str>,
  pub threads: Option<usize>,
  pub double_write_check: bool,
}

fn invalid(msg: String) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// 加载内置的default.toml
pub fn load_default_config() -> io::Result<AppConfig> {
  parse_config(DEFAULT_CONFIG)
}

fn parse_config(content: &str) -> io::Result<AppConfig> {
  toml::from_str::<AppConfig>(content).map_err(|e| invalid(format!("解析TOML配置失败: {}", e)))
}

/// 从指定文件加载配置
pub fn load_config_file(path: &Path) -> io::Result<AppConfig> {
  let content = fs::read_to_string(path)
    .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("无法读取配置文件 {:?}: {}", path, e)))?;
  parse_config(&content)
}

/// 合并两个配置（后者覆盖前者）
pub fn merge_config(mut base: AppConfig, override_config: AppConfig) -> AppConfig {
  let o = override_config.simulation;
  if !o.target.is_empty() {
    base.simulation.target = o.target;
  }
  if o.quiet {
    base.simulation.quiet = true;
  }
  if o.step_mode {
    base.simulation.step_mode = true;
  }
  if !o.trace_file.is_empty() {
    base.simulation.trace_file = o.trace_file;
  }
  if !o.output_file.is_empty() {
    base.simulation.output_file = o.output_file;
  }
  if o.threads != 0 {
    base.simulation.threads = o.threads;
  }
  if o.double_write_check {
    base.simulation.double_write_check = true;
  }
  if o.ddr_line_width != default_ddr_line_width() {
    base.simulation.ddr_line_width = o.ddr_line_width;
  }
  if !override_config.target.profile_file.is_empty() {
    base.target.profile_file = override_config.target.profile_file;
  }
  base
}

/// 应用环境变量覆写（DPUSIM_<SECTION>__<KEY>）
pub fn apply_env_overrides(config: AppConfig) -> io::Result<AppConfig> {
  let layered = ::config::Config::builder()
    .add_source(::config::Config::try_from(&config).map_err(|e| invalid(format!("序列化配置失败: {}", e)))?)
    .add_source(::config::Environment::with_prefix(ENV_PREFIX).prefix_separator("_").separator("__").try_parsing(true))
    .build()
    .map_err(|e| invalid(format!("读取环境变量配置失败: {}", e)))?;
  layered
    .try_deserialize::<AppConfig>()
    .map_err(|e| invalid(format!("环境变量配置无效: {}", e)))
}

/// 应用CLI参数覆写配置
pub fn apply_cli_overrides(config: &mut AppConfig, cli: &CliOverrides<'_>) {
  if cli.quiet {
    config.simulation.quiet = true;
  }
  if cli.step {
    config.simulation.step_mode = true;
  }
  if let Some(target) = cli.target {
    config.simulation.target = target.to_string();
  }
  if let Some(file) = cli.trace_file {
    config.simulation.trace_file = file.to_string();
  }
  if let Some(file) = cli.output_file {
    config.simulation.output_file = file.to_string();
  }
  if let Some(threads) = cli.threads {
    config.simulation.threads = threads;
  }
  if cli.double_write_check {
    config.simulation.double_write_check = true;
  }
}

/// 验证配置
pub fn validate_config(config: &AppConfig) -> io::Result<()> {
  // 使用外部硬件描述文件时不检查目标名
  if config.target.profile_file.is_empty() {
    Generation::from_name(&config.simulation.target)
      .map_err(|_| invalid(format!("unsupported target: {}", config.simulation.target)))?;
  }
  if config.simulation.ddr_line_width == 0 {
    return Err(invalid("ddr_line_width must be greater than 0".to_string()));
  }
  Ok(())
}

/// 补全相对路径（相对于工作根目录）
pub fn resolve_paths(config: &mut AppConfig, root: &Path) -> io::Result<()> {
  config.simulation.trace_file = resolve_single_path(&config.simulation.trace_file, root)?;
  config.simulation.output_file = resolve_single_path(&config.simulation.output_file, root)?;
  config.target.profile_file = resolve_single_path(&config.target.profile_file, root)?;
  Ok(())
}

/// 补全单个路径
fn resolve_single_path(path_str: &str, root: &Path) -> io::Result<String> {
  if path_str.is_empty() {
    return Ok(path_str.to_string());
  }

  let path = Path::new(path_str);

  // 如果已经是绝对路径，直接返回
  if path.is_absolute() {
    return Ok(path_str.to_string());
  }

  Ok(root.join(path).to_string_lossy().to_string())
}

/// 加载并合并配置
///
/// 流程：
/// 1. 加载默认配置
/// 2. 如果提供了自定义配置文件，加载并合并
/// 3. 应用环境变量覆写
/// 4. 应用CLI参数覆写
/// 5. 补全相对路径
/// 6. 验证配置
pub fn load_and_merge_configs(
  custom_config_path: Option<&str>,
  root: &Path,
  cli: &CliOverrides<'_>,
) -> io::Result<AppConfig> {
  let mut config = load_default_config()?;

  if let Some(custom_path) = custom_config_path {
    let custom_path_buf = PathBuf::from(custom_path);
    let custom_path_abs = if custom_path_buf.is_absolute() {
      custom_path_buf
    } else {
      root.join(&custom_path_buf)
    };

    let custom_config = load_config_file(&custom_path_abs)?;
    config = merge_config(config, custom_config);
  }

  let mut config = apply_env_overrides(config)?;

  apply_cli_overrides(&mut config, cli);

  resolve_paths(&mut config, root)?;

  validate_config(&config)?;

  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn embedded_defaults() {
    let cfg = load_default_config().unwrap();
    assert_eq!(cfg.simulation.target, "XV2DPU");
    assert_eq!(cfg.simulation.ddr_line_width, 16);
    assert!(cfg.target.profile_file.is_empty());
    validate_config(&cfg).unwrap();
  }

  #[test]
  fn file_then_cli() {
    let user = parse_config("[simulation]\ntarget = \"XV3DPU\"\nthreads = 2\n").unwrap();
    let mut cfg = merge_config(load_default_config().unwrap(), user);
    assert_eq!((cfg.simulation.target.as_str(), cfg.simulation.threads), ("XV3DPU", 2));
    apply_cli_overrides(&mut cfg, &CliOverrides { target: Some("DPUV2"), step: true, ..Default::default() });
    let sim = cfg.to_sim_config();
    assert_eq!(sim.target, TargetSource::Builtin("DPUV2".into()));
    assert_eq!(sim.step_mode, StepMode::Step);
    assert_eq!(sim.dpu.threads, 2);
  }

  #[test]
  fn paths_resolve_against_root() {
    let mut cfg = AppConfig::default();
    cfg.simulation.trace_file = "out/trace.jsonl".into();
    cfg.simulation.output_file = "/tmp/regions.json".into();
    resolve_paths(&mut cfg, Path::new("/work")).unwrap();
    assert_eq!(cfg.simulation.trace_file, "/work/out/trace.jsonl");
    assert_eq!(cfg.simulation.output_file, "/tmp/regions.json");
  }

  #[test]
  fn unknown_target_is_rejected() {
    let mut cfg = AppConfig::default();
    cfg.simulation.target = "TPU".into();
    assert!(validate_config(&cfg).is_err());
    cfg.target.profile_file = "custom.toml".into();
    assert!(validate_config(&cfg).is_ok());
  }
}
