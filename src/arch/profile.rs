//! Hardware Variant Profiles: per-generation constants and capabilities.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::check;
use crate::error::{DpuError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Generation {
  Dpuv2,
  Xvdpu,
  Xv2dpu,
  Xv3dpu,
}

impl Generation {
  pub const ALL: [Generation; 4] = [Generation::Dpuv2, Generation::Xvdpu, Generation::Xv2dpu, Generation::Xv3dpu];

  pub fn name(self) -> &'static str {
    match self {
      Generation::Dpuv2 => "DPUV2",
      Generation::Xvdpu => "XVDPU",
      Generation::Xv2dpu => "XV2DPU",
      Generation::Xv3dpu => "XV3DPU",
    }
  }

  pub fn from_name(name: &str) -> Result<Self> {
    Self::ALL
      .into_iter()
      .find(|g| g.name().eq_ignore_ascii_case(name))
      .ok_or_else(|| DpuError::Config(format!("unknown target generation {}", name)))
  }

  /// Address-list indirection instead of direct bank-stride addressing.
  pub fn is_tiled(self) -> bool {
    matches!(self, Generation::Xv2dpu | Generation::Xv3dpu)
  }
}

impl std::fmt::Display for Generation {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecMode {
  Dwcv,
  Prelu,
  Avepool,
  Maxpool,
  Leakyrelu,
  Maxreduce,
  Dwcvb0,
  Hsigmoid,
  Dwcvw16b0,
  Macc,
  Comp,
  ElewAdd,
  ElewMul,
  InstancenormFirst,
  InstancenormSecond,
  Layernorm,
  Reduction,
  ElewDiv,
  L2norm,
}

impl ExecMode {
  const TABLE: [ExecMode; 19] = [
    ExecMode::Dwcv,
    ExecMode::Prelu,
    ExecMode::Avepool,
    ExecMode::Maxpool,
    ExecMode::Leakyrelu,
    ExecMode::Maxreduce,
    ExecMode::Dwcvb0,
    ExecMode::Hsigmoid,
    ExecMode::Dwcvw16b0,
    ExecMode::Macc,
    ExecMode::Comp,
    ExecMode::ElewAdd,
    ExecMode::ElewMul,
    ExecMode::InstancenormFirst,
    ExecMode::InstancenormSecond,
    ExecMode::Layernorm,
    ExecMode::Reduction,
    ExecMode::ElewDiv,
    ExecMode::L2norm,
  ];

  pub fn from_code(code: i64) -> Result<Self> {
    usize::try_from(code)
      .ok()
      .and_then(|i| Self::TABLE.get(i).copied())
      .ok_or_else(|| DpuError::param(format!("exec_mode {} outside the mode taxonomy", code)))
  }

  pub fn code(self) -> i64 {
    self as i64
  }

  pub fn is_elew(self) -> bool {
    matches!(self, ExecMode::ElewAdd | ExecMode::ElewMul | ExecMode::ElewDiv)
  }

  pub fn is_instnorm(self) -> bool {
    matches!(self, ExecMode::InstancenormFirst | ExecMode::InstancenormSecond)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActType {
  None,
  Relu,
  Prelu,
  LeakyRelu,
  Relu6,
  Hsigmoid,
  Hswish,
}

impl ActType {
  pub fn from_code(code: i64) -> Result<Self> {
    Ok(match code {
      0 => ActType::None,
      1 => ActType::Relu,
      2 => ActType::Prelu,
      3 => ActType::LeakyRelu,
      4 => ActType::Relu6,
      5 => ActType::Hsigmoid,
      6 => ActType::Hswish,
      _ => return Err(DpuError::param(format!("act_type {} outside the activation taxonomy", code))),
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadType {
  Zero,
  Min,
}

impl PadType {
  pub fn from_code(code: i64) -> Result<Self> {
    match code {
      0 => Ok(PadType::Zero),
      1 => Ok(PadType::Min),
      _ => Err(DpuError::param(format!("pad_type {} is neither ZERO nor MIN", code))),
    }
  }
}

/// A run of banks sharing geometry; ids are `base_id..base_id + bank_num`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankGroup {
  pub name: String,
  pub base_id: u32,
  pub bank_num: u32,
  pub width: usize,
  pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parallel {
  pub pixel_parallel: usize,
  pub channel_parallel: usize,
  #[serde(default)]
  pub output_w_parallel: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvEngine {
  pub pixel_parallel: usize,
  pub input_channel_parallel: usize,
  pub output_channel_parallel: usize,
  pub weight_bank: String,
  pub bias_bank: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AluEngine {
  pub pixel_parallel: usize,
  pub channel_parallel: usize,
  pub weight_bank: String,
  pub bias_bank: String,
  #[serde(default)]
  pub nonlinear: Vec<ActType>,
}

/// Engine tables of the newest generation, indexed by `aie_mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiledEngines {
  pub dwconv_weight_bank: String,
  pub norm_weight_bank: String,
  /// Output channels per core, indexed by core mode.
  pub core_ocp: Vec<usize>,
  pub dwconv: Vec<Parallel>,
  pub pool: Vec<Parallel>,
  pub eltwise: Vec<Parallel>,
  pub norm: Vec<Parallel>,
  pub reduce: Parallel,
  pub l2norm: Parallel,
}

impl TiledEngines {
  pub fn mode(table: &[Parallel], aie_mode: i64, what: &str) -> Result<Parallel> {
    usize::try_from(aie_mode)
      .ok()
      .and_then(|i| table.get(i).copied())
      .ok_or_else(|| DpuError::param(format!("aie_mode {} has no {} parallel entry", aie_mode, what)))
  }

  pub fn core(&self, core_mode: usize) -> Result<usize> {
    self
      .core_ocp
      .get(core_mode)
      .copied()
      .filter(|&c| c > 0)
      .ok_or_else(|| DpuError::Config(format!("core mode {} not declared", core_mode)))
  }
}

/// Optional white-lists; an empty list leaves the check off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhiteLists {
  #[serde(default, rename = "alu-in")]
  pub alu_in: Vec<u32>,
  #[serde(default, rename = "alu-out")]
  pub alu_out: Vec<u32>,
  #[serde(default, rename = "alu-kernel")]
  pub alu_kernel: Vec<u32>,
  #[serde(default, rename = "alu-stride")]
  pub alu_stride: Vec<u32>,
  #[serde(default, rename = "load-out")]
  pub load_out: Vec<u32>,
}

impl WhiteLists {
  pub fn allows(list: &[u32], value: u32) -> bool {
    list.is_empty() || list.contains(&value)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
  pub name: String,
  pub generation: Generation,
  pub image_bank: String,
  pub mean_value_bank: String,
  pub exec_modes: Vec<ExecMode>,
  pub bank_groups: Vec<BankGroup>,
  pub conv: ConvEngine,
  pub alu: AluEngine,
  #[serde(default)]
  pub tiled: Option<TiledEngines>,
  #[serde(default)]
  pub white_lists: WhiteLists,
}

fn group(name: &str, base_id: u32, bank_num: u32, width: usize, depth: usize) -> BankGroup {
  BankGroup { name: name.to_string(), base_id, bank_num, width, depth }
}

fn par(pixel_parallel: usize, channel_parallel: usize, output_w_parallel: usize) -> Parallel {
  Parallel { pixel_parallel, channel_parallel, output_w_parallel }
}

const LEGACY_MODES: [ExecMode; 9] = [
  ExecMode::Dwcv,
  ExecMode::Prelu,
  ExecMode::Avepool,
  ExecMode::Maxpool,
  ExecMode::Leakyrelu,
  ExecMode::Maxreduce,
  ExecMode::Dwcvb0,
  ExecMode::Hsigmoid,
  ExecMode::Dwcvw16b0,
];

impl Profile {
  pub fn builtin(generation: Generation) -> Self {
    match generation {
      Generation::Dpuv2 => Self::legacy(generation, 8, 16, 2048, &LEGACY_MODES[..7]),
      Generation::Xvdpu => Self::legacy(generation, 8, 32, 4096, &LEGACY_MODES),
      Generation::Xv2dpu => Self::xv2dpu(),
      Generation::Xv3dpu => Self::xv3dpu(),
    }
  }

  fn legacy(generation: Generation, pp: usize, cp: usize, depth: usize, modes: &[ExecMode]) -> Self {
    let img = pp as u32 * 2;
    Profile {
      name: generation.name().to_string(),
      generation,
      bank_groups: vec![
        group("IMG", 0, img, cp, depth),
        group("CONVW", img, 1, cp * 2, depth),
        group("CONVB", img + 1, 1, cp, 256),
        group("DWCVW", img + 2, 1, cp, depth),
        group("DWCVB", img + 3, 1, cp, 256),
        group("MEAN", img + 4, 1, cp, 4),
      ],
      image_bank: "IMG".into(),
      mean_value_bank: "MEAN".into(),
      conv: ConvEngine {
        pixel_parallel: pp,
        input_channel_parallel: cp,
        output_channel_parallel: cp,
        weight_bank: "CONVW".into(),
        bias_bank: "CONVB".into(),
      },
      alu: AluEngine {
        pixel_parallel: pp,
        channel_parallel: cp,
        weight_bank: "DWCVW".into(),
        bias_bank: "DWCVB".into(),
        nonlinear: vec![ActType::Relu, ActType::LeakyRelu, ActType::Relu6],
      },
      tiled: None,
      exec_modes: modes.to_vec(),
      white_lists: WhiteLists::default(),
    }
  }

  fn xv2dpu() -> Self {
    Profile {
      name: "XV2DPU".into(),
      generation: Generation::Xv2dpu,
      bank_groups: vec![
        group("IMG", 0, 1, 16, 65536),
        group("WGT", 1, 4, 16, 4096),
        group("MEAN", 5, 1, 16, 4),
      ],
      image_bank: "IMG".into(),
      mean_value_bank: "MEAN".into(),
      conv: ConvEngine {
        pixel_parallel: 8,
        input_channel_parallel: 32,
        output_channel_parallel: 32,
        weight_bank: "WGT".into(),
        bias_bank: "WGT".into(),
      },
      alu: AluEngine {
        pixel_parallel: 4,
        channel_parallel: 32,
        weight_bank: "WGT".into(),
        bias_bank: "WGT".into(),
        nonlinear: vec![ActType::Relu, ActType::LeakyRelu, ActType::Relu6, ActType::Hsigmoid, ActType::Hswish],
      },
      tiled: None,
      exec_modes: vec![ExecMode::Macc, ExecMode::Comp, ExecMode::ElewAdd, ExecMode::ElewMul],
      white_lists: WhiteLists { alu_in: vec![0], alu_out: vec![0], ..Default::default() },
    }
  }

  fn xv3dpu() -> Self {
    Profile {
      name: "XV3DPU".into(),
      generation: Generation::Xv3dpu,
      bank_groups: vec![
        group("IMG", 0, 1, 32, 65536),
        group("WGT", 1, 4, 32, 8192),
        group("MEAN", 5, 1, 32, 2),
      ],
      image_bank: "IMG".into(),
      mean_value_bank: "MEAN".into(),
      conv: ConvEngine {
        pixel_parallel: 8,
        input_channel_parallel: 64,
        output_channel_parallel: 64,
        weight_bank: "WGT".into(),
        bias_bank: "WGT".into(),
      },
      alu: AluEngine {
        pixel_parallel: 4,
        channel_parallel: 32,
        weight_bank: "WGT".into(),
        bias_bank: "WGT".into(),
        nonlinear: vec![ActType::Relu, ActType::LeakyRelu, ActType::Relu6, ActType::Hsigmoid, ActType::Hswish],
      },
      tiled: Some(TiledEngines {
        dwconv: vec![par(4, 16, 8), par(4, 32, 8)],
        pool: vec![par(4, 16, 8), par(4, 32, 8)],
        eltwise: vec![par(4, 32, 8), par(4, 64, 8)],
        norm: vec![par(4, 32, 8)],
        reduce: par(4, 64, 8),
        l2norm: par(4, 32, 8),
        core_ocp: vec![32, 8, 32],
        dwconv_weight_bank: "WGT".into(),
        norm_weight_bank: "WGT".into(),
      }),
      exec_modes: vec![
        ExecMode::Macc,
        ExecMode::Comp,
        ExecMode::ElewAdd,
        ExecMode::ElewMul,
        ExecMode::ElewDiv,
        ExecMode::InstancenormFirst,
        ExecMode::InstancenormSecond,
        ExecMode::Reduction,
        ExecMode::L2norm,
      ],
      white_lists: WhiteLists { alu_in: vec![0], alu_out: vec![0], ..Default::default() },
    }
  }

  /// Read a profile replacing the built-in one of its generation.
  pub fn from_toml_file(path: &Path) -> Result<Self> {
    let text = std::fs::read_to_string(path)
      .map_err(|e| DpuError::Config(format!("cannot read profile {:?}: {}", path, e)))?;
    Self::from_toml_str(&text)
  }

  pub fn from_toml_str(text: &str) -> Result<Self> {
    let profile: Profile =
      toml::from_str(text).map_err(|e| DpuError::Config(format!("profile TOML: {}", e)))?;
    profile.validate()?;
    Ok(profile)
  }

  pub fn validate(&self) -> Result<()> {
    let has = |name: &str| self.bank_groups.iter().any(|g| g.name == name);
    for name in [
      &self.image_bank,
      &self.mean_value_bank,
      &self.conv.weight_bank,
      &self.conv.bias_bank,
      &self.alu.weight_bank,
      &self.alu.bias_bank,
    ] {
      check!(has(name), DpuError::Config(format!("{}: bank group {} not declared", self.name, name)));
    }
    check!(
      self.alu.pixel_parallel > 0 && self.alu.channel_parallel > 0 && self.conv.pixel_parallel > 0,
      DpuError::Config(format!("{}: zero parallelism", self.name))
    );
    if self.generation == Generation::Xv3dpu {
      let tiled = self
        .tiled
        .as_ref()
        .ok_or_else(|| DpuError::Config(format!("{}: missing tiled engine tables", self.name)))?;
      for name in [&tiled.dwconv_weight_bank, &tiled.norm_weight_bank] {
        check!(has(name), DpuError::Config(format!("{}: bank group {} not declared", self.name, name)));
      }
    }
    Ok(())
  }

  pub fn supports(&self, mode: ExecMode) -> bool {
    self.exec_modes.contains(&mode)
  }

  /// Range check then support check of a raw `exec_mode` field.
  pub fn exec_mode(&self, code: i64) -> Result<ExecMode> {
    let mode = ExecMode::from_code(code)?;
    check!(
      self.supports(mode),
      DpuError::unsupported(format!("exec_mode {:?}", mode), self.name.clone())
    );
    Ok(mode)
  }

  pub fn supports_act(&self, act: ActType) -> bool {
    act == ActType::None || self.alu.nonlinear.contains(&act)
  }

  pub fn tiled(&self) -> Result<&TiledEngines> {
    self
      .tiled
      .as_ref()
      .ok_or_else(|| DpuError::Config(format!("{}: no tiled engine tables", self.name)))
  }

  pub fn group(&self, name: &str) -> Result<&BankGroup> {
    self
      .bank_groups
      .iter()
      .find(|g| g.name == name)
      .ok_or_else(|| DpuError::Config(format!("{}: bank group {} not declared", self.name, name)))
  }

  pub fn total_banks(&self) -> u32 {
    self.bank_groups.iter().map(|g| g.bank_num).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builtins_validate() {
    for g in Generation::ALL {
      let p = Profile::builtin(g);
      p.validate().unwrap();
      assert_eq!(p.generation, g);
    }
  }

  #[test]
  fn exec_mode_range_then_support() {
    let p = Profile::builtin(Generation::Xv2dpu);
    assert!(matches!(p.exec_mode(19), Err(DpuError::Parameter { .. })));
    assert!(matches!(p.exec_mode(16), Err(DpuError::Unsupported { .. })));
    assert_eq!(p.exec_mode(9).unwrap(), ExecMode::Macc);
  }

  #[test]
  fn profile_round_trips_through_toml() {
    let p = Profile::builtin(Generation::Xv3dpu);
    let text = toml::to_string(&p).unwrap();
    let back = Profile::from_toml_str(&text).unwrap();
    assert_eq!(back, p);
  }

  #[test]
  fn generation_names() {
    assert_eq!(Generation::from_name("xv2dpu").unwrap(), Generation::Xv2dpu);
    assert!(Generation::from_name("dpuv9").is_err());
    assert!(Generation::Xv3dpu.is_tiled());
    assert!(!Generation::Dpuv2.is_tiled());
  }
}
