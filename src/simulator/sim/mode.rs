use std::path::PathBuf;

use crate::arch::dpu::DpuOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
  Continuous,
  Step,
}

/// Where the Variant Profile comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSource {
  Builtin(String),
  File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SimConfig {
  pub target: TargetSource,
  pub quiet: bool,
  pub step_mode: StepMode,
  pub trace_file: Option<PathBuf>,
  pub output_file: Option<PathBuf>,
  pub dpu: DpuOptions,
}

impl Default for SimConfig {
  fn default() -> Self {
    Self {
      target: TargetSource::Builtin("XV2DPU".to_string()),
      quiet: false,
      step_mode: StepMode::Continuous,
      trace_file: None,
      output_file: None,
      dpu: DpuOptions::default(),
    }
  }
}
