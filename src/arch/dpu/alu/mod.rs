//! The miscellaneous compute engine.
//!
//! Every compute instruction runs the same five stages; what each stage does
//! depends on the hardware variant, see [`ComputeVariant`].

mod config;
pub mod kernels;
mod legacy;
mod tiled;

use log::debug;

pub use config::{AddrEntry, AddrType, Claim, ConfigSlot, SharedComputeConfig, MAX_INPUTS};
pub use legacy::DirectAlu;
pub use tiled::{RowAddr, TiledAlu};

use super::field::FieldMap;
use super::Dpu;
use crate::arch::profile::{ActType, ExecMode, Profile, WhiteLists};
use crate::check;
use crate::error::{DpuError, Result};

/// Instance-norm state carried from the first phase to its followers.
#[derive(Debug, Clone, Default)]
pub struct NormScratch {
  pub mean: Vec<f32>,
  pub variance: Vec<f32>,
  pub weights: Vec<i8>,
  pub bias: Vec<i8>,
}

pub trait ComputeVariant {
  fn target_check(&self, profile: &Profile) -> Result<()>;
  fn read(&mut self, dpu: &Dpu) -> Result<()>;
  fn pad(&mut self) -> Result<()>;
  fn transform(&mut self, dpu: &Dpu) -> Result<()>;
  fn save(&self, dpu: &mut Dpu) -> Result<()>;

  fn exec(&mut self, dpu: &mut Dpu) -> Result<()> {
    self.target_check(&dpu.profile)?;
    self.read(dpu)?;
    self.pad()?;
    self.transform(dpu)?;
    self.save(dpu)
  }
}

/// Bank ids against the ALU white-lists, window sizes against the kernel /
/// stride lists, activation against the engine's nonlinear set.
pub(crate) fn check_target(
  profile: &Profile,
  bank_in: u32,
  bank_out: u32,
  kernel: (usize, usize),
  stride: (usize, usize),
  act: ActType,
) -> Result<()> {
  let wl = &profile.white_lists;
  check!(
    WhiteLists::allows(&wl.alu_in, bank_in),
    DpuError::range(format!("input bank {} not in the {} ALU white-list", bank_in, profile.name))
  );
  check!(
    WhiteLists::allows(&wl.alu_out, bank_out),
    DpuError::range(format!("output bank {} not in the {} ALU white-list", bank_out, profile.name))
  );
  for k in [kernel.0, kernel.1] {
    check!(
      WhiteLists::allows(&wl.alu_kernel, k as u32),
      DpuError::param(format!("kernel {:?} not in the {} ALU white-list", kernel, profile.name))
    );
  }
  for s in [stride.0, stride.1] {
    check!(
      WhiteLists::allows(&wl.alu_stride, s as u32),
      DpuError::param(format!("stride {:?} not in the {} ALU white-list", stride, profile.name))
    );
  }
  check!(
    profile.supports_act(act),
    DpuError::unsupported(format!("activation {:?}", act), profile.name.clone())
  );
  Ok(())
}

/// A decoded compute instruction of either addressing family.
#[derive(Debug, Clone)]
pub enum Alu {
  Direct(Box<DirectAlu>),
  Tiled(Box<TiledAlu>),
}

impl Alu {
  pub fn decode(f: &FieldMap, claim: &Claim, profile: &Profile) -> Result<Self> {
    if profile.generation.is_tiled() {
      Ok(Alu::Tiled(Box::new(TiledAlu::decode(claim, f, profile)?)))
    } else {
      Ok(Alu::Direct(Box::new(DirectAlu::decode(&claim.init, f, profile)?)))
    }
  }

  pub fn mode(&self) -> ExecMode {
    match self {
      Alu::Direct(a) => a.mode(),
      Alu::Tiled(a) => a.mode(),
    }
  }

  pub fn result(&self) -> &[i8] {
    match self {
      Alu::Direct(a) => a.result(),
      Alu::Tiled(a) => a.result(),
    }
  }

  pub fn run(&mut self, dpu: &mut Dpu) -> Result<()> {
    debug!("alu {:?} on {}", self.mode(), dpu.profile.name);
    match self {
      Alu::Direct(a) => a.exec(dpu),
      Alu::Tiled(a) => a.exec(dpu),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::profile::Generation;

  #[test]
  fn target_check_kinds() {
    let p = Profile::builtin(Generation::Xv2dpu);
    assert!(check_target(&p, 0, 0, (3, 3), (1, 1), ActType::Relu).is_ok());
    assert!(matches!(
      check_target(&p, 1, 0, (1, 1), (1, 1), ActType::None),
      Err(DpuError::AddressOutOfRange { .. })
    ));
    assert!(matches!(
      check_target(&p, 0, 0, (1, 1), (1, 1), ActType::Prelu),
      Err(DpuError::Unsupported { .. })
    ));
  }
}
