pub mod alu;
pub mod bank;
pub mod ddr;
pub mod field;
pub mod inst;
pub mod load;
pub mod overlap;
pub mod pool;
pub mod quant;
pub mod save;
pub mod sequencer;
pub mod shape;

use log::debug;

use crate::arch::profile::Profile;
use crate::error::Result;

use alu::NormScratch;
use bank::BankSet;
use ddr::DdrSet;
use overlap::WriteTracker;
use pool::WorkerPool;

pub use inst::{Instruction, Opcode};
pub use sequencer::Sequencer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpuOptions {
  /// Worker threads for the inner pixel loops, 0 = rayon default.
  pub threads: usize,
  pub double_write_check: bool,
  /// Line width used for external-region usage bookkeeping.
  pub ddr_line_width: usize,
}

impl Default for DpuOptions {
  fn default() -> Self {
    Self { threads: 0, double_write_check: false, ddr_line_width: 16 }
  }
}

/// The machine state instructions act on: banks, external regions and the
/// engine scratch that survives across instructions.
#[derive(Debug)]
pub struct Dpu {
  pub profile: Profile,
  pub banks: BankSet,
  pub ddr: DdrSet,
  pub norm: NormScratch,
  pub bank_writes: WriteTracker,
  pub ddr_writes: WriteTracker,
  pub pool: WorkerPool,
  pub options: DpuOptions,
}

impl Dpu {
  pub fn new(profile: Profile, options: DpuOptions) -> Result<Self> {
    profile.validate()?;
    let banks = BankSet::from_groups(&profile.bank_groups)?;
    let pool = WorkerPool::new(options.threads)?;
    debug!(
      "{}: {} banks, {} worker threads",
      profile.name,
      banks.len(),
      pool.threads()
    );
    Ok(Self {
      profile,
      banks,
      ddr: DdrSet::new(),
      norm: NormScratch::default(),
      bank_writes: WriteTracker::new("bank"),
      ddr_writes: WriteTracker::new("region"),
      pool,
      options,
    })
  }

  /// Reset the per-instruction diagnostic scope.
  pub fn begin_instruction(&mut self) {
    self.bank_writes.clear();
    self.ddr_writes.clear();
  }
}
