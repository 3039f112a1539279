#![allow(dead_code)]

use dpusim::arch::dpu::field::fields;
use dpusim::arch::dpu::{Dpu, DpuOptions, Instruction, Opcode, Sequencer};
use dpusim::arch::profile::{Generation, Profile};
use dpusim::Result;

/// Expand one `#[test]` per named case; the body receives the case tuple.
macro_rules! test_case {
  ($body:ident: $($name:ident => $case:expr),+ $(,)?) => {
    $(
      #[test]
      fn $name() {
        dpusim::simulator::utils::log::init_log();
        $body($case);
      }
    )+
  };
}

pub fn dpu(g: Generation) -> Dpu {
  Dpu::new(Profile::builtin(g), DpuOptions::default()).unwrap()
}

pub fn sequencer(g: Generation) -> Sequencer {
  Sequencer::new(dpu(g))
}

pub fn inst(op: Opcode, pairs: &[(&str, i64)]) -> Instruction {
  Instruction::new(op, fields(pairs.iter().copied()))
}

/// Issue every instruction, stopping at the first error.
pub fn run(seq: &mut Sequencer, program: &[Instruction]) -> Result<()> {
  for i in program {
    seq.issue(i)?;
  }
  Ok(())
}

/// Address-list descriptor with the usual defaults.
pub fn addr(kind: i64, id: i64, h_num: i64, mt_addr: i64, jump: i64, jump_endl: i64) -> Instruction {
  inst(
    Opcode::AluAddr,
    &[("type", kind), ("id", id), ("h_num", h_num), ("mt_addr", mt_addr), ("jump", jump), ("jump_endl", jump_endl)],
  )
}
