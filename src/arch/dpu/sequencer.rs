//! Program-order issue of instructions against one machine.

use log::{debug, info};

use super::alu::{AddrEntry, Alu, ConfigSlot, SharedComputeConfig};
use super::inst::{Instruction, Opcode};
use super::load::Load;
use super::save::Save;
use super::Dpu;
use crate::error::{DpuError, Result};

/// What one issued instruction did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed {
  pub id: u64,
  pub opcode: Opcode,
  pub summary: String,
}

/// Owns the machine and the init block in force. Instructions run strictly
/// one after another; the first error stops the stream.
#[derive(Debug)]
pub struct Sequencer {
  dpu: Dpu,
  slot: ConfigSlot,
  issued: u64,
  ended: bool,
}

impl Sequencer {
  pub fn new(dpu: Dpu) -> Self {
    Self { dpu, slot: ConfigSlot::new(), issued: 0, ended: false }
  }

  pub fn dpu(&self) -> &Dpu {
    &self.dpu
  }

  pub fn dpu_mut(&mut self) -> &mut Dpu {
    &mut self.dpu
  }

  pub fn slot(&self) -> &ConfigSlot {
    &self.slot
  }

  pub fn issued(&self) -> u64 {
    self.issued
  }

  /// An END instruction went through.
  pub fn is_ended(&self) -> bool {
    self.ended
  }

  pub fn issue(&mut self, inst: &Instruction) -> Result<Executed> {
    let id = inst.id.unwrap_or(self.issued);
    self.issued += 1;
    self.dpu.begin_instruction();
    let summary = self.dispatch(inst).map_err(|e| e.at(id))?;
    info!("#{} {}: {}", id, inst.op, summary);
    Ok(Executed { id, opcode: inst.op, summary })
  }

  fn dispatch(&mut self, inst: &Instruction) -> Result<String> {
    let f = &inst.fields;
    match inst.op {
      Opcode::Load => {
        let load = Load::decode(f, &self.dpu.profile, &self.dpu.banks)?;
        load.exec(&mut self.dpu)?;
        Ok(format!("-> bank {}", load.bank_id()))
      },
      Opcode::Save => {
        let save = Save::decode(f, &self.dpu.profile)?;
        save.exec(&mut self.dpu)?;
        Ok(format!("{:?}", save.mode()))
      },
      Opcode::AluInit => {
        let cfg = if self.dpu.profile.generation.is_tiled() {
          SharedComputeConfig::tiled(f.clone())?
        } else {
          SharedComputeConfig::direct(f.clone())
        };
        let summary = match cfg.remaining() {
          Some(n) => format!("{} consumers", n),
          None => "until replaced".to_string(),
        };
        self.slot.publish(cfg)?;
        Ok(summary)
      },
      Opcode::AluAddr => {
        if !self.dpu.profile.generation.is_tiled() {
          return Err(DpuError::unsupported("address-list instruction", self.dpu.profile.name.clone()));
        }
        let entry = AddrEntry::decode(f)?;
        let summary = format!("{:?} id {} x{} @ {}", entry.kind, entry.id, entry.h_num, entry.mt_addr);
        self.slot.append(entry)?;
        Ok(summary)
      },
      Opcode::Alu => {
        let claim = self.slot.claim()?;
        let mut alu = Alu::decode(f, &claim, &self.dpu.profile)?;
        alu.run(&mut self.dpu)?;
        Ok(format!("{:?}", alu.mode()))
      },
      Opcode::End => {
        self.ended = true;
        Ok("end of program".to_string())
      },
      op if op.is_noop() => {
        debug!("{} has no effect on banks or regions", op);
        Ok("no-op".to_string())
      },
      op => Err(DpuError::unsupported(format!("{} instruction", op), self.dpu.profile.name.clone())),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::dpu::field::FieldMap;
  use crate::arch::dpu::DpuOptions;
  use crate::arch::profile::{Generation, Profile};

  fn seq(g: Generation) -> Sequencer {
    Sequencer::new(Dpu::new(Profile::builtin(g), DpuOptions::default()).unwrap())
  }

  #[test]
  fn errors_carry_the_instruction_id() {
    let mut s = seq(Generation::Xv2dpu);
    let alu = Instruction::new(Opcode::Alu, FieldMap::new()).with_id(41);
    let err = s.issue(&alu).unwrap_err();
    assert!(matches!(err, DpuError::Ordering { .. }));
    assert_eq!(err.inst(), Some(41));
  }

  #[test]
  fn ids_default_to_stream_position() {
    let mut s = seq(Generation::Dpuv2);
    s.issue(&Instruction::new(Opcode::Sync, FieldMap::new())).unwrap();
    let err = s.issue(&Instruction::new(Opcode::AluAddr, FieldMap::new())).unwrap_err();
    assert_eq!(err.inst(), Some(1));
    assert!(matches!(err, DpuError::Unsupported { .. }));
  }

  #[test]
  fn engines_without_a_model_stop_the_run() {
    let mut s = seq(Generation::Xv2dpu);
    for op in [Opcode::DumpBank, Opcode::DumpDdr, Opcode::DumpDdrSlice, Opcode::Sync] {
      assert_eq!(s.issue(&Instruction::new(op, FieldMap::new())).unwrap().summary, "no-op");
    }
    for op in [Opcode::ConvInit, Opcode::Conv, Opcode::Pool, Opcode::DptWise, Opcode::Elew, Opcode::Other] {
      let err = s.issue(&Instruction::new(op, FieldMap::new()).with_id(12)).unwrap_err();
      assert!(matches!(err, DpuError::Unsupported { .. }), "{}", op);
      assert_eq!(err.inst(), Some(12));
    }
  }

  #[test]
  fn end_marks_the_stream() {
    let mut s = seq(Generation::Xv3dpu);
    let done = s.issue(&Instruction::new(Opcode::End, FieldMap::new())).unwrap();
    assert_eq!(done.opcode, Opcode::End);
    assert!(s.is_ended());
  }
}
