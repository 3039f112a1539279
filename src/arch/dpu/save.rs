//! Bank -> external memory transfers.

use log::debug;

use super::field::{FieldMap, Fields};
use super::Dpu;
use crate::arch::profile::{Generation, Profile};
use crate::check;
use crate::error::{DpuError, Result};

/// What a pixel turns into on the way out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
  Normal,
  Const(i8),
  /// Reduce each pixel to one byte: the index of its first maximum, or the
  /// maximum itself when `value` is set.
  ArgMax { value: bool },
}

#[derive(Debug, Clone)]
pub struct Save {
  bank_id: u32,
  bank_addr: usize,
  reg_id: u32,
  ddr_addr: usize,
  jump_read: usize,
  jump_read_endl: usize,
  jump_write: usize,
  jump_write_endl: usize,
  length: usize,
  channel: usize,
  block_num: usize,
  mode: SaveMode,
}

impl Save {
  pub fn decode(f: &FieldMap, profile: &Profile) -> Result<Self> {
    let generation = profile.generation;
    let tiled = generation.is_tiled();
    let argmax = f.field_or("argmax", 0);
    check!(
      (0..=3).contains(&argmax),
      DpuError::range(format!("argmax {} outside 0..=3", argmax))
    );
    let mode = if f.flag("const_en") {
      SaveMode::Const(f.field_or("const_value", 0) as i8)
    } else if argmax >> 1 != 0 {
      SaveMode::ArgMax { value: argmax & 1 != 0 }
    } else {
      SaveMode::Normal
    };
    let bank_id = if generation == Generation::Xv3dpu { 0 } else { f.field_u32("bank_id")? };
    check!(
      bank_id < profile.total_banks(),
      DpuError::range(format!("bank_id {} out of range ({} banks)", bank_id, profile.total_banks()))
    );
    Ok(Self {
      bank_id,
      bank_addr: if generation == Generation::Xv3dpu { f.field_usize("mt_addr")? } else { f.field_usize("bank_addr")? },
      reg_id: f.field_u32("reg_id")?,
      ddr_addr: f.field_usize("ddr_addr")?,
      jump_read: f.field_usize("jump_read")?,
      jump_read_endl: f.field_or("jump_read_endl", 0).max(0) as usize,
      jump_write: f.field_usize("jump_write")?,
      jump_write_endl: f.field_or("jump_write_endl", 0).max(0) as usize,
      length: f.field_usize("length")?,
      channel: f.field_usize("channel")?,
      block_num: if tiled { f.field_or("block_num", 1).max(1) as usize } else { 1 },
      mode,
    })
  }

  pub fn mode(&self) -> SaveMode {
    self.mode
  }

  fn ddr_range_check(&self, dpu: &Dpu) -> Result<()> {
    let size = dpu.ddr.get(self.reg_id)?.size();
    let end = self.ddr_addr + self.length.saturating_sub(1) * self.jump_write + self.channel;
    check!(
      end <= size,
      DpuError::range(format!(
        "ddr segment fault: ddr_addr {:#x} length {} jump_write {} channel {} beyond region {} size {}",
        self.ddr_addr, self.length, self.jump_write, self.channel, self.reg_id, size
      ))
    );
    Ok(())
  }

  /// First maximum wins.
  pub fn argmax(data: &[i8]) -> (usize, i8) {
    let mut best = (0, i8::MIN);
    for (i, &v) in data.iter().enumerate() {
      if i == 0 || v > best.1 {
        best = (i, v);
      }
    }
    best
  }

  pub fn exec(&self, dpu: &mut Dpu) -> Result<()> {
    self.ddr_range_check(dpu)?;
    debug!(
      "save {:?} bank {} row {} -> reg {} ddr {:#x} ({}x{}x{})",
      self.mode, self.bank_id, self.bank_addr, self.reg_id, self.ddr_addr, self.block_num, self.length, self.channel
    );
    let line = dpu.options.ddr_line_width;
    let check_writes = dpu.options.double_write_check;
    for b in 0..self.block_num {
      for p in 0..self.length {
        let ddr = self.ddr_addr + p * self.jump_write + b * self.jump_write_endl;
        let bytes: Vec<u8> = match self.mode {
          SaveMode::Const(v) => vec![v as u8; self.channel],
          SaveMode::ArgMax { value } => {
            let data = self.read_pixel(dpu, b, p)?;
            let (idx, max) = Self::argmax(&data);
            vec![if value { max as u8 } else { idx as u8 }]
          },
          SaveMode::Normal => {
            if check_writes {
              dpu.ddr_writes.insert(self.reg_id, ddr, self.channel);
            }
            self.read_pixel(dpu, b, p)?.into_iter().map(|v| v as u8).collect()
          },
        };
        let region = dpu.ddr.get_mut(self.reg_id)?;
        region.write(ddr, &bytes)?;
        Self::mark_lines(region, ddr, self.channel, line);
      }
    }
    Ok(())
  }

  fn read_pixel(&self, dpu: &Dpu, block: usize, pixel: usize) -> Result<Vec<i8>> {
    let bank = dpu.banks.get(self.bank_id)?;
    let addr = (self.bank_addr + pixel * self.jump_read + block * self.jump_read_endl) % bank.depth();
    bank.read_vec(addr, self.channel)
  }

  /// A pixel that spills over its first line touches `ceil(rest / hw)` more.
  fn mark_lines(region: &mut super::ddr::Region, addr: usize, len: usize, hw: usize) {
    if hw == 0 || len == 0 {
      return;
    }
    let base = addr - addr % hw;
    let head = hw - addr % hw;
    let lines = if len <= head { 1 } else { (len - head).div_ceil(hw) + 1 };
    for i in 0..lines {
      region.mark_used(base + i * hw, 1, hw);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn argmax_first_occurrence() {
    assert_eq!(Save::argmax(&[3, 5, 5, 1]), (1, 5));
    assert_eq!(Save::argmax(&[-128, -128]), (0, -128));
    assert_eq!(Save::argmax(&[-3, -1, -2]), (1, -1));
  }

  #[test]
  fn line_usage_spans() {
    let mut r = super::super::ddr::Region::new(0, 128);
    Save::mark_lines(&mut r, 10, 30, 16);
    assert_eq!(r.used_lines(16), vec![0, 16, 32]);
  }
}
