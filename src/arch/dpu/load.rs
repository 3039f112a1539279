//! External memory -> bank transfers.

use log::debug;

use super::bank::BankSet;
use super::field::{FieldMap, Fields};
use super::Dpu;
use crate::arch::profile::{Generation, Profile, WhiteLists};
use crate::check;
use crate::error::{DpuError, Result};

pub const MODE_AVG_MAX: u32 = 3;
pub const MODE_AVG_CHANNEL_LIMIT: usize = 64;
/// `broadcast` value selecting constant fill.
const BROADCAST_CONST: i64 = 7;
const CONV_BIAS_BLOCK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadDst {
  Image,
  ConvWeights,
  ConvBias,
  MiscWeights,
  MiscBias,
  LayerParam,
}

impl LoadDst {
  fn from_code(code: i64, generation: Generation) -> Result<Self> {
    Ok(match code {
      0 => LoadDst::Image,
      1 => LoadDst::ConvWeights,
      2 => LoadDst::ConvBias,
      3 => LoadDst::MiscWeights,
      4 => LoadDst::MiscBias,
      5 if generation == Generation::Xv3dpu => LoadDst::LayerParam,
      _ => return Err(DpuError::param(format!("mt_dst {} not valid on {}", code, generation))),
    })
  }
}

/// Spatial post-pass applied to an image load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reshape {
  None,
  SpaceToDepth,
  DepthToSpace,
  Upsample,
  Downsample,
}

impl Reshape {
  fn from_code(code: i64) -> Result<Self> {
    Ok(match code {
      0 => Reshape::None,
      1 => Reshape::SpaceToDepth,
      2 => Reshape::DepthToSpace,
      4 => Reshape::Upsample,
      5 => Reshape::Downsample,
      _ => return Err(DpuError::range(format!("invalid trans_mode {}", code))),
    })
  }
}

#[derive(Debug, Clone)]
pub struct Load {
  generation: Generation,
  /// `None` on direct-addressing targets.
  dst: Option<LoadDst>,
  bank_id: u32,
  bank_addr: usize,
  pad_start: i64,
  pad_end: i64,
  pad_idx: i64,
  jump_read: usize,
  jump_write: usize,
  jump_read_endl: usize,
  jump_write_endl: usize,
  length: usize,
  channel: usize,
  block_num: usize,
  mode_avg: u32,
  reg_id: u32,
  ddr_addr: usize,
  const_en: bool,
  const_value: i8,
  reshape: Reshape,
  tile_stride: (usize, usize),
  sample_scale: (usize, usize),
}

fn align_up(v: usize, n: usize) -> usize {
  v.div_ceil(n) * n
}

impl Load {
  pub fn decode(f: &FieldMap, profile: &Profile, banks: &BankSet) -> Result<Self> {
    let generation = profile.generation;
    let tiled = generation.is_tiled();
    let xv3 = generation == Generation::Xv3dpu;

    let dst = if tiled { Some(LoadDst::from_code(f.field("mt_dst")?, generation)?) } else { None };
    let mut channel = f.field_usize("channel")?;
    if generation == Generation::Xv2dpu {
      let div = match dst {
        Some(LoadDst::ConvBias) => 8,
        Some(LoadDst::MiscWeights) | Some(LoadDst::MiscBias) => 2,
        _ => 1,
      };
      check!(
        channel % div == 0,
        DpuError::range(format!("channel {} not a multiple of {} for mt_dst {:?}", channel, div, dst))
      );
      channel /= div;
    }

    let bank_id = match dst {
      None => {
        let id = f.field_u32("bank_id")?;
        check!(
          id < profile.total_banks(),
          DpuError::range(format!("bank_id {} out of range ({} banks)", id, profile.total_banks()))
        );
        id
      },
      Some(LoadDst::Image) => banks.id_in_group(&profile.image_bank, 0)?,
      Some(_) => banks.id_in_group(&profile.conv.weight_bank, 0)?,
    };

    let mode_avg = f.field_u32("mode_avg")?;
    check!(mode_avg <= MODE_AVG_MAX, DpuError::range(format!("mode_avg {} > {}", mode_avg, MODE_AVG_MAX)));
    check!(
      mode_avg == 0 || channel <= MODE_AVG_CHANNEL_LIMIT,
      DpuError::param(format!("channel {} with mode_avg {} (limit {})", channel, mode_avg, MODE_AVG_CHANNEL_LIMIT))
    );

    let (const_en, const_value) = (
      f.field_or("broadcast", 0) == BROADCAST_CONST || f.flag("const_en"),
      f.field_or("const_value", 0) as i8,
    );

    Ok(Self {
      generation,
      dst,
      bank_id,
      bank_addr: if tiled { f.field_usize("mt_addr")? } else { f.field_usize("bank_addr")? },
      pad_start: f.field("pad_start")?,
      pad_end: f.field("pad_end")?,
      pad_idx: f.field("pad_idx")?,
      jump_read: f.field_usize("jump_read")?,
      jump_write: f.field_usize("jump_write")?,
      jump_read_endl: if xv3 { f.field_usize("jump_read_endl")? } else { 0 },
      jump_write_endl: if tiled { f.field_usize("jump_write_endl")? } else { 0 },
      length: f.field_usize("length")?,
      channel,
      block_num: if tiled { f.field_usize("block_num")? } else { 1 },
      mode_avg,
      reg_id: f.field_u32("reg_id")?,
      ddr_addr: f.field_usize("ddr_addr")?,
      const_en,
      const_value,
      reshape: if xv3 { Reshape::from_code(f.field_or("trans_mode", 0))? } else { Reshape::None },
      tile_stride: (f.field_or("tile_stride_h", 1).max(1) as usize, f.field_or("tile_stride_w", 1).max(1) as usize),
      sample_scale: (f.field_or("sample_scale_h", 1).max(1) as usize, f.field_or("sample_scale_w", 1).max(1) as usize),
    })
  }

  pub fn bank_id(&self) -> u32 {
    self.bank_id
  }

  pub fn target_check(&self, profile: &Profile) -> Result<()> {
    check!(
      WhiteLists::allows(&profile.white_lists.load_out, self.bank_id),
      DpuError::range(format!("bank_id {} does not match target {}", self.bank_id, profile.name))
    );
    Ok(())
  }

  pub fn exec(&self, dpu: &mut Dpu) -> Result<()> {
    self.target_check(&dpu.profile)?;
    debug!(
      "load {:?} reg {} ddr {:#x} -> bank {} row {} ({}x{}x{})",
      self.dst, self.reg_id, self.ddr_addr, self.bank_id, self.bank_addr, self.block_num, self.length, self.channel
    );
    match self.dst {
      None => self.load_direct(dpu),
      Some(LoadDst::Image) => self.load_image(dpu),
      Some(LoadDst::ConvWeights) if self.generation == Generation::Xv2dpu => self.load_conv_weights(dpu),
      Some(LoadDst::ConvBias) => self.load_conv_bias(dpu),
      Some(LoadDst::MiscWeights) if self.generation == Generation::Xv2dpu => self.load_misc_weights(dpu),
      Some(LoadDst::MiscBias) => self.load_misc_bias(dpu),
      Some(LoadDst::ConvWeights) | Some(LoadDst::MiscWeights) | Some(LoadDst::LayerParam) => {
        self.load_contiguous(dpu)
      },
    }
  }

  fn ddr_range_check(&self, dpu: &Dpu, ddr_addr: usize) -> Result<()> {
    let size = dpu.ddr.get(self.reg_id)?.size();
    let end = ddr_addr + self.length.saturating_sub(1) * self.jump_read + self.channel;
    check!(
      end <= size,
      DpuError::range(format!(
        "ddr segment fault: ddr_addr {:#x} length {} jump_read {} channel {} beyond region {} size {}",
        ddr_addr, self.length, self.jump_read, self.channel, self.reg_id, size
      ))
    );
    Ok(())
  }

  fn mean_table(&self, dpu: &Dpu) -> Result<Vec<i8>> {
    if self.mode_avg == 0 {
      return Ok(vec![0; self.channel]);
    }
    dpu.banks.in_group(&dpu.profile.mean_value_bank, 0)?.read_vec(0, self.channel)
  }

  /// `false` entries are forced to zero. Only computed for narrow pixels.
  pub fn pad_mask(&self, bank_width: usize) -> Result<Vec<bool>> {
    let (len, ch) = (self.length, self.channel);
    let mut mask = vec![true; len * ch];
    if !(ch >= self.jump_read && ch <= MODE_AVG_CHANNEL_LIMIT) {
      return Ok(mask);
    }
    let jr = self.jump_read as i64;
    let end_start = len as i64 - self.pad_idx;
    for l in 0..len {
      let row = &mut mask[l * ch..(l + 1) * ch];
      let start = (self.pad_start - l as i64 * jr).max(0);
      check!(
        start < ch as i64,
        DpuError::range(format!("pad_start {} covers the whole pixel {} (channel {})", self.pad_start, l, ch))
      );
      row[..start as usize].iter_mut().for_each(|m| *m = false);
      if l as i64 >= end_start {
        let end = self.pad_end + jr * (l as i64 - end_start);
        let from = align_up(ch, bank_width) as i64 - end;
        check!(
          from > 0,
          DpuError::range(format!("pad_end {} covers the whole pixel {} (channel {})", self.pad_end, l, ch))
        );
        for m in row.iter_mut().skip(from as usize) {
          *m = false;
        }
      }
    }
    Ok(mask)
  }

  fn minus_mean(raw: i8, mean: i8, mode_avg: u32) -> i8 {
    let delta = ((raw as u8 as u32) & 0x3ff).wrapping_sub(mean as u8 as u32);
    (delta >> (mode_avg - 1)) as i8
  }

  /// Pixel `l` of the transfer starting at `ddr_addr`.
  fn pixel(&self, dpu: &mut Dpu, ddr_addr: usize, l: usize, mask: &[bool], mean: &[i8]) -> Result<Vec<i8>> {
    let line = dpu.options.ddr_line_width;
    let region = dpu.ddr.get_mut(self.reg_id)?;
    let mut data = vec![0i8; self.channel];
    let tiled = self.dst.is_some();
    for (c, d) in data.iter_mut().enumerate() {
      let masked = !mask[l * self.channel + c];
      // direct targets apply the mask before the constant, tiled ones after
      if tiled && self.const_en {
        *d = self.const_value;
        continue;
      }
      if masked {
        continue;
      }
      if self.const_en {
        *d = self.const_value;
        continue;
      }
      let off = ddr_addr + l * self.jump_read + c;
      let raw = region.byte(off)? as i8;
      region.mark_used(off, 1, line);
      *d = if self.mode_avg != 0 { Self::minus_mean(raw, mean[c], self.mode_avg) } else { raw };
    }
    Ok(data)
  }

  fn load_rows(&self, dpu: &mut Dpu, ddr_addr: usize, bank_offset: usize, mask: &[bool], mean: &[i8]) -> Result<()> {
    for l in 0..self.length {
      let data = self.pixel(dpu, ddr_addr, l, mask, mean)?;
      let bank = dpu.banks.get_mut(self.bank_id)?;
      let addr = (self.bank_addr + l * self.jump_write + bank_offset) % bank.depth();
      bank.write(addr, &data)?;
    }
    Ok(())
  }

  fn load_direct(&self, dpu: &mut Dpu) -> Result<()> {
    self.ddr_range_check(dpu, self.ddr_addr)?;
    let width = dpu.banks.get(self.bank_id)?.width();
    let mean = self.mean_table(dpu)?;
    let mask = self.pad_mask(width)?;
    self.load_rows(dpu, self.ddr_addr, 0, &mask, &mean)
  }

  fn load_image(&self, dpu: &mut Dpu) -> Result<()> {
    if self.generation == Generation::Xv2dpu {
      check!(
        self.block_num == 1,
        DpuError::range(format!("image bank load needs block_num 1, got {}", self.block_num))
      );
    }
    let width = dpu.banks.get(self.bank_id)?.width();
    let mean = self.mean_table(dpu)?;
    let mask = self.pad_mask(width)?;
    for b in 0..self.block_num {
      let ddr_addr = self.ddr_addr + b * self.jump_read_endl;
      self.ddr_range_check(dpu, ddr_addr)?;
      self.load_rows(dpu, ddr_addr, b * self.jump_write_endl, &mask, &mean)?;
    }
    match self.reshape {
      Reshape::None => Ok(()),
      r => self.reshape_image(dpu, r),
    }
  }

  /// Read back the loaded blocks as one dense `block x length x channel` buffer.
  fn read_back(&self, dpu: &Dpu, ch: usize) -> Result<Vec<i8>> {
    let bank = dpu.banks.get(self.bank_id)?;
    let mut buf = vec![0i8; self.block_num * self.length * ch];
    for b in 0..self.block_num {
      for l in 0..self.length {
        let addr = (self.bank_addr + b * self.jump_write_endl + l * self.jump_write) % bank.depth();
        let at = (b * self.length + l) * ch;
        bank.read(addr, &mut buf[at..at + ch])?;
      }
    }
    Ok(buf)
  }

  fn reshape_image(&self, dpu: &mut Dpu, reshape: Reshape) -> Result<()> {
    let width = dpu.banks.get(self.bank_id)?.width();
    let ch = self.jump_write * width;
    let src = self.read_back(dpu, ch)?;
    let (len, blocks) = (self.length, self.block_num);
    let bank = dpu.banks.get_mut(self.bank_id)?;
    let depth = bank.depth();
    let mut put = |addr: usize, from: usize, n: usize| -> Result<()> {
      check!(
        from + n <= src.len(),
        DpuError::range(format!("reshape source {}+{} beyond {}", from, n, src.len()))
      );
      bank.write((self.bank_addr + addr) % depth, &src[from..from + n])
    };
    match reshape {
      Reshape::SpaceToDepth => {
        let (th, tw) = self.tile_stride;
        let sub_oc = ch / th / tw;
        let jw = sub_oc / width;
        let jwe = jw * len * tw;
        for b in 0..blocks {
          for l in 0..len {
            let ocg = (b % th) * tw + l % tw;
            put((b / th) * jwe + (l / tw) * jw, (b * len + l) * ch + ocg * sub_oc, sub_oc)?;
          }
        }
      },
      Reshape::DepthToSpace => {
        let (th, tw) = self.tile_stride;
        let (oh, ow) = (blocks * th, len * tw);
        let oc = ch / th / tw;
        let jw = oc / width;
        let jwe = jw * ow;
        for h in 0..oh {
          let row = (h / th) * len * ch + (h % th) * tw * oc;
          for w in 0..ow {
            put(h * jwe + w * jw, row + (w / tw) * ch + (w % tw) * oc, oc)?;
          }
        }
      },
      Reshape::Upsample => {
        let (sh, sw) = self.sample_scale;
        let (oh, ow) = (blocks * sh, len * sw);
        let jwe = self.jump_write * ow;
        for h in 0..oh {
          for w in 0..ow {
            put(h * jwe + w * self.jump_write, (h / sh) * len * ch + (w / sw) * ch, ch)?;
          }
        }
      },
      Reshape::Downsample => {
        let (sh, sw) = self.sample_scale;
        let (oh, ow) = (blocks / sh, len / sw);
        let jwe = self.jump_write * ow;
        for h in 0..oh {
          for w in 0..ow {
            put(h * jwe + w * self.jump_write, h * sh * len * ch + w * sw * ch, ch)?;
          }
        }
      },
      Reshape::None => {},
    }
    Ok(())
  }

  /// Copy `width` bytes at `ddr_off` (relative to `ddr_addr`) to a bank row.
  fn copy_row(&self, dpu: &mut Dpu, ddr_off: usize, bank_id: u32, row: usize) -> Result<()> {
    let bank = dpu.banks.get(bank_id)?;
    let (width, depth) = (bank.width(), bank.depth());
    let region = dpu.ddr.get_mut(self.reg_id)?;
    let bytes: Vec<i8> = region.read(self.ddr_addr + ddr_off, width)?.iter().map(|&b| b as i8).collect();
    region.mark_used(self.ddr_addr + ddr_off, width, dpu.options.ddr_line_width);
    dpu.banks.get_mut(bank_id)?.write((self.bank_addr + row) % depth, &bytes)
  }

  /// Deshuffle `icp x ocp` weight blocks across the conv weight banks.
  fn load_conv_weights(&self, dpu: &mut Dpu) -> Result<()> {
    let profile = &dpu.profile;
    let (icp, ocp) = (profile.conv.input_channel_parallel, profile.conv.output_channel_parallel);
    let group = profile.group(&profile.conv.weight_bank)?.clone();
    let (width, banks) = (group.width, group.bank_num as usize);
    check!(icp == ocp, DpuError::range(format!("conv weights need icp == ocp, got {} / {}", icp, ocp)));
    let block = icp * ocp;
    check!(
      block % (banks * width) == 0,
      DpuError::range(format!("weight block {} not aligned to {} banks x {}", block, banks, width))
    );
    let icg = self.channel.div_ceil(icp);
    let ocg = self.block_num.div_ceil(ocp);
    let cycles = block / width / banks;
    check!(
      cycles * self.length == self.jump_write,
      DpuError::range(format!("jump_write {} != {} cycles x length {}", self.jump_write, cycles, self.length))
    );
    check!(
      cycles * icg * self.length == self.jump_write_endl,
      DpuError::range(format!(
        "jump_write_endl {} != {} cycles x {} icg x length {}",
        self.jump_write_endl, cycles, icg, self.length
      ))
    );
    for o in 0..ocg {
      for i in 0..icg {
        for l in 0..self.length {
          let blk = o * icg * self.length + i * self.length + l;
          for cyc in 0..cycles {
            for b in 0..banks {
              let ddr = blk * block + cyc * width * banks + b * width;
              let row = o * self.jump_write_endl + i * self.jump_write + l * cycles + cyc;
              self.copy_row(dpu, ddr, group.base_id + b as u32, row)?;
            }
          }
        }
      }
    }
    Ok(())
  }

  fn load_conv_bias(&self, dpu: &mut Dpu) -> Result<()> {
    let profile = &dpu.profile;
    let ocp = profile.conv.output_channel_parallel;
    let group = profile.group(&profile.conv.bias_bank)?.clone();
    let (width, banks) = (group.width, group.bank_num as usize);
    if self.generation == Generation::Xv2dpu {
      check!(self.block_num == 1, DpuError::range(format!("conv bias needs block_num 1, got {}", self.block_num)));
    }
    check!(
      CONV_BIAS_BLOCK % (banks * width) == 0,
      DpuError::range(format!("bias block {} not aligned to {} banks x {}", CONV_BIAS_BLOCK, banks, width))
    );
    let cycles = CONV_BIAS_BLOCK / width / banks;
    for o in 0..self.channel.div_ceil(ocp) {
      for cyc in 0..cycles {
        for b in 0..banks {
          let ddr = o * CONV_BIAS_BLOCK + cyc * width * banks + b * width;
          self.copy_row(dpu, ddr, group.base_id + b as u32, o * self.jump_write + cyc)?;
        }
      }
    }
    Ok(())
  }

  /// Only the first two banks of a row carry data, the others are cleared.
  fn load_misc_weights(&self, dpu: &mut Dpu) -> Result<()> {
    let profile = &dpu.profile;
    let cp = profile.alu.channel_parallel;
    let group = profile.group(&profile.alu.weight_bank)?.clone();
    let (width, banks) = (group.width, group.bank_num as usize);
    check!(self.block_num == 1, DpuError::range(format!("misc weights need block_num 1, got {}", self.block_num)));
    check!(
      self.length == self.jump_write,
      DpuError::range(format!("misc weights need length == jump_write, got {} / {}", self.length, self.jump_write))
    );
    check!(cp == 2 * width, DpuError::range(format!("alu cp {} != 2 x bank width {}", cp, width)));
    for o in 0..self.channel.div_ceil(cp) {
      for l in 0..self.length {
        for b in 0..banks {
          let id = group.base_id + b as u32;
          let row = o * self.jump_write + l;
          if b < 2 {
            self.copy_row(dpu, o * self.length * banks * width + l * banks * width + b * width, id, row)?;
          } else {
            let bank = dpu.banks.get_mut(id)?;
            let depth = bank.depth();
            bank.write((self.bank_addr + row) % depth, &vec![0; width])?;
          }
        }
      }
    }
    Ok(())
  }

  fn load_misc_bias(&self, dpu: &mut Dpu) -> Result<()> {
    let profile = &dpu.profile;
    let cp = profile.alu.channel_parallel;
    let group = profile.group(&profile.alu.bias_bank)?.clone();
    let (width, banks) = (group.width, group.bank_num as usize);
    check!(self.block_num == 1, DpuError::range(format!("misc bias needs block_num 1, got {}", self.block_num)));
    let block = width * banks;
    for o in 0..self.channel.div_ceil(cp) {
      for b in 0..banks {
        self.copy_row(dpu, o * block + b * width, group.base_id + b as u32, o * self.jump_write)?;
      }
    }
    Ok(())
  }

  fn load_contiguous(&self, dpu: &mut Dpu) -> Result<()> {
    let size = self.block_num * self.length * self.channel;
    let region = dpu.ddr.get_mut(self.reg_id)?;
    let bytes: Vec<i8> = region.read(self.ddr_addr, size)?.iter().map(|&b| b as i8).collect();
    region.mark_used(self.ddr_addr, size, dpu.options.ddr_line_width);
    let bank = dpu.banks.get_mut(self.bank_id)?;
    let depth = bank.depth();
    bank.write(self.bank_addr % depth, &bytes)
  }
}
