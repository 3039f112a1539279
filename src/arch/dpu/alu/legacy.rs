//! Compute path of the direct bank-stride generations (DPUV2, XVDPU).
//!
//! The init block holds the scalar geometry; each compute instruction names
//! its input / output banks directly and walks the pixel-parallel bank group
//! with the stride offsets below.

use log::debug;

use super::kernels::{self, Activation, Padding, CONV_ACTS};
use super::{check_target, ComputeVariant};
use crate::arch::dpu::field::{FieldMap, Fields};
use crate::arch::dpu::quant::dpu_round;
use crate::arch::dpu::shape::ShapeDescriptor;
use crate::arch::dpu::Dpu;
use crate::arch::profile::{ActType, ExecMode, Profile};
use crate::check;
use crate::error::{DpuError, Result};

pub const MAX_SHIFT_BIAS: i64 = 20;
/// Base row addresses one instruction may walk through.
const ADDR_GROUPS: usize = 4;

/// `s >= 32` encodes a left shift by `s - 32`, anything below a right shift.
fn prelu_shift(s: i64) -> i64 {
  if s >= 32 {
    s - 32
  } else {
    -s
  }
}

#[derive(Debug, Clone)]
pub struct DirectAlu {
  mode: ExecMode,
  act: ActType,

  jump_read: usize,
  jump_read_endl: usize,
  jump_read_weights: usize,
  jump_write: usize,
  jump_write_endl: usize,
  shift_cut: i64,
  shift_bias: i64,
  stride: (usize, usize),
  stride_offset_in: usize,
  stride_offset_out: usize,
  stride_out: usize,
  channel_offset: usize,
  multi_factor: i8,
  kernel: (usize, usize),
  /// (positive, negative) slope shifts of LEAKYRELU / PRELU.
  shift_prelu: (i64, i64),

  bank_id_in: u32,
  bank_addr_in: [usize; ADDR_GROUPS],
  bank_id_out: u32,
  bank_addr_out: usize,
  bank_addr_weights: usize,
  bank_addr_bias: usize,
  pad: Padding,

  pp: usize,
  cp: usize,
  ic: usize,
  src_h: usize,
  real_src_h: usize,
  src_w: usize,
  dst_h: usize,
  real_dst_h: usize,
  dst_w: usize,

  img: Vec<i8>,
  weights: Vec<i8>,
  weights16: Vec<i16>,
  prelu: Vec<i8>,
  bias: Vec<i8>,
  acc: Vec<i64>,
  rlt: Vec<i8>,
}

impl DirectAlu {
  pub fn decode(init: &FieldMap, f: &FieldMap, profile: &Profile) -> Result<Self> {
    let mode = profile.exec_mode(init.field("exec_mode")?)?;
    let act = ActType::from_code(init.field_or("act_type", 0))?;
    let shift_bias = init.field_or("shift_bias", 0);
    check!(
      shift_bias <= MAX_SHIFT_BIAS,
      DpuError::param(format!("shift_bias {} > {}", shift_bias, MAX_SHIFT_BIAS))
    );
    let kernel = (init.field_usize("kernel_h")?, init.field_usize("kernel_w")?);
    let stride = (init.field_usize("stride_h")?, init.field_usize("stride_w")?);
    let kernel_d = f.field_or("kernel_d", 1);
    check!(kernel_d == 1, DpuError::param(format!("kernel_d {} (only 1 is modelled)", kernel_d)));
    check!(
      kernel.0 >= 1 && kernel.1 >= 1 && stride.0 >= 1 && stride.1 >= 1,
      DpuError::param(format!("kernel {:?} / stride {:?} must be positive", kernel, stride))
    );
    if matches!(mode, ExecMode::Leakyrelu | ExecMode::Prelu | ExecMode::Hsigmoid) {
      check!(
        kernel == (1, 1) && stride == (1, 1),
        DpuError::param(format!("{:?} needs kernel 1x1 and stride 1, got {:?} / {:?}", mode, kernel, stride))
      );
    }

    let pp_alu = profile.alu.pixel_parallel;
    let pp = profile.conv.pixel_parallel;
    let cp = profile.alu.channel_parallel;
    let vpp = f.field_usize("valid_pixel_parallel")?;
    check!(
      vpp >= 1 && vpp <= pp_alu,
      DpuError::param(format!("valid_pixel_parallel {} outside 1..={}", vpp, pp_alu))
    );
    check!(pp_alu <= pp, DpuError::param(format!("alu pixel parallel {} > conv pixel parallel {}", pp_alu, pp)));

    let length = init.field_usize("length")?;
    check!(length >= 1, DpuError::param("length must be positive"));
    let stride_out = init.field_usize("stride_out")?;
    check!(stride_out > 0, DpuError::param("stride_out must be positive"));
    let ic = init.field_usize("channel_group")? * cp;
    let channel_offset = init.field_or("channel_offset", 0).max(0) as usize;
    check!(
      channel_offset <= ic,
      DpuError::param(format!("channel_offset {} > channels {}", channel_offset, ic))
    );

    let src_h = (pp_alu - 1) * stride.0 + kernel.0;
    let real_src_h = (vpp - 1) * stride.0 + kernel.0;
    let src_w = (length - 1) * stride.1 + kernel.1;
    let (dst_h, dst_w) = (pp_alu, length);
    let rlt_fill = if matches!(mode, ExecMode::Maxpool | ExecMode::Maxreduce) { i8::MIN } else { 0 };
    let taps = kernel.0 * kernel.1 * ic;

    Ok(Self {
      mode,
      act,
      jump_read: init.field_usize("jump_read")?,
      jump_read_endl: init.field_usize("jump_read_endl")?,
      jump_read_weights: init.field_or("jump_read_weights", 0).max(0) as usize,
      jump_write: init.field_usize("jump_write")?,
      jump_write_endl: init.field_usize("jump_write_endl")?,
      shift_cut: init.field("shift_cut")?,
      shift_bias,
      stride,
      stride_offset_in: init.field_or("stride_offset_in", 0).max(0) as usize,
      stride_offset_out: init.field_or("stride_offset_out", 0).max(0) as usize,
      stride_out,
      channel_offset,
      multi_factor: init.field_or("multi_factor", 0) as i8,
      kernel,
      shift_prelu: (
        prelu_shift(init.field_or("shift_prelu_p", 0)),
        prelu_shift(init.field_or("shift_prelu_n", 0)),
      ),
      bank_id_in: f.field_u32("bank_id_in")?,
      bank_addr_in: [
        f.field_usize("bank_addr_in")?,
        f.field_or("bank_addr_in_1", 0).max(0) as usize,
        f.field_or("bank_addr_in_2", 0).max(0) as usize,
        f.field_or("bank_addr_in_3", 0).max(0) as usize,
      ],
      bank_id_out: f.field_u32("bank_id_out")?,
      bank_addr_out: f.field_usize("bank_addr_out")?,
      bank_addr_weights: f.field_or("bank_addr_weights", 0).max(0) as usize,
      bank_addr_bias: f.field_or("bank_addr_bias", 0).max(0) as usize,
      pad: Padding {
        left: f.field_or("pad_left", 0),
        top: f.field_or("pad_top", 0),
        right: f.field_or("pad_right", 0),
        bottom: f.field_or("pad_bottom", 0),
      },
      pp,
      cp,
      ic,
      src_h,
      real_src_h,
      src_w,
      dst_h,
      real_dst_h: vpp,
      dst_w,
      img: vec![0; src_h * src_w * ic],
      weights: vec![0; taps],
      weights16: vec![0; taps],
      prelu: vec![0; ic],
      bias: vec![0; ic],
      acc: Vec::new(),
      rlt: vec![rlt_fill; dst_h * dst_w * ic],
    })
  }

  pub fn mode(&self) -> ExecMode {
    self.mode
  }

  /// Output pixels as written by `save`, `real_dst_h x dst_w x channels`.
  pub fn result(&self) -> &[i8] {
    &self.rlt[..self.real_dst_h * self.dst_w * self.ic]
  }

  fn img_shape(&self) -> ShapeDescriptor {
    ShapeDescriptor::new(&[self.src_h, self.src_w, self.ic])
  }

  fn rlt_shape(&self) -> ShapeDescriptor {
    ShapeDescriptor::new(&[self.dst_h, self.dst_w, self.ic])
  }

  fn read_image(&mut self, dpu: &Dpu) -> Result<()> {
    check!(
      self.stride_offset_in < self.stride.0,
      DpuError::param(format!("stride_offset_in {} >= stride_h {}", self.stride_offset_in, self.stride.0))
    );
    let pp = self.pp as u32;
    let base = (self.bank_id_in / pp) * pp;
    let mut bank_id = self.bank_id_in;
    let mut offset = self.stride_offset_in;
    let mut group = 0;
    let row_len = self.src_w * self.ic;
    for h in 0..self.real_src_h {
      check!(
        group < ADDR_GROUPS,
        DpuError::param(format!("input rows walk past the {} base addresses", ADDR_GROUPS))
      );
      let bank = dpu.banks.get(bank_id)?;
      let depth = bank.depth();
      let row = &mut self.img[h * row_len..(h + 1) * row_len];
      for (w, px) in row.chunks_mut(self.ic).enumerate() {
        let addr = (self.bank_addr_in[group] + offset * self.jump_read_endl + w * self.jump_read) % depth;
        bank.read(addr, px)?;
      }
      offset += 1;
      if offset == self.stride.0 {
        offset = 0;
        bank_id += 1;
        if bank_id == base + pp {
          bank_id = base;
          group += 1;
        }
      }
    }
    Ok(())
  }

  fn read_weights(&mut self, dpu: &Dpu) -> Result<()> {
    let bank = dpu.banks.in_group(&dpu.profile.alu.weight_bank, 0)?;
    let depth = bank.depth();
    let (kh, kw) = self.kernel;
    let ic = self.ic;
    for a in 0..kh {
      for b in 0..kw {
        let addr = (self.bank_addr_weights + a * kw * self.jump_read_weights + b * self.jump_read_weights) % depth;
        let dst = a * kw * ic + b * ic;
        if self.mode == ExecMode::Dwcvw16b0 {
          let raw = bank.read_vec(addr, 2 * ic)?;
          for (w, pair) in self.weights16[dst..dst + ic].iter_mut().zip(raw.chunks(2)) {
            *w = i16::from_le_bytes([pair[0] as u8, pair[1] as u8]);
          }
        } else {
          bank.read(addr, &mut self.weights[dst..dst + ic])?;
        }
      }
    }
    Ok(())
  }

  fn depthwise(&mut self, dpu: &Dpu) -> Result<()> {
    let shape = self.img_shape();
    let (kh, kw, ic, cp) = (self.kernel.0, self.kernel.1, self.ic, self.cp);
    let mut acc = vec![0i64; self.dst_h * self.dst_w * ic];
    let this = &*self;
    dpu.pool.for_each_chunk(&mut acc, self.dst_w * ic, |oh, row| {
      kernels::dw_conv_row(&this.img, &shape, this.real_src_h, this.kernel, this.stride, oh, row, |a, b, k| {
        let tap = a * kw * ic + b * ic + k;
        if this.mode == ExecMode::Dwcvw16b0 {
          // one 16-bit weight per channel-parallel lane group
          this.weights16[tap - k % cp] as i64
        } else {
          this.weights[tap] as i64
        }
      });
      Ok(())
    })?;
    debug!("dwconv {}x{} taps over {} rows", kh, kw, self.real_src_h);
    self.acc = acc;
    Ok(())
  }

  fn add_bias(&mut self) {
    let ic = self.ic;
    let factor = kernels::pow2(self.shift_bias);
    for (i, a) in self.acc.iter_mut().enumerate() {
      *a = (*a as f64 * 2.0 + self.bias[i % ic] as f64 * factor) as i64;
    }
  }

  fn requantize(&mut self) -> Result<()> {
    let act = Activation::plain(self.act);
    let sc = self.shift_cut;
    for (r, &a) in self.rlt.iter_mut().zip(&self.acc) {
      let v = match self.mode {
        ExecMode::Dwcv => a as f64 / kernels::pow2(sc + 1),
        ExecMode::Dwcvb0 => a as f64 / kernels::pow2(sc),
        _ => a as f64 * 2.0 / kernels::pow2(sc + 1),
      };
      *r = dpu_round(act.apply(v, CONV_ACTS)?);
    }
    Ok(())
  }

  /// Negative inputs scale by `slope(k)` and shift by the negative shift,
  /// everything else by the positive shift.
  fn slope<F: Fn(usize) -> f64>(&mut self, slope: F) {
    let (pos, neg) = (kernels::pow2(self.shift_prelu.0), kernels::pow2(self.shift_prelu.1));
    let n = self.dst_h * self.dst_w * self.ic;
    for i in 0..n {
      let mut t = self.img[i] as f64;
      if t < 0.0 {
        t *= slope(i % self.ic);
      }
      t /= if t < 0.0 { neg } else { pos };
      self.rlt[i] = dpu_round(t);
    }
  }

  fn ave_pool(&mut self) {
    let shape = self.img_shape();
    let (kh, kw) = self.kernel;
    let (sh, sw) = self.stride;
    let factor = kernels::pow2(kernels::legacy_shift_cut(self.shift_cut));
    let mf = self.multi_factor as f32;
    let mut i = 0;
    while i + kh <= self.real_src_h {
      let mut j = 0;
      while j + kw <= self.src_w {
        for k in 0..self.ic {
          let mut sum = 0f32;
          for a in 0..kh {
            for b in 0..kw {
              sum += self.img[shape.offset(&[i + a, j + b, k])] as f32;
            }
          }
          let v = ((sum * mf) as f64 * factor) as f32;
          self.rlt[(i / sh) * self.dst_w * self.ic + (j / sw) * self.ic + k] = dpu_round(v as f64);
        }
        j += sw;
      }
      i += sh;
    }
  }
}

impl ComputeVariant for DirectAlu {
  fn target_check(&self, profile: &Profile) -> Result<()> {
    check_target(profile, self.bank_id_in, self.bank_id_out, self.kernel, self.stride, self.act)
  }

  fn read(&mut self, dpu: &Dpu) -> Result<()> {
    self.read_image(dpu)?;
    match self.mode {
      ExecMode::Avepool | ExecMode::Maxpool | ExecMode::Leakyrelu | ExecMode::Maxreduce | ExecMode::Hsigmoid => {
        return Ok(());
      },
      ExecMode::Prelu => {
        let bank = dpu.banks.in_group(&dpu.profile.alu.weight_bank, 0)?;
        return bank.read(self.bank_addr_weights, &mut self.prelu);
      },
      _ => {},
    }
    self.read_weights(dpu)?;
    if matches!(self.mode, ExecMode::Dwcvb0 | ExecMode::Dwcvw16b0) {
      return Ok(());
    }
    let bank = dpu.banks.in_group(&dpu.profile.alu.bias_bank, 0)?;
    bank.read(self.bank_addr_bias, &mut self.bias)
  }

  fn pad(&mut self) -> Result<()> {
    if self.mode == ExecMode::Maxreduce {
      return Ok(());
    }
    let value = if self.mode == ExecMode::Maxpool { i8::MIN } else { 0 };
    let shape = self.img_shape();
    kernels::pad_borders(&mut self.img, &shape, self.real_src_h, self.pad, self.kernel, value);
    kernels::pad_channel_tail(&mut self.img, &shape, self.real_src_h, self.channel_offset, value);
    Ok(())
  }

  fn transform(&mut self, dpu: &Dpu) -> Result<()> {
    debug!("{:?}: {}x{} -> {}x{}", self.mode, self.real_src_h, self.src_w, self.real_dst_h, self.dst_w);
    match self.mode {
      ExecMode::Dwcv | ExecMode::Dwcvb0 | ExecMode::Dwcvw16b0 => {
        self.depthwise(dpu)?;
        if self.mode == ExecMode::Dwcv {
          self.add_bias();
        }
        self.requantize()
      },
      ExecMode::Leakyrelu => {
        let mf = self.multi_factor as f64;
        self.slope(|_| mf);
        Ok(())
      },
      ExecMode::Prelu => {
        let prelu = self.prelu.clone();
        self.slope(|k| prelu[k] as f64);
        Ok(())
      },
      ExecMode::Maxpool | ExecMode::Maxreduce => {
        let (shape, out_shape) = (self.img_shape(), self.rlt_shape());
        let shift = kernels::legacy_shift_cut(self.shift_cut);
        kernels::max_pool(&self.img, &shape, self.real_src_h, self.kernel, self.stride, &mut self.rlt, &out_shape, shift)
      },
      ExecMode::Avepool => {
        self.ave_pool();
        Ok(())
      },
      ExecMode::Hsigmoid => {
        let n = self.dst_h * self.dst_w * self.ic;
        for i in 0..n {
          self.rlt[i] = dpu_round(kernels::hsigmoid(self.img[i] as f64, self.shift_bias, self.shift_cut));
        }
        Ok(())
      },
      mode => Err(DpuError::unsupported(format!("exec_mode {:?}", mode), dpu.profile.name.clone())),
    }
  }

  fn save(&self, dpu: &mut Dpu) -> Result<()> {
    let pp = self.pp;
    let off = self.bank_id_out as usize % pp;
    let base = self.bank_id_out as usize - off;
    let row_len = self.dst_w * self.ic;
    for h in 0..self.real_dst_h {
      let bank_offset = (h + self.stride_offset_out) / self.stride_out;
      let group_offset = (off + bank_offset) / pp;
      let bank_id = (base + (off + bank_offset) % pp) as u32;
      let row = self.bank_addr_out
        + group_offset * self.stride_out * self.jump_write_endl
        + ((h + self.stride_offset_out) % self.stride_out) * self.jump_write_endl;
      let bank = dpu.banks.get_mut(bank_id)?;
      let depth = bank.depth();
      for (w, px) in self.rlt[h * row_len..(h + 1) * row_len].chunks(self.ic).enumerate() {
        bank.write((row + w * self.jump_write) % depth, px)?;
      }
    }
    debug!("saved {} rows from bank {} row {}", self.real_dst_h, self.bank_id_out, self.bank_addr_out);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::dpu::field::fields;
  use crate::arch::dpu::DpuOptions;
  use crate::arch::profile::Generation;

  fn init(mode: i64, kernel: i64, stride: i64) -> FieldMap {
    fields([
      ("exec_mode", mode),
      ("jump_read", 1),
      ("jump_read_endl", 4),
      ("jump_read_weights", 1),
      ("jump_write", 1),
      ("jump_write_endl", 4),
      ("shift_cut", 0),
      ("shift_bias", 0),
      ("act_type", 0),
      ("stride_h", stride),
      ("stride_w", stride),
      ("stride_out", 1),
      ("channel_group", 1),
      ("length", 2),
      ("kernel_h", kernel),
      ("kernel_w", kernel),
      ("multi_factor", 1),
      ("shift_prelu_p", 32),
      ("shift_prelu_n", 33),
    ])
  }

  fn alu(vpp: i64) -> FieldMap {
    fields([
      ("bank_id_in", 0),
      ("bank_addr_in", 0),
      ("bank_id_out", 8),
      ("bank_addr_out", 0),
      ("valid_pixel_parallel", vpp),
    ])
  }

  fn dpu() -> Dpu {
    Dpu::new(Profile::builtin(Generation::Dpuv2), DpuOptions::default()).unwrap()
  }

  #[test]
  fn geometry_follows_parallelism() {
    let p = Profile::builtin(Generation::Dpuv2);
    let a = DirectAlu::decode(&init(0, 3, 2), &alu(3), &p).unwrap();
    assert_eq!((a.src_h, a.real_src_h, a.src_w), (17, 7, 5));
    assert_eq!((a.dst_h, a.real_dst_h, a.dst_w, a.ic), (8, 3, 2, 16));
  }

  #[test]
  fn decode_rejections() {
    let p = Profile::builtin(Generation::Dpuv2);
    let mut bad = init(0, 1, 1);
    bad.insert("shift_bias".into(), 21);
    assert!(matches!(DirectAlu::decode(&bad, &alu(1), &p), Err(DpuError::Parameter { .. })));
    assert!(DirectAlu::decode(&init(4, 3, 1), &alu(1), &p).is_err());
    assert!(DirectAlu::decode(&init(0, 1, 1), &alu(9), &p).is_err());
    // HSIGMOID is not enabled on DPUV2
    assert!(matches!(DirectAlu::decode(&init(7, 1, 1), &alu(1), &p), Err(DpuError::Unsupported { .. })));
    let mut deep = alu(1);
    deep.insert("kernel_d".into(), 2);
    assert!(DirectAlu::decode(&init(0, 1, 1), &deep, &p).is_err());
  }

  #[test]
  fn leaky_uses_slope_and_shifts() {
    let mut d = dpu();
    d.banks.get_mut(0).unwrap().write(0, &[-8, 8]).unwrap();
    let mut f = init(4, 1, 1);
    f.insert("multi_factor".into(), 3);
    f.insert("length".into(), 1);
    let mut a = DirectAlu::decode(&f, &alu(1), &d.profile).unwrap();
    a.exec(&mut d).unwrap();
    // -8 * 3 / 2^(33 - 32), 8 / 2^0
    assert_eq!(&d.banks.get(8).unwrap().read_vec(0, 2).unwrap(), &[-12, 8]);
  }

  #[test]
  fn maxpool_pads_with_min() {
    let mut d = dpu();
    d.banks.get_mut(0).unwrap().write(1, &vec![-5; 16]).unwrap();
    d.banks.get_mut(0).unwrap().write(3, &vec![-7; 16]).unwrap();
    let mut f = init(3, 2, 2);
    f.insert("length".into(), 1);
    f.insert("jump_read_endl".into(), 2);
    let mut fields = alu(1);
    fields.insert("pad_left".into(), 1);
    // right / bottom at kernel - 1 leave those borders alone
    fields.insert("pad_right".into(), 1);
    fields.insert("pad_bottom".into(), 1);
    let mut a = DirectAlu::decode(&f, &fields, &d.profile).unwrap();
    a.exec(&mut d).unwrap();
    // column 0 is padding, the max over the rest is -5 not 0
    assert_eq!(a.result()[0], -5);
  }
}
