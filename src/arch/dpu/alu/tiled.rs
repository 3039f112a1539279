//! Compute path of the address-list generations (XV2DPU, XV3DPU).
//!
//! Rows are not derived from bank strides: every input / output row comes
//! from an address-list descriptor claimed from the init block in force.

use std::collections::BTreeMap;

use log::debug;

use super::config::{AddrType, Claim, MAX_INPUTS};
use super::kernels::{self, Activation, NormFix, Padding, ReduceAxis, ReduceOp, ELEW_ACTS, TILED_ACTS};
use super::{check_target, ComputeVariant, NormScratch};
use crate::arch::dpu::field::{FieldMap, Fields};
use crate::arch::dpu::quant::{dpu_round, dpu_round_even};
use crate::arch::dpu::shape::ShapeDescriptor;
use crate::arch::dpu::Dpu;
use crate::arch::profile::{ActType, ExecMode, Generation, PadType, Parallel, Profile, TiledEngines};
use crate::check;
use crate::error::{DpuError, Result};

/// Both engines read and write the first bank of the image group.
const BANK_IO: u32 = 0;
const MAX_SHIFT_BIAS: i64 = 20;
/// Elementwise results take `shift_cut` as a 7-bit shift-write code.
const SHIFT_WRITE_BITS: u32 = 7;
/// XV2DPU output width parallelism.
const XV2_OWP: usize = 8;
/// `b_mode` value meaning "no bias".
const B_MODE_NO_BIAS: i64 = 2;
const LAYER_PARAM_LEN: usize = 64;
const LP_WEIGHTS_FP: usize = 23;
const LP_BIAS_FP: usize = 24;
const KERNEL_W_GRANULE: usize = 4;
const BIAS_DUP: usize = 4;
/// Core modes used by the weight layouts of the newest generation.
const CORE_DWCONV: usize = 1;
const CORE_NORM: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowAddr {
  pub addr: usize,
  pub jump: usize,
}

#[derive(Debug, Clone)]
pub struct TiledAlu {
  generation: Generation,
  mode: ExecMode,
  sub_mode: i64,
  act: Activation,
  num: usize,
  alu_num: u32,
  left: u32,
  share_channel_group: bool,
  share_kernel: bool,
  kernel: (usize, usize),
  stride: (usize, usize),
  b_mode: i64,
  pad_type: PadType,
  tile_cg: usize,
  oc_iter: usize,
  shift_bias: i64,
  shift_cut: i64,
  shift_read: [i64; MAX_INPUTS],
  lp_mt_addr: usize,
  fix: NormFix,

  rows_in: BTreeMap<usize, Vec<RowAddr>>,
  rows_out: Vec<RowAddr>,
  bank_addr_weights: usize,
  jump_read_weights: usize,
  bank_addr_bias: usize,
  pad: Padding,

  cp: usize,
  ic: usize,
  src_h: usize,
  src_w: usize,
  dst_h: usize,
  dst_w: usize,

  img: Vec<i8>,
  weights: Vec<i8>,
  bias: Vec<i8>,
  acc: Vec<i64>,
  rlt: Vec<i8>,
  mean: Vec<f32>,
  variance: Vec<f32>,
}

/// (pixel, channel, output width) parallelism of one compute mode.
fn parallelism(mode: ExecMode, init: &FieldMap, profile: &Profile) -> Result<(usize, usize, usize)> {
  if profile.generation == Generation::Xv2dpu {
    return Ok((profile.alu.pixel_parallel, profile.alu.channel_parallel, XV2_OWP));
  }
  let t = profile.tiled()?;
  let aie = init.field_or("aie_mode", 0);
  let of = |p: Parallel| (p.pixel_parallel, p.channel_parallel, p.output_w_parallel);
  Ok(match mode {
    ExecMode::Macc => {
      let p = TiledEngines::mode(&t.dwconv, aie, "dwconv")?;
      (init.field_usize("ohp")?, p.channel_parallel, init.field_usize("owp")?)
    },
    ExecMode::Comp => of(TiledEngines::mode(&t.pool, aie, "pool")?),
    m if m.is_elew() => {
      let p = TiledEngines::mode(&t.eltwise, aie, "eltwise")?;
      (p.pixel_parallel, init.field_usize("cp")?, p.output_w_parallel)
    },
    m if m.is_instnorm() => of(TiledEngines::mode(&t.norm, aie, "norm")?),
    ExecMode::Reduction => {
      let (pp, cp, owp) = of(t.reduce);
      (pp, if aie == 1 { cp / 2 } else { cp }, owp)
    },
    ExecMode::L2norm => of(t.l2norm),
    _ => of(TiledEngines::mode(&t.dwconv, aie, "dwconv")?),
  })
}

fn slot<'a, T>(buf: &'a mut [T], at: usize, len: usize, what: &str) -> Result<&'a mut [T]> {
  check!(
    at + len <= buf.len(),
    DpuError::range(format!("{} [{}, {}) beyond buffer of {}", what, at, at + len, buf.len()))
  );
  Ok(&mut buf[at..at + len])
}

impl TiledAlu {
  pub fn decode(claim: &Claim, f: &FieldMap, profile: &Profile) -> Result<Self> {
    let init = &claim.init;
    let generation = profile.generation;
    let xv3 = generation == Generation::Xv3dpu;
    let code = init.field("exec_mode")?;
    if !xv3 {
      check!(
        (ExecMode::Macc.code()..=ExecMode::ElewMul.code()).contains(&code),
        DpuError::param(format!("exec_mode {} outside MACC..=ELEW_MUL", code))
      );
    }
    let mode = profile.exec_mode(code)?;
    let shift_bias = init.field_or("shift_bias", 0);
    check!(
      shift_bias <= MAX_SHIFT_BIAS,
      DpuError::param(format!("shift_bias {} > {}", shift_bias, MAX_SHIFT_BIAS))
    );
    let kernel = (init.field_or("kernel_h", 1).max(0) as usize, init.field_or("kernel_w", 1).max(0) as usize);
    let stride = (init.field_or("stride_h", 1).max(0) as usize, init.field_or("stride_w", 1).max(0) as usize);
    check!(
      kernel.0 >= 1 && kernel.1 >= 1 && stride.0 >= 1 && stride.1 >= 1,
      DpuError::param(format!("kernel {:?} / stride {:?} must be positive", kernel, stride))
    );
    let num = init.field_usize("num")?;
    check!(
      (1..=MAX_INPUTS).contains(&num),
      DpuError::param(format!("num {} outside 1..={}", num, MAX_INPUTS))
    );

    let mut rows_in: BTreeMap<usize, Vec<RowAddr>> = BTreeMap::new();
    let mut rows_out = Vec::new();
    let (mut bank_addr_weights, mut jump_read_weights, mut bank_addr_bias) = (0, 0, 0);
    let share_rows = mode.is_elew() || mode.is_instnorm();
    for e in &claim.entries {
      match e.kind {
        AddrType::Ifm => {
          if e.invalid {
            continue;
          }
          let rows = rows_in.entry(e.id).or_default();
          for i in 0..e.h_num {
            let addr = if share_rows && e.jump_endl == 0 { e.mt_addr } else { e.mt_addr + i * e.jump_endl };
            rows.push(RowAddr { addr, jump: e.jump });
          }
        },
        AddrType::Wgt => {
          bank_addr_weights = e.mt_addr;
          jump_read_weights = e.jump;
        },
        AddrType::Bias => bank_addr_bias = e.mt_addr,
        AddrType::Ofm => {
          check!(!e.invalid, DpuError::param("invalid entry in the output address list"));
          rows_out.extend((0..e.h_num).map(|i| RowAddr { addr: e.mt_addr + i * e.jump_endl, jump: e.jump }));
        },
      }
    }
    let single_input = matches!(mode, ExecMode::Macc | ExecMode::Comp | ExecMode::Reduction | ExecMode::L2norm)
      || mode.is_instnorm();
    if single_input {
      check!(
        num == 1 && rows_in.len() == 1 && rows_in.contains_key(&0),
        DpuError::param(format!("{:?} takes exactly input id 0 (num {}, ids {:?})", mode, num, rows_in.keys()))
      );
    }
    if mode.is_elew() {
      check!(
        rows_in.len() == num,
        DpuError::param(format!("{} input ids listed for num {}", rows_in.len(), num))
      );
    }

    let (pp, cp, owp) = parallelism(mode, init, profile)?;
    let tile_owg = init.field_usize("tile_owg")?;
    let tile_ohg = init.field_usize("tile_ohg")?;
    let tile_cg = init.field_usize("tile_cg")?;
    let ow_iter = init.field_usize("ow_iter")?;
    let oh_iter = if xv3 { init.field_or("oh_iter", 1) } else { 1 };
    let oc_iter = if xv3 { init.field_or("oc_iter", 1).max(1) as usize } else { 1 };

    let dst_h = rows_out.len();
    if matches!(mode, ExecMode::Macc | ExecMode::Comp) {
      check!(dst_h > 0, DpuError::param(format!("{:?} without output rows", mode)));
    }
    let oh_offset = oh_iter * (tile_ohg * pp) as i64 - dst_h as i64;
    let ow_offset = if xv3 { 0 } else { init.field_or("ow_offset", 0) };
    check!(
      ow_offset < (tile_owg * owp) as i64,
      DpuError::param(format!("ow_offset {} not below tile_owg * owp {}", ow_offset, tile_owg * owp))
    );
    let dst_w = (ow_iter * tile_owg * owp) as i64 - ow_offset;
    check!(dst_w > 0, DpuError::param(format!("output width {} is empty", dst_w)));
    let dst_w = dst_w as usize;

    // Right / bottom fields name the padded extent in the full tile, the
    // border pass wants them relative to the window end.
    let pad_right_field = f.field_or("pad_right", 0);
    let pad_bottom_field = f.field_or("pad_bottom", 0);
    let pr = if pad_right_field != 0 { pad_right_field - stride.1 as i64 * ow_offset } else { 0 };
    let pb = if pad_bottom_field != 0 { pad_bottom_field - stride.0 as i64 * oh_offset } else { 0 };
    let pad = Padding {
      left: f.field_or("pad_left", 0),
      top: f.field_or("pad_top", 0),
      right: kernel.1 as i64 - pr - 1,
      bottom: kernel.0 as i64 - pb - 1,
    };

    let ic = tile_cg * cp * oc_iter;
    let (src_h, src_w) = match mode {
      ExecMode::Macc | ExecMode::Comp => ((dst_h - 1) * stride.0 + kernel.0, (dst_w - 1) * stride.1 + kernel.1),
      ExecMode::Reduction => {
        let h = rows_in.get(&0).map_or(0, Vec::len);
        let axis = ReduceAxis::from_sub_mode(init.field_or("exec_sub_mode", 0))?;
        (h, if axis == ReduceAxis::W { kernel.1 } else { dst_w })
      },
      _ => (dst_h, dst_w),
    };
    let mut shift_read = [0; MAX_INPUTS];
    for (k, s) in shift_read.iter_mut().enumerate() {
      *s = init.field_or(&format!("shift_read_{}", k), 0);
    }
    let rlt_fill = if mode == ExecMode::Comp { i8::MIN } else { 0 };

    debug!(
      "{:?}: src {}x{}x{}x{} dst {}x{}x{} (pp {} cp {} owp {})",
      mode, src_h, num, src_w, ic, dst_h, dst_w, ic, pp, cp, owp
    );
    Ok(Self {
      generation,
      mode,
      sub_mode: if xv3 { init.field_or("exec_sub_mode", 0) } else { 0 },
      act: Activation {
        act: ActType::from_code(init.field_or("act_type", 0))?,
        hsigmoid_in: init.field_or("hsigmoid_in", 0),
        shift_hsigmoid: init.field_or("shift_hsigmoid", 0),
        shift_hswish: init.field_or("shift_hswish", 0),
      },
      num,
      alu_num: claim.alu_num,
      left: claim.left,
      share_channel_group: init.flag("share_channel_group"),
      share_kernel: init.flag("share_kernel"),
      kernel,
      stride,
      b_mode: init.field_or("b_mode", 0),
      pad_type: PadType::from_code(init.field_or("pad_type", 0))?,
      tile_cg,
      oc_iter,
      shift_bias,
      shift_cut: init.field("shift_cut")?,
      shift_read,
      lp_mt_addr: init.field_or("lp_mt_addr", 0).max(0) as usize,
      fix: NormFix {
        input_fp: claim.input_fp,
        output_fp: claim.output_fp,
        weights_fp: 0,
        bias_fp: 0,
        epsilon: f32::from_bits(init.field_or("epsilon", 0) as u32),
      },
      rows_in,
      rows_out,
      bank_addr_weights,
      jump_read_weights,
      bank_addr_bias,
      pad,
      cp,
      ic,
      src_h,
      src_w,
      dst_h,
      dst_w,
      img: vec![0; src_h * num * src_w * ic],
      weights: vec![0; kernel.0 * kernel.1 * ic],
      bias: vec![0; ic],
      acc: Vec::new(),
      rlt: vec![rlt_fill; dst_h * dst_w * ic],
      mean: Vec::new(),
      variance: Vec::new(),
    })
  }

  pub fn mode(&self) -> ExecMode {
    self.mode
  }

  /// `dst_h x dst_w x channels`, in the order `save` writes it.
  pub fn result(&self) -> &[i8] {
    &self.rlt
  }

  fn xv3(&self) -> bool {
    self.generation == Generation::Xv3dpu
  }

  fn img_shape(&self) -> ShapeDescriptor {
    ShapeDescriptor::new(&[self.src_h, self.num, self.src_w, self.ic])
  }

  /// View of input 0 as a plain `rows x cols x channels` plane.
  fn plane_shape(&self) -> ShapeDescriptor {
    ShapeDescriptor::new(&[self.src_h, self.src_w, self.ic])
  }

  fn rlt_shape(&self) -> ShapeDescriptor {
    ShapeDescriptor::new(&[self.dst_h, self.dst_w, self.ic])
  }

  fn read_image(&mut self, dpu: &Dpu) -> Result<()> {
    let bank = dpu.banks.get(BANK_IO)?;
    let depth = bank.depth();
    let shape = self.img_shape();
    let xv3 = self.xv3();
    let pad_top = self.pad.top.max(0) as usize;
    let pad_left = self.pad.left.max(0) as usize;
    for id in 0..self.num {
      let rows = self
        .rows_in
        .get(&id)
        .ok_or_else(|| DpuError::range(format!("no input rows listed for id {}", id)))?;
      for h in 0..self.src_h {
        let cur = if !xv3 {
          h
        } else if h >= pad_top && h < pad_top + rows.len() {
          h - pad_top
        } else {
          0
        };
        let row = rows
          .get(cur)
          .ok_or_else(|| DpuError::range(format!("input id {} lists {} rows, row {} needed", id, rows.len(), cur)))?;
        let mut addr = row.addr;
        for w in 0..self.src_w {
          if xv3 && w < pad_left {
            continue;
          }
          let at = shape.offset(&[h, id, w, 0]);
          bank.read(addr, &mut self.img[at..at + self.ic])?;
          addr = (addr + row.jump) % depth;
        }
      }
    }
    Ok(())
  }

  /// Two bank-wide halves per channel group, spread over the first two banks.
  fn read_weights_xv2(&mut self, dpu: &Dpu) -> Result<()> {
    let profile = &dpu.profile;
    let (kh, kw) = self.kernel;
    let oc = self.ic;
    let group = profile.group(&profile.alu.weight_bank)?;
    let width = group.width;
    let jump_ocg = if self.share_channel_group { 0 } else { self.jump_read_weights };
    let jump_tap = if self.share_kernel { 0 } else { 1 };
    for g in 0..oc.div_ceil(self.cp) {
      for a in 0..kh {
        for b in 0..kw {
          for half in 0..2u32 {
            let bank = dpu.banks.in_group(&profile.alu.weight_bank, half)?;
            let addr = (self.bank_addr_weights + g * jump_ocg + (a * kw + b) * jump_tap) % bank.depth();
            let dst = a * kw * oc + b * oc + g * self.cp + half as usize * width;
            let len = width.min(self.weights.len().saturating_sub(dst));
            bank.read(addr, slot(&mut self.weights, dst, len, "weights")?)?;
          }
        }
      }
    }
    if self.b_mode == B_MODE_NO_BIAS {
      return Ok(());
    }
    let width = profile.group(&profile.alu.bias_bank)?.width;
    let jump_cg = if self.share_channel_group { 0 } else { 1 };
    for cg in 0..self.tile_cg {
      for half in 0..2u32 {
        let bank = dpu.banks.in_group(&profile.alu.bias_bank, half)?;
        let addr = (self.bank_addr_bias + cg * jump_cg) % bank.depth();
        let dst = cg * self.cp + half as usize * width;
        let len = width.min(self.bias.len().saturating_sub(dst));
        bank.read(addr, slot(&mut self.bias, dst, len, "bias")?)?;
      }
    }
    Ok(())
  }

  /// Fix points of the weights and bias live in the layer parameter block.
  fn read_layer_param(&mut self, dpu: &Dpu) -> Result<()> {
    let t = dpu.profile.tiled()?;
    let lp = dpu.banks.in_group(&t.norm_weight_bank, 0)?.read_vec(self.lp_mt_addr, LAYER_PARAM_LEN)?;
    self.fix.weights_fp = lp[LP_WEIGHTS_FP] as i64;
    self.fix.bias_fp = lp[LP_BIAS_FP] as i64;
    Ok(())
  }

  /// Per core and channel iteration: `tile_cg` weight vectors laid out
  /// `kh x ceil(kw / 4) x 4 x core_ocp`, then `tile_cg` bias vectors.
  fn read_weights_xv3(&mut self, dpu: &Dpu) -> Result<()> {
    let t = dpu.profile.tiled()?;
    let core_ocp = t.core(CORE_DWCONV)?;
    let oc_core_num = self.cp / core_ocp;
    let bank = dpu.banks.in_group(&t.dwconv_weight_bank, 0)?;
    let width = bank.width();
    let (kh, kw) = self.kernel;
    let oc = self.ic;
    let kwg = kw.div_ceil(KERNEL_W_GRANULE);
    let bias_lines = core_ocp * BIAS_DUP / width;
    let sv_size = kh * kwg * core_ocp * KERNEL_W_GRANULE;
    let sv_lines = sv_size / width;
    let tcg = self.tile_cg;
    let mut base = self.bank_addr_weights;
    for it in 0..self.oc_iter {
      for core in 0..oc_core_num {
        let oc_base = |tg: usize| it * oc_core_num * tcg * core_ocp + core * tcg * core_ocp + tg * core_ocp;
        for tg in 0..tcg {
          let sv = bank.read_vec(base, sv_size)?;
          let mut src = 0;
          for a in 0..kh {
            for g in 0..kwg {
              for q in 0..KERNEL_W_GRANULE {
                let b = g * KERNEL_W_GRANULE + q;
                for c in 0..core_ocp {
                  if b < kw {
                    slot(&mut self.weights, a * kw * oc + b * oc + oc_base(tg) + c, 1, "weights")?[0] = sv[src];
                  }
                  src += 1;
                }
              }
            }
          }
          base += sv_lines;
        }
        for tg in 0..tcg {
          bank.read(base, slot(&mut self.bias, oc_base(tg), core_ocp, "bias")?)?;
          base += bias_lines;
        }
      }
    }
    Ok(())
  }

  /// Scale / bias vectors of the first instance-norm phase.
  fn read_norm_params(&mut self, dpu: &Dpu) -> Result<()> {
    let t = dpu.profile.tiled()?;
    let core_ocp = t.core(CORE_NORM)?;
    let oc_core_num = self.cp / core_ocp;
    let bank = dpu.banks.in_group(&t.norm_weight_bank, 0)?;
    let sv = core_ocp * self.tile_cg;
    let sv_lines = sv / bank.width();
    let mut base = self.bank_addr_weights;
    for core in 0..oc_core_num {
      for it in 0..self.oc_iter {
        let oc_base = core * self.oc_iter * sv + it * sv;
        bank.read(base, slot(&mut self.weights, oc_base, sv, "norm weights")?)?;
        bank.read(base + sv_lines, slot(&mut self.bias, oc_base, sv, "norm bias")?)?;
        base += 2 * sv_lines;
      }
    }
    Ok(())
  }

  fn take_scratch(&mut self, norm: &NormScratch, with_params: bool) -> Result<()> {
    let oc = self.ic;
    check!(
      norm.mean.len() >= oc && norm.variance.len() >= oc,
      DpuError::ordering(format!(
        "instance norm statistics cover {} channels, {} needed",
        norm.mean.len().min(norm.variance.len()),
        oc
      ))
    );
    self.mean = norm.mean[..oc].to_vec();
    self.variance = norm.variance[..oc].to_vec();
    if with_params {
      check!(
        norm.weights.len() >= oc && norm.bias.len() >= oc,
        DpuError::ordering(format!("instance norm scale / bias cover {} channels, {} needed", norm.weights.len(), oc))
      );
      self.weights[..oc].copy_from_slice(&norm.weights[..oc]);
      self.bias[..oc].copy_from_slice(&norm.bias[..oc]);
    }
    Ok(())
  }

  fn depthwise(&mut self, dpu: &Dpu) -> Result<()> {
    let shape = self.plane_shape();
    let (kw, oc) = (self.kernel.1, self.ic);
    let mut acc = vec![0i64; self.dst_h * self.dst_w * oc];
    let this = &*self;
    dpu.pool.for_each_chunk(&mut acc, self.dst_w * oc, |oh, row| {
      kernels::dw_conv_row(&this.img, &shape, this.src_h, this.kernel, this.stride, oh, row, |a, b, k| {
        this.weights[a * kw * oc + b * oc + k] as i64
      });
      Ok(())
    })?;
    let factor = kernels::pow2(self.shift_bias);
    for (i, a) in acc.iter_mut().enumerate() {
      let bias = if self.b_mode != B_MODE_NO_BIAS { self.bias[i % oc] as f64 * factor } else { 0.0 };
      *a = (*a as f64 * 2.0 + bias) as i64;
    }
    self.acc = acc;
    Ok(())
  }

  fn eltwise_row(&self, r: usize, out: &mut [i8], shift_write: f64) -> Result<()> {
    let shape = self.img_shape();
    let broadcast_c = self.xv3() && self.sub_mode & 1 != 0;
    let add = self.mode == ExecMode::ElewAdd;
    // Per-operand view of one row: inputs after the first carry a single
    // channel under channel broadcast.
    let operands: Vec<ShapeDescriptor> = (0..self.num)
      .map(|k| ShapeDescriptor::new(&[self.src_w, if broadcast_c && k > 0 { 1 } else { self.ic }]))
      .collect();
    for (i, px) in out.chunks_mut(self.ic).enumerate() {
      for (j, o) in px.iter_mut().enumerate() {
        let mut t = if add { 0.0 } else { 1.0 };
        for (k, operand) in operands.iter().enumerate() {
          let c = operand.broadcast_coord(&[i, j])?;
          let v = (self.img[shape.offset(&[r, k, c[0], c[1]])] as f64 * 4.0 / kernels::pow2(self.shift_read[k])).floor();
          match self.mode {
            ExecMode::ElewAdd => t += v,
            ExecMode::ElewMul => t *= v,
            _ => t /= v,
          }
        }
        t *= shift_write;
        t /= if add { 4.0 } else { 16.0 };
        *o = dpu_round(self.act.apply(t, ELEW_ACTS)?);
      }
    }
    Ok(())
  }

  fn instnorm_second(&mut self) -> Result<()> {
    let oc = self.ic;
    for (p, o) in self.rlt.iter_mut().enumerate() {
      let k = p % oc;
      let v = kernels::instnorm_value(self.img[p], self.mean[k], self.variance[k], self.weights[k], self.bias[k], &self.fix);
      *o = dpu_round_even(self.act.apply(v, ELEW_ACTS)?);
    }
    Ok(())
  }
}

impl ComputeVariant for TiledAlu {
  fn target_check(&self, profile: &Profile) -> Result<()> {
    check_target(profile, BANK_IO, BANK_IO, self.kernel, self.stride, self.act.act)
  }

  fn read(&mut self, dpu: &Dpu) -> Result<()> {
    self.read_image(dpu)?;
    if !self.xv3() {
      if self.mode == ExecMode::Macc {
        self.read_weights_xv2(dpu)?;
      }
      return Ok(());
    }
    self.read_layer_param(dpu)?;
    match self.mode {
      ExecMode::Macc => self.read_weights_xv3(dpu)?,
      ExecMode::InstancenormFirst => {
        if self.left == self.alu_num {
          self.mean = vec![0.0; self.ic];
          self.variance = vec![0.0; self.ic];
        } else {
          self.take_scratch(&dpu.norm, false)?;
        }
        self.read_norm_params(dpu)?;
      },
      ExecMode::InstancenormSecond => self.take_scratch(&dpu.norm, true)?,
      _ => {},
    }
    Ok(())
  }

  fn pad(&mut self) -> Result<()> {
    if !matches!(self.mode, ExecMode::Macc | ExecMode::Comp) {
      return Ok(());
    }
    let value = if self.mode == ExecMode::Comp && self.pad_type == PadType::Min { i8::MIN } else { 0 };
    let shape = self.plane_shape();
    kernels::pad_borders(&mut self.img, &shape, self.src_h, self.pad, self.kernel, value);
    Ok(())
  }

  fn transform(&mut self, dpu: &Dpu) -> Result<()> {
    match self.mode {
      ExecMode::Macc => {
        self.depthwise(dpu)?;
        let scale = kernels::pow2(self.shift_cut + 1);
        for (r, &a) in self.rlt.iter_mut().zip(&self.acc) {
          *r = dpu_round(self.act.apply(a as f64 / scale, TILED_ACTS)?);
        }
      },
      ExecMode::Comp => {
        let (shape, out_shape) = (self.plane_shape(), self.rlt_shape());
        let shift = kernels::signed_shift_cut(self.shift_cut);
        kernels::max_pool(&self.img, &shape, self.src_h, self.kernel, self.stride, &mut self.rlt, &out_shape, shift)?;
        for r in self.rlt.iter_mut() {
          *r = dpu_round(self.act.apply(*r as f64, TILED_ACTS)?);
        }
      },
      m if m.is_elew() => {
        let shift_write = kernels::shift_write_factor(self.shift_cut, SHIFT_WRITE_BITS);
        let mut rlt = std::mem::take(&mut self.rlt);
        let this = &*self;
        let res = dpu
          .pool
          .for_each_chunk(&mut rlt, self.dst_w * self.ic, |r, row| this.eltwise_row(r, row, shift_write));
        self.rlt = rlt;
        res?;
      },
      ExecMode::InstancenormFirst => {
        let shape = self.plane_shape();
        kernels::instnorm_accumulate(&self.img, &shape, &mut self.mean, &mut self.variance);
        if self.left == 1 {
          let total_hw = self.src_h * self.src_w * self.alu_num as usize;
          kernels::instnorm_finalize(&mut self.mean, &mut self.variance, self.fix.input_fp, total_hw);
          debug!("instance norm statistics final over {} pixels", total_hw);
        }
      },
      ExecMode::InstancenormSecond => self.instnorm_second()?,
      ExecMode::Reduction => {
        let axis = ReduceAxis::from_sub_mode(self.sub_mode)?;
        let op = ReduceOp::from_sub_mode(self.sub_mode)?;
        let scale = kernels::pow2(self.fix.output_fp - self.fix.input_fp);
        let (shape, out_shape) = (self.plane_shape(), self.rlt_shape());
        kernels::reduce(&self.img, &shape, axis, op, scale, &mut self.rlt, &out_shape)?;
      },
      ExecMode::L2norm => {
        let shape = self.plane_shape();
        let out = kernels::l2norm(
          &self.img,
          &shape,
          self.sub_mode,
          self.shift_read[0],
          kernels::signed_shift_cut(self.shift_cut),
        );
        let n = out.len().min(self.rlt.len());
        self.rlt[..n].copy_from_slice(&out[..n]);
      },
      mode => return Err(DpuError::unsupported(format!("exec_mode {:?}", mode), dpu.profile.name.clone())),
    }
    Ok(())
  }

  fn save(&self, dpu: &mut Dpu) -> Result<()> {
    let check_writes = dpu.options.double_write_check;
    let bank = dpu.banks.get_mut(BANK_IO)?;
    let (depth, width) = (bank.depth(), bank.width());
    let oc = self.ic;
    for (h, row) in self.rows_out.iter().enumerate() {
      let mut addr = row.addr;
      for w in 0..self.dst_w {
        let at = (h * self.dst_w + w) * oc;
        bank.write(addr, &self.rlt[at..at + oc])?;
        if check_writes {
          dpu.bank_writes.insert(BANK_IO, addr, oc.div_ceil(width));
        }
        addr = (addr + row.jump) % depth;
      }
    }
    if self.mode == ExecMode::InstancenormFirst {
      dpu.norm = NormScratch {
        mean: self.mean.clone(),
        variance: self.variance.clone(),
        weights: self.weights[..oc].to_vec(),
        bias: self.bias[..oc].to_vec(),
      };
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::dpu::alu::config::AddrEntry;
  use crate::arch::dpu::field::fields;

  fn entry(kind: AddrType, id: usize, h_num: usize, mt_addr: usize, jump_endl: usize) -> AddrEntry {
    AddrEntry { kind, id, h_num, mt_addr, jump: 1, jump_endl, invalid: false, fix_point: 0 }
  }

  fn claim(init: FieldMap, entries: Vec<AddrEntry>) -> Claim {
    Claim { init, entries, alu_num: 1, left: 1, input_fp: 0, output_fp: 0 }
  }

  fn xv2_init(mode: i64, num: i64) -> FieldMap {
    fields([
      ("exec_mode", mode),
      ("num", num),
      ("alu_num", 1),
      ("kernel_h", 2),
      ("kernel_w", 2),
      ("stride_h", 2),
      ("stride_w", 2),
      ("tile_owg", 1),
      ("tile_ohg", 1),
      ("tile_cg", 1),
      ("ow_iter", 1),
      ("ow_offset", 6),
      ("shift_cut", 0),
    ])
  }

  #[test]
  fn tile_geometry() {
    let p = Profile::builtin(Generation::Xv2dpu);
    let c = claim(xv2_init(9, 1), vec![entry(AddrType::Ifm, 0, 4, 0, 8), entry(AddrType::Ofm, 0, 2, 100, 4)]);
    let a = TiledAlu::decode(&c, &FieldMap::new(), &p).unwrap();
    assert_eq!((a.dst_h, a.dst_w, a.src_h, a.src_w, a.ic), (2, 2, 4, 4, 32));
    // zero pad fields leave right / bottom borders untouched
    assert_eq!((a.pad.right, a.pad.bottom), (1, 1));
    assert_eq!(a.rows_out[1], RowAddr { addr: 104, jump: 1 });
  }

  #[test]
  fn input_id_rules() {
    let p = Profile::builtin(Generation::Xv2dpu);
    let two = claim(xv2_init(9, 1), vec![entry(AddrType::Ifm, 1, 4, 0, 8), entry(AddrType::Ofm, 0, 2, 0, 4)]);
    assert!(matches!(TiledAlu::decode(&two, &FieldMap::new(), &p), Err(DpuError::Parameter { .. })));
    let elew = claim(xv2_init(11, 2), vec![entry(AddrType::Ifm, 0, 2, 0, 0), entry(AddrType::Ofm, 0, 2, 0, 4)]);
    assert!(TiledAlu::decode(&elew, &FieldMap::new(), &p).is_err());
    let out_of_family = claim(xv2_init(3, 1), vec![]);
    assert!(matches!(TiledAlu::decode(&out_of_family, &FieldMap::new(), &p), Err(DpuError::Parameter { .. })));
  }

  #[test]
  fn shared_rows_repeat_the_base() {
    let p = Profile::builtin(Generation::Xv2dpu);
    let c = claim(
      xv2_init(11, 2),
      vec![
        entry(AddrType::Ifm, 0, 3, 40, 0),
        entry(AddrType::Ifm, 1, 3, 50, 2),
        entry(AddrType::Ofm, 0, 3, 0, 4),
      ],
    );
    let a = TiledAlu::decode(&c, &FieldMap::new(), &p).unwrap();
    assert!(a.rows_in[&0].iter().all(|r| r.addr == 40));
    assert_eq!(a.rows_in[&1].iter().map(|r| r.addr).collect::<Vec<_>>(), vec![50, 52, 54]);
  }

  #[test]
  fn invalid_output_entry_is_fatal() {
    let p = Profile::builtin(Generation::Xv2dpu);
    let mut ofm = entry(AddrType::Ofm, 0, 2, 0, 4);
    ofm.invalid = true;
    let c = claim(xv2_init(9, 1), vec![entry(AddrType::Ifm, 0, 4, 0, 8), ofm]);
    assert!(TiledAlu::decode(&c, &FieldMap::new(), &p).is_err());
  }
}
