//! Arithmetic shared by the direct-addressing and address-list compute paths.
//!
//! Images are `rows x cols x channels` planes described by a
//! [`ShapeDescriptor`]; every kernel addresses them through it.

use crate::arch::dpu::quant::{dpu_round, dpu_round_even, dr, f_to_bf};
use crate::arch::dpu::shape::ShapeDescriptor;
use crate::arch::profile::ActType;
use crate::check;
use crate::error::{DpuError, Result};

/// `6 << 4`, the relu6 ceiling in the output domain.
pub const RELU6_CEIL: f64 = 96.0;
const HSIGMOID_MUL: f64 = 2731.0;
const HSIGMOID_CAP: f64 = 4_294_967_296.0;
const L2NORM_LANES: usize = 16;
const L2NORM_FLOOR: f32 = 1e-12;

/// Activations after a depthwise conv on direct-addressing targets.
pub const CONV_ACTS: &[ActType] = &[ActType::None, ActType::Relu, ActType::LeakyRelu, ActType::Relu6];
/// Activations after MACC / COMP on address-list targets.
pub const TILED_ACTS: &[ActType] = &[
  ActType::None,
  ActType::Relu,
  ActType::LeakyRelu,
  ActType::Relu6,
  ActType::Hsigmoid,
  ActType::Hswish,
];
/// Activations after elementwise and normalization stages.
pub const ELEW_ACTS: &[ActType] = &[ActType::None, ActType::Relu, ActType::LeakyRelu, ActType::Hsigmoid];

pub fn pow2(e: i64) -> f64 {
  2f64.powi(e.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
}

/// From 8 up the field encodes a right shift by `v - 8`.
pub fn legacy_shift_cut(v: i64) -> i64 {
  if v >= 8 {
    -(v - 8)
  } else {
    v
  }
}

/// Sign in bit 6, magnitude in the low six bits.
pub fn signed_shift_cut(v: i64) -> i64 {
  let magnitude = v & 0x3f;
  if v & 0x40 != 0 {
    -magnitude
  } else {
    magnitude
  }
}

/// Values at or above `2^(bit_width - 1)` encode right shifts.
pub fn shift_write_factor(shift_write: i64, bit_width: u32) -> f64 {
  let bound = 1i64 << (bit_width - 1);
  if shift_write >= bound {
    1.0 / pow2(shift_write - bound)
  } else {
    pow2(shift_write)
  }
}

pub fn hsigmoid(x: f64, hsigmoid_in: i64, shift: i64) -> f64 {
  HSIGMOID_CAP.min((x * HSIGMOID_MUL + 3.0 * HSIGMOID_MUL * pow2(hsigmoid_in)).max(0.0)) * pow2(-shift)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Activation {
  pub act: ActType,
  pub hsigmoid_in: i64,
  pub shift_hsigmoid: i64,
  pub shift_hswish: i64,
}

impl Activation {
  pub fn plain(act: ActType) -> Self {
    Self { act, hsigmoid_in: 0, shift_hsigmoid: 0, shift_hswish: 0 }
  }

  /// Piecewise activation over an already shifted accumulator.
  pub fn apply(&self, x: f64, allowed: &[ActType]) -> Result<f64> {
    check!(
      allowed.contains(&self.act),
      DpuError::param(format!("nonlinear type {:?} not supported at this stage", self.act))
    );
    Ok(match self.act {
      ActType::None => x,
      ActType::Relu => {
        if x < 0.0 {
          0.0
        } else {
          x
        }
      },
      ActType::LeakyRelu => {
        if x < 0.0 {
          x * 26.0 / 256.0
        } else {
          x
        }
      },
      ActType::Relu6 => {
        let x = if x < 0.0 { 0.0 } else { x };
        if x < RELU6_CEIL {
          x
        } else {
          RELU6_CEIL
        }
      },
      ActType::Hsigmoid => hsigmoid(dr(x), self.hsigmoid_in, self.shift_hsigmoid),
      ActType::Hswish => {
        let x = dr(x);
        let h = dr(hsigmoid(x, self.hsigmoid_in, self.shift_hsigmoid));
        x * h * pow2(-self.shift_hswish)
      },
      ActType::Prelu => return Err(DpuError::param("prelu is an exec mode, not an activation stage")),
    })
  }
}

/// Border widths; right / bottom are already in "first padded column from
/// the window end" form, see [`pad_borders`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Padding {
  pub left: i64,
  pub top: i64,
  pub right: i64,
  pub bottom: i64,
}

/// Overwrite the border pixels of the first `rows` rows with `value`.
///
/// Left / top cover the first `left` / `top` columns / rows. Right covers
/// columns from `cols - kernel_w + right + 1`, bottom rows from
/// `rows - kernel_h + bottom + 1`.
pub fn pad_borders(img: &mut [i8], shape: &ShapeDescriptor, rows: usize, pad: Padding, kernel: (usize, usize), value: i8) {
  let dims = shape.dims();
  let (cols, ch) = (dims[1], dims[2]);
  let rows = rows.min(dims[0]);
  let left = pad.left.clamp(0, cols as i64) as usize;
  let top = pad.top.clamp(0, rows as i64) as usize;
  let right_from = (cols as i64 - kernel.1 as i64 + pad.right + 1).max(0) as usize;
  let bottom_from = (rows as i64 - kernel.0 as i64 + pad.bottom + 1).max(0) as usize;
  for h in 0..rows {
    for w in 0..cols {
      if w < left || h < top || w >= right_from || h >= bottom_from {
        let p = shape.offset(&[h, w, 0]);
        img[p..p + ch].fill(value);
      }
    }
  }
}

/// Overwrite the last `count` channels of every pixel in the first `rows` rows.
pub fn pad_channel_tail(img: &mut [i8], shape: &ShapeDescriptor, rows: usize, count: usize, value: i8) {
  let dims = shape.dims();
  let (cols, ch) = (dims[1], dims[2]);
  let count = count.min(ch);
  for h in 0..rows.min(dims[0]) {
    for w in 0..cols {
      let p = shape.offset(&[h, w, ch - count]);
      img[p..p + count].fill(value);
    }
  }
}

/// Depthwise window sums feeding output row `oh`; `out` is that row
/// (`out_w x channels`). Windows running past `rows` leave the row untouched.
#[allow(clippy::too_many_arguments)]
pub fn dw_conv_row<W>(
  img: &[i8],
  shape: &ShapeDescriptor,
  rows: usize,
  kernel: (usize, usize),
  stride: (usize, usize),
  oh: usize,
  out: &mut [i64],
  weight: W,
) where
  W: Fn(usize, usize, usize) -> i64,
{
  let dims = shape.dims();
  let (cols, ch) = (dims[1], dims[2]);
  let (kh, kw) = kernel;
  let top = oh * stride.0;
  if top + kh > rows || ch == 0 {
    return;
  }
  for (ow, px) in out.chunks_mut(ch).enumerate() {
    let left = ow * stride.1;
    if left + kw > cols {
      break;
    }
    for (k, acc) in px.iter_mut().enumerate() {
      let mut sum = 0i64;
      for a in 0..kh {
        for b in 0..kw {
          sum += img[shape.offset(&[top + a, left + b, k])] as i64 * weight(a, b, k);
        }
      }
      *acc = sum;
    }
  }
}

/// Sliding-window max into a pre-filled output, each result rescaled by
/// `2^shift` and rounded.
#[allow(clippy::too_many_arguments)]
pub fn max_pool(
  img: &[i8],
  shape: &ShapeDescriptor,
  rows: usize,
  kernel: (usize, usize),
  stride: (usize, usize),
  out: &mut [i8],
  out_shape: &ShapeDescriptor,
  shift: i64,
) -> Result<()> {
  let dims = shape.dims();
  let (cols, ch) = (dims[1], dims[2]);
  let (kh, kw) = kernel;
  let factor = pow2(shift);
  let mut i = 0;
  while i + kh <= rows {
    let mut j = 0;
    while j + kw <= cols {
      for k in 0..ch {
        let pos = out_shape.coord_to_position(&[i / stride.0, j / stride.1, k])?;
        let mut m = out[pos];
        for a in 0..kh {
          for b in 0..kw {
            m = m.max(img[shape.offset(&[i + a, j + b, k])]);
          }
        }
        out[pos] = dpu_round(m as f64 * factor);
      }
      j += stride.1;
    }
    i += stride.0;
  }
  Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
  Max,
  Min,
  Sum,
  Mean,
}

impl ReduceOp {
  /// Reduce type lives above the two axis bits of `exec_sub_mode`.
  pub fn from_sub_mode(sub: i64) -> Result<Self> {
    Ok(match sub >> 2 {
      1 => ReduceOp::Max,
      2 => ReduceOp::Min,
      3 => ReduceOp::Mean,
      4 => ReduceOp::Sum,
      t => return Err(DpuError::param(format!("reduce type {} is none of max/min/sum/mean", t))),
    })
  }

  /// Max starts from the smallest positive float, so an all-negative
  /// window comes out as 0.
  fn init(self) -> f32 {
    match self {
      ReduceOp::Max => f32::MIN_POSITIVE,
      ReduceOp::Min => f32::MAX,
      ReduceOp::Sum | ReduceOp::Mean => 0.0,
    }
  }

  fn combine(self, a: f32, b: f32) -> f32 {
    match self {
      ReduceOp::Max => a.max(b),
      ReduceOp::Min => a.min(b),
      ReduceOp::Sum | ReduceOp::Mean => a + b,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceAxis {
  H,
  W,
  C,
}

impl ReduceAxis {
  pub fn from_sub_mode(sub: i64) -> Result<Self> {
    Ok(match sub & 0x3 {
      1 => ReduceAxis::H,
      2 => ReduceAxis::W,
      3 => ReduceAxis::C,
      _ => return Err(DpuError::param(format!("exec_sub_mode {:#x} selects no reduce axis", sub))),
    })
  }
}

/// Reduce along `axis`, rescale by `scale` (the fix point move), then round.
/// Results land at index 0 of the reduced axis; a channel reduction keeps
/// one value per row, at `(y, 0, 0)`, and the last column wins.
pub fn reduce(
  img: &[i8],
  shape: &ShapeDescriptor,
  axis: ReduceAxis,
  op: ReduceOp,
  scale: f64,
  out: &mut [i8],
  out_shape: &ShapeDescriptor,
) -> Result<()> {
  let dims = shape.dims();
  let (rows, cols, ch) = (dims[0], dims[1], dims[2]);
  let finish = |acc: f32, n: usize| -> i8 {
    let mut v = (acc as f64 * scale) as f32;
    if op == ReduceOp::Mean {
      v /= n as f32;
    }
    dpu_round(v as f64)
  };
  let fold = |it: &mut dyn Iterator<Item = usize>| it.fold(op.init(), |acc, p| op.combine(acc, img[p] as f32));
  match axis {
    ReduceAxis::H => {
      for k in 0..ch {
        for x in 0..cols {
          let acc = fold(&mut (0..rows).map(|y| shape.offset(&[y, x, k])));
          out[out_shape.coord_to_position(&[0, x, k])?] = finish(acc, rows);
        }
      }
    },
    ReduceAxis::W => {
      for k in 0..ch {
        for y in 0..rows {
          let acc = fold(&mut (0..cols).map(|x| shape.offset(&[y, x, k])));
          out[out_shape.coord_to_position(&[y, 0, k])?] = finish(acc, cols);
        }
      }
    },
    ReduceAxis::C => {
      for x in 0..cols {
        for y in 0..rows {
          let acc = fold(&mut (0..ch).map(|k| shape.offset(&[y, x, k])));
          out[out_shape.coord_to_position(&[y, 0, 0])?] = finish(acc, ch);
        }
      }
    },
  }
  Ok(())
}

/// Sixteen-lane bf16 partial sum, folded into lane 0.
fn lane_sum(values: impl Iterator<Item = (usize, f32)>) -> f32 {
  let mut lanes = [0f32; L2NORM_LANES];
  for (lane, v) in values {
    lanes[lane % L2NORM_LANES] += f_to_bf(v);
  }
  let mut total = lanes[0];
  for l in &lanes[1..] {
    total += l;
  }
  total
}

/// `x / sqrt(sum x^2)` over the axes selected by `sub_mode` (bit 2 = h,
/// bit 1 = w, bit 0 = c), in bf16, rescaled by `2^shift_cut`.
pub fn l2norm(img: &[i8], shape: &ShapeDescriptor, sub_mode: i64, shift_read: i64, shift_cut: i64) -> Vec<i8> {
  let dims = shape.dims();
  let (rows, cols, ch) = (dims[0], dims[1], dims[2]);
  let read_scale = 0.5f64.powi(shift_read as i32);
  let input = |p: usize| f_to_bf((img[p] as f64 * read_scale) as f32);
  let mut accum: Vec<f32> = (0..img.len())
    .map(|p| {
      let v = input(p);
      v * v
    })
    .collect();

  if sub_mode & 0x1 != 0 {
    for y in 0..rows {
      for x in 0..cols {
        let total = f_to_bf(lane_sum((0..ch).map(|k| (k, accum[shape.offset(&[y, x, k])]))));
        for k in 0..ch {
          accum[shape.offset(&[y, x, k])] = total;
        }
      }
    }
  }
  if sub_mode & 0x2 != 0 {
    for y in 0..rows {
      for k in 0..ch {
        let total = f_to_bf(lane_sum((0..cols).map(|x| (x, accum[shape.offset(&[y, x, k])]))));
        for x in 0..cols {
          accum[shape.offset(&[y, x, k])] = total;
        }
      }
    }
  }
  if sub_mode & 0x4 != 0 {
    for x in 0..cols {
      for k in 0..ch {
        // Height sums share the lane of their column.
        let total = f_to_bf(lane_sum((0..rows).map(|y| (x, accum[shape.offset(&[y, x, k])]))));
        for y in 0..rows {
          accum[shape.offset(&[y, x, k])] = total;
        }
      }
    }
  }

  let factor = pow2(shift_cut);
  (0..img.len())
    .map(|p| {
      let acc = accum[p].max(L2NORM_FLOOR);
      let inv = f_to_bf(1.0 / acc.sqrt());
      let norm = f_to_bf(((input(p) * inv) as f64 * factor) as f32);
      dpu_round_even(norm as f64)
    })
    .collect()
}

/// Phase one of instance norm: add this tile's per-channel sum and sum of
/// squares into the running partial sums.
pub fn instnorm_accumulate(img: &[i8], shape: &ShapeDescriptor, sum: &mut [f32], square: &mut [f32]) {
  let dims = shape.dims();
  let (rows, cols, ch) = (dims[0], dims[1], dims[2]);
  for k in 0..ch.min(sum.len()).min(square.len()) {
    let mut s = 0f32;
    let mut q = 0f32;
    for y in 0..rows {
      for x in 0..cols {
        let v = img[shape.offset(&[y, x, k])] as f32;
        s += v;
        q += v * v;
      }
    }
    sum[k] += s;
    square[k] += q;
  }
}

/// Turn the partial sums into mean / variance over `total_hw` pixels.
pub fn instnorm_finalize(sum: &mut [f32], square: &mut [f32], input_fp: i64, total_hw: usize) {
  let scale = pow2(input_fp);
  for (m, v) in sum.iter_mut().zip(square.iter_mut()) {
    let mean_sum = f_to_bf((*m as f64 / scale) as f32);
    let square_sum = f_to_bf((*v as f64 / (scale * scale)) as f32);
    let mean = f_to_bf(mean_sum / total_hw as f32);
    let square_mean = f_to_bf(square_sum / total_hw as f32);
    *m = mean;
    *v = (square_mean as f64 - (mean as f64).powi(2)) as f32;
  }
}

/// Fix points and epsilon of the second instance-norm phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormFix {
  pub input_fp: i64,
  pub output_fp: i64,
  pub weights_fp: i64,
  pub bias_fp: i64,
  pub epsilon: f32,
}

/// `scale * (x - mean) / sqrt(var + eps) + bias` in bf16 steps, scaled to
/// the output fix point. Activation and rounding are left to the caller.
pub fn instnorm_value(x: i8, mean: f32, variance: f32, weight: i8, bias: i8, fix: &NormFix) -> f64 {
  let scale = f_to_bf((weight as f64 / pow2(fix.weights_fp)) as f32);
  let bias = f_to_bf((bias as f64 / pow2(fix.bias_fp)) as f32);
  let input = f_to_bf((x as f64 / pow2(fix.input_fp)) as f32);
  let stdev = f_to_bf(f_to_bf(variance + fix.epsilon).sqrt());
  let inv_stdev = f_to_bf(1.0 / stdev);
  let input_scale = f_to_bf(input * inv_stdev);
  let mean_scale = f_to_bf(mean * inv_stdev);
  let centered = f_to_bf(input_scale - mean_scale);
  let out = scale * centered + bias;
  out as f64 * pow2(fix.output_fp)
}
