#[macro_use]
mod common;

use common::{addr, inst, run, sequencer};
use dpusim::arch::dpu::{Instruction, Opcode, Sequencer};
use dpusim::arch::profile::Generation;
use dpusim::DpuError;

const CH: usize = 32;
const OUT: usize = 40;

fn fill_rows(s: &mut Sequencer, bank: u32, first: usize, rows: usize, f: impl Fn(usize, usize) -> i8) {
  let b = s.dpu_mut().banks.get_mut(bank).unwrap();
  for r in 0..rows {
    let data: Vec<i8> = (0..CH).map(|c| f(r, c)).collect();
    b.write(first + r, &data).unwrap();
  }
}

fn elew_init(sub_mode: i64) -> Instruction {
  inst(
    Opcode::AluInit,
    &[
      ("exec_mode", 11),
      ("exec_sub_mode", sub_mode),
      ("num", 2),
      ("alu_num", 1),
      ("cp", CH as i64),
      ("tile_owg", 1),
      ("tile_ohg", 1),
      ("tile_cg", 1),
      ("ow_iter", 1),
      ("shift_read_0", 2),
      ("shift_read_1", 2),
      ("shift_cut", 2),
    ],
  )
}

/// Two 1x8 inputs, x0 = c and x1 = w + c, added on the newest generation.
fn elew_add((sub_mode, expected): (i64, fn(usize, usize) -> i8)) {
  let mut s = sequencer(Generation::Xv3dpu);
  fill_rows(&mut s, 0, 0, 8, |_, c| c as i8);
  fill_rows(&mut s, 0, 20, 8, |w, c| (w + c) as i8);
  let program = [
    elew_init(sub_mode),
    addr(0, 0, 1, 0, 1, 0),
    addr(0, 1, 1, 20, 1, 0),
    addr(3, 0, 1, OUT as i64, 1, 0),
    inst(Opcode::Alu, &[]),
  ];
  run(&mut s, &program).unwrap();
  let bank = s.dpu().banks.get(0).unwrap();
  for w in 0..8 {
    let row = bank.read_vec(OUT + w, CH).unwrap();
    let want: Vec<i8> = (0..CH).map(|c| expected(w, c)).collect();
    assert_eq!(row, want, "pixel {}", w);
  }
}

test_case!(elew_add:
  per_channel => (0, |w: usize, c: usize| (w + 2 * c) as i8),
  channel_broadcast => (1, |w: usize, c: usize| (w + c) as i8),
);

const NORM_ROWS: usize = 2;
const NORM_IN: i64 = 0;
const NORM_WEIGHTS: i64 = 10;

fn norm_init(mode: i64) -> Instruction {
  inst(
    Opcode::AluInit,
    &[
      ("exec_mode", mode),
      ("num", 1),
      ("alu_num", 1),
      ("tile_owg", 1),
      ("tile_ohg", 1),
      ("tile_cg", 1),
      ("ow_iter", 1),
      ("shift_cut", 0),
      ("lp_mt_addr", 0),
      ("epsilon", 1e-5f32.to_bits() as i64),
    ],
  )
}

/// Input rows, optional scale / bias descriptor, output rows, compute.
fn norm_phase(mode: i64, out: i64, with_weights: bool) -> Vec<Instruction> {
  let mut p = vec![norm_init(mode), addr(0, 0, NORM_ROWS as i64, NORM_IN, 1, 8)];
  if with_weights {
    p.push(addr(1, 0, 1, NORM_WEIGHTS, 1, 0));
  }
  p.push(addr(3, 0, NORM_ROWS as i64, out, 1, 8));
  p.push(inst(Opcode::Alu, &[]));
  p
}

fn norm_machine() -> Sequencer {
  let mut s = sequencer(Generation::Xv3dpu);
  fill_rows(&mut s, 0, NORM_IN as usize, 8 * NORM_ROWS, |_, _| 4);
  let wgt = s.dpu().banks.id_in_group("WGT", 0).unwrap();
  fill_rows(&mut s, wgt, NORM_WEIGHTS as usize, 1, |_, _| 1);
  fill_rows(&mut s, wgt, NORM_WEIGHTS as usize + 1, 1, |_, _| 7);
  s
}

#[test]
fn instance_norm_of_a_constant_is_its_bias() {
  dpusim::simulator::utils::log::init_log();
  let mut s = norm_machine();
  run(&mut s, &norm_phase(13, 200, true)).unwrap();
  assert!(s.dpu().norm.mean.iter().all(|&m| m == 4.0));
  assert!(s.dpu().norm.variance.iter().all(|&v| v == 0.0));
  run(&mut s, &norm_phase(14, 300, false)).unwrap();
  let bank = s.dpu().banks.get(0).unwrap();
  for p in 0..8 * NORM_ROWS {
    assert_eq!(bank.read_vec(300 + p, CH).unwrap(), vec![7; CH], "pixel {}", p);
  }
}

#[test]
fn second_phase_needs_statistics() {
  dpusim::simulator::utils::log::init_log();
  let mut s = norm_machine();
  let err = run(&mut s, &norm_phase(14, 300, false)).unwrap_err();
  assert!(matches!(err, DpuError::Ordering { .. }));
  assert_eq!(err.inst(), Some(3));
}

#[test]
fn mode_outside_the_target() {
  dpusim::simulator::utils::log::init_log();
  let mut s = sequencer(Generation::Xv2dpu);
  let mut p = norm_phase(13, 200, true);
  p.remove(2);
  let err = run(&mut s, &p).unwrap_err();
  assert!(matches!(err, DpuError::Parameter { .. }));
  assert_eq!(err.inst(), Some(3));
}

#[test]
fn xv2_max_pool() {
  dpusim::simulator::utils::log::init_log();
  let mut s = sequencer(Generation::Xv2dpu);
  // 2x4 image, one bank-wide half per pixel: value 4h + w + 1 on every channel
  for h in 0..2 {
    for w in 0..4 {
      let v = (4 * h + w + 1) as i8;
      s.dpu_mut().banks.get_mut(0).unwrap().write(8 * h + 2 * w, &[v; CH]).unwrap();
    }
  }
  let init = inst(
    Opcode::AluInit,
    &[
      ("exec_mode", 10),
      ("num", 1),
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
    ],
  );
  let program = [init, addr(0, 0, 2, 0, 2, 8), addr(3, 0, 1, 100, 2, 0), inst(Opcode::Alu, &[])];
  run(&mut s, &program).unwrap();
  let bank = s.dpu().banks.get(0).unwrap();
  assert_eq!(bank.read_vec(100, CH).unwrap(), vec![6; CH]);
  assert_eq!(bank.read_vec(102, CH).unwrap(), vec![8; CH]);
}

const GARBAGE: i8 = 50;

/// Weights of the depthwise cases: all ones on channel 0, `a - b` on channel 1.
fn dw_weight(a: usize, b: usize, k: usize) -> i8 {
  if k == 0 {
    1
  } else {
    a as i8 - b as i8
  }
}

/// Depthwise sum over the taps that land on real pixels only. `real(h, w)`
/// yields the input pixel at working-buffer position (h, w), if any.
fn real_windows(
  kernel: usize,
  stride: usize,
  (oh, ow, k): (usize, usize, usize),
  real: impl Fn(usize, usize) -> Option<i8>,
) -> i8 {
  let mut sum = 0i64;
  for a in 0..kernel {
    for b in 0..kernel {
      if let Some(x) = real(oh * stride + a, ow * stride + b) {
        let x = if k == 0 { x } else { -x };
        sum += x as i64 * dw_weight(a, b, k) as i64;
      }
    }
  }
  sum as i8
}

/// XV2 4x4 working image: rows / columns 1..=2 are real, the border holds
/// stale data that the declared padding must hide.
fn xv2_padded_machine(border: i8) -> Sequencer {
  let mut s = sequencer(Generation::Xv2dpu);
  let img = s.dpu_mut().banks.get_mut(0).unwrap();
  for h in 0..4 {
    for w in 0..4 {
      let inside = (1..=2).contains(&h) && (1..=2).contains(&w);
      let x = if inside { (4 * h + w + 1) as i8 } else { border };
      img.write(8 * h + 2 * w, &[x, -x]).unwrap();
    }
  }
  let wgt = s.dpu_mut().banks.get_mut(1).unwrap();
  for a in 0..2 {
    for b in 0..2 {
      wgt.write(2 * a + b, &[dw_weight(a, b, 0), dw_weight(a, b, 1)]).unwrap();
    }
  }
  s
}

fn xv2_macc(pads: &[(&str, i64)]) -> Vec<Instruction> {
  let mut init = vec![
    ("exec_mode", 9),
    ("num", 1),
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
    ("b_mode", 2),
  ];
  init.extend_from_slice(pads);
  vec![
    inst(Opcode::AluInit, &init),
    addr(0, 0, 4, 0, 2, 8),
    addr(1, 0, 1, 0, 0, 0),
    addr(3, 0, 2, 100, 2, 4),
    inst(Opcode::Alu, &[]),
  ]
}

fn xv2_output(s: &Sequencer) -> Vec<Vec<i8>> {
  let bank = s.dpu().banks.get(0).unwrap();
  [100, 102, 104, 106].iter().map(|&r| bank.read_vec(r, 2).unwrap()).collect()
}

#[test]
fn tiled_padding_hides_the_border() {
  dpusim::simulator::utils::log::init_log();
  // Right / bottom fields count from the full tile: 13 = 1 + stride * ow_offset,
  // 5 = 1 + stride * (ohp - rows), leaving the last column / row as padding.
  let pads = [("pad_left", 1), ("pad_top", 1), ("pad_right", 13), ("pad_bottom", 5)];
  let mut padded = xv2_padded_machine(GARBAGE);
  run(&mut padded, &xv2_macc(&pads)).unwrap();
  let mut clean = xv2_padded_machine(0);
  run(&mut clean, &xv2_macc(&[])).unwrap();
  assert_eq!(xv2_output(&padded), xv2_output(&clean));

  let real = |h: usize, w: usize| {
    ((1..=2).contains(&h) && (1..=2).contains(&w)).then(|| (4 * h + w + 1) as i8)
  };
  let got = xv2_output(&padded);
  for (i, px) in got.iter().enumerate() {
    let (oh, ow) = (i / 2, i % 2);
    let want: Vec<i8> = (0..2).map(|k| real_windows(2, 2, (oh, ow, k), real)).collect();
    assert_eq!(px, &want, "output pixel ({}, {})", oh, ow);
  }
  // Each 2x2 window sees exactly one real pixel.
  assert_eq!(got, vec![vec![6, 0], vec![7, -7], vec![10, 10], vec![11, 0]]);
}

const DW_OUT_BANK: u32 = 8;
const DW_WEIGHT_BANK: u32 = 18;

/// DPUV2 5x5 working image, row h in image bank h and pixel w at row w of
/// that bank; real pixels fill rows / columns 1..=3.
fn dpuv2_padded_machine(border: i8) -> Sequencer {
  let mut s = sequencer(Generation::Dpuv2);
  for h in 0..5 {
    let bank = s.dpu_mut().banks.get_mut(h as u32).unwrap();
    for w in 0..5 {
      let inside = (1..=3).contains(&h) && (1..=3).contains(&w);
      let x = if inside { (3 * (h - 1) + (w - 1) + 1) as i8 } else { border };
      bank.write(w, &[x, -x]).unwrap();
    }
  }
  let wgt = s.dpu_mut().banks.get_mut(DW_WEIGHT_BANK).unwrap();
  for a in 0..3 {
    for b in 0..3 {
      wgt.write(3 * a + b, &[dw_weight(a, b, 0), dw_weight(a, b, 1)]).unwrap();
    }
  }
  s
}

fn dpuv2_dwcv(pads: &[(&str, i64)]) -> Vec<Instruction> {
  let init = inst(
    Opcode::AluInit,
    &[
      ("exec_mode", 0),
      ("jump_read", 1),
      ("jump_read_endl", 0),
      ("jump_read_weights", 1),
      ("jump_write", 1),
      ("jump_write_endl", 0),
      ("shift_cut", 0),
      ("shift_bias", 0),
      ("stride_h", 1),
      ("stride_w", 1),
      ("stride_out", 1),
      ("channel_group", 1),
      ("length", 3),
      ("kernel_h", 3),
      ("kernel_w", 3),
    ],
  );
  let mut alu = vec![
    ("bank_id_in", 0),
    ("bank_addr_in", 0),
    ("bank_id_out", DW_OUT_BANK as i64),
    ("bank_addr_out", 0),
    ("bank_addr_weights", 0),
    ("bank_addr_bias", 0),
    ("valid_pixel_parallel", 3),
  ];
  alu.extend_from_slice(pads);
  vec![init, inst(Opcode::Alu, &alu)]
}

fn dpuv2_output(s: &Sequencer) -> Vec<Vec<i8>> {
  let mut out = Vec::new();
  for h in 0..3 {
    let bank = s.dpu().banks.get(DW_OUT_BANK + h).unwrap();
    for w in 0..3 {
      out.push(bank.read_vec(w, 2).unwrap());
    }
  }
  out
}

#[test]
fn direct_padding_hides_the_border() {
  dpusim::simulator::utils::log::init_log();
  // Right / bottom of 1 pad the last column / row of a 3x3 window walk.
  let pads = [("pad_left", 1), ("pad_top", 1), ("pad_right", 1), ("pad_bottom", 1)];
  let mut padded = dpuv2_padded_machine(GARBAGE);
  run(&mut padded, &dpuv2_dwcv(&pads)).unwrap();
  // kernel - 1 on right / bottom leaves those borders alone
  let mut clean = dpuv2_padded_machine(0);
  run(&mut clean, &dpuv2_dwcv(&[("pad_right", 2), ("pad_bottom", 2)])).unwrap();
  assert_eq!(dpuv2_output(&padded), dpuv2_output(&clean));

  let real = |h: usize, w: usize| {
    ((1..=3).contains(&h) && (1..=3).contains(&w)).then(|| (3 * (h - 1) + (w - 1) + 1) as i8)
  };
  let got = dpuv2_output(&padded);
  for (i, px) in got.iter().enumerate() {
    let (oh, ow) = (i / 3, i % 3);
    let want: Vec<i8> = (0..2).map(|k| real_windows(3, 1, (oh, ow, k), real)).collect();
    assert_eq!(px, &want, "output pixel ({}, {})", oh, ow);
  }
  // Corner window: 1 + 2 + 4 + 5; centre window: every real pixel.
  assert_eq!(got[0][0], 12);
  assert_eq!(got[4], vec![45, -12]);
}

const RED_CH: usize = 64;
const RED_OUT: i64 = 100;

/// XV3 image of 2 rows x 8 pixels x 64 channels; a pixel spans two bank
/// rows, row h starts at bank row 16h.
fn reduce_machine(pixel: impl Fn(usize, usize) -> i8) -> Sequencer {
  let mut s = sequencer(Generation::Xv3dpu);
  let bank = s.dpu_mut().banks.get_mut(0).unwrap();
  for h in 0..2 {
    for w in 0..8 {
      bank.write(16 * h + 2 * w, &[pixel(h, w); RED_CH]).unwrap();
    }
  }
  s
}

fn reduction(sub_mode: i64, out_rows: i64) -> Vec<Instruction> {
  vec![
    inst(
      Opcode::AluInit,
      &[
        ("exec_mode", 16),
        ("exec_sub_mode", sub_mode),
        ("num", 1),
        ("alu_num", 1),
        ("tile_owg", 1),
        ("tile_ohg", 1),
        ("tile_cg", 1),
        ("ow_iter", 1),
        ("shift_cut", 0),
      ],
    ),
    addr(0, 0, 2, 0, 2, 16),
    addr(3, 0, out_rows, RED_OUT, 2, 16),
    inst(Opcode::Alu, &[]),
  ]
}

/// Reduce the two rows (`top`, `bottom` on every pixel and channel) over H.
fn reduce_over_h((reduce_type, top, bottom, expected): (i64, i8, i8, i8)) {
  let mut s = reduce_machine(|h, _| if h == 0 { top } else { bottom });
  run(&mut s, &reduction((reduce_type << 2) | 1, 1)).unwrap();
  let bank = s.dpu().banks.get(0).unwrap();
  for w in 0..8 {
    assert_eq!(bank.read_vec(RED_OUT as usize + 2 * w, RED_CH).unwrap(), vec![expected; RED_CH], "pixel {}", w);
  }
}

test_case!(reduce_over_h:
  reduce_max => (1, 2, 4, 4),
  reduce_min => (2, 2, 4, 2),
  reduce_mean => (3, 2, 4, 3),
  reduce_mean_rounds_half_up => (3, 2, 5, 4),
  reduce_sum => (4, 2, 4, 6),
  reduce_max_of_negatives_is_zero => (1, -5, -7, 0),
);

#[test]
fn channel_reduction_keeps_one_value_per_row() {
  dpusim::simulator::utils::log::init_log();
  let mut s = reduce_machine(|h, w| (10 * h + w) as i8);
  // mean over the channels of each pixel, every pixel of a row on (h, 0, 0)
  run(&mut s, &reduction((3 << 2) | 3, 2)).unwrap();
  let bank = s.dpu().banks.get(0).unwrap();
  let row0 = bank.read_vec(RED_OUT as usize, RED_CH).unwrap();
  let row1 = bank.read_vec(RED_OUT as usize + 16, RED_CH).unwrap();
  assert_eq!((row0[0], row1[0]), (7, 17));
  assert!(row0[1..].iter().chain(&row1[1..]).all(|&v| v == 0));
  assert_eq!(bank.read_vec(RED_OUT as usize + 2, RED_CH).unwrap(), vec![0; RED_CH]);
}
