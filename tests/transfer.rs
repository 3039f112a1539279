#[macro_use]
mod common;

use common::{inst, run, sequencer};
use dpusim::arch::dpu::ddr::Region;
use dpusim::arch::dpu::{Instruction, Opcode, Sequencer};
use dpusim::arch::profile::Generation;
use dpusim::DpuError;

const SRC: u32 = 1;
const DST: u32 = 2;

fn machine() -> Sequencer {
  let mut s = sequencer(Generation::Dpuv2);
  let bytes: Vec<u8> = (0..64).map(|i| (i as u8).wrapping_mul(3)).collect();
  s.dpu_mut().ddr.insert(Region::with_data(SRC, 64, &bytes).unwrap());
  s.dpu_mut().ddr.insert(Region::new(DST, 32));
  s
}

fn load(pairs: &[(&str, i64)]) -> Instruction {
  let mut f = vec![
    ("bank_id", 0),
    ("bank_addr", 5),
    ("reg_id", SRC as i64),
    ("ddr_addr", 0),
    ("length", 2),
    ("channel", 8),
    ("jump_read", 8),
    ("jump_write", 1),
    ("mode_avg", 0),
    ("pad_start", 0),
    ("pad_end", 0),
    ("pad_idx", 0),
  ];
  for &(k, v) in pairs {
    match f.iter().position(|&(name, _)| name == k) {
      Some(i) => f[i].1 = v,
      None => f.push((k, v)),
    }
  }
  inst(Opcode::Load, &f)
}

fn save(pairs: &[(&str, i64)]) -> Instruction {
  let mut f = vec![
    ("bank_id", 0),
    ("bank_addr", 5),
    ("reg_id", DST as i64),
    ("ddr_addr", 0),
    ("length", 2),
    ("channel", 8),
    ("jump_read", 1),
    ("jump_write", 8),
  ];
  f.extend_from_slice(pairs);
  inst(Opcode::Save, &f)
}

#[test]
fn load_then_save_round_trip() {
  dpusim::simulator::utils::log::init_log();
  let mut s = machine();
  run(&mut s, &[load(&[]), save(&[])]).unwrap();
  let src = s.dpu().ddr.get(SRC).unwrap().data()[..16].to_vec();
  assert_eq!(&s.dpu().ddr.get(DST).unwrap().data()[..16], &src[..]);
  let row: Vec<u8> = s.dpu().banks.get(0).unwrap().read_vec(6, 8).unwrap().iter().map(|&v| v as u8).collect();
  assert_eq!(row, &src[8..16]);
}

#[test]
fn constant_load_fills_every_channel() {
  dpusim::simulator::utils::log::init_log();
  let mut s = machine();
  run(&mut s, &[load(&[("const_en", 1), ("const_value", -3)])]).unwrap();
  assert_eq!(s.dpu().banks.get(0).unwrap().read_vec(5, 8).unwrap(), vec![-3; 8]);
}

fn argmax((mode, expected): (i64, i8)) {
  let mut s = machine();
  s.dpu_mut().banks.get_mut(0).unwrap().write(10, &[3, 5, 5, 1]).unwrap();
  let mut p = save(&[("argmax", mode)]);
  p.fields.insert("bank_addr".into(), 10);
  p.fields.insert("length".into(), 1);
  p.fields.insert("channel".into(), 4);
  run(&mut s, &[p]).unwrap();
  assert_eq!(s.dpu().ddr.get(DST).unwrap().byte(0).unwrap() as i8, expected);
  assert_eq!(s.dpu().ddr.get(DST).unwrap().byte(1).unwrap(), 0);
}

test_case!(argmax:
  first_index_of_the_maximum => (2, 1),
  maximum_value => (3, 5),
);

#[test]
fn argmax_marks_lines_for_every_channel_read() {
  dpusim::simulator::utils::log::init_log();
  let mut s = machine();
  let mut p = save(&[("argmax", 2)]);
  p.fields.insert("length".into(), 1);
  p.fields.insert("channel".into(), 20);
  run(&mut s, &[p]).unwrap();
  // One byte lands in DDR, but the 20 channels span two 16-byte lines.
  assert_eq!(s.dpu().ddr.get(DST).unwrap().used_lines(16), vec![0, 16]);
}

#[test]
fn constant_save() {
  dpusim::simulator::utils::log::init_log();
  let mut s = machine();
  run(&mut s, &[save(&[("const_en", 1), ("const_value", 9)])]).unwrap();
  assert_eq!(&s.dpu().ddr.get(DST).unwrap().data()[..16], &[9u8; 16]);
}

fn fails((program, kind): (Vec<Instruction>, fn(&DpuError) -> bool)) {
  let mut s = machine();
  let err = run(&mut s, &program).unwrap_err();
  assert!(kind(&err), "unexpected error {}", err);
  assert_eq!(err.inst(), Some(program.len() as u64 - 1));
}

fn out_of_range(e: &DpuError) -> bool {
  matches!(e, DpuError::AddressOutOfRange { .. })
}

fn parameter(e: &DpuError) -> bool {
  matches!(e, DpuError::Parameter { .. })
}

test_case!(fails:
  load_past_region_end => (vec![load(&[("ddr_addr", 60)])], out_of_range),
  save_past_region_end => (vec![load(&[]), save(&[("ddr_addr", 20)])], out_of_range),
  unknown_region => (vec![load(&[("reg_id", 9)])], out_of_range),
  bank_beyond_target => (vec![load(&[("bank_id", 99)])], out_of_range),
  mode_avg_too_large => (vec![load(&[("mode_avg", 4)])], out_of_range),
  missing_field => (vec![inst(Opcode::Save, &[("bank_id", 0)])], parameter),
);
