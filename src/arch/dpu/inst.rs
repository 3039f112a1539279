use serde::{Deserialize, Serialize};

use super::field::FieldMap;

/// Instruction kinds a program may carry. The convolution, pooling,
/// depthwise and elementwise engines and the threshold unit have no model
/// here and stop the run; dumps and SYNC are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Opcode {
  Load,
  Save,
  AluInit,
  AluAddr,
  Alu,
  End,
  ConvInit,
  ConvAddr,
  Conv,
  PoolInit,
  Pool,
  DwInit,
  DptWise,
  ElewInit,
  Elew,
  Thd,
  DumpBank,
  DumpDdr,
  DumpDdrSlice,
  Sync,
  #[serde(other)]
  Other,
}

impl Opcode {
  pub fn name(self) -> &'static str {
    match self {
      Opcode::Load => "LOAD",
      Opcode::Save => "SAVE",
      Opcode::AluInit => "ALUINIT",
      Opcode::AluAddr => "ALUADDR",
      Opcode::Alu => "ALU",
      Opcode::End => "END",
      Opcode::ConvInit => "CONVINIT",
      Opcode::ConvAddr => "CONVADDR",
      Opcode::Conv => "CONV",
      Opcode::PoolInit => "POOLINIT",
      Opcode::Pool => "POOL",
      Opcode::DwInit => "DWINIT",
      Opcode::DptWise => "DPTWISE",
      Opcode::ElewInit => "ELEWINIT",
      Opcode::Elew => "ELEW",
      Opcode::Thd => "THD",
      Opcode::DumpBank => "DUMPBANK",
      Opcode::DumpDdr => "DUMPDDR",
      Opcode::DumpDdrSlice => "DUMPDDRSLICE",
      Opcode::Sync => "SYNC",
      Opcode::Other => "OTHER",
    }
  }

  /// Debug dumps and SYNC leave banks and regions untouched.
  pub fn is_noop(self) -> bool {
    matches!(self, Opcode::DumpBank | Opcode::DumpDdr | Opcode::DumpDdrSlice | Opcode::Sync)
  }
}

impl std::fmt::Display for Opcode {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// One decoded instruction: opcode plus its field map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
  /// Falls back to the position in the stream when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<u64>,
  pub op: Opcode,
  #[serde(default)]
  pub fields: FieldMap,
}

impl Instruction {
  pub fn new(op: Opcode, fields: FieldMap) -> Self {
    Self { id: None, op, fields }
  }

  pub fn with_id(mut self, id: u64) -> Self {
    self.id = Some(id);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn opcode_names_parse() {
    let inst: Instruction = serde_json::from_str(r#"{"op": "ALUINIT", "fields": {"alu_num": 2}}"#).unwrap();
    assert_eq!(inst.op, Opcode::AluInit);
    assert_eq!(inst.fields["alu_num"], 2);
    assert_eq!(inst.id, None);
    let conv: Instruction = serde_json::from_str(r#"{"op": "CONVINIT", "id": 7}"#).unwrap();
    assert_eq!((conv.op, conv.id), (Opcode::ConvInit, Some(7)));
    let dump: Instruction = serde_json::from_str(r#"{"op": "DUMPDDRSLICE"}"#).unwrap();
    assert!(dump.op.is_noop());
    assert!(!Opcode::DptWise.is_noop());
    let odd: Instruction = serde_json::from_str(r#"{"op": "FOO"}"#).unwrap();
    assert_eq!(odd.op, Opcode::Other);
  }
}
