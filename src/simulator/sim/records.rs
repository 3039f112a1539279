use serde::{Deserialize, Serialize};

/// One line of the trace file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstRecord {
  pub step: usize,
  pub id: u64,
  pub opcode: String,
  pub summary: String,
}

/// Macro to push an InstRecord for an executed instruction
///
/// Usage:
/// ```ignore
/// inst_record!(self.records, step, executed);
/// ```
#[macro_export]
macro_rules! inst_record {
  ($records:expr, $step:expr, $executed:expr) => {
    $records.push($crate::simulator::sim::records::InstRecord {
      step: $step,
      id: $executed.id,
      opcode: $executed.opcode.name().to_string(),
      summary: $executed.summary.clone(),
    });
  };
}
