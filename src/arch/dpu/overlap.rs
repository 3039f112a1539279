use std::collections::HashMap;

use log::warn;

/// Double-write diagnostic: remembers `[start, start + len)` blocks per scope
/// (region id or bank id) and warns when a new block crosses an earlier one.
#[derive(Debug, Default)]
pub struct WriteTracker {
  name: &'static str,
  blocks: HashMap<u32, Vec<(usize, usize)>>,
}

impl WriteTracker {
  pub fn new(name: &'static str) -> Self {
    Self { name, blocks: HashMap::new() }
  }

  /// Forget everything recorded so far. Called between instructions.
  pub fn clear(&mut self) {
    self.blocks.clear();
  }

  /// Returns true when the block overlapped an earlier one.
  pub fn insert(&mut self, scope: u32, start: usize, len: usize) -> bool {
    if len == 0 {
      return false;
    }
    let end = start + len;
    let list = self.blocks.entry(scope).or_default();
    let hit = list.iter().find(|&&(s, e)| start < e && s < end).copied();
    list.push((start, end));
    if let Some((s, e)) = hit {
      warn!(
        "{} {}: write [{:#x}, {:#x}) crosses earlier write [{:#x}, {:#x})",
        self.name, scope, start, end, s, e
      );
      return true;
    }
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn detects_crossing_blocks() {
    let mut t = WriteTracker::new("region");
    assert!(!t.insert(0, 0, 16));
    assert!(!t.insert(0, 16, 16));
    assert!(!t.insert(1, 8, 4));
    assert!(t.insert(0, 30, 4));
    t.clear();
    assert!(!t.insert(0, 30, 4));
  }
}
