//! Program files: external regions, bank preloads and the decoded
//! instruction stream, all as JSON.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::arch::dpu::ddr::Region;
use crate::arch::dpu::{Dpu, Instruction};
use crate::error::{DpuError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
  pub id: u32,
  pub size: usize,
  /// Leading bytes; the rest of the region starts zeroed.
  #[serde(default)]
  pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankPreload {
  pub bank: u32,
  pub addr: usize,
  pub data: Vec<i8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
  #[serde(default)]
  pub regions: Vec<RegionSpec>,
  #[serde(default)]
  pub banks: Vec<BankPreload>,
  pub instructions: Vec<Instruction>,
}

/// Final contents of one external region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDump {
  pub id: u32,
  pub data: Vec<u8>,
}

impl Program {
  pub fn from_json_str(text: &str) -> Result<Self> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn from_file(path: &Path) -> Result<Self> {
    let text = fs::read_to_string(path).map_err(|e| DpuError::Program(format!("cannot read {:?}: {}", path, e)))?;
    Self::from_json_str(&text)
  }

  /// Install the regions and bank preloads into a fresh machine.
  pub fn apply(&self, dpu: &mut Dpu) -> Result<()> {
    for r in &self.regions {
      if dpu.ddr.get(r.id).is_ok() {
        return Err(DpuError::Program(format!("region {} declared twice", r.id)));
      }
      dpu.ddr.insert(Region::with_data(r.id, r.size, &r.data)?);
    }
    for b in &self.banks {
      dpu.banks.get_mut(b.bank)?.write(b.addr, &b.data)?;
    }
    Ok(())
  }
}

pub fn dump_regions(dpu: &Dpu) -> Vec<RegionDump> {
  dpu.ddr.iter().map(|r| RegionDump { id: r.id(), data: r.data().to_vec() }).collect()
}
