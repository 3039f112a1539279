//! Init / address-list hand-off between companion instructions and the
//! compute instructions consuming them.

use log::debug;

use crate::arch::dpu::field::{FieldMap, Fields};
use crate::check;
use crate::error::{DpuError, Result};

/// Input ids an address list may carry.
pub const MAX_INPUTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrType {
  Ifm,
  Wgt,
  Bias,
  Ofm,
}

impl AddrType {
  pub fn from_code(code: i64) -> Result<Self> {
    Ok(match code {
      0 => AddrType::Ifm,
      1 => AddrType::Wgt,
      2 => AddrType::Bias,
      3 => AddrType::Ofm,
      _ => return Err(DpuError::param(format!("address type {} is none of IFM/WGT/BIAS/OFM", code))),
    })
  }
}

/// One address-list descriptor: `h_num` rows starting at `mt_addr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrEntry {
  pub kind: AddrType,
  pub id: usize,
  pub h_num: usize,
  pub mt_addr: usize,
  pub jump: usize,
  pub jump_endl: usize,
  pub invalid: bool,
  pub fix_point: i64,
}

impl AddrEntry {
  pub fn decode(f: &FieldMap) -> Result<Self> {
    let kind = AddrType::from_code(f.field("type")?)?;
    let id = f.field_usize("id")?;
    match kind {
      AddrType::Ifm => check!(
        id < MAX_INPUTS,
        DpuError::param(format!("input id {} must be below {}", id, MAX_INPUTS))
      ),
      _ => check!(id == 0, DpuError::param(format!("{:?} address id {} must be 0", kind, id))),
    }
    Ok(Self {
      kind,
      id,
      h_num: f.field_usize("h_num")?,
      mt_addr: f.field_usize("mt_addr")?,
      jump: f.field_usize("jump")?,
      jump_endl: f.field_or("jump_endl", 0).max(0) as usize,
      invalid: f.flag("invalid"),
      fix_point: f.field_or("fix_point", 0),
    })
  }
}

/// Configuration published by an init instruction.
#[derive(Debug, Clone)]
pub struct SharedComputeConfig {
  init: FieldMap,
  alu_num: u32,
  /// `None` on direct-addressing targets: the block stays in force until
  /// the next init replaces it.
  remaining: Option<u32>,
  entries: Vec<AddrEntry>,
  input_fp: i64,
  output_fp: i64,
}

impl SharedComputeConfig {
  pub fn direct(init: FieldMap) -> Self {
    Self { init, alu_num: 0, remaining: None, entries: Vec::new(), input_fp: 0, output_fp: 0 }
  }

  pub fn tiled(init: FieldMap) -> Result<Self> {
    let alu_num = init.field_u32("alu_num")?;
    Ok(Self { init, alu_num, remaining: Some(alu_num), entries: Vec::new(), input_fp: 0, output_fp: 0 })
  }

  pub fn init(&self) -> &FieldMap {
    &self.init
  }

  pub fn alu_num(&self) -> u32 {
    self.alu_num
  }

  pub fn remaining(&self) -> Option<u32> {
    self.remaining
  }

  pub fn entries(&self) -> &[AddrEntry] {
    &self.entries
  }

  fn append(&mut self, entry: AddrEntry) {
    match entry.kind {
      AddrType::Ifm => self.input_fp = entry.fix_point,
      AddrType::Ofm => self.output_fp = entry.fix_point,
      _ => {},
    }
    self.entries.push(entry);
  }
}

/// What one compute instruction takes out of the block in force.
#[derive(Debug, Clone)]
pub struct Claim {
  pub init: FieldMap,
  pub entries: Vec<AddrEntry>,
  pub alu_num: u32,
  /// Consumers left including this one, so 1 marks the last of its block.
  /// Always 0 on direct-addressing targets.
  pub left: u32,
  pub input_fp: i64,
  pub output_fp: i64,
}

/// Holder of the block in force. Owned by the sequencer and handed to each
/// compute instruction explicitly.
#[derive(Debug, Default)]
pub struct ConfigSlot {
  active: Option<SharedComputeConfig>,
}

impl ConfigSlot {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn active(&self) -> Option<&SharedComputeConfig> {
    self.active.as_ref()
  }

  /// Install a new block. A counted block still owed consumers is an error.
  pub fn publish(&mut self, cfg: SharedComputeConfig) -> Result<()> {
    if let Some(left) = self.active.as_ref().and_then(|c| c.remaining) {
      check!(
        left == 0,
        DpuError::ordering(format!("init issued while {} compute instructions of the previous block are pending", left))
      );
    }
    debug!("init block: {:?} consumers", cfg.remaining);
    self.active = Some(cfg);
    Ok(())
  }

  pub fn append(&mut self, entry: AddrEntry) -> Result<()> {
    let cfg = self
      .active
      .as_mut()
      .ok_or_else(|| DpuError::ordering("address list issued without an init block"))?;
    cfg.append(entry);
    Ok(())
  }

  /// Consume one slot of the block: drains the pending address list and
  /// clears the block once its count reaches zero.
  pub fn claim(&mut self) -> Result<Claim> {
    let cfg = self
      .active
      .as_mut()
      .ok_or_else(|| DpuError::ordering("compute instruction without an init block"))?;
    let left = match cfg.remaining.as_mut() {
      Some(remaining) => {
        let left = *remaining;
        check!(
          left > 0,
          DpuError::ordering(format!("more compute instructions than alu_num {} of their init block", cfg.alu_num))
        );
        *remaining -= 1;
        left
      },
      None => 0,
    };
    let claim = Claim {
      init: cfg.init.clone(),
      entries: std::mem::take(&mut cfg.entries),
      alu_num: cfg.alu_num,
      left,
      input_fp: cfg.input_fp,
      output_fp: cfg.output_fp,
    };
    if cfg.remaining == Some(0) {
      self.active = None;
    }
    Ok(claim)
  }
}
