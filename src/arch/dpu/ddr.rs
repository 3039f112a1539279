use std::collections::{BTreeMap, BTreeSet};

use crate::check;
use crate::error::{DpuError, Result};

/// Linear external byte space addressed by register id.
#[derive(Debug, Clone)]
pub struct Region {
  id: u32,
  data: Vec<u8>,
  used: BTreeSet<usize>,
}

impl Region {
  pub fn new(id: u32, size: usize) -> Self {
    Self { id, data: vec![0; size], used: BTreeSet::new() }
  }

  /// Region of `size` bytes whose head is `init` (the rest stays zero).
  pub fn with_data(id: u32, size: usize, init: &[u8]) -> Result<Self> {
    check!(
      init.len() <= size,
      DpuError::Program(format!("region {}: {} initial bytes for size {}", id, init.len(), size))
    );
    let mut r = Self::new(id, size);
    r.data[..init.len()].copy_from_slice(init);
    Ok(r)
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn size(&self) -> usize {
    self.data.len()
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  fn span(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>> {
    let end = offset.checked_add(len).unwrap_or(usize::MAX);
    check!(
      end <= self.data.len(),
      DpuError::range(format!(
        "region {} offset {} + {} bytes beyond size {}",
        self.id,
        offset,
        len,
        self.data.len()
      ))
    );
    Ok(offset..end)
  }

  pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
    let span = self.span(offset, len)?;
    Ok(&self.data[span])
  }

  pub fn byte(&self, offset: usize) -> Result<u8> {
    Ok(self.read(offset, 1)?[0])
  }

  pub fn write(&mut self, offset: usize, src: &[u8]) -> Result<()> {
    let span = self.span(offset, src.len())?;
    self.data[span].copy_from_slice(src);
    Ok(())
  }

  /// Record the `line_width`-aligned lines covering `[offset, offset + len)`.
  pub fn mark_used(&mut self, offset: usize, len: usize, line_width: usize) {
    if len == 0 || line_width == 0 {
      return;
    }
    let first = offset / line_width;
    let last = (offset + len - 1) / line_width;
    self.used.extend(first..=last);
  }

  /// Start offsets of every touched line.
  pub fn used_lines(&self, line_width: usize) -> Vec<usize> {
    self.used.iter().map(|l| l * line_width).collect()
  }
}

#[derive(Debug, Clone, Default)]
pub struct DdrSet {
  regions: BTreeMap<u32, Region>,
}

impl DdrSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, region: Region) {
    self.regions.insert(region.id(), region);
  }

  pub fn get(&self, id: u32) -> Result<&Region> {
    self
      .regions
      .get(&id)
      .ok_or_else(|| DpuError::range(format!("external region {} not declared", id)))
  }

  pub fn get_mut(&mut self, id: u32) -> Result<&mut Region> {
    self
      .regions
      .get_mut(&id)
      .ok_or_else(|| DpuError::range(format!("external region {} not declared", id)))
  }

  pub fn iter(&self) -> impl Iterator<Item = &Region> {
    self.regions.values()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bounds_checked() {
    let mut r = Region::new(1, 8);
    r.write(4, &[1, 2, 3, 4]).unwrap();
    assert_eq!(r.read(4, 4).unwrap(), &[1, 2, 3, 4]);
    assert!(matches!(r.write(5, &[0; 4]), Err(DpuError::AddressOutOfRange { .. })));
  }

  #[test]
  fn line_usage() {
    let mut r = Region::new(0, 64);
    r.mark_used(14, 4, 16);
    assert_eq!(r.used_lines(16), vec![0, 16]);
  }

  #[test]
  fn initial_bytes() {
    let r = Region::with_data(2, 4, &[9, 8]).unwrap();
    assert_eq!(r.data(), &[9, 8, 0, 0]);
    assert!(Region::with_data(2, 1, &[9, 8]).is_err());
  }
}
