use std::collections::BTreeMap;

use crate::arch::profile::BankGroup;
use crate::check;
use crate::error::{DpuError, Result};

/// Fixed width x depth on-chip memory. Row addresses are checked against the
/// depth, the element walk that follows wraps modulo the bank size.
#[derive(Debug, Clone)]
pub struct Bank {
  id: u32,
  group: String,
  index: u32,
  width: usize,
  depth: usize,
  data: Vec<i8>,
}

impl Bank {
  pub fn new(id: u32, group: &str, index: u32, width: usize, depth: usize) -> Self {
    Self {
      id,
      group: group.to_string(),
      index,
      width,
      depth,
      data: vec![0; width * depth],
    }
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn group(&self) -> &str {
    &self.group
  }

  pub fn index(&self) -> u32 {
    self.index
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn depth(&self) -> usize {
    self.depth
  }

  pub fn data(&self) -> &[i8] {
    &self.data
  }

  fn start(&self, addr: usize) -> Result<usize> {
    check!(
      addr < self.depth,
      DpuError::range(format!(
        "bank {} ({}[{}]) row {} >= depth {}",
        self.id, self.group, self.index, addr, self.depth
      ))
    );
    Ok(addr * self.width)
  }

  pub fn read(&self, addr: usize, dst: &mut [i8]) -> Result<()> {
    let start = self.start(addr)?;
    let size = self.data.len();
    for (i, d) in dst.iter_mut().enumerate() {
      *d = self.data[(start + i) % size];
    }
    Ok(())
  }

  pub fn read_vec(&self, addr: usize, count: usize) -> Result<Vec<i8>> {
    let mut v = vec![0; count];
    self.read(addr, &mut v)?;
    Ok(v)
  }

  pub fn write(&mut self, addr: usize, src: &[i8]) -> Result<()> {
    let start = self.start(addr)?;
    let size = self.data.len();
    for (i, &s) in src.iter().enumerate() {
      self.data[(start + i) % size] = s;
    }
    Ok(())
  }
}

/// Every bank of the target, keyed by global id.
#[derive(Debug, Clone, Default)]
pub struct BankSet {
  banks: BTreeMap<u32, Bank>,
  groups: Vec<BankGroup>,
}

impl BankSet {
  pub fn from_groups(groups: &[BankGroup]) -> Result<Self> {
    let mut banks = BTreeMap::new();
    for g in groups {
      check!(
        g.width > 0 && g.depth > 0 && g.bank_num > 0,
        DpuError::Config(format!("bank group {} has an empty geometry", g.name))
      );
      for i in 0..g.bank_num {
        let id = g.base_id + i;
        let bank = Bank::new(id, &g.name, i, g.width, g.depth);
        check!(
          banks.insert(id, bank).is_none(),
          DpuError::Config(format!("bank id {} declared twice (group {})", id, g.name))
        );
      }
    }
    Ok(Self { banks, groups: groups.to_vec() })
  }

  pub fn len(&self) -> usize {
    self.banks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.banks.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Bank> {
    self.banks.values()
  }

  pub fn contains(&self, id: u32) -> bool {
    self.banks.contains_key(&id)
  }

  pub fn get(&self, id: u32) -> Result<&Bank> {
    self
      .banks
      .get(&id)
      .ok_or_else(|| DpuError::range(format!("bank id {} not present on target", id)))
  }

  pub fn get_mut(&mut self, id: u32) -> Result<&mut Bank> {
    self
      .banks
      .get_mut(&id)
      .ok_or_else(|| DpuError::range(format!("bank id {} not present on target", id)))
  }

  pub fn group(&self, name: &str) -> Result<&BankGroup> {
    self
      .groups
      .iter()
      .find(|g| g.name == name)
      .ok_or_else(|| DpuError::Config(format!("bank group {} not declared", name)))
  }

  /// Global id of bank `index` inside group `name`.
  pub fn id_in_group(&self, name: &str, index: u32) -> Result<u32> {
    let g = self.group(name)?;
    check!(
      index < g.bank_num,
      DpuError::range(format!("bank {} of group {} (only {} banks)", index, name, g.bank_num))
    );
    Ok(g.base_id + index)
  }

  pub fn in_group(&self, name: &str, index: u32) -> Result<&Bank> {
    let id = self.id_in_group(name, index)?;
    self.get(id)
  }

  pub fn in_group_mut(&mut self, name: &str, index: u32) -> Result<&mut Bank> {
    let id = self.id_in_group(name, index)?;
    self.get_mut(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn group(name: &str, base_id: u32, bank_num: u32) -> BankGroup {
    BankGroup { name: name.into(), base_id, bank_num, width: 4, depth: 2 }
  }

  #[test]
  fn wraps_modulo_size() {
    let mut b = Bank::new(0, "IMG", 0, 4, 2);
    b.write(1, &[1, 2, 3, 4, 5, 6]).unwrap();
    assert_eq!(b.read_vec(0, 2).unwrap(), vec![5, 6]);
    assert_eq!(b.read_vec(1, 4).unwrap(), vec![1, 2, 3, 4]);
  }

  #[test]
  fn row_beyond_depth_is_fatal() {
    let b = Bank::new(3, "IMG", 0, 4, 2);
    assert!(matches!(b.read_vec(2, 1), Err(DpuError::AddressOutOfRange { .. })));
  }

  #[test]
  fn group_lookup() {
    let set = BankSet::from_groups(&[group("IMG", 0, 2), group("WGT", 2, 4)]).unwrap();
    assert_eq!(set.len(), 6);
    assert_eq!(set.in_group("WGT", 3).unwrap().id(), 5);
    assert!(set.in_group("WGT", 4).is_err());
    assert!(set.get(6).is_err());
  }

  #[test]
  fn duplicate_ids_rejected() {
    assert!(BankSet::from_groups(&[group("A", 0, 2), group("B", 1, 1)]).is_err());
  }
}
