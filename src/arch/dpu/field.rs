use std::collections::BTreeMap;

use crate::error::{DpuError, Result};

/// Decoded instruction fields, name -> value.
pub type FieldMap = BTreeMap<String, i64>;

pub trait Fields {
  fn field(&self, name: &str) -> Result<i64>;
  fn field_or(&self, name: &str, default: i64) -> i64;

  fn field_usize(&self, name: &str) -> Result<usize> {
    let v = self.field(name)?;
    usize::try_from(v).map_err(|_| DpuError::param(format!("field {} = {} must not be negative", name, v)))
  }

  fn field_u32(&self, name: &str) -> Result<u32> {
    let v = self.field(name)?;
    u32::try_from(v).map_err(|_| DpuError::param(format!("field {} = {} out of range", name, v)))
  }

  fn flag(&self, name: &str) -> bool {
    self.field_or(name, 0) != 0
  }
}

impl Fields for FieldMap {
  fn field(&self, name: &str) -> Result<i64> {
    self
      .get(name)
      .copied()
      .ok_or_else(|| DpuError::param(format!("missing field {}", name)))
  }

  fn field_or(&self, name: &str, default: i64) -> i64 {
    self.get(name).copied().unwrap_or(default)
  }
}

/// Build a field map from literal pairs, mostly for tests.
pub fn fields<'a>(pairs: impl IntoIterator<Item = (&'a str, i64)>) -> FieldMap {
  pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}
