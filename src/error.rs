use std::fmt;
use thiserror::Error;

/// Id of the instruction an error belongs to. Unknown until the sequencer
/// stamps it on the way out of `Sequencer::issue`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstId(pub Option<u64>);

impl fmt::Display for InstId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.0 {
      Some(id) => write!(f, "#{}", id),
      None => write!(f, "#?"),
    }
  }
}

#[derive(Debug, Error)]
pub enum DpuError {
  /// A field value outside its legal numeric range.
  #[error("instruction {inst}: parameter error: {message}")]
  Parameter { inst: InstId, message: String },

  /// Bank id, bank address or external offset beyond declared bounds.
  #[error("instruction {inst}: address out of range: {message}")]
  AddressOutOfRange { inst: InstId, message: String },

  /// Compute instruction without, or in excess of, its init block.
  #[error("instruction {inst}: ordering error: {message}")]
  Ordering { inst: InstId, message: String },

  /// Mode known to the taxonomy but not enabled on the active target.
  #[error("instruction {inst}: {message} is unsupported on {target}")]
  Unsupported { inst: InstId, message: String, target: String },

  #[error("configuration error: {0}")]
  Config(String),

  #[error("program error: {0}")]
  Program(String),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DpuError>;

impl DpuError {
  pub fn param(message: impl Into<String>) -> Self {
    DpuError::Parameter { inst: InstId::default(), message: message.into() }
  }

  pub fn range(message: impl Into<String>) -> Self {
    DpuError::AddressOutOfRange { inst: InstId::default(), message: message.into() }
  }

  pub fn ordering(message: impl Into<String>) -> Self {
    DpuError::Ordering { inst: InstId::default(), message: message.into() }
  }

  pub fn unsupported(message: impl Into<String>, target: impl Into<String>) -> Self {
    DpuError::Unsupported {
      inst: InstId::default(),
      message: message.into(),
      target: target.into(),
    }
  }

  /// Attach an instruction id if none was recorded yet.
  pub fn at(mut self, id: u64) -> Self {
    match &mut self {
      DpuError::Parameter { inst, .. }
      | DpuError::AddressOutOfRange { inst, .. }
      | DpuError::Ordering { inst, .. }
      | DpuError::Unsupported { inst, .. } => {
        if inst.0.is_none() {
          inst.0 = Some(id);
        }
      },
      _ => {},
    }
    self
  }

  pub fn inst(&self) -> Option<u64> {
    match self {
      DpuError::Parameter { inst, .. }
      | DpuError::AddressOutOfRange { inst, .. }
      | DpuError::Ordering { inst, .. }
      | DpuError::Unsupported { inst, .. } => inst.0,
      _ => None,
    }
  }
}

/// `check!(cond, DpuError::param(...))` returns the error when `cond` fails.
#[macro_export]
macro_rules! check {
  ($cond:expr, $err:expr) => {
    if !($cond) {
      return Err($err);
    }
  };
}
