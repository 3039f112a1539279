pub mod arch;
pub mod error;
pub mod simulator;

pub use error::{DpuError, Result};
pub use simulator::sim::mode::{SimConfig, StepMode};
pub use simulator::utils::log;
