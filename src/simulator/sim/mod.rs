pub mod mode;
pub mod records;
pub mod shell;

pub use mode::{SimConfig, StepMode};
pub use records::InstRecord;
