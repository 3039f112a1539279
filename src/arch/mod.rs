pub mod dpu;
pub mod profile;

pub use dpu::{Dpu, DpuOptions};
pub use profile::{Generation, Profile};
