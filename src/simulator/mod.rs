pub mod config;
pub mod program;
pub mod sim;
#[allow(clippy::module_inception)]
pub mod simulator;
pub mod utils;

pub use program::Program;
pub use simulator::Simulator;
pub use utils::log;
