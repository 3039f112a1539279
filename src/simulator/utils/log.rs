//! Console progress output of the simulator and the `log` backend.
use std::sync::atomic::{AtomicBool, Ordering};
static PROGRESS: AtomicBool = AtomicBool::new(true);

/// Install the `env_logger` backend, `info` unless `RUST_LOG` says otherwise.
/// Safe to call more than once.
pub fn init_log() {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp(None)
    .try_init();
}

/// `--quiet` turns progress lines off.
pub fn set_log(enabled: bool) {
  PROGRESS.store(enabled, Ordering::Relaxed);
}

pub fn is_log_enabled() -> bool {
  PROGRESS.load(Ordering::Relaxed)
}

/// Progress line with a blue [Log] prefix, dropped in quiet mode
#[macro_export]
macro_rules! log_info {
  ($($arg:tt)*) => {
    if $crate::simulator::utils::log::is_log_enabled() {
      println!("\x1b[34m[Log]\x1b[0m {}", format!($($arg)*));
    }
  };
}
