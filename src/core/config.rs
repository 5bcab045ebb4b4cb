//! Runtime configuration, read from the environment the same way logging
//! verbosity is.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::warn;

/// Default output sink for the temperature log.
pub const DEFAULT_LOG_PATH: &str = "/tmp/thermal.dat";
/// Default logger stall threshold in seconds.
pub const DEFAULT_STALL_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct Config {
    /// Where the per-cycle sample lines go. Truncated on startup.
    pub log_path: PathBuf,
    /// How long the logger waits without a stamped sample before it
    /// provokes the devices with a characteristic read.
    pub stall_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            stall_timeout: Duration::from_secs(DEFAULT_STALL_SECS),
        }
    }
}

impl Config {
    /// Reads `INKLOG_OUT` and `INKLOG_STALL_SECS`, falling back to the
    /// defaults on absent or unparsable values.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = env::var("INKLOG_OUT") {
            config.log_path = PathBuf::from(path);
        }
        if let Ok(raw) = env::var("INKLOG_STALL_SECS") {
            match raw.parse::<u64>() {
                Ok(secs) => config.stall_timeout = Duration::from_secs(secs),
                Err(_) => warn!("ignoring unparsable INKLOG_STALL_SECS={:?}", raw),
            }
        }
        config
    }
}
