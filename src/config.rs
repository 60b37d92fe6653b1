//! Tuning parameters for a process group.
//!
//! All values have defaults matching long-standing deployment behavior.
//! Blocking-wait mode is controlled by the `NCCL_BLOCKING_WAIT` environment
//! variable; everything else is set by constructing a custom `GroupConfig`.

use std::time::Duration;

use crate::error::{CommError, Result};

/// Environment variable selecting blocking-wait mode: `"1"` makes
/// `WorkHandle::wait`/`synchronize` block until completion or timeout,
/// `"0"` (or unset) returns after stream ordering is established.
pub const NCCL_BLOCKING_WAIT_ENV: &str = "NCCL_BLOCKING_WAIT";

/// Tuning parameters for collective dispatch and error monitoring.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    /// Deadline for a single collective under blocking wait.
    pub op_timeout: Duration,

    /// Whether `wait()` blocks until GPU completion (with timeout) instead
    /// of returning after stream ordering.
    pub blocking_wait: bool,

    /// How long the watchdog sleeps between polling cycles.
    pub watchdog_interval: Duration,

    /// Bounded wait on a peer's aborted-communicator store key per
    /// watchdog cycle.
    pub store_wait: Duration,

    /// Polling interval of the blocking-wait busy loop.
    pub busy_poll: Duration,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(10),
            blocking_wait: false,
            watchdog_interval: Duration::from_secs(10),
            store_wait: Duration::from_secs(1),
            busy_poll: Duration::from_millis(10),
        }
    }
}

impl GroupConfig {
    /// Load the config from the environment, falling back to defaults.
    ///
    /// `NCCL_BLOCKING_WAIT` must be `"0"` or `"1"`; any other value is an
    /// `InvalidArgument` error so a typo cannot silently select a wait mode.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var(NCCL_BLOCKING_WAIT_ENV) {
            match v.as_str() {
                "1" => cfg.blocking_wait = true,
                "0" => {}
                _ => {
                    return Err(CommError::invalid_argument(format!(
                        "invalid value for environment variable {NCCL_BLOCKING_WAIT_ENV}: {v:?}"
                    )));
                }
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = GroupConfig::default();
        assert_eq!(cfg.op_timeout, Duration::from_secs(10));
        assert!(!cfg.blocking_wait);
        assert_eq!(cfg.watchdog_interval, Duration::from_secs(10));
        assert_eq!(cfg.store_wait, Duration::from_secs(1));
        assert_eq!(cfg.busy_poll, Duration::from_millis(10));
    }

    #[test]
    fn test_from_env_parsing() {
        // Single test mutating the variable so parallel test runs don't race.
        unsafe { std::env::set_var(NCCL_BLOCKING_WAIT_ENV, "1") };
        assert!(GroupConfig::from_env().unwrap().blocking_wait);

        unsafe { std::env::set_var(NCCL_BLOCKING_WAIT_ENV, "0") };
        assert!(!GroupConfig::from_env().unwrap().blocking_wait);

        unsafe { std::env::set_var(NCCL_BLOCKING_WAIT_ENV, "yes") };
        assert!(matches!(
            GroupConfig::from_env(),
            Err(CommError::InvalidArgument(_))
        ));

        unsafe { std::env::remove_var(NCCL_BLOCKING_WAIT_ENV) };
        assert!(!GroupConfig::from_env().unwrap().blocking_wait);
    }
}
