//! # Runtime Configuration
//!
//! All mode flags are resolved once, at process start, into an immutable
//! [`Config`]. The job controller receives it in its constructor and never
//! looks at the environment again.
//!
//! ## Environment
//!
//! | Variable | Meaning | Default |
//! |----------|---------|---------|
//! | `WAINLUX_PORT` | serial device path | `/dev/ttyUSB0` |
//! | `WAINLUX_MOCK` | use the simulated device | off |
//! | `WAINLUX_DRY_RUN` | run jobs without any transport I/O | off |
//!
//! Boolean variables accept `1`, `true`, `yes`, `on` (case-insensitive).

use std::time::Duration;

use crate::device::DeviceSpec;

/// Default serial device path (CH340 bridge on Linux)
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";

pub const ENV_PORT: &str = "WAINLUX_PORT";
pub const ENV_MOCK: &str = "WAINLUX_MOCK";
pub const ENV_DRY_RUN: &str = "WAINLUX_DRY_RUN";

/// Finished jobs kept for status queries and late subscribers
pub const DEFAULT_JOB_HISTORY: usize = 32;

/// Bounded retry with exponential backoff.
///
/// ```
/// use std::time::Duration;
/// use wainlux::config::RetryPolicy;
///
/// let policy = RetryPolicy::DEFAULT;
/// assert_eq!(policy.backoff(1), Duration::from_millis(100));
/// assert_eq!(policy.backoff(2), Duration::from_millis(200));
/// assert_eq!(policy.backoff(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per frame, including the first
    pub max_attempts: u32,
    /// Pause after the first failed attempt
    pub base_backoff: Duration,
    /// Upper bound for any single pause
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        base_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(2),
    };

    /// Pause after the `failed`-th failed attempt (1-based): base × 2^(failed-1).
    pub fn backoff(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Timeouts for every blocking point of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Wait for the ACK of a control or line frame
    pub ack_timeout: Duration,
    /// Wait for the ACK + version reply of the identify handshake
    pub connect_timeout: Duration,
    /// Silence tolerated between burn status frames
    pub burn_idle_timeout: Duration,
    /// Hard cap on the burning phase
    pub max_burn_duration: Duration,
    /// Simulated device response latency (mock mode)
    pub mock_ack_latency: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(1),
            burn_idle_timeout: Duration::from_secs(90),
            max_burn_duration: Duration::from_secs(600),
            mock_ack_latency: Duration::from_millis(5),
        }
    }
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Serial device path
    pub port: String,
    /// Baud rate; the K6 only speaks 115200
    pub baud: u32,
    /// Substitute the simulated device for the serial port
    pub mock: bool,
    /// Run the whole job pipeline without transport I/O
    pub dry_run: bool,
    pub timing: Timing,
    pub retry: RetryPolicy,
    pub spec: DeviceSpec,
    /// How many finished jobs (and their last events) are remembered
    pub job_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud: DeviceSpec::K6.baud,
            mock: false,
            dry_run: false,
            timing: Timing::default(),
            retry: RetryPolicy::default(),
            spec: DeviceSpec::K6,
            job_history: DEFAULT_JOB_HISTORY,
        }
    }
}

impl Config {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(port) = lookup(ENV_PORT).filter(|p| !p.trim().is_empty()) {
            config.port = port.trim().to_string();
        }
        config.mock = lookup(ENV_MOCK).is_some_and(|v| parse_bool(&v));
        config.dry_run = lookup(ENV_DRY_RUN).is_some_and(|v| parse_bool(&v));
        config
    }

    /// Human-readable operation mode for status snapshots.
    pub fn operation_mode(&self) -> &'static str {
        if self.dry_run {
            "dry-run"
        } else if self.mock {
            "mock"
        } else {
            "hardware"
        }
    }
}

/// Parse a bool-like flag value.
pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.baud, 115_200);
        assert!(!config.mock);
        assert!(!config.dry_run);
        assert_eq!(config.operation_mode(), "hardware");
        assert_eq!(config.job_history, DEFAULT_JOB_HISTORY);
    }

    #[test]
    fn test_env_flags() {
        let config = Config::from_lookup(lookup_from(&[
            (ENV_PORT, "/dev/ttyACM0"),
            (ENV_MOCK, "Yes"),
            (ENV_DRY_RUN, "0"),
        ]));
        assert_eq!(config.port, "/dev/ttyACM0");
        assert!(config.mock);
        assert!(!config.dry_run);
        assert_eq!(config.operation_mode(), "mock");
    }

    #[test]
    fn test_dry_run_wins_mode_label() {
        let config = Config::from_lookup(lookup_from(&[(ENV_MOCK, "1"), (ENV_DRY_RUN, "on")]));
        assert_eq!(config.operation_mode(), "dry-run");
    }

    #[test]
    fn test_blank_port_ignored() {
        let config = Config::from_lookup(lookup_from(&[(ENV_PORT, "  ")]));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", "TRUE", "yes", "on", " On "] {
            assert!(parse_bool(v), "{v} should be true");
        }
        for v in ["0", "false", "no", "off", "", "maybe"] {
            assert!(!parse_bool(v), "{v} should be false");
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }
}
