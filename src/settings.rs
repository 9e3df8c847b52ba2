//! Runtime Settings
//!
//! Tunables shared by the owning thread, the fence pool and both reclamation
//! sweeps. Every field has a default; deployments can override them in code,
//! through process-wide environment variables, or from a JSON document.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use glthread::Settings;
//! use std::time::Duration;
//!
//! // Defaults: 16 pooled fences, 3 min idle timeout, 60 s sweeps.
//! let settings = Settings::default();
//!
//! // Process-wide overrides (GLTHREAD_* environment variables).
//! let settings = Settings::from_env()?;
//!
//! // Explicit overrides.
//! let settings = Settings {
//!     fence_pool_threshold: 64,
//!     idle_timeout: Duration::from_secs(30),
//!     ..Default::default()
//! };
//! ```
//!
//! # Environment Variables
//!
//! | Variable                          | Field                  | Unit    |
//! |-----------------------------------|------------------------|---------|
//! | `GLTHREAD_FENCE_POOL_THRESHOLD`   | `fence_pool_threshold` | count   |
//! | `GLTHREAD_IDLE_TIMEOUT_MS`        | `idle_timeout`         | ms      |
//! | `GLTHREAD_SWEEP_INTERVAL_MS`      | `sweep_interval`       | ms      |
//! | `GLTHREAD_IDLE_CHECK_INTERVAL_MS` | `idle_check_interval`  | ms      |
//! | `GLTHREAD_CYCLE_INTERVAL_MS`      | `cycle_interval`       | ms      |
//! | `GLTHREAD_FENCE_POLL_INTERVAL_MS` | `fence_poll_interval`  | ms      |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Default number of outstanding fences before the pool is swept.
pub const DEFAULT_FENCE_POOL_THRESHOLD: usize = 16;
/// Default idle time after which an idle-managed resource is evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60);
/// Default period of the reachability sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Default period of the idle check.
pub const DEFAULT_IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// Default length of one owning-thread cycle (roughly one 60 Hz frame).
pub const DEFAULT_CYCLE_INTERVAL: Duration = Duration::from_millis(16);
/// Default pause between two fence polls while a caller is blocked in `get`.
pub const DEFAULT_FENCE_POLL_INTERVAL: Duration = Duration::from_millis(1);

const ENV_FENCE_POOL_THRESHOLD: &str = "GLTHREAD_FENCE_POOL_THRESHOLD";
const ENV_IDLE_TIMEOUT: &str = "GLTHREAD_IDLE_TIMEOUT_MS";
const ENV_SWEEP_INTERVAL: &str = "GLTHREAD_SWEEP_INTERVAL_MS";
const ENV_IDLE_CHECK_INTERVAL: &str = "GLTHREAD_IDLE_CHECK_INTERVAL_MS";
const ENV_CYCLE_INTERVAL: &str = "GLTHREAD_CYCLE_INTERVAL_MS";
const ENV_FENCE_POLL_INTERVAL: &str = "GLTHREAD_FENCE_POLL_INTERVAL_MS";

/// Tunables for owning threads, fences and reclamation.
///
/// Durations are (de)serialized as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Outstanding fence handles an owning thread tolerates before it sweeps
    /// satisfied ones on the next fence creation.
    pub fence_pool_threshold: usize,

    /// How long an idle-managed resource may go unused before eviction.
    #[serde(rename = "idle_timeout_ms", with = "millis")]
    pub idle_timeout: Duration,

    /// Period of the reachability sweep that turns dropped handles into
    /// deletion units.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,

    /// Period of the idle check.
    #[serde(rename = "idle_check_interval_ms", with = "millis")]
    pub idle_check_interval: Duration,

    /// Length of one owning-thread cycle; per-cycle tasks run once per cycle.
    #[serde(rename = "cycle_interval_ms", with = "millis")]
    pub cycle_interval: Duration,

    /// Pause between fence polls while a caller waits in `get`.
    #[serde(rename = "fence_poll_interval_ms", with = "millis")]
    pub fence_poll_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fence_pool_threshold: DEFAULT_FENCE_POOL_THRESHOLD,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_check_interval: DEFAULT_IDLE_CHECK_INTERVAL,
            cycle_interval: DEFAULT_CYCLE_INTERVAL,
            fence_poll_interval: DEFAULT_FENCE_POLL_INTERVAL,
        }
    }
}

impl Settings {
    /// Defaults overlaid with any `GLTHREAD_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Parses settings from JSON; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Rejects values that would stall the sweeps or the owning thread, or
    /// flood its queue with fence polls.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("sweep_interval", self.sweep_interval),
            ("idle_check_interval", self.idle_check_interval),
            ("cycle_interval", self.cycle_interval),
            ("fence_poll_interval", self.fence_poll_interval),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();

        if let Some(raw) = lookup(ENV_FENCE_POOL_THRESHOLD) {
            settings.fence_pool_threshold = parse_number(ENV_FENCE_POOL_THRESHOLD, &raw)? as usize;
        }

        let durations: [(&str, &mut Duration); 5] = [
            (ENV_IDLE_TIMEOUT, &mut settings.idle_timeout),
            (ENV_SWEEP_INTERVAL, &mut settings.sweep_interval),
            (ENV_IDLE_CHECK_INTERVAL, &mut settings.idle_check_interval),
            (ENV_CYCLE_INTERVAL, &mut settings.cycle_interval),
            (ENV_FENCE_POLL_INTERVAL, &mut settings.fence_poll_interval),
        ];
        for (key, field) in durations {
            if let Some(raw) = lookup(key) {
                *field = Duration::from_millis(parse_number(key, &raw)?);
            }
        }

        settings.validate()?;
        Ok(settings)
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
