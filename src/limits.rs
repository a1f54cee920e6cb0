//! Resource limits applied to every sandbox.

use crate::{Error, Result};
use serde_derive::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_WALL_TIME: Duration = Duration::from_secs(5);
const DEFAULT_COMPILE_TIME: Duration = Duration::from_secs(10);
const DEFAULT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
const DEFAULT_PIDS: u32 = 64;

/// Hard ceilings for a single execution. Every field is always set;
/// there is no unbounded mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    #[serde(with = "millis")]
    pub wall_time: Duration,
    #[serde(with = "millis")]
    pub compile_time: Duration,
    pub memory_bytes: u64,
    /// Applied to stdout and stderr independently.
    pub max_output_bytes: usize,
    pub cpus: f64,
    pub pids: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            wall_time: DEFAULT_WALL_TIME,
            compile_time: DEFAULT_COMPILE_TIME,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            cpus: 1.0,
            pids: DEFAULT_PIDS,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.wall_time == Duration::from_millis(0) {
            return Err(invalid("wall time must be positive"));
        }
        if self.compile_time == Duration::from_millis(0) {
            return Err(invalid("compile time must be positive"));
        }
        // Docker refuses memory limits below 6 MiB.
        if self.memory_bytes < 6 * 1024 * 1024 {
            return Err(invalid("memory limit must be at least 6 MiB"));
        }
        if self.max_output_bytes == 0 {
            return Err(invalid("output limit must be positive"));
        }
        if !(self.cpus > 0.0) {
            return Err(invalid("cpu quota must be positive"));
        }
        if self.pids == 0 {
            return Err(invalid("pid limit must be positive"));
        }
        Ok(())
    }

    /// Applies caller overrides on top of `self`, then clamps the result
    /// to `ceiling`.
    pub fn resolve(&self, overrides: Option<&LimitOverrides>, ceiling: &ResourceLimits) -> Result<Self> {
        let mut limits = self.clone();

        if let Some(overrides) = overrides {
            if let Some(ms) = overrides.wall_time_ms {
                if ms == 0 {
                    return Err(invalid("wallTimeMs must be positive"));
                }
                limits.wall_time = Duration::from_millis(ms);
            }
            if let Some(bytes) = overrides.memory_bytes {
                limits.memory_bytes = bytes;
            }
            if let Some(bytes) = overrides.max_output_bytes {
                if bytes == 0 {
                    return Err(invalid("maxOutputBytes must be positive"));
                }
                limits.max_output_bytes = bytes;
            }
        }

        limits.wall_time = limits.wall_time.min(ceiling.wall_time);
        limits.compile_time = limits.compile_time.min(ceiling.compile_time);
        limits.memory_bytes = limits.memory_bytes.min(ceiling.memory_bytes);
        limits.max_output_bytes = limits.max_output_bytes.min(ceiling.max_output_bytes);
        limits.cpus = limits.cpus.min(ceiling.cpus);
        limits.pids = limits.pids.min(ceiling.pids);

        limits.validate()?;
        Ok(limits)
    }

    /// Upper bound on how long a container may live, used as the keep-alive
    /// so that a leaked sandbox still exits on its own.
    pub fn container_lifetime(&self) -> Duration {
        self.compile_time + self.wall_time + Duration::from_secs(30)
    }
}

/// Limits a caller may override per submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitOverrides {
    pub wall_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

fn invalid(reason: &str) -> Error {
    Error::InvalidLimits {
        reason: reason.to_string(),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::{convert::TryFrom, time::Duration};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
