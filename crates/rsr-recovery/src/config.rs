//! Registry configuration.

use rsr_error::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default temp-file prefix for files written during a recovery.
pub const DEFAULT_TEMP_FILE_PREFIX: &str = "recovery.";

/// Tunables for a [`RecoveryRegistry`](crate::RecoveryRegistry).
///
/// Durations serialize as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Idle period after which a session is cancelled as timed out.
    /// Default: 30 minutes.
    #[serde(rename = "activity_timeout_ms", with = "duration_ms")]
    pub activity_timeout: Duration,
    /// How often the background sweeper looks for idle sessions.
    /// Default: 30 seconds.
    #[serde(rename = "sweep_interval_ms", with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Prefix of every temp file name handed out by a session.
    /// Default: `"recovery."`.
    pub temp_file_prefix: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(30),
            temp_file_prefix: DEFAULT_TEMP_FILE_PREFIX.to_owned(),
        }
    }
}

impl RegistryConfig {
    /// Reject settings the registry cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.activity_timeout.is_zero() {
            return Err(RecoveryError::InvalidConfig(
                "activity_timeout must be non-zero".into(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(RecoveryError::InvalidConfig(
                "sweep_interval must be non-zero".into(),
            ));
        }
        if self.temp_file_prefix.is_empty() {
            return Err(RecoveryError::InvalidConfig(
                "temp_file_prefix must not be empty".into(),
            ));
        }
        if self
            .temp_file_prefix
            .contains(|c: char| c == '/' || c == '\\' || c.is_control())
        {
            return Err(RecoveryError::InvalidConfig(format!(
                "temp_file_prefix {:?} is not a plain file name prefix",
                self.temp_file_prefix
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
