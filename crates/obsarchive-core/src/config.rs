//! Engine configuration.
//!
//! [`ArchiveConfig`] carries the knobs that govern locking and end-of-table
//! resolution. All fields have defaults, so a partial JSON document such as
//! `{"lock_timeout_ms": 2000}` is a valid configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::error::{ArchiveResult, InvalidConfigSnafu, IoSnafu};

/// Runtime configuration for containers and archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Upper bound on waiting for the advisory lock, in milliseconds.
    pub lock_timeout_ms: u64,
    /// Interval between lock attempts while waiting, in milliseconds.
    pub lock_poll_interval_ms: u64,
    /// Number of trailing rows (in append order) scanned to resolve the end
    /// of a table for duration-relative slices.
    ///
    /// This assumes times arrive non-decreasing. Out-of-order writes older
    /// than this suffix are not seen and skew the computed window.
    pub tail_scan_rows: usize,
    /// Take a shared lock for read handles. When `false`, reads proceed
    /// unlocked and may observe a concurrent writer's partial tail.
    pub shared_read_lock: bool,
    /// `fsync` the container when a write handle is closed.
    pub sync_on_close: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
            lock_poll_interval_ms: 50,
            tail_scan_rows: 100,
            shared_read_lock: true,
            sync_on_close: true,
        }
    }
}

impl ArchiveConfig {
    /// Parse a configuration from JSON; missing fields take defaults.
    pub fn from_json_str(json: &str) -> ArchiveResult<Self> {
        serde_json::from_str(json).context(InvalidConfigSnafu { origin: "<string>" })
    }

    /// Read a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        serde_json::from_str(&json).context(InvalidConfigSnafu {
            origin: path.display().to_string(),
        })
    }

    /// Lock wait bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Lock polling interval.
    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    /// Set the lock wait bound.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the lock polling interval.
    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the trailing-row window used to resolve the end of a table.
    pub fn with_tail_scan_rows(mut self, rows: usize) -> Self {
        self.tail_scan_rows = rows;
        self
    }

    /// Enable or disable shared locks for readers.
    pub fn with_shared_read_lock(mut self, enabled: bool) -> Self {
        self.shared_read_lock = enabled;
        self
    }

    /// Enable or disable `fsync` on close.
    pub fn with_sync_on_close(mut self, enabled: bool) -> Self {
        self.sync_on_close = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let cfg = ArchiveConfig::from_json_str(r#"{"lock_timeout_ms": 250}"#)?;
        assert_eq!(cfg.lock_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.tail_scan_rows, 100);
        assert!(cfg.shared_read_lock);
        Ok(())
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert!(ArchiveConfig::from_json_str("{\"tail_scan_rows\": \"many\"}").is_err());
    }

    #[test]
    fn builders_override_fields() {
        let cfg = ArchiveConfig::default()
            .with_lock_timeout(Duration::from_secs(1))
            .with_tail_scan_rows(10)
            .with_sync_on_close(false);
        assert_eq!(cfg.lock_timeout_ms, 1000);
        assert_eq!(cfg.tail_scan_rows, 10);
        assert!(!cfg.sync_on_close);
    }
}
