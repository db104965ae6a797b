// SPDX-License-Identifier: PMPL-1.0-or-later
//! Engine configuration.
//!
//! Defaults match the deployed service:
//! - database_path: ./stag-data
//! - batch_size: 50, flush_interval_ms: 100
//! - snapshot_threshold: 0.1, worker_threads: 4, log_level: info

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Log verbosity recognised by the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// The equivalent `tracing` level, for subscriber setup in binaries.
    pub fn tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration recognised by the engine core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the database file.
    pub database_path: PathBuf,
    /// Events per flush; the queue holds twice this many.
    pub batch_size: usize,
    /// Deadline after which a partial batch is flushed anyway.
    pub flush_interval_ms: u64,
    /// Reserved for a future snapshot-frequency policy; validated but not
    /// acted upon.
    pub snapshot_threshold: f64,
    /// Upper bound on concurrent read threads the embedding service may
    /// spawn; the writer is always single-threaded.
    pub worker_threads: usize,
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./stag-data"),
            batch_size: 50,
            flush_interval_ms: 100,
            snapshot_threshold: 0.1,
            worker_threads: 4,
            log_level: LogLevel::default(),
        }
    }
}

impl EngineConfig {
    /// Check every field against its permitted range.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.database_path.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig(
                "database_path cannot be empty".to_string(),
            ));
        }
        if self.batch_size < 1 || self.batch_size > 1000 {
            return Err(EngineError::InvalidConfig(format!(
                "batch_size must be between 1 and 1000, got {}",
                self.batch_size
            )));
        }
        if !(0.0..=1.0).contains(&self.snapshot_threshold) {
            return Err(EngineError::InvalidConfig(format!(
                "snapshot_threshold must be between 0 and 1, got {}",
                self.snapshot_threshold
            )));
        }
        if self.worker_threads < 1 || self.worker_threads > 100 {
            return Err(EngineError::InvalidConfig(format!(
                "worker_threads must be between 1 and 100, got {}",
                self.worker_threads
            )));
        }
        Ok(())
    }

    /// The flush deadline as a [`Duration`].
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
