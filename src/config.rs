use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::RetryConfig;

/// Main configuration structure for SpoolTrack
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SpoolTrackConfig {
    /// Row store location and request limits
    pub store: StoreConfig,
    /// Claim/release coordination settings
    pub coordination: CoordinationConfig,
    /// Audit outbox settings
    pub audit: AuditConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the JSON store document used by the file-backed store
    pub path: PathBuf,
    /// Largest number of rows a single store call may touch
    pub max_rows_per_call: usize,
    /// Sustained request rate towards the store
    pub requests_per_second: u32,
    /// Burst capacity on top of the sustained rate
    pub burst: u32,
    /// How long a sheet's header row is cached
    pub column_cache_ttl_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".spooltrack/store.json"),
            max_rows_per_call: 500,
            requests_per_second: 10,
            burst: 20,
            column_cache_ttl_seconds: 300,
        }
    }
}

impl StoreConfig {
    pub fn column_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.column_cache_ttl_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Attempts for a claim/release that keeps hitting version conflicts
    pub version_attempts: usize,
    /// Attempts for a store write failing with transient errors
    pub store_write_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Failed inspections allowed before a spool is blocked
    pub repair_cycle_cap: u8,
    /// Move inspection to pending when welding completes
    pub inspection_trigger: bool,
    /// Claims older than this are reported by reconcile
    pub stale_claim_hours: i64,
    /// Offset of the plant's business day from UTC
    pub business_utc_offset_minutes: i32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            version_attempts: 3,
            store_write_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
            repair_cycle_cap: 3,
            inspection_trigger: true,
            stale_claim_hours: 24,
            business_utc_offset_minutes: -180,
        }
    }
}

impl CoordinationConfig {
    pub fn version_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.version_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: true,
        }
    }

    pub fn store_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.store_write_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Where staged and committed audit batches wait for the flush
    pub outbox_path: PathBuf,
    /// Attempts per chunk when appending to the audit sheet
    pub flush_attempts: usize,
    /// SQLite outbox instead of the JSON file (needs the `database` feature)
    pub database_url: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            outbox_path: PathBuf::from(".spooltrack/outbox.json"),
            flush_attempts: 3,
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON lines instead of human-readable logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl SpoolTrackConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (spooltrack.toml, .spooltrack-rc)
    /// 3. Environment variables (SPOOLTRACK_ prefix, `__` between sections)
    pub fn load() -> Result<Self> {
        Self::load_from_dir(".")
    }

    /// Same as [`SpoolTrackConfig::load`], looking for files in `dir`.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut builder = Config::builder();

        let toml_file = dir.join("spooltrack.toml");
        if toml_file.exists() {
            builder = builder.add_source(File::from(toml_file).format(FileFormat::Toml));
        }

        let rc_file = dir.join(".spooltrack-rc");
        if rc_file.exists() {
            builder = builder.add_source(File::from(rc_file).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("SPOOLTRACK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
