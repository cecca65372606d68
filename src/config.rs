//! Configuration types for the delayq server.
//!
//! Settings are loaded from a TOML file (`delayq.toml` by default). Every
//! section and key is optional:
//!
//! - [`ServerConfig`] - listen address
//! - [`EngineConfig`] - backend selection and tie-break strategy
//! - [`FjallConfig`] / [`RedbConfig`] - per-backend storage settings
//! - [`MaintenanceSettings`] - compaction schedule for the fjall backend
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 6379
//!
//! [engine]
//! backend = "fjall"
//! uniquifier = "random"
//!
//! [fjall]
//! path = "./queue_data"
//! sequence_bandwidth = 4
//!
//! [maintenance]
//! interval_secs = 300
//! discard_ratio = 0.7
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::engine::{FjallOptions, MaintenanceConfig, RedbOptions, Uniquifier};

/// Config file looked up when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "delayq.toml";

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Storage backend behind the queue engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Log-structured keyspace with value-log compaction.
    #[default]
    Fjall,
    /// Single-file B-tree, one table per queue.
    Redb,
}

/// delayq.toml configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub fjall: FjallConfig,
    pub redb: RedbConfig,
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: Backend,
    pub uniquifier: Uniquifier,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FjallConfig {
    pub path: PathBuf,
    /// Queue identifiers leased per counter write.
    pub sequence_bandwidth: u64,
    /// Fsync the journal after every commit.
    pub fsync: bool,
}

impl Default for FjallConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./queue_data"),
            sequence_bandwidth: 4,
            fsync: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedbConfig {
    pub path: PathBuf,
}

impl Default for RedbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./queue_data.redb"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSettings {
    pub interval_secs: u64,
    pub discard_ratio: f32,
    pub max_rounds: u32,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        let defaults = MaintenanceConfig::default();
        Self {
            interval_secs: defaults.interval.as_secs(),
            discard_ratio: defaults.discard_ratio,
            max_rounds: defaults.max_rounds,
        }
    }
}

impl Config {
    /// Load configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The file cannot be read (IO error)
    /// - The file contains invalid TOML syntax
    /// - A field has an invalid type or an unknown enum value
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::metadata(path) {
            Ok(_) => Self::load_from(path),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using default configs");
                Ok(Self::default())
            },
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read config file: {}", path.display())),
        }
    }

    /// Validate configuration with comprehensive checks.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails with one or more errors:
    /// - Port 0 or an empty host
    /// - Empty storage path for the selected backend
    /// - Zero sequence bandwidth or maintenance interval
    /// - Discard ratio outside (0, 1)
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // 1. Listen address
        if self.server.host.is_empty() {
            errors.push("server.host cannot be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push(
                "server.port cannot be 0. Use a valid port number (1-65535)\n  \
                 Default: 6379"
                    .to_string(),
            );
        }
        if self.server.port < 1024 && self.server.port > 0 {
            warnings.push(format!(
                "server.port {} is a system/privileged port (< 1024)\n  \
                 Recommendation: Use ports >= 1024 (e.g., 6379) to avoid permission issues",
                self.server.port
            ));
        }

        // 2. Storage paths
        match self.engine.backend {
            Backend::Fjall if self.fjall.path.as_os_str().is_empty() => {
                errors.push("fjall.path cannot be empty".to_string());
            },
            Backend::Redb if self.redb.path.as_os_str().is_empty() => {
                errors.push("redb.path cannot be empty".to_string());
            },
            _ => {},
        }
        if self.fjall.sequence_bandwidth == 0 {
            errors.push(
                "fjall.sequence_bandwidth cannot be 0. Set a positive number (default: 4)"
                    .to_string(),
            );
        }
        if self.engine.backend == Backend::Fjall && !self.fjall.fsync {
            warnings.push(
                "fjall.fsync is disabled\n  \
                 Acknowledged writes may be lost on power failure"
                    .to_string(),
            );
        }

        // 3. Maintenance schedule
        if self.maintenance.interval_secs == 0 {
            errors.push(
                "maintenance.interval_secs cannot be 0. Set a positive number (default: 300)"
                    .to_string(),
            );
        }
        let ratio = self.maintenance.discard_ratio;
        if !(ratio > 0.0 && ratio < 1.0) {
            errors.push(format!(
                "maintenance.discard_ratio must be between 0 and 1 exclusive (got: {ratio})"
            ));
        }
        if self.maintenance.max_rounds == 0 {
            warnings.push(
                "maintenance.max_rounds is 0\n  \
                 Compaction will never run"
                    .to_string(),
            );
        }

        if !errors.is_empty() {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }

    /// Address the front-end binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn maintenance_config(&self) -> MaintenanceConfig {
        MaintenanceConfig {
            interval: Duration::from_secs(self.maintenance.interval_secs),
            discard_ratio: self.maintenance.discard_ratio,
            max_rounds: self.maintenance.max_rounds,
        }
    }

    pub fn fjall_options(&self) -> FjallOptions {
        FjallOptions {
            sequence_bandwidth: self.fjall.sequence_bandwidth,
            uniquifier: self.engine.uniquifier,
            fsync: self.fjall.fsync,
            maintenance: self.maintenance_config(),
            ..FjallOptions::new(&self.fjall.path)
        }
    }

    pub fn redb_options(&self) -> RedbOptions {
        RedbOptions {
            uniquifier: self.engine.uniquifier,
            ..RedbOptions::new(&self.redb.path)
        }
    }
}
