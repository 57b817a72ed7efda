//! Engine configuration.
//!
//! Read from a JSON file with camelCase keys. Every field has a default, so a
//! missing file or an empty object yields a working configuration:
//!
//! ```json
//! {
//!   "namespace": "orion",
//!   "sidecar": { "binaryPath": "orion-sidecar", "args": [] },
//!   "restart": { "maxRestarts": 3, "initialBackoffMs": 500 },
//!   "retention": { "maxResidentSessions": 16 },
//!   "backpressure": { "maxPendingPartials": 256 }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;
use crate::protocol::QueryOptions;
use crate::session::RetentionPolicy;
use crate::sidecar::{AdapterOptions, RestartPolicy};
use crate::spawn::SpawnConfig;

pub const DEFAULT_SIDECAR_BINARY: &str = "orion-sidecar";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SidecarConfig {
    pub binary_path: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    pub shell_prefix: Option<String>,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            binary_path: DEFAULT_SIDECAR_BINARY.to_string(),
            args: Vec::new(),
            working_dir: None,
            shell_prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartConfig {
    pub max_restarts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        let policy = RestartPolicy::default();
        Self {
            max_restarts: policy.max_restarts,
            initial_backoff_ms: policy.initial_backoff.as_millis() as u64,
            max_backoff_ms: policy.max_backoff.as_millis() as u64,
            jitter_ms: policy.jitter.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionConfig {
    /// `null` keeps every session resident.
    pub max_resident_sessions: Option<usize>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_resident_sessions: RetentionPolicy::default().max_resident_sessions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackpressureConfig {
    pub max_pending_partials: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_pending_partials: AdapterOptions::default().max_pending_partials,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// First component of every session id this engine creates.
    pub namespace: String,
    pub sidecar: SidecarConfig,
    pub restart: RestartConfig,
    pub retention: RetentionConfig,
    pub backpressure: BackpressureConfig,
    pub transcript_dir: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    /// Applied to every session the manager creates.
    pub default_options: QueryOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: "orion".to_string(),
            sidecar: SidecarConfig::default(),
            restart: RestartConfig::default(),
            retention: RetentionConfig::default(),
            backpressure: BackpressureConfig::default(),
            transcript_dir: None,
            data_dir: None,
            default_options: QueryOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path`. A file that does not exist gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&content).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_restarts: self.restart.max_restarts,
            initial_backoff: Duration::from_millis(self.restart.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.restart.max_backoff_ms),
            jitter: Duration::from_millis(self.restart.jitter_ms),
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_resident_sessions: self.retention.max_resident_sessions,
        }
    }

    pub fn spawn_config(&self) -> SpawnConfig {
        let mut config = SpawnConfig::new(&self.sidecar.binary_path, self.sidecar.args.clone());
        if let Some(dir) = &self.sidecar.working_dir {
            config = config.working_dir(dir);
        }
        if let Some(prefix) = &self.sidecar.shell_prefix {
            config = config.shell_prefix(prefix);
        }
        config
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            restart: self.restart_policy(),
            max_pending_partials: self.backpressure.max_pending_partials,
            transcript_dir: self.transcript_dir.clone(),
        }
    }

    /// Configured data directory, or `~/.orion`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(paths::default_data_dir)
    }

    /// Where the JSONL message store lives.
    pub fn messages_dir(&self) -> PathBuf {
        self.data_dir().join("messages")
    }
}
