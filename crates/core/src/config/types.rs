use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::scheduler::CoordinatorConfig;
use crate::worker::WorkerConfig;

/// Root configuration
///
/// The presence of `[coordinator]` and/or `[worker]` decides which roles
/// this process runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub coordinator: Option<CoordinatorConfig>,
    #[serde(default)]
    pub worker: Option<WorkerConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

/// Database configuration (coordinator registries and stream store)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("castfleet.db")
}

/// Sanitized config for API responses (worker token redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinator: Option<CoordinatorConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<SanitizedWorkerConfig>,
}

/// Worker section with the identity token hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedWorkerConfig {
    pub id_configured: bool,
    pub address: String,
    pub coordinator_url: String,
    pub recording_dir: PathBuf,
    pub output_dir: PathBuf,
    pub trash_dir: PathBuf,
    pub version: String,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            logging: config.logging.clone(),
            database: config.database.clone(),
            coordinator: config.coordinator.clone(),
            worker: config.worker.as_ref().map(|w| SanitizedWorkerConfig {
                id_configured: !w.id.is_empty(),
                address: w.address.clone(),
                coordinator_url: w.coordinator_url.clone(),
                recording_dir: w.recording_dir.clone(),
                output_dir: w.output_dir.clone(),
                trash_dir: w.trash_dir.clone(),
                version: w.version.clone(),
            }),
        }
    }
}
