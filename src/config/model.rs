// src/config/model.rs

//! Raw TOML mirror and the validated runtime configuration.
//!
//! Everything in the `Raw*` structs is optional so that environment variables
//! can fill gaps before validation; the typed structs below are what the rest
//! of the crate consumes.

use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::{path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;

use crate::enrich::CloudProvider;

/// Top-level runtime config
#[derive(Debug, Clone)]
pub struct Config {
    pub main: MainConfig,
    pub events: EventsConfig,
    pub falcon: FalconConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub offsets: OffsetsConfig,
    /// Present only when the CHRONICLE backend is enabled.
    pub chronicle: Option<ChronicleConfig>,
    /// Present only when the AZURE backend is enabled.
    pub azure: Option<AzureConfig>,
    /// Present only when the AWS_SQS backend is enabled.
    pub aws_sqs: Option<AwsSqsConfig>,
}

#[derive(Debug, Clone)]
pub struct MainConfig {
    pub backends: Vec<Backend>,
    pub worker_threads: usize,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct EventsConfig {
    pub severity_threshold: u8,
    /// Events created longer ago than this are dropped at ingest.
    pub max_age: chrono::Duration,
    pub exclude_clouds: HashSet<CloudProvider>,
}

#[derive(Debug, Clone)]
pub struct FalconConfig {
    pub client_id: String,
    pub client_secret: String,
    pub cloud_region: String,
    pub application_id: String,
    pub reconnect_retry_count: u32,
    pub discovery_backoff: Duration,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsConfig {
    pub listen: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct OffsetsConfig {
    /// SQLite checkpoint file; `None` keeps offsets in memory only.
    pub path: Option<PathBuf>,
    pub checkpoint_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ChronicleConfig {
    pub security_key: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub workspace_id: String,
    pub primary_key: String,
    pub log_type: String,
}

#[derive(Debug, Clone)]
pub struct AwsSqsConfig {
    pub region: String,
    pub sqs_queue_name: String,
}

/// Enabled notification backends; add a variant here to support new ones
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Generic,
    Chronicle,
    Azure,
    AwsSqs,
}

/// Allow `"chronicle"` → `Backend::Chronicle`
impl FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "GENERIC"   => Ok(Backend::Generic),
            "CHRONICLE" => Ok(Backend::Chronicle),
            "AZURE"     => Ok(Backend::Azure),
            "AWS_SQS"   => Ok(Backend::AwsSqs),
            other       => Err(ConfigError::UnknownBackend(other.into())),
        }
    }
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("please provide environment variable {env} or configuration option {key}")]
    Missing { key: &'static str, env: &'static str },

    #[error("expected {key} to be in range {min}-{max}, got {value}")]
    OutOfRange { key: &'static str, value: i64, min: i64, max: i64 },

    #[error("expected {0} to be non-empty")]
    Empty(&'static str),

    #[error("unknown backend '{0}' (expected GENERIC, CHRONICLE, AZURE or AWS_SQS)")]
    UnknownBackend(String),

    #[error("main.backends must name at least one backend")]
    NoBackends,

    #[error("unknown falcon cloud region '{0}'")]
    UnknownRegion(String),

    #[error("unknown cloud '{0}' in events.exclude_clouds")]
    UnknownCloud(String),

    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("invalid listen address '{0}': {1}")]
    InvalidAddress(String, #[source] std::net::AddrParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

// ───── raw TOML mirror ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub main: RawMain,
    pub events: RawEvents,
    pub falcon: RawFalcon,
    pub logging: LoggingConfig,
    pub metrics: RawMetrics,
    pub offsets: RawOffsets,
    pub chronicle: RawChronicle,
    pub azure: RawAzure,
    pub aws_sqs: RawAwsSqs,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawMain {
    pub backends: Vec<String>,
    pub worker_threads: Option<i64>,
    pub queue_capacity: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawEvents {
    pub severity_threshold: Option<i64>,
    pub older_than_days_threshold: Option<i64>,
    pub exclude_clouds: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawFalcon {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub cloud_region: Option<String>,
    pub application_id: Option<String>,
    pub reconnect_retry_count: Option<i64>,
    pub discovery_backoff: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawMetrics {
    pub listen: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawOffsets {
    pub path: Option<String>,
    pub checkpoint_interval: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawChronicle {
    pub security_key: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawAzure {
    pub workspace_id: Option<String>,
    pub primary_key: Option<String>,
    pub log_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawAwsSqs {
    pub region: Option<String>,
    pub sqs_queue_name: Option<String>,
}
