// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads the gateway TOML file into [`RawConfig`], lets environment variables
//! override credentials and regions, then validates everything into a typed
//! [`Config`].

use std::collections::HashSet;
use std::net::SocketAddr;
use std::{fs, path::Path, path::PathBuf, time::Duration};

use super::model::*;
use crate::comms::falcon::base_url;
use crate::enrich::CloudProvider;

pub const DEFAULT_CONFIG_PATH: &str = "config/gateway.toml";

/// Load, override from the process environment, and validate.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    log::debug!("Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = from_str_with_env(&txt, |name| std::env::var(name).ok())?;
    log::info!("Loaded config from {:?}", path);
    Ok(cfg)
}

/// Same as [`load`] with an explicit environment lookup.
pub fn from_str_with_env(
    txt: &str,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Config, ConfigError> {
    let mut raw: RawConfig = toml::from_str(txt)?;
    apply_env_overrides(&mut raw, env);
    validate(raw)
}

/// Non-empty environment values replace the file's values.
pub fn apply_env_overrides(raw: &mut RawConfig, env: impl Fn(&str) -> Option<String>) {
    let slots = [
        ("FALCON_CLIENT_ID", &mut raw.falcon.client_id),
        ("FALCON_CLIENT_SECRET", &mut raw.falcon.client_secret),
        ("FALCON_CLOUD_REGION", &mut raw.falcon.cloud_region),
        ("FALCON_APPLICATION_ID", &mut raw.falcon.application_id),
        ("GOOGLE_SECURITY_KEY", &mut raw.chronicle.security_key),
        ("CHRONICLE_REGION", &mut raw.chronicle.region),
        ("WORKSPACE_ID", &mut raw.azure.workspace_id),
        ("PRIMARY_KEY", &mut raw.azure.primary_key),
        ("AWS_REGION", &mut raw.aws_sqs.region),
        ("AWS_SQS_QUEUE_NAME", &mut raw.aws_sqs.sqs_queue_name),
    ];
    for (name, slot) in slots {
        if let Some(value) = env(name).filter(|v| !v.is_empty()) {
            log::debug!("{name} overrides the configuration file");
            *slot = Some(value);
        }
    }
}

fn ranged(key: &'static str, value: Option<i64>, default: i64, min: i64, max: i64) -> Result<i64, ConfigError> {
    let value = value.unwrap_or(default);
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange { key, value, min, max })
    }
}

fn required(key: &'static str, env: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(ConfigError::Empty(key)),
        None => Err(ConfigError::Missing { key, env }),
    }
}

fn duration(value: Option<String>, default: &str) -> Result<Duration, ConfigError> {
    let text = value.unwrap_or_else(|| default.to_owned());
    humantime::parse_duration(&text).map_err(|e| ConfigError::InvalidDuration(text, e))
}

/// Turn the raw mirror into a runtime `Config`, enforcing ranges and
/// per-backend requirements.
pub fn validate(raw: RawConfig) -> Result<Config, ConfigError> {
    // main
    let backends = raw
        .main
        .backends
        .iter()
        .map(|b| b.parse::<Backend>())
        .collect::<Result<Vec<_>, _>>()?;
    let mut seen = HashSet::new();
    let backends: Vec<Backend> = backends.into_iter().filter(|b| seen.insert(*b)).collect();
    if backends.is_empty() {
        return Err(ConfigError::NoBackends);
    }
    let main = MainConfig {
        worker_threads: ranged("main.worker_threads", raw.main.worker_threads, 4, 1, 127)? as usize,
        queue_capacity: ranged("main.queue_capacity", raw.main.queue_capacity, 10_000, 1, i64::from(u32::MAX))? as usize,
        backends,
    };

    // events
    let exclude_clouds = raw
        .events
        .exclude_clouds
        .iter()
        .map(|c| c.parse::<CloudProvider>().map_err(ConfigError::UnknownCloud))
        .collect::<Result<HashSet<_>, _>>()?;
    let days = ranged("events.older_than_days_threshold", raw.events.older_than_days_threshold, 21, 0, 9999)?;
    let events = EventsConfig {
        severity_threshold: ranged("events.severity_threshold", raw.events.severity_threshold, 2, 0, 5)? as u8,
        max_age: chrono::Duration::days(days),
        exclude_clouds,
    };

    // falcon
    let f = raw.falcon;
    let cloud_region = f.cloud_region.unwrap_or_else(|| "us-1".into());
    if base_url(&cloud_region).is_none() {
        return Err(ConfigError::UnknownRegion(cloud_region));
    }
    let falcon = FalconConfig {
        client_id: required("falcon.client_id", "FALCON_CLIENT_ID", f.client_id)?,
        client_secret: required("falcon.client_secret", "FALCON_CLIENT_SECRET", f.client_secret)?,
        cloud_region,
        application_id: f
            .application_id
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| "fig-gateway".into()),
        reconnect_retry_count: ranged("falcon.reconnect_retry_count", f.reconnect_retry_count, 36, 1, 9999)? as u32,
        discovery_backoff: duration(f.discovery_backoff, "10s")?,
    };

    // metrics / offsets
    let metrics = MetricsConfig {
        listen: raw
            .metrics
            .listen
            .filter(|l| !l.is_empty())
            .map(|l| l.parse::<SocketAddr>().map_err(|e| ConfigError::InvalidAddress(l, e)))
            .transpose()?,
    };
    let offsets = OffsetsConfig {
        path: raw.offsets.path.filter(|p| !p.is_empty()).map(PathBuf::from),
        checkpoint_interval: duration(raw.offsets.checkpoint_interval, "30s")?,
    };

    // backend sections
    let chronicle = if main.backends.contains(&Backend::Chronicle) {
        Some(ChronicleConfig {
            security_key: required("chronicle.security_key", "GOOGLE_SECURITY_KEY", raw.chronicle.security_key)?,
            region: required("chronicle.region", "CHRONICLE_REGION", raw.chronicle.region)?,
        })
    } else {
        None
    };
    let azure = if main.backends.contains(&Backend::Azure) {
        Some(AzureConfig {
            workspace_id: required("azure.workspace_id", "WORKSPACE_ID", raw.azure.workspace_id)?,
            primary_key: required("azure.primary_key", "PRIMARY_KEY", raw.azure.primary_key)?,
            log_type: raw
                .azure
                .log_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "FalconEvents".into()),
        })
    } else {
        None
    };
    let aws_sqs = if main.backends.contains(&Backend::AwsSqs) {
        Some(AwsSqsConfig {
            region: required("aws_sqs.region", "AWS_REGION", raw.aws_sqs.region)?,
            sqs_queue_name: required("aws_sqs.sqs_queue_name", "AWS_SQS_QUEUE_NAME", raw.aws_sqs.sqs_queue_name)?,
        })
    } else {
        None
    };

    log::debug!(
        "Validated config: backends={:?}, workers={}, region={}",
        main.backends,
        main.worker_threads,
        falcon.cloud_region
    );
    Ok(Config {
        main,
        events,
        falcon,
        logging: raw.logging,
        metrics,
        offsets,
        chronicle,
        azure,
        aws_sqs,
    })
}
