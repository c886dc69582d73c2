//! Google Chronicle sink.
//!
//! Detections are translated into a UDM event and posted to the Chronicle
//! ingestion API. Only the `us` region is served from the unprefixed host.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use std::time::Duration;

use super::{RelevantTypes, Sink, SinkError};
use crate::comms::events::Event;
use crate::enrich::EnrichedEvent;

const INGESTION_HOST: &str = "malachiteingestion-pa.googleapis.com";

pub struct ChronicleSink {
    http: reqwest::Client,
    endpoint: String,
    security_key: String,
    types: RelevantTypes,
}

impl ChronicleSink {
    pub fn new(region: &str, security_key: &str) -> Result<Self, SinkError> {
        if security_key.is_empty() {
            return Err(SinkError::Other("chronicle security_key is empty".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint(region),
            security_key: security_key.to_owned(),
            types: RelevantTypes::detections(),
        })
    }
}

fn endpoint(region: &str) -> String {
    let region = region.trim();
    if region.is_empty() || region.eq_ignore_ascii_case("us") {
        format!("https://{INGESTION_HOST}/v1/udmevents")
    } else {
        format!("https://{region}-{INGESTION_HOST}/v1/udmevents")
    }
}

#[async_trait]
impl Sink for ChronicleSink {
    fn name(&self) -> &'static str {
        "CHRONICLE"
    }

    fn relevant_event_types(&self) -> &RelevantTypes {
        &self.types
    }

    async fn process(&self, event: &EnrichedEvent) -> Result<(), SinkError> {
        log::info!(
            "processing detection: {}",
            event.event.detect_description().unwrap_or("-")
        );
        let body = json!({ "events": [udm(&event.event)?] });
        let resp = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.security_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                sink: self.name(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Build the UDM representation of a detection.
fn udm(event: &Event) -> Result<Value, SinkError> {
    let sensor_id = event.sensor_id().ok_or(SinkError::MissingField("SensorId"))?;
    let detect_id = event.detect_id().ok_or(SinkError::MissingField("DetectId"))?;
    let s = |name: &str| event.str_field(name).unwrap_or_default();

    let timestamp = event
        .field("ProcessStartTime")
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(|| event.creation_time());

    let full_path = match (s("FilePath"), s("FileName")) {
        ("", name) => name.to_owned(),
        (dir, name) => format!("{dir}\\{name}"),
    };

    Ok(json!({
        "metadata": {
            "event_timestamp": timestamp.to_rfc3339(),
            "event_type": "PROCESS_UNCATEGORIZED",
            "description": s("DetectDescription"),
            "product_event_type": event.event_type(),
            "product_log_id": detect_id,
            "product_name": "Falcon",
        },
        "principal": {
            "hostname": s("ComputerName"),
            "user": { "userid": s("UserName") },
            "ip": s("LocalIP"),
        },
        "target": {
            "asset_id": format!("CrowdStrike.Falcon:{sensor_id}"),
            "process": {
                "command_line": s("CommandLine"),
                "file": {
                    "full_path": full_path,
                    "md5": s("MD5String"),
                    "sha1": s("SHA1String"),
                    "sha256": s("SHA256String"),
                },
                "pid": scalar(event.field("ProcessId")),
                "parent_process": {
                    "command_line": s("ParentCommandLine"),
                    "pid": scalar(event.field("ParentProcessId")),
                },
            },
        },
        "security_result": {
            "action_details": s("PatternDispositionDescription"),
            "severity_details": event.severity_name().unwrap_or_default(),
            "url_back_to_product": event.product_link().and_then(console_link),
        },
    }))
}

/// Numbers and strings both appear for process ids; UDM wants a string.
fn scalar(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

/// Rewrite a `FalconHostLink` into the console deep-link form
/// `scheme//host/api2/link?{cid}&url={encoded path}`.
fn console_link(link: &str) -> Option<String> {
    let (_, cid) = link.rsplit_once('_')?;
    let segments: Vec<&str> = link.split('/').collect();
    if segments.len() < 3 {
        return None;
    }
    let path: String = segments[3..].iter().map(|seg| format!("/{seg}")).collect();
    let rewritten = format!(
        "{}/{}/{}/api2/link?{cid}&url={}",
        segments[0],
        segments[1],
        segments[2],
        urlencoding::encode(&path)
    );
    rewritten.split('_').next().map(str::to_owned)
}
