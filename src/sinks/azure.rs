//! Azure Log Analytics sink.
//!
//! Events are posted to the HTTP Data Collector API of a Log Analytics
//! workspace, signed with the workspace shared key.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{Value, json};
use sha2::Sha256;
use std::time::Duration;

use super::{RelevantTypes, Sink, SinkError};
use crate::enrich::{CloudProvider, EnrichedEvent};

const API_VERSION: &str = "2016-04-01";
const RESOURCE: &str = "/api/logs";
const CONTENT_TYPE: &str = "application/json";

pub struct AzureSink {
    http: reqwest::Client,
    endpoint: String,
    workspace_id: String,
    key: Vec<u8>,
    log_type: String,
    types: RelevantTypes,
}

impl AzureSink {
    pub fn new(workspace_id: &str, primary_key: &str, log_type: &str) -> Result<Self, SinkError> {
        if workspace_id.is_empty() {
            return Err(SinkError::Other("azure workspace_id is empty".into()));
        }
        let key = STANDARD
            .decode(primary_key.trim())
            .map_err(|e| SinkError::Other(format!("azure primary_key is not base64: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!(
                "https://{workspace_id}.ods.opinsights.azure.com{RESOURCE}?api-version={API_VERSION}"
            ),
            workspace_id: workspace_id.to_owned(),
            key,
            log_type: log_type.to_owned(),
            types: RelevantTypes::All,
        })
    }

    /// `Authorization` header value for a body of `content_length` bytes sent at `date`.
    fn signature(&self, content_length: usize, date: &str) -> Result<String, SinkError> {
        let to_sign =
            format!("POST\n{content_length}\n{CONTENT_TYPE}\nx-ms-date:{date}\n{RESOURCE}");
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| SinkError::Other(format!("invalid azure key: {e}")))?;
        mac.update(to_sign.as_bytes());
        let digest = STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{digest}", self.workspace_id))
    }
}

/// The wire document plus the device attributes it was enriched with.
fn record(event: &EnrichedEvent) -> Value {
    let mut doc = event.event.payload().clone();
    if let Value::Object(map) = &mut doc {
        map.insert(
            "device".into(),
            json!({
                "hostname": event.hostname(),
                "cloud_provider": event.cloud_provider().map(|p| p.to_string()),
                "account_id": event.account_id(),
                "instance_id": event.instance_id(),
            }),
        );
    }
    doc
}

#[async_trait]
impl Sink for AzureSink {
    fn name(&self) -> &'static str {
        "AZURE"
    }

    fn relevant_event_types(&self) -> &RelevantTypes {
        &self.types
    }

    /// Hosts known to run in another cloud belong to that cloud's console.
    fn is_relevant(&self, event: &EnrichedEvent) -> bool {
        event.device.is_none() || event.cloud_provider() == Some(CloudProvider::Azure)
    }

    async fn process(&self, event: &EnrichedEvent) -> Result<(), SinkError> {
        let body = serde_json::to_vec(&[record(event)])
            .map_err(|e| SinkError::Other(format!("cannot serialize event: {e}")))?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let authorization = self.signature(body.len(), &date)?;

        let resp = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", CONTENT_TYPE)
            .header("Log-Type", &self.log_type)
            .header("x-ms-date", &date)
            .header("Authorization", authorization)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                sink: self.name(),
                status: status.as_u16(),
                body,
            });
        }
        log::debug!("{} posted to log analytics as {}", event.event, self.log_type);
        Ok(())
    }
}
