//! Event model for the vendor detection stream.
//!
//! Every non-blank line of a data feed is one JSON document of the form
//!
//! ```text
//! {"metadata": {"offset": 42, "eventType": "DetectionSummaryEvent",
//!               "eventCreationTime": 1700000000000, ...},
//!  "event":    {"SensorId": "...", "Severity": 4, ...}}
//! ```
//!
//! `Event` keeps the classification fields the pipeline needs as typed values
//! and the complete document as an opaque payload for the sinks.
//!
//! ## Invariants
//! - `(feed_id, offset)` identifies an event within one feed.
//! - `severity` is always on the 1–5 scale; a missing value means 5.
//! - Events are immutable once parsed.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Event types that describe a detection on a managed host.
pub const DETECTION_EVENT_TYPES: &[&str] = &["DetectionSummaryEvent", "EppDetectionSummaryEvent"];

const DEFAULT_SEVERITY: u8 = 5;

/// Identifier of one stream partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedId(String);

impl FeedId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a stream line could not become an `Event`.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("event line is not valid UTF-8")]
    Encoding,

    #[error("invalid eventCreationTime {0}")]
    InvalidTimestamp(i64),

    #[error("event field '{0}' is missing")]
    MissingField(&'static str),
}

#[derive(Deserialize)]
struct RawEnvelope {
    metadata: RawMetadata,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    offset: u64,
    event_type: String,
    event_creation_time: i64,
}

/// One parsed stream event.
#[derive(Debug, Clone)]
pub struct Event {
    feed_id: FeedId,
    offset: u64,
    event_type: String,
    creation_time: DateTime<Utc>,
    severity: u8,
    payload: Value,
}

impl Event {
    /// Parse one raw stream line received on `feed_id`.
    pub fn parse(feed_id: FeedId, line: &[u8]) -> Result<Self, EventError> {
        let text = std::str::from_utf8(line).map_err(|_| EventError::Encoding)?;
        let payload: Value = serde_json::from_str(text)?;
        let envelope = RawEnvelope::deserialize(&payload)?;

        let millis = envelope.metadata.event_creation_time;
        let creation_time = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or(EventError::InvalidTimestamp(millis))?;

        let severity = payload
            .get("event")
            .and_then(|e| e.get("Severity"))
            .and_then(Value::as_u64)
            .map(|s| s.clamp(1, 5) as u8)
            .unwrap_or(DEFAULT_SEVERITY);

        Ok(Self {
            feed_id,
            offset: envelope.metadata.offset,
            event_type: envelope.metadata.event_type,
            creation_time,
            severity,
            payload,
        })
    }

    pub fn feed_id(&self) -> &FeedId {
        &self.feed_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    pub fn severity(&self) -> u8 {
        self.severity
    }

    /// The complete document as received from the wire.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn is_detection(&self) -> bool {
        DETECTION_EVENT_TYPES.contains(&self.event_type.as_str())
    }

    /// Look up a field in the `event` object of the payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get("event").and_then(|e| e.get(name))
    }

    /// String field in the `event` object; `None` when absent or not a string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    pub fn sensor_id(&self) -> Option<&str> {
        self.str_field("SensorId").filter(|s| !s.is_empty())
    }

    pub fn severity_name(&self) -> Option<&str> {
        self.str_field("SeverityName")
    }

    pub fn detect_id(&self) -> Option<&str> {
        self.str_field("DetectId")
    }

    pub fn detect_name(&self) -> Option<&str> {
        self.str_field("DetectName")
    }

    pub fn detect_description(&self) -> Option<&str> {
        self.str_field("DetectDescription")
    }

    pub fn product_link(&self) -> Option<&str> {
        self.str_field("FalconHostLink")
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[feed={} offset={} severity={}]",
            self.event_type, self.feed_id, self.offset, self.severity
        )
    }
}
