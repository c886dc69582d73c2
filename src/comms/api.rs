//! Seams between the pipeline and the vendor APIs.
//!
//! The pipeline only talks to the vendor through [`StreamingApi`] and
//! [`DeviceDirectory`]; `FalconClient` implements both over HTTP and tests
//! substitute in-process fakes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::comms::events::FeedId;

const PARTITION_MARKER: &str = "/sensors/entities/datafeed-actions/v1/";

/// Raw chunks of one open data feed body.
pub type FeedBody = BoxStream<'static, Result<Bytes, ApiError>>;

/// All the ways a vendor call can fail.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Discovery succeeded but no partition is currently offered to this
    /// application id. Usually another instance holds the streams.
    #[error(
        "streaming API not discovered for application_id={0}; another instance may already be \
         running with the same application id, or the API client lacks the streaming scope"
    )]
    NoStreams(String),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{context} returned HTTP {status}: {body}")]
    Status {
        context: &'static str,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {context}: {detail}")]
    Malformed {
        context: &'static str,
        detail: String,
    },

    #[error("cannot parse stream partition from refresh URL '{0}'")]
    Partition(String),
}

/// Wire shape of one discovered stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDescriptor {
    #[serde(rename = "dataFeedURL")]
    pub data_feed_url: String,
    pub session_token: SessionToken,
    #[serde(rename = "refreshActiveSessionURL")]
    pub refresh_active_session_url: String,
    /// Seconds.
    pub refresh_active_session_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionToken {
    pub token: String,
}

/// One partition of the stream, as handed out by discovery.
///
/// Never mutated; a restart cycle replaces the whole set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub feed_id: FeedId,
    pub data_feed_url: String,
    pub token: String,
    pub refresh_interval: Duration,
    pub refresh_url: String,
}

impl TryFrom<StreamDescriptor> for Partition {
    type Error = ApiError;

    fn try_from(d: StreamDescriptor) -> Result<Self, Self::Error> {
        let feed_id = partition_of(&d.refresh_active_session_url)?;
        Ok(Self {
            feed_id,
            data_feed_url: d.data_feed_url,
            token: d.session_token.token,
            refresh_interval: Duration::from_secs(d.refresh_active_session_interval),
            refresh_url: d.refresh_active_session_url,
        })
    }
}

/// Extract the partition number from a refresh URL of the form
/// `https://host/sensors/entities/datafeed-actions/v1/<id>?...`.
pub fn partition_of(refresh_url: &str) -> Result<FeedId, ApiError> {
    let tail = refresh_url
        .find(PARTITION_MARKER)
        .map(|i| &refresh_url[i + PARTITION_MARKER.len()..])
        .ok_or_else(|| ApiError::Partition(refresh_url.to_owned()))?;
    let id = tail.split(['?', '/']).next().unwrap_or_default();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ApiError::Partition(refresh_url.to_owned()));
    }
    Ok(FeedId::new(id))
}

/// Offset to request when (re)connecting a feed whose highest dequeued
/// offset is `last`. Zero means "start from now".
pub fn resume_offset(last: u64) -> u64 {
    if last != 0 { last.saturating_add(1) } else { 0 }
}

/// Vendor stream management and consumption.
#[async_trait]
pub trait StreamingApi: Send + Sync + 'static {
    /// Discover the partitions available to this application id.
    /// An empty set is reported as [`ApiError::NoStreams`].
    async fn list_streams(&self) -> Result<Vec<Partition>, ApiError>;

    /// Extend the lease of one partition's session token.
    async fn refresh_stream(&self, partition: &Partition) -> Result<(), ApiError>;

    /// Open the long-lived data feed starting at `offset`.
    async fn open_feed(&self, partition: &Partition, offset: u64) -> Result<FeedBody, ApiError>;
}

/// Device record as returned by the host directory.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceRecord {
    pub device_id: String,
    pub hostname: Option<String>,
    pub platform_name: Option<String>,
    pub service_provider: Option<String>,
    pub service_provider_account_id: Option<String>,
    pub instance_id: Option<String>,
    pub mac_address: Option<String>,
}

/// Host directory lookups used for enrichment.
#[async_trait]
pub trait DeviceDirectory: Send + Sync + 'static {
    /// Every record matching `sensor_id`; callers decide what a count other
    /// than one means.
    async fn device_details(&self, sensor_id: &str) -> Result<Vec<DeviceRecord>, ApiError>;
}
