//! Enriched events and cloud provider classification.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::comms::api::DeviceRecord;
use crate::comms::events::Event;

/// Cloud a host runs in, as far as the directory knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CloudProvider {
    Aws,
    Azure,
    Gcp,
    /// The directory names a provider this gateway does not know.
    Unrecognized,
}

impl CloudProvider {
    /// Classify a directory `service_provider` value. Empty means "none".
    pub fn from_service_provider(raw: &str) -> Option<Self> {
        match raw.trim() {
            "" => None,
            "AWS_EC2" | "AWS_EC2_V2" => Some(Self::Aws),
            "AZURE" => Some(Self::Azure),
            "GCP" => Some(Self::Gcp),
            _ => Some(Self::Unrecognized),
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Aws => "AWS",
            Self::Azure => "AZURE",
            Self::Gcp => "GCP",
            Self::Unrecognized => "UNRECOGNIZED",
        })
    }
}

/// Configuration spelling: `AWS`, `AZURE`, `GCP`, `UNRECOGNIZED`.
impl FromStr for CloudProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AWS" => Ok(Self::Aws),
            "AZURE" => Ok(Self::Azure),
            "GCP" => Ok(Self::Gcp),
            "UNRECOGNIZED" => Ok(Self::Unrecognized),
            other => Err(other.to_owned()),
        }
    }
}

/// An event together with the device attributes of the host that raised it.
#[derive(Debug, Clone)]
pub struct EnrichedEvent {
    pub event: Event,
    pub device: Option<Arc<DeviceRecord>>,
}

impl EnrichedEvent {
    pub fn new(event: Event, device: Option<Arc<DeviceRecord>>) -> Self {
        Self { event, device }
    }

    pub fn cloud_provider(&self) -> Option<CloudProvider> {
        self.device
            .as_ref()?
            .service_provider
            .as_deref()
            .and_then(CloudProvider::from_service_provider)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.device.as_ref()?.service_provider_account_id.as_deref()
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.device.as_ref()?.instance_id.as_deref()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.device.as_ref()?.hostname.as_deref()
    }
}
