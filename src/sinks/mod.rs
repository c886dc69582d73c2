//! Notification sinks.
//!
//! A sink is anything that accepts routed events and performs a side effect:
//! a SIEM post, a console finding, a log line. The pipeline sees sinks only
//! through the [`Sink`] trait; concrete sinks are picked from the
//! `[main].backends` list at startup by [`build_sinks`].
//!
//! ## Adding a sink
//! 1. Implement [`Sink`] in a new module.
//! 2. Add a [`Backend`] variant and its configuration section.
//! 3. Construct it in [`build_sinks`].

pub mod aws_sqs;
pub mod azure;
pub mod chronicle;
pub mod generic;
pub mod registry;

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

use crate::comms::events::DETECTION_EVENT_TYPES;
use crate::config::model::{Backend, Config};
use crate::enrich::EnrichedEvent;

pub use registry::{DispatchReport, SinkRegistry};

/// Event types a sink wants to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelevantTypes {
    All,
    Only(BTreeSet<String>),
}

impl RelevantTypes {
    pub fn only<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(types.into_iter().map(Into::into).collect())
    }

    /// The detection-class event types.
    pub fn detections() -> Self {
        Self::only(DETECTION_EVENT_TYPES.iter().copied())
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(types) => types.contains(event_type),
        }
    }

    /// Union of several descriptors; `All` absorbs everything.
    pub fn union<'a>(items: impl IntoIterator<Item = &'a RelevantTypes>) -> Self {
        let mut acc = BTreeSet::new();
        for item in items {
            match item {
                Self::All => return Self::All,
                Self::Only(types) => acc.extend(types.iter().cloned()),
            }
        }
        Self::Only(acc)
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{sink} rejected the event with HTTP {status}: {body}")]
    Rejected {
        sink: &'static str,
        status: u16,
        body: String,
    },

    #[error("event is missing '{0}' required by this sink")]
    MissingField(&'static str),

    #[error("{0}")]
    Other(String),
}

/// Capability set every sink provides.
///
/// `process` may be called concurrently from several dispatch workers for
/// different events.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Display name for logs and metrics.
    fn name(&self) -> &'static str;

    fn relevant_event_types(&self) -> &RelevantTypes;

    /// Sink-specific final check, applied after the type and cloud filters.
    fn is_relevant(&self, _event: &EnrichedEvent) -> bool {
        true
    }

    async fn process(&self, event: &EnrichedEvent) -> Result<(), SinkError>;
}

/// Instantiate the sinks enabled in `cfg`, in configuration order.
pub async fn build_sinks(cfg: &Config) -> Result<Vec<Arc<dyn Sink>>, SinkError> {
    let mut sinks = Vec::with_capacity(cfg.main.backends.len());
    for backend in &cfg.main.backends {
        let sink: Arc<dyn Sink> = match backend {
            Backend::Generic => Arc::new(generic::GenericSink::new()),
            Backend::Chronicle => {
                let c = section(cfg.chronicle.as_ref(), "chronicle")?;
                Arc::new(chronicle::ChronicleSink::new(&c.region, &c.security_key)?)
            }
            Backend::Azure => {
                let a = section(cfg.azure.as_ref(), "azure")?;
                Arc::new(azure::AzureSink::new(&a.workspace_id, &a.primary_key, &a.log_type)?)
            }
            Backend::AwsSqs => {
                let q = section(cfg.aws_sqs.as_ref(), "aws_sqs")?;
                Arc::new(
                    aws_sqs::AwsSqsSink::connect(&q.region, &q.sqs_queue_name, &cfg.falcon.application_id)
                        .await?,
                )
            }
        };
        log::info!("{} backend is enabled", sink.name());
        sinks.push(sink);
    }
    Ok(sinks)
}

fn section<'a, T>(value: Option<&'a T>, name: &str) -> Result<&'a T, SinkError> {
    value.ok_or_else(|| SinkError::Other(format!("[{name}] section missing")))
}
