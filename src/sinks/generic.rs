//! Console sink: every event is written to the log.

use async_trait::async_trait;

use super::{RelevantTypes, Sink, SinkError};
use crate::enrich::EnrichedEvent;

pub struct GenericSink {
    types: RelevantTypes,
}

impl GenericSink {
    pub fn new() -> Self {
        Self {
            types: RelevantTypes::All,
        }
    }
}

impl Default for GenericSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for GenericSink {
    fn name(&self) -> &'static str {
        "GENERIC"
    }

    fn relevant_event_types(&self) -> &RelevantTypes {
        &self.types
    }

    async fn process(&self, event: &EnrichedEvent) -> Result<(), SinkError> {
        let provider = event
            .cloud_provider()
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into());
        log::info!(
            "{} provider={} host={} payload={}",
            event.event,
            provider,
            event.hostname().unwrap_or("-"),
            event.event.payload()
        );
        Ok(())
    }
}
