//! Routing of enriched events to the enabled sinks.
//!
//! For every sink the registry applies, in order:
//! 1. the sink's event-type set,
//! 2. the global cloud exclusion (detections only),
//! 3. the sink's own `is_relevant`.
//!
//! Sinks that pass are called concurrently. A sink that errors or panics is
//! logged and counted; the others still receive the event.

use futures::FutureExt;
use futures::future::join_all;
use metrics::counter;
use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use super::{RelevantTypes, Sink, SinkError};
use crate::enrich::{CloudProvider, EnrichedEvent};

/// Outcome of routing one event.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct SinkRegistry {
    sinks: Vec<Arc<dyn Sink>>,
    excluded_clouds: HashSet<CloudProvider>,
    relevant: RelevantTypes,
}

impl SinkRegistry {
    pub fn new(
        sinks: Vec<Arc<dyn Sink>>,
        excluded_clouds: impl IntoIterator<Item = CloudProvider>,
    ) -> Result<Self, SinkError> {
        if sinks.is_empty() {
            return Err(SinkError::Other("no backend enabled".into()));
        }
        let relevant = RelevantTypes::union(sinks.iter().map(|s| s.relevant_event_types()));
        Ok(Self {
            sinks,
            excluded_clouds: excluded_clouds.into_iter().collect(),
            relevant,
        })
    }

    /// Union of the sinks' accepted types; ingestion uses it to drop events
    /// early.
    pub fn relevant_event_types(&self) -> &RelevantTypes {
        &self.relevant
    }

    fn excluded_by_cloud(&self, event: &EnrichedEvent) -> bool {
        event.event.is_detection()
            && event
                .cloud_provider()
                .is_some_and(|p| self.excluded_clouds.contains(&p))
    }

    /// Sinks that should receive `event`, in registry order.
    pub fn sinks_for<'a>(&'a self, event: &'a EnrichedEvent) -> Vec<&'a Arc<dyn Sink>> {
        if self.excluded_by_cloud(event) {
            return Vec::new();
        }
        self.sinks
            .iter()
            .filter(|s| s.relevant_event_types().accepts(event.event.event_type()))
            .filter(|s| s.is_relevant(event))
            .collect()
    }

    pub async fn process(&self, event: &EnrichedEvent) -> DispatchReport {
        let targets = self.sinks_for(event);
        let mut report = DispatchReport {
            skipped: self.sinks.len() - targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            log::debug!("no sink wants {}", event.event);
            return report;
        }

        let outcomes = join_all(targets.into_iter().map(|sink| async move {
            let outcome = AssertUnwindSafe(sink.process(event)).catch_unwind().await;
            (sink.name(), outcome)
        }))
        .await;

        for (name, outcome) in outcomes {
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    log::error!("{name} failed to process {}: {e}", event.event);
                    counter!("gateway_sink_failures_total", "sink" => name).increment(1);
                    report.failed += 1;
                }
                Err(panic) => {
                    log::error!(
                        "{name} panicked while processing {}: {}",
                        event.event,
                        panic_message(panic.as_ref())
                    );
                    counter!("gateway_sink_failures_total", "sink" => name).increment(1);
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
