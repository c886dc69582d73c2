// src/dispatch/worker.rs

//! Dispatch worker pool: dequeue, enrich, route.

use metrics::counter;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::comms::events::Event;
use crate::enrich::{DeviceCache, DeviceError, EnrichedEvent};
use crate::queue::OffsetTrackingQueue;
use crate::sinks::{DispatchReport, SinkRegistry};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("detection event carries no SensorId")]
    MissingSensor,

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Enrichment and routing for a single event.
pub struct Dispatcher {
    cache: Arc<DeviceCache>,
    registry: Arc<SinkRegistry>,
}

impl Dispatcher {
    pub fn new(cache: Arc<DeviceCache>, registry: Arc<SinkRegistry>) -> Self {
        Self { cache, registry }
    }

    /// Attach device attributes. `Ok(None)` means the host has no cloud
    /// provider and the event is not routed.
    pub async fn enrich(&self, event: Event) -> Result<Option<EnrichedEvent>, DispatchError> {
        let Some(sensor_id) = event.sensor_id() else {
            if event.is_detection() {
                return Err(DispatchError::MissingSensor);
            }
            return Ok(Some(EnrichedEvent::new(event, None)));
        };
        let device = self.cache.device_details(sensor_id).await?;
        let enriched = EnrichedEvent::new(event, Some(device));
        if enriched.cloud_provider().is_none() {
            return Ok(None);
        }
        Ok(Some(enriched))
    }

    /// Enrich and route; `Ok(None)` when the event was dropped for lack of a
    /// cloud provider.
    pub async fn handle(&self, event: Event) -> Result<Option<DispatchReport>, DispatchError> {
        match self.enrich(event).await? {
            Some(enriched) => Ok(Some(self.registry.process(&enriched).await)),
            None => Ok(None),
        }
    }
}

/// Spawn `workers` tasks draining `queue`. They exit once the queue is
/// closed and empty.
pub fn spawn_dispatch_pool(
    workers: usize,
    queue: Arc<OffsetTrackingQueue>,
    dispatcher: Arc<Dispatcher>,
) -> JoinSet<()> {
    let mut pool = JoinSet::new();
    for id in 0..workers.max(1) {
        let queue = Arc::clone(&queue);
        let dispatcher = Arc::clone(&dispatcher);
        pool.spawn(run_worker(id, queue, dispatcher));
    }
    log::info!("Started {} dispatch worker(s)", workers.max(1));
    pool
}

async fn run_worker(id: usize, queue: Arc<OffsetTrackingQueue>, dispatcher: Arc<Dispatcher>) {
    while let Some(event) = queue.get().await {
        let context = event.to_string();

        match dispatcher.handle(event).await {
            Ok(Some(report)) => {
                log::debug!(
                    "{context} delivered={} failed={} skipped={}",
                    report.delivered,
                    report.failed,
                    report.skipped
                );
                counter!("gateway_events_dispatched_total").increment(1);
            }
            Ok(None) => {
                log::debug!("{context} dropped: device has no cloud provider");
                counter!("gateway_events_dropped_total", "reason" => "no_provider").increment(1);
            }
            Err(e) => {
                log::error!("Could not process {context}: {e}");
                counter!("gateway_events_dropped_total", "reason" => "error").increment(1);
            }
        }
    }
    log::debug!("Dispatch worker {id} stopped");
}
