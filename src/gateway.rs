//! Wiring of the full pipeline: manager → queue → dispatch pool → sinks.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::comms::api::{DeviceDirectory, StreamingApi};
use crate::config::Config;
use crate::dispatch::{Dispatcher, spawn_dispatch_pool};
use crate::enrich::DeviceCache;
use crate::queue::OffsetTrackingQueue;
use crate::sinks::SinkRegistry;
use crate::stream::{DiscoveryPolicy, IngestFilter, ManagerError, SessionManager};

/// A running gateway. Dispatch workers start on construction; streams start
/// with [`Gateway::run`].
pub struct Gateway {
    manager: SessionManager,
    queue: Arc<OffsetTrackingQueue>,
    pool: JoinSet<()>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Must be called from within the Tokio runtime.
    pub fn start(
        cfg: &Config,
        api: Arc<dyn StreamingApi>,
        directory: Arc<dyn DeviceDirectory>,
        registry: SinkRegistry,
        queue: Arc<OffsetTrackingQueue>,
        shutdown: CancellationToken,
    ) -> Self {
        let filter = IngestFilter::new(&cfg.events, registry.relevant_event_types().clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(DeviceCache::new(directory)),
            Arc::new(registry),
        ));
        let pool = spawn_dispatch_pool(
            cfg.main.worker_threads,
            Arc::clone(&queue),
            dispatcher,
        );
        let policy = DiscoveryPolicy {
            retries: cfg.falcon.reconnect_retry_count,
            backoff: cfg.falcon.discovery_backoff,
        };
        let manager = SessionManager::new(api, Arc::clone(&queue), filter, policy, shutdown.clone());
        Self {
            manager,
            queue,
            pool,
            shutdown,
        }
    }

    /// Run until shutdown or a fatal discovery error. Either way the queue is
    /// closed and the dispatch pool finishes the buffered events before this
    /// returns.
    pub async fn run(mut self) -> Result<(), ManagerError> {
        let result = self.manager.run().await;
        if let Err(e) = &result {
            log::error!("Stream supervision failed: {e}");
        }
        self.shutdown.cancel();
        self.queue.close();
        log::info!("Draining {} queued event(s)", self.queue.len());
        while let Some(joined) = self.pool.join_next().await {
            if let Err(e) = joined {
                log::error!("Dispatch worker aborted: {e}");
            }
        }
        result
    }
}
