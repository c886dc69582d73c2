//! Supervisory loop over stream partition generations.
//!
//! A generation is one discovery result plus, per partition, an ingest
//! worker and a session refresher sharing a child cancellation token. When
//! any of them cancels the token the whole generation is torn down and
//! discovery starts over.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::ingest::{IngestFilter, StreamIngestWorker};
use super::refresher::SessionRefresher;
use crate::comms::api::{ApiError, Partition, StreamingApi};
use crate::comms::events::FeedId;
use crate::queue::OffsetTrackingQueue;

/// Pause between the end of a generation and the next discovery.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no stream partitions after {retries} retries: {source}")]
    RetriesExhausted {
        retries: u32,
        #[source]
        source: ApiError,
    },

    #[error("stream discovery failed: {0}")]
    Discovery(#[source] ApiError),
}

/// Retry policy for "no streams available" during discovery.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

pub struct SessionManager {
    api: Arc<dyn StreamingApi>,
    queue: Arc<OffsetTrackingQueue>,
    filter: Arc<IngestFilter>,
    policy: DiscoveryPolicy,
    shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Ingest,
    Refresh,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn StreamingApi>,
        queue: Arc<OffsetTrackingQueue>,
        filter: IngestFilter,
        policy: DiscoveryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            api,
            queue,
            filter: Arc::new(filter),
            policy,
            shutdown,
        }
    }

    /// Run generations until `shutdown` fires (`Ok`) or discovery fails.
    pub async fn run(&self) -> Result<(), ManagerError> {
        let mut generation: u64 = 0;
        loop {
            let Some(partitions) = self.discover().await? else {
                break;
            };
            generation += 1;
            log::info!(
                "Starting stream generation {generation} with {} partition(s)",
                partitions.len()
            );

            let token = self.shutdown.child_token();
            let mut tasks = self.spawn_generation(partitions, &token);
            token.cancelled().await;

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, _, Ok(()))) => {}
                    Ok((role, feed, Err(e))) => {
                        log::error!("{role:?} task for feed {feed} failed: {e}");
                    }
                    Err(e) => log::error!("Stream task aborted: {e}"),
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            counter!("gateway_stream_restarts_total").increment(1);
            log::info!("Stream generation {generation} ended; rediscovering partitions");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
        log::info!("Session manager stopped");
        Ok(())
    }

    fn spawn_generation(
        &self,
        partitions: Vec<Partition>,
        token: &CancellationToken,
    ) -> JoinSet<(Role, FeedId, Result<(), ApiError>)> {
        let mut tasks = JoinSet::new();
        for partition in partitions {
            let feed = partition.feed_id.clone();

            let refresher = SessionRefresher::new(Arc::clone(&self.api), partition.clone(), token.clone());
            let id = feed.clone();
            tasks.spawn(async move { (Role::Refresh, id, refresher.run().await) });

            let worker = StreamIngestWorker::new(
                Arc::clone(&self.api),
                partition,
                Arc::clone(&self.queue),
                Arc::clone(&self.filter),
                token.clone(),
            );
            tasks.spawn(async move { (Role::Ingest, feed, worker.run().await) });
        }
        tasks
    }

    /// Partitions for the next generation, or `None` if shutdown fired while
    /// waiting.
    async fn discover(&self) -> Result<Option<Vec<Partition>>, ManagerError> {
        let mut retries = 0;
        loop {
            let listed = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                listed = self.api.list_streams() => listed,
            };
            let listed = match listed {
                Ok(p) if p.is_empty() => Err(ApiError::NoStreams("(empty discovery)".into())),
                other => other,
            };
            match listed {
                Ok(partitions) => return Ok(Some(partitions)),
                Err(e @ ApiError::NoStreams(_)) => {
                    if retries >= self.policy.retries {
                        return Err(ManagerError::RetriesExhausted { retries, source: e });
                    }
                    retries += 1;
                    log::warn!(
                        "{e}; retry {retries}/{} in {}",
                        self.policy.retries,
                        humantime::format_duration(self.policy.backoff)
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.policy.backoff) => {}
                    }
                }
                Err(e) => return Err(ManagerError::Discovery(e)),
            }
        }
    }
}
