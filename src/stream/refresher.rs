//! Session lease keep-alive.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::comms::api::{ApiError, Partition, StreamingApi};

const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Refreshes one partition's session ahead of vendor expiry.
pub struct SessionRefresher {
    api: Arc<dyn StreamingApi>,
    partition: Partition,
    cancel: CancellationToken,
}

impl SessionRefresher {
    pub fn new(api: Arc<dyn StreamingApi>, partition: Partition, cancel: CancellationToken) -> Self {
        Self {
            api,
            partition,
            cancel,
        }
    }

    /// 9/10 of the advertised refresh interval.
    pub fn period(&self) -> Duration {
        let interval = self.partition.refresh_interval;
        interval
            .checked_mul(9)
            .map_or_else(|| interval / 10 * 9, |d| d / 10)
            .max(MIN_PERIOD)
    }

    /// Refresh until the generation is cancelled. A failed refresh cancels
    /// the generation and is returned.
    pub async fn run(self) -> Result<(), ApiError> {
        let period = self.period();
        let feed = &self.partition.feed_id;
        log::debug!("Refreshing feed {feed} every {}", humantime::format_duration(period));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(period) => {}
            }
            let refreshed = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                r = self.api.refresh_stream(&self.partition) => r,
            };
            match refreshed {
                Ok(()) => log::debug!("Refreshed session for feed {feed}"),
                Err(e) => {
                    log::error!("Session refresh for feed {feed} failed: {e}");
                    self.cancel.cancel();
                    return Err(e);
                }
            }
        }
    }
}
