//! Bounded hand-off queue between stream ingestion and dispatch.
//!
//! Producers await capacity in [`OffsetTrackingQueue::put`]; this is the
//! pipeline's only backpressure point. Consumers share one receiver, and
//! every successful [`OffsetTrackingQueue::get`] raises the feed's entry in
//! the offset table so a reconnect can resume after the last dequeued event.
//! After [`OffsetTrackingQueue::close`] producers are refused and consumers
//! drain what is buffered, then see `None`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::comms::events::{Event, FeedId};

#[derive(Debug, Error)]
#[error("event queue is closed")]
pub struct QueueClosed;

pub struct OffsetTrackingQueue {
    tx: mpsc::Sender<Event>,
    rx: AsyncMutex<mpsc::Receiver<Event>>,
    offsets: Mutex<HashMap<FeedId, u64>>,
    closed: CancellationToken,
}

impl OffsetTrackingQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: AsyncMutex::new(rx),
            offsets: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Enqueue `event`, waiting while the queue is full.
    pub async fn put(&self, event: Event) -> Result<(), QueueClosed> {
        if self.closed.is_cancelled() {
            return Err(QueueClosed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(QueueClosed),
            sent = self.tx.send(event) => sent.map_err(|_| QueueClosed),
        }
    }

    /// Wait for the next event and record its offset.
    ///
    /// Returns `None` once the queue has been closed and drained.
    pub async fn get(&self) -> Option<Event> {
        let event = {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                biased;
                event = rx.recv() => event,
                _ = self.closed.cancelled() => rx.try_recv().ok(),
            }
        }?;
        let mut table = self.table();
        let entry = table.entry(event.feed_id().clone()).or_insert(0);
        *entry = (*entry).max(event.offset());
        Some(event)
    }

    /// Highest offset dequeued for `feed`, or 0 if none was seen.
    pub fn last_offset(&self, feed: &FeedId) -> u64 {
        self.table().get(feed).copied().unwrap_or(0)
    }

    /// Merge a previously persisted table. Entries only move forward.
    pub fn seed(&self, offsets: impl IntoIterator<Item = (FeedId, u64)>) {
        let mut table = self.table();
        for (feed, offset) in offsets {
            let entry = table.entry(feed).or_insert(0);
            *entry = (*entry).max(offset);
        }
    }

    /// Copy of the offset table.
    pub fn snapshot(&self) -> HashMap<FeedId, u64> {
        self.table().clone()
    }

    /// Refuse further puts; consumers finish the buffered events.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> MutexGuard<'_, HashMap<FeedId, u64>> {
        // The table stays consistent even if a holder panicked: every write
        // is a single max() update.
        self.offsets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
