//! Per-partition ingestion: read the feed, drop what nobody wants, enqueue
//! the rest.

use chrono::{DateTime, Utc};
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::session::StreamingSession;
use crate::comms::api::{ApiError, Partition, StreamingApi, resume_offset};
use crate::comms::events::Event;
use crate::config::model::EventsConfig;
use crate::queue::OffsetTrackingQueue;
use crate::sinks::RelevantTypes;

/// Local relevance filters applied before an event is queued.
#[derive(Debug, Clone)]
pub struct IngestFilter {
    pub severity_threshold: u8,
    pub max_age: chrono::Duration,
    /// Union of the enabled sinks' types.
    pub accepted: RelevantTypes,
}

/// Why an event was dropped at ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Severity,
    Age,
    Type,
}

impl Rejection {
    pub fn label(self) -> &'static str {
        match self {
            Self::Severity => "severity",
            Self::Age => "age",
            Self::Type => "type",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl IngestFilter {
    pub fn new(events: &EventsConfig, accepted: RelevantTypes) -> Self {
        Self {
            severity_threshold: events.severity_threshold,
            max_age: events.max_age,
            accepted,
        }
    }

    /// Severity first, then age, then type.
    pub fn admit(&self, event: &Event, now: DateTime<Utc>) -> Result<(), Rejection> {
        if event.severity() < self.severity_threshold {
            return Err(Rejection::Severity);
        }
        if event.creation_time() < now - self.max_age {
            return Err(Rejection::Age);
        }
        if !self.accepted.accepts(event.event_type()) {
            return Err(Rejection::Type);
        }
        Ok(())
    }
}

/// Owns one partition's feed connection for one generation.
pub struct StreamIngestWorker {
    api: Arc<dyn StreamingApi>,
    partition: Partition,
    queue: Arc<OffsetTrackingQueue>,
    filter: Arc<IngestFilter>,
    cancel: CancellationToken,
}

impl StreamIngestWorker {
    pub fn new(
        api: Arc<dyn StreamingApi>,
        partition: Partition,
        queue: Arc<OffsetTrackingQueue>,
        filter: Arc<IngestFilter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            partition,
            queue,
            filter,
            cancel,
        }
    }

    /// Consume the feed until it ends or the generation is cancelled.
    ///
    /// Whatever the exit path, the generation token is cancelled on return so
    /// the manager restarts the partition set.
    pub async fn run(self) -> Result<(), ApiError> {
        let _restart = self.cancel.clone().drop_guard();
        let feed = &self.partition.feed_id;

        let offset = resume_offset(self.queue.last_offset(feed));
        log::info!("Opening feed {feed} at offset {offset}");
        let body = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            body = self.api.open_feed(&self.partition, offset) => body?,
        };
        let mut session = StreamingSession::new(body);

        loop {
            let line = tokio::select! {
                _ = self.cancel.cancelled() => break,
                line = session.next_line() => line,
            };
            let Some(line) = line else {
                log::info!("Feed {feed} disconnected");
                break;
            };
            counter!("gateway_events_received_total").increment(1);

            let event = match Event::parse(feed.clone(), &line) {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Dropping malformed line on feed {feed}: {e}");
                    counter!("gateway_events_malformed_total").increment(1);
                    continue;
                }
            };
            if let Err(reason) = self.filter.admit(&event, Utc::now()) {
                log::debug!("Filtered {event} ({reason})");
                counter!("gateway_events_filtered_total", "reason" => reason.label()).increment(1);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.queue.put(event) => if sent.is_err() {
                    log::warn!("Event queue closed; stopping feed {feed}");
                    break;
                },
            }
        }
        Ok(())
    }
}
