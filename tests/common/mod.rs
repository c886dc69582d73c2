// tests/common/mod.rs
//! In-process fakes of the vendor APIs and a recording sink.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use gateway::comms::{ApiError, DeviceDirectory, DeviceRecord, FeedBody, FeedId, Partition, StreamingApi};
use gateway::config::{Config, loader::from_str_with_env};
use gateway::enrich::EnrichedEvent;
use gateway::sinks::{RelevantTypes, Sink, SinkError};

/// One feed line as the vendor serializes it.
pub fn line(offset: u64, event_type: &str, event: Value) -> String {
    json!({
        "metadata": {
            "customerIDString": "cid",
            "offset": offset,
            "eventType": event_type,
            "eventCreationTime": Utc::now().timestamp_millis(),
        },
        "event": event
    })
    .to_string()
}

pub fn detection(offset: u64, sensor: &str) -> String {
    line(
        offset,
        "DetectionSummaryEvent",
        json!({"SensorId": sensor, "Severity": 4, "DetectId": format!("ldt:{offset}")}),
    )
}

pub fn partition(id: &str) -> Partition {
    Partition {
        feed_id: FeedId::new(id),
        data_feed_url: format!("https://firehose.example/sensors/entities/datafeed/v1/{id}?appId=test"),
        token: "session-token".into(),
        refresh_interval: Duration::from_secs(1800),
        refresh_url: format!("https://api.example/sensors/entities/datafeed-actions/v1/{id}?appId=test"),
    }
}

pub fn config(extra: &str) -> Config {
    let txt = format!(
        "[main]\nbackends = [\"GENERIC\"]\nworker_threads = 2\n\
         [falcon]\nclient_id = \"id\"\nclient_secret = \"secret\"\n{extra}\n"
    );
    from_str_with_env(&txt, |_| None).unwrap()
}

/// Scripted streaming API. Each feed serves the lines whose offset is at or
/// after the requested one; `hold_open` keeps the body pending afterwards.
pub struct FakeStreams {
    pub partitions: Vec<Partition>,
    pub feeds: HashMap<FeedId, Vec<(u64, String)>>,
    pub hold_open: bool,
    /// The first `no_streams` discovery calls report no streams.
    pub no_streams: usize,
    pub fail_refresh: bool,
    pub list_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub opened: Mutex<Vec<(FeedId, u64)>>,
}

impl FakeStreams {
    pub fn new(partitions: Vec<Partition>) -> Self {
        Self {
            partitions,
            feeds: HashMap::new(),
            hold_open: true,
            no_streams: 0,
            fail_refresh: false,
            list_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn with_feed(mut self, id: &str, lines: Vec<(u64, String)>) -> Self {
        self.feeds.insert(FeedId::new(id), lines);
        self
    }

    pub fn opened(&self) -> Vec<(FeedId, u64)> {
        self.opened.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamingApi for FakeStreams {
    async fn list_streams(&self) -> Result<Vec<Partition>, ApiError> {
        let n = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if n < self.no_streams {
            return Err(ApiError::NoStreams("test".into()));
        }
        Ok(self.partitions.clone())
    }

    async fn refresh_stream(&self, _partition: &Partition) -> Result<(), ApiError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh {
            return Err(ApiError::Status {
                context: "refresh",
                status: 404,
                body: "session expired".into(),
            });
        }
        Ok(())
    }

    async fn open_feed(&self, partition: &Partition, offset: u64) -> Result<FeedBody, ApiError> {
        self.opened
            .lock()
            .unwrap()
            .push((partition.feed_id.clone(), offset));

        let mut body = String::new();
        for (off, text) in self.feeds.get(&partition.feed_id).into_iter().flatten() {
            if *off >= offset {
                body.push_str(text);
                body.push_str("\n\n");
            }
        }
        let chunks = stream::iter(vec![Ok(Bytes::from(body))]);
        if self.hold_open {
            Ok(chunks.chain(stream::pending()).boxed())
        } else {
            Ok(chunks.boxed())
        }
    }
}

/// Directory with a fixed sensor → records table.
#[derive(Default)]
pub struct FakeDirectory {
    pub records: HashMap<String, Vec<DeviceRecord>>,
    pub calls: AtomicUsize,
}

impl FakeDirectory {
    pub fn with(mut self, sensor: &str, provider: Option<&str>) -> Self {
        self.records.insert(
            sensor.to_owned(),
            vec![DeviceRecord {
                device_id: sensor.to_owned(),
                hostname: Some(format!("host-{sensor}")),
                service_provider: provider.map(str::to_owned),
                ..Default::default()
            }],
        );
        self
    }
}

#[async_trait]
impl DeviceDirectory for FakeDirectory {
    async fn device_details(&self, sensor_id: &str) -> Result<Vec<DeviceRecord>, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.get(sensor_id).cloned().unwrap_or_default())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Record,
    Fail,
    Panic,
}

/// Sink that remembers the offsets it was handed.
pub struct RecordingSink {
    pub name: &'static str,
    pub types: RelevantTypes,
    pub mode: Mode,
    pub seen: Mutex<Vec<u64>>,
    /// When set, every call waits for a permit first.
    pub gate: Option<Arc<Semaphore>>,
}

impl RecordingSink {
    pub fn new(name: &'static str, mode: Mode) -> Self {
        Self {
            name,
            types: RelevantTypes::All,
            mode,
            seen: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn gated(name: &'static str, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(name, Mode::Record)
        }
    }

    pub fn seen(&self) -> Vec<u64> {
        let mut seen = self.seen.lock().unwrap().clone();
        seen.sort_unstable();
        seen
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &'static str {
        self.name
    }

    fn relevant_event_types(&self) -> &RelevantTypes {
        &self.types
    }

    async fn process(&self, event: &EnrichedEvent) -> Result<(), SinkError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.seen.lock().unwrap().push(event.event.offset());
        match self.mode {
            Mode::Record => Ok(()),
            Mode::Fail => Err(SinkError::Other("downstream unavailable".into())),
            Mode::Panic => panic!("sink bug"),
        }
    }
}

/// Poll `cond` every 10ms for up to 30s.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..3_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
