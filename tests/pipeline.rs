// tests/pipeline.rs
//! End-to-end runs of the gateway against in-process fakes.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use common::*;
use gateway::Gateway;
use gateway::comms::FeedId;
use gateway::queue::OffsetTrackingQueue;
use gateway::sinks::{Sink, SinkRegistry};

fn registry(sinks: Vec<Arc<dyn Sink>>) -> SinkRegistry {
    SinkRegistry::new(sinks, []).unwrap()
}

#[tokio::test]
async fn resumes_after_the_last_dequeued_offset() {
    let api = Arc::new(
        FakeStreams::new(vec![partition("1")])
            .with_feed("1", (1..=3).map(|o| (o, detection(o, "s1"))).collect()),
    );
    let directory = Arc::new(FakeDirectory::default().with("s1", Some("AWS_EC2")));
    let sink = Arc::new(RecordingSink::new("rec", Mode::Record));
    let queue = Arc::new(OffsetTrackingQueue::new(16));
    // Offsets 1 and 2 were dispatched before the previous process stopped.
    queue.seed([(FeedId::new("1"), 2)]);

    let shutdown = CancellationToken::new();
    let gateway = Gateway::start(
        &config(""),
        api.clone(),
        directory,
        registry(vec![sink.clone() as Arc<dyn Sink>]),
        Arc::clone(&queue),
        shutdown.clone(),
    );
    let run = tokio::spawn(gateway.run());

    wait_for(|| !sink.seen().is_empty()).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(api.opened(), [(FeedId::new("1"), 3)]);
    assert_eq!(sink.seen(), [3]);
    assert_eq!(queue.last_offset(&FeedId::new("1")), 3);
}

#[tokio::test]
async fn fresh_start_requests_offset_zero() {
    let api = Arc::new(
        FakeStreams::new(vec![partition("0"), partition("1")])
            .with_feed("0", vec![(1, detection(1, "s1")), (2, detection(2, "s1"))])
            .with_feed("1", vec![(7, detection(7, "s2"))]),
    );
    let directory = Arc::new(
        FakeDirectory::default()
            .with("s1", Some("GCP"))
            .with("s2", Some("AZURE")),
    );
    let sink = Arc::new(RecordingSink::new("rec", Mode::Record));
    let queue = Arc::new(OffsetTrackingQueue::new(16));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        Gateway::start(
            &config(""),
            api.clone(),
            directory.clone(),
            registry(vec![sink.clone() as Arc<dyn Sink>]),
            Arc::clone(&queue),
            shutdown.clone(),
        )
        .run(),
    );

    wait_for(|| sink.seen().len() == 3).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();

    let mut opened = api.opened();
    opened.sort();
    assert_eq!(opened, [(FeedId::new("0"), 0), (FeedId::new("1"), 0)]);
    assert_eq!(sink.seen(), [1, 2, 7]);
    assert_eq!(queue.last_offset(&FeedId::new("0")), 2);
    assert_eq!(queue.last_offset(&FeedId::new("1")), 7);
    // One directory lookup per sensor.
    assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failing_sinks_and_bad_events_do_not_stop_delivery() {
    let lines = vec![
        (1, detection(1, "s1")),
        (2, "{this is not json".to_owned()),
        // Unknown sensor: the directory has no record.
        (3, detection(3, "ghost")),
        // Host without a cloud provider is dropped.
        (4, detection(4, "onprem")),
        // Detection without a sensor id.
        (5, line(5, "DetectionSummaryEvent", serde_json::json!({"Severity": 5}))),
        // Audit events without a sensor are routed without device data.
        (6, line(6, "AuthActivityAuditEvent", serde_json::json!({"UserId": "alice"}))),
        (7, detection(7, "s1")),
    ];
    let api = Arc::new(FakeStreams::new(vec![partition("0")]).with_feed("0", lines));
    let directory = Arc::new(
        FakeDirectory::default()
            .with("s1", Some("AWS_EC2_V2"))
            .with("onprem", None),
    );
    let failing = Arc::new(RecordingSink::new("failing", Mode::Fail));
    let panicking = Arc::new(RecordingSink::new("panicking", Mode::Panic));
    let healthy = Arc::new(RecordingSink::new("healthy", Mode::Record));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        Gateway::start(
            &config(""),
            api,
            directory,
            registry(vec![
                failing.clone() as Arc<dyn Sink>,
                panicking.clone(),
                healthy.clone(),
            ]),
            Arc::new(OffsetTrackingQueue::new(16)),
            shutdown.clone(),
        )
        .run(),
    );

    wait_for(|| healthy.seen().len() == 3).await;
    // Give the workers a moment to pick up anything that should not arrive.
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(healthy.seen(), [1, 6, 7]);
    assert_eq!(failing.seen(), [1, 6, 7]);
    assert_eq!(panicking.seen(), [1, 6, 7]);
}

#[tokio::test]
async fn low_severity_and_unwanted_types_never_reach_the_queue() {
    let lines = vec![
        (1, line(1, "DetectionSummaryEvent", serde_json::json!({"SensorId": "s1", "Severity": 1}))),
        (2, line(2, "AuthActivityAuditEvent", serde_json::json!({"UserId": "u"}))),
        (3, detection(3, "s1")),
    ];
    let api = Arc::new(FakeStreams::new(vec![partition("0")]).with_feed("0", lines));
    let directory = Arc::new(FakeDirectory::default().with("s1", Some("GCP")));
    let mut sink = RecordingSink::new("detections-only", Mode::Record);
    sink.types = gateway::sinks::RelevantTypes::detections();
    let sink = Arc::new(sink);
    let queue = Arc::new(OffsetTrackingQueue::new(16));

    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        Gateway::start(
            &config("[events]\nseverity_threshold = 3"),
            api,
            directory,
            registry(vec![sink.clone() as Arc<dyn Sink>]),
            Arc::clone(&queue),
            shutdown.clone(),
        )
        .run(),
    );

    wait_for(|| !sink.seen().is_empty()).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(sink.seen(), [3]);
    assert_eq!(queue.last_offset(&FeedId::new("0")), 3);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn shutdown_drains_buffered_events() {
    let api = Arc::new(
        FakeStreams::new(vec![partition("0")])
            .with_feed("0", (1..=5).map(|o| (o, detection(o, "s1"))).collect()),
    );
    let directory = Arc::new(FakeDirectory::default().with("s1", Some("GCP")));
    let gate = Arc::new(Semaphore::new(0));
    let sink = Arc::new(RecordingSink::gated("gated", Arc::clone(&gate)));
    let queue = Arc::new(OffsetTrackingQueue::new(16));

    let mut cfg = config("");
    cfg.main.worker_threads = 1;
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(
        Gateway::start(
            &cfg,
            api,
            directory,
            registry(vec![sink.clone() as Arc<dyn Sink>]),
            Arc::clone(&queue),
            shutdown.clone(),
        )
        .run(),
    );

    // The single worker holds offset 1 at the gate; the rest is buffered.
    wait_for(|| queue.last_offset(&FeedId::new("0")) == 1 && queue.len() == 4).await;
    shutdown.cancel();
    gate.add_permits(5);
    run.await.unwrap().unwrap();

    assert!(queue.is_closed());
    assert!(queue.is_empty());
    assert_eq!(sink.seen(), [1, 2, 3, 4, 5]);
    assert_eq!(queue.last_offset(&FeedId::new("0")), 5);
}
