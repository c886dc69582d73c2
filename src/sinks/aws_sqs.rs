//! Amazon SQS sink.
//!
//! Every event is forwarded verbatim as the message body. On FIFO queues
//! (name ending in `.fifo`) messages of one feed share a group so SQS keeps
//! their order, and the feed offset deduplicates redeliveries after a
//! reconnect.

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use aws_sdk_sqs::config::Region;
use aws_sdk_sqs::error::DisplayErrorContext;

use super::{RelevantTypes, Sink, SinkError};
use crate::comms::events::Event;
use crate::enrich::EnrichedEvent;

pub struct AwsSqsSink {
    client: Client,
    queue_url: String,
    fifo: bool,
    app_id: String,
    types: RelevantTypes,
}

/// What gets sent for one event.
#[derive(Debug, PartialEq, Eq)]
struct Message {
    body: String,
    group_id: Option<String>,
    deduplication_id: Option<String>,
}

impl AwsSqsSink {
    /// Resolve `queue_name` in `region`. Credentials come from the default
    /// AWS provider chain.
    pub async fn connect(region: &str, queue_name: &str, app_id: &str) -> Result<Self, SinkError> {
        log::debug!("Connecting to SQS queue {queue_name} in {region}");
        let conf = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_owned()))
            .load()
            .await;
        let client = Client::new(&conf);

        let resolved = client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| {
                SinkError::Other(format!(
                    "cannot resolve SQS queue {queue_name} in {region}: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        let queue_url = resolved
            .queue_url()
            .ok_or_else(|| SinkError::Other(format!("SQS returned no URL for queue {queue_name}")))?
            .to_owned();

        Ok(Self {
            client,
            queue_url,
            fifo: is_fifo(queue_name),
            app_id: app_id.to_owned(),
            types: RelevantTypes::All,
        })
    }
}

fn is_fifo(queue_name: &str) -> bool {
    queue_name.ends_with(".fifo")
}

fn message(event: &Event, fifo: bool, app_id: &str) -> Message {
    let (group_id, deduplication_id) = if fifo {
        (
            Some(format!("fig/{app_id}/{}", event.feed_id())),
            Some(event.offset().to_string()),
        )
    } else {
        (None, None)
    };
    Message {
        body: event.payload().to_string(),
        group_id,
        deduplication_id,
    }
}

#[async_trait]
impl Sink for AwsSqsSink {
    fn name(&self) -> &'static str {
        "AWS_SQS"
    }

    fn relevant_event_types(&self) -> &RelevantTypes {
        &self.types
    }

    async fn process(&self, event: &EnrichedEvent) -> Result<(), SinkError> {
        let msg = message(&event.event, self.fifo, &self.app_id);
        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(msg.body)
            .set_message_group_id(msg.group_id)
            .set_message_deduplication_id(msg.deduplication_id)
            .send()
            .await
            .map_err(|e| SinkError::Other(format!("SQS send_message failed: {}", DisplayErrorContext(&e))))?;
        Ok(())
    }
}
