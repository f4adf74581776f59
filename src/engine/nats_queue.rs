// NATS JetStream transport for the automation event queue

//! # NATS Queue Transport
//!
//! Implements [`QueueTransport`] on top of NATS JetStream.
//!
//! ## Subject Hierarchy
//!
//! - `automation.events.approval` - approval-related entities
//! - `automation.events.inventory` - inventory and stock entities
//! - `automation.events.workflow` - everything else
//!
//! ## Stream Configuration
//!
//! A single stream (`AUTOMATION_EVENTS` by default) captures
//! `automation.events.*`:
//! - **Retention Policy**: work queue (a message is gone once acknowledged)
//! - **Storage Type**: file-based for persistence
//! - **Deduplication**: `Nats-Msg-Id` set to the queue message id
//!
//! Each category gets a durable pull consumer with explicit acks. Redelivery
//! after a NAK, or after `ack_wait` passes without a settle, is the broker's
//! job, bounded by `max_deliver`.

use std::time::Duration;

use async_nats::jetstream::{self, consumer, stream, AckKind, Context};
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use super::queue::{Acknowledger, Delivery, DeliveryStream, QueueCategory, QueueMessage, QueueTransport};
use crate::{AutomationError, Result};

/// Configuration for the NATS transport
#[derive(Debug, Clone)]
pub struct NatsQueueConfig {
    /// NATS server URLs
    pub nats_urls: Vec<String>,
    pub stream_name: String,
    pub subject_prefix: String,
    /// Prefix for the per-category durable consumer names
    pub consumer_prefix: String,

    pub max_messages: i64,
    pub max_age: Duration,

    /// Deliveries before the broker gives up on a message
    pub max_deliver: i64,
    /// How long the broker waits for a settle before redelivering
    pub ack_wait: Duration,
}

impl Default for NatsQueueConfig {
    fn default() -> Self {
        Self {
            nats_urls: vec!["nats://localhost:4222".to_string()],
            stream_name: "AUTOMATION_EVENTS".to_string(),
            subject_prefix: "automation.events".to_string(),
            consumer_prefix: "automation-worker".to_string(),
            max_messages: 1_000_000,
            max_age: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
            max_deliver: 5,
            // Longer than the default processing timeout
            ack_wait: Duration::from_secs(330),
        }
    }
}

fn queue_error(context: &str, e: impl std::fmt::Display) -> AutomationError {
    AutomationError::Queue(format!("{}: {}", context, e))
}

pub struct NatsQueueTransport {
    jetstream: Context,
    config: NatsQueueConfig,
}

impl NatsQueueTransport {
    /// Connect and make sure the stream exists
    pub async fn connect(config: NatsQueueConfig) -> Result<Self> {
        let client = async_nats::connect(config.nats_urls.join(","))
            .await
            .map_err(|e| queue_error("Failed to connect to NATS", e))?;

        let transport = Self {
            jetstream: jetstream::new(client),
            config,
        };
        transport.ensure_stream().await?;
        Ok(transport)
    }

    pub fn config(&self) -> &NatsQueueConfig {
        &self.config
    }

    async fn ensure_stream(&self) -> Result<()> {
        let stream_config = stream::Config {
            name: self.config.stream_name.clone(),
            subjects: vec![format!("{}.*", self.config.subject_prefix)],
            max_messages: self.config.max_messages,
            max_age: self.config.max_age,
            storage: stream::StorageType::File,
            num_replicas: 1,
            retention: stream::RetentionPolicy::WorkQueue,
            discard: stream::DiscardPolicy::Old,
            duplicate_window: Duration::from_secs(120),
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| queue_error("Failed to create NATS stream", e))?;

        info!(stream = %self.config.stream_name, "NATS stream ready");
        Ok(())
    }

    fn consumer_name(&self, category: QueueCategory) -> String {
        format!("{}-{}", self.config.consumer_prefix, category.as_str())
    }
}

#[async_trait]
impl QueueTransport for NatsQueueTransport {
    async fn publish(&self, category: QueueCategory, message: &QueueMessage) -> Result<()> {
        let subject = category.subject(&self.config.subject_prefix);
        let payload = message.encode()?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(async_nats::header::NATS_MESSAGE_ID, message.id.as_str());

        let ack = self
            .jetstream
            .publish_with_headers(subject.clone(), headers, payload)
            .await
            .map_err(|e| queue_error("Failed to publish event to NATS", e))?
            .await
            .map_err(|e| queue_error("Failed to get NATS publish acknowledgment", e))?;

        debug!(
            subject = %subject,
            message_id = %message.id,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Event published to NATS"
        );
        Ok(())
    }

    async fn subscribe(&self, category: QueueCategory) -> Result<DeliveryStream> {
        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| queue_error("Failed to get NATS stream", e))?;

        let durable = self.consumer_name(category);
        let consumer_config = consumer::pull::Config {
            durable_name: Some(durable.clone()),
            filter_subject: category.subject(&self.config.subject_prefix),
            ack_policy: consumer::AckPolicy::Explicit,
            deliver_policy: consumer::DeliverPolicy::All,
            max_deliver: self.config.max_deliver,
            ack_wait: self.config.ack_wait,
            ..Default::default()
        };

        let consumer: consumer::PullConsumer = stream
            .get_or_create_consumer(&durable, consumer_config)
            .await
            .map_err(|e| queue_error("Failed to create NATS consumer", e))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| queue_error("Failed to open NATS message stream", e))?;

        info!(consumer = %durable, category = %category, "Subscribed to NATS consumer");

        let deliveries = messages.map(|item| {
            let message = item.map_err(|e| queue_error("Failed to receive NATS message", e))?;
            let attempt = message.info().map(|info| info.delivered.max(1) as u64).unwrap_or(1);
            let payload = message.payload.clone();
            Ok(Delivery::new(payload, attempt, Box::new(NatsAcker { message })))
        });

        Ok(deliveries.boxed())
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acknowledger for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| queue_error("Failed to ack NATS message", e))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| queue_error("Failed to nak NATS message", e))
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| queue_error("Failed to terminate NATS message", e))
    }
}
