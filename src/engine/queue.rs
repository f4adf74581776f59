// Queue-based ingestion - decoupling event producers from workflow execution

//! # Queue Manager
//!
//! Producers hand trigger events to [`QueueManager::submit`], which routes
//! them to one of three categories and publishes them through a
//! [`QueueTransport`]. One consumer task per category pulls deliveries and
//! feeds them to an [`EventProcessor`] (the workflow engine), one message at
//! a time.
//!
//! ```text
//! submit(event) ──▶ breaker gate ──▶ transport.publish(category, message)
//!                                                │
//! consumer(category) ◀── transport.subscribe ◀───┘
//!    │ decode + validate ── invalid ──▶ term (never redelivered)
//!    │ breaker open ──────────────────▶ nak(open_circuit_delay)
//!    │ processor.process (timeout)
//!    ├── ok ──────────────────────────▶ ack
//!    └── error / timeout ─────────────▶ nak(retry_delay) + breaker failure
//! ```
//!
//! Redelivery is owned by the broker: JetStream's `max_deliver` and
//! `ack_wait` for [`NatsQueueTransport`](super::nats_queue::NatsQueueTransport),
//! a bounded re-send loop for [`InMemoryQueueTransport`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::circuit_breaker::CircuitBreaker;
use crate::models::{EventType, FieldChange, TriggerEvent};
use crate::{AutomationError, Result};

/// Which queue an event is routed to, decided by its entity name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueCategory {
    Approval,
    Inventory,
    Workflow,
}

impl QueueCategory {
    pub const ALL: [QueueCategory; 3] = [
        QueueCategory::Approval,
        QueueCategory::Inventory,
        QueueCategory::Workflow,
    ];

    pub fn for_entity(entity_name: &str) -> Self {
        let name = entity_name.to_lowercase();
        if name.contains("approval") {
            QueueCategory::Approval
        } else if name.contains("inventory") || name.contains("stock") {
            QueueCategory::Inventory
        } else {
            QueueCategory::Workflow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueCategory::Approval => "approval",
            QueueCategory::Inventory => "inventory",
            QueueCategory::Workflow => "workflow",
        }
    }

    /// Broker subject under `prefix`, e.g. `automation.events.approval`
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.{}", prefix, self.as_str())
    }
}

impl fmt::Display for QueueCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueuePayload {
    #[serde(default)]
    pub field_changes: HashMap<String, FieldChange>,
    #[serde(default)]
    pub raw_data: HashMap<String, serde_json::Value>,
    pub timestamp: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
}

/// Wire format of a queued trigger event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub message_type: String,
    pub category: QueueCategory,
    pub entity_name: String,
    pub entity_id: String,
    /// Kept as a string so unknown types are rejected at decode time
    pub event_type: String,
    pub payload: QueuePayload,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub const TRIGGER_EVENT: &'static str = "trigger_event";

    pub fn from_event(event: &TriggerEvent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: Self::TRIGGER_EVENT.to_string(),
            category: QueueCategory::for_entity(&event.entity_name),
            entity_name: event.entity_name.clone(),
            entity_id: event.entity_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            payload: QueuePayload {
                field_changes: event.field_changes.clone(),
                raw_data: event.raw_data.clone(),
                timestamp: event.timestamp,
                user_id: event.user_id.clone(),
            },
            enqueued_at: Utc::now(),
        }
    }

    /// Rebuild and validate the event
    pub fn to_event(&self) -> Result<TriggerEvent> {
        if self.message_type != Self::TRIGGER_EVENT {
            return Err(AutomationError::InvalidEvent(format!(
                "unsupported message type '{}'",
                self.message_type
            )));
        }

        let event = TriggerEvent {
            event_type: EventType::from_str(&self.event_type)?,
            entity_name: self.entity_name.clone(),
            entity_id: self.entity_id.clone(),
            field_changes: self.payload.field_changes.clone(),
            timestamp: self.payload.timestamp,
            raw_data: self.payload.raw_data.clone(),
            user_id: self.payload.user_id.clone(),
        };

        let validation = event.validate();
        if !validation.is_valid() {
            return Err(AutomationError::InvalidEvent(validation.errors.join("; ")));
        }
        Ok(event)
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    /// Ask for redelivery, optionally after `delay`
    async fn nak(&self, delay: Option<Duration>) -> Result<()>;
    /// Never redeliver
    async fn term(&self) -> Result<()>;
}

/// One message handed to a consumer
pub struct Delivery {
    pub payload: Bytes,
    /// 1 for the first delivery
    pub attempt: u64,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Bytes, attempt: u64, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            attempt,
            acker,
        }
    }

    pub fn message(&self) -> Result<QueueMessage> {
        QueueMessage::decode(&self.payload)
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.acker.nak(delay).await
    }

    pub async fn term(&self) -> Result<()> {
        self.acker.term().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("attempt", &self.attempt)
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Broker seam for the queue manager
#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn publish(&self, category: QueueCategory, message: &QueueMessage) -> Result<()>;
    async fn subscribe(&self, category: QueueCategory) -> Result<DeliveryStream>;
}

/// Whatever turns a dequeued event into work
#[async_trait]
pub trait EventProcessor: Send + Sync {
    async fn process(&self, event: TriggerEvent) -> Result<()>;
}

// ============================================================================
// IN-MEMORY TRANSPORT
// ============================================================================

/// Counters for the in-memory transport, mostly for tests
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub published: AtomicUsize,
    pub acked: AtomicUsize,
    pub naked: AtomicUsize,
    pub termed: AtomicUsize,
    pub dropped: AtomicUsize,
}

type Envelope = (Bytes, u64);

struct Channel {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
}

/// Channel-backed transport for tests and embedded use
pub struct InMemoryQueueTransport {
    channels: HashMap<QueueCategory, Channel>,
    counters: Arc<TransportCounters>,
    max_deliver: u64,
}

impl InMemoryQueueTransport {
    pub fn new(max_deliver: u64) -> Self {
        let channels = QueueCategory::ALL
            .iter()
            .map(|category| {
                let (sender, receiver) = mpsc::unbounded_channel();
                (
                    *category,
                    Channel {
                        sender,
                        receiver: Mutex::new(Some(receiver)),
                    },
                )
            })
            .collect();

        Self {
            channels,
            counters: Arc::new(TransportCounters::default()),
            max_deliver: max_deliver.max(1),
        }
    }

    pub fn counters(&self) -> &TransportCounters {
        &self.counters
    }

    fn channel(&self, category: QueueCategory) -> Result<&Channel> {
        self.channels
            .get(&category)
            .ok_or_else(|| AutomationError::Queue(format!("no channel for category {}", category)))
    }
}

impl Default for InMemoryQueueTransport {
    fn default() -> Self {
        Self::new(5)
    }
}

struct InMemoryAcker {
    sender: mpsc::UnboundedSender<Envelope>,
    payload: Bytes,
    attempt: u64,
    max_deliver: u64,
    counters: Arc<TransportCounters>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<()> {
        self.counters.naked.fetch_add(1, Ordering::SeqCst);
        if self.attempt >= self.max_deliver {
            warn!(attempt = self.attempt, "Message exhausted its deliveries, dropping");
            self.counters.dropped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let sender = self.sender.clone();
        let envelope = (self.payload.clone(), self.attempt + 1);
        match delay {
            Some(delay) if !delay.is_zero() => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = sender.send(envelope);
                });
            }
            _ => {
                sender
                    .send(envelope)
                    .map_err(|_| AutomationError::Queue("queue channel closed".to_string()))?;
            }
        }
        Ok(())
    }

    async fn term(&self) -> Result<()> {
        self.counters.termed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueueTransport {
    async fn publish(&self, category: QueueCategory, message: &QueueMessage) -> Result<()> {
        let payload = message.encode()?;
        self.channel(category)?
            .sender
            .send((payload, 1))
            .map_err(|_| AutomationError::Queue("queue channel closed".to_string()))?;
        self.counters.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, category: QueueCategory) -> Result<DeliveryStream> {
        let channel = self.channel(category)?;
        let receiver = channel.receiver.lock().await.take().ok_or_else(|| {
            AutomationError::Queue(format!("category {} already has a consumer", category))
        })?;

        let sender = channel.sender.clone();
        let counters = self.counters.clone();
        let max_deliver = self.max_deliver;

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|envelope| (envelope, receiver))
        })
        .map(move |(payload, attempt)| {
            let acker = InMemoryAcker {
                sender: sender.clone(),
                payload: payload.clone(),
                attempt,
                max_deliver,
                counters: counters.clone(),
            };
            Ok(Delivery::new(payload, attempt, Box::new(acker)))
        });

        Ok(stream.boxed())
    }
}

// ============================================================================
// QUEUE MANAGER
// ============================================================================

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deadline for one `EventProcessor::process` call
    pub processing_timeout: Duration,
    /// Redelivery delay after a processing failure
    pub retry_delay: Duration,
    /// Redelivery delay while the breaker is open
    pub open_circuit_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_timeout: Duration::from_secs(300),
            retry_delay: Duration::from_secs(5),
            open_circuit_delay: Duration::from_secs(30),
        }
    }
}

/// What the consumer did with one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Retried,
    Rejected,
    Deferred,
}

pub struct QueueManager {
    transport: Arc<dyn QueueTransport>,
    breaker: Arc<CircuitBreaker>,
    config: QueueConfig,
    shutdown: CancellationToken,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(transport: Arc<dyn QueueTransport>, breaker: Arc<CircuitBreaker>, config: QueueConfig) -> Self {
        Self {
            transport,
            breaker,
            config,
            shutdown: CancellationToken::new(),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Validate, route and publish an event
    pub async fn submit(&self, event: &TriggerEvent) -> Result<QueueMessage> {
        let validation = event.validate();
        if !validation.is_valid() {
            return Err(AutomationError::InvalidEvent(validation.errors.join("; ")));
        }

        self.breaker.check()?;

        let message = QueueMessage::from_event(event);
        match self.transport.publish(message.category, &message).await {
            Ok(()) => {
                self.breaker.record_success();
                debug!(
                    message_id = %message.id,
                    category = %message.category,
                    entity = %message.entity_name,
                    "Event queued"
                );
                Ok(message)
            }
            Err(e) => {
                self.breaker.record_failure();
                error!(category = %message.category, error = %e, "Failed to publish event");
                Err(e)
            }
        }
    }

    /// Spawn one consumer task per category
    pub async fn start_consumers(&self, processor: Arc<dyn EventProcessor>) -> Result<()> {
        let mut consumers = self.consumers.lock().await;
        for category in QueueCategory::ALL {
            let stream = self.transport.subscribe(category).await?;
            let worker = ConsumerWorker {
                category,
                processor: processor.clone(),
                breaker: self.breaker.clone(),
                config: self.config.clone(),
            };
            let token = self.shutdown.clone();
            consumers.push(tokio::spawn(worker.run(stream, token)));
            info!(category = %category, "Queue consumer started");
        }
        Ok(())
    }

    /// Stop consumers and wait for in-flight messages to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.consumers.lock().await.drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Queue consumer task ended abnormally");
            }
        }
        info!("Queue consumers stopped");
    }
}

struct ConsumerWorker {
    category: QueueCategory,
    processor: Arc<dyn EventProcessor>,
    breaker: Arc<CircuitBreaker>,
    config: QueueConfig,
}

impl ConsumerWorker {
    async fn run(self, mut stream: DeliveryStream, shutdown: CancellationToken) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.handle(delivery).await;
                }
                Some(Err(e)) => {
                    warn!(category = %self.category, error = %e, "Failed to receive delivery");
                }
                None => {
                    debug!(category = %self.category, "Delivery stream ended");
                    break;
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) -> DeliveryOutcome {
        let outcome = self.settle(&delivery).await;
        if let Err(e) = outcome.1 {
            warn!(category = %self.category, error = %e, "Failed to settle delivery");
        }
        outcome.0
    }

    async fn settle(&self, delivery: &Delivery) -> (DeliveryOutcome, Result<()>) {
        let event = match delivery.message().and_then(|message| message.to_event()) {
            Ok(event) => event,
            Err(e) => {
                warn!(category = %self.category, error = %e, "Rejecting malformed message");
                return (DeliveryOutcome::Rejected, delivery.term().await);
            }
        };

        if !self.breaker.allow_request() {
            debug!(category = %self.category, "Circuit open, deferring message");
            return (
                DeliveryOutcome::Deferred,
                delivery.nak(Some(self.config.open_circuit_delay)).await,
            );
        }

        let processed = tokio::time::timeout(self.config.processing_timeout, self.processor.process(event)).await;
        match processed {
            Ok(Ok(())) => {
                self.breaker.record_success();
                (DeliveryOutcome::Acked, delivery.ack().await)
            }
            Ok(Err(e)) if e.is_validation() => {
                self.breaker.release_probe();
                warn!(category = %self.category, error = %e, "Processor rejected event");
                (DeliveryOutcome::Rejected, delivery.term().await)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                warn!(
                    category = %self.category,
                    attempt = delivery.attempt,
                    error = %e,
                    "Event processing failed, requesting redelivery"
                );
                (DeliveryOutcome::Retried, delivery.nak(Some(self.config.retry_delay)).await)
            }
            Err(_) => {
                self.breaker.record_failure();
                warn!(
                    category = %self.category,
                    attempt = delivery.attempt,
                    timeout_secs = self.config.processing_timeout.as_secs(),
                    "Event processing timed out, requesting redelivery"
                );
                (DeliveryOutcome::Retried, delivery.nak(Some(self.config.retry_delay)).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::circuit_breaker::CircuitBreakerConfig;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct CountingProcessor {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl EventProcessor for CountingProcessor {
        async fn process(&self, _event: TriggerEvent) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                Err(AutomationError::Internal("downstream unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn fast_config() -> QueueConfig {
        QueueConfig {
            processing_timeout: Duration::from_secs(5),
            retry_delay: Duration::ZERO,
            open_circuit_delay: Duration::from_millis(10),
        }
    }

    fn breaker(threshold: u32) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "queue",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(60),
            },
        ))
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_category_routing() {
        assert_eq!(QueueCategory::for_entity("PurchaseApproval"), QueueCategory::Approval);
        assert_eq!(QueueCategory::for_entity("inventory_item"), QueueCategory::Inventory);
        assert_eq!(QueueCategory::for_entity("StockLevel"), QueueCategory::Inventory);
        assert_eq!(QueueCategory::for_entity("order"), QueueCategory::Workflow);
        assert_eq!(QueueCategory::Approval.subject("automation.events"), "automation.events.approval");
    }

    #[test]
    fn test_message_rebuilds_event() {
        let event = TriggerEvent::updated("order", "o-1")
            .with_change("status", json!("new"), json!("paid"))
            .with_user("u-1");
        let message = QueueMessage::from_event(&event);
        let decoded = QueueMessage::decode(&message.encode().unwrap()).unwrap();

        assert_eq!(decoded.to_event().unwrap(), event);
    }

    #[test]
    fn test_message_with_unknown_event_type_is_invalid() {
        let mut message = QueueMessage::from_event(&TriggerEvent::created("order", "1"));
        message.event_type = "on_archive".to_string();

        assert!(matches!(message.to_event(), Err(AutomationError::InvalidEvent(_))));
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_event() {
        let manager = QueueManager::new(Arc::new(InMemoryQueueTransport::default()), breaker(3), fast_config());
        let event = TriggerEvent::created("order", "");

        let err = manager.submit(&event).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_submit_fails_fast_when_circuit_open() {
        let breaker = breaker(1);
        breaker.record_failure();
        let transport = Arc::new(InMemoryQueueTransport::default());
        let manager = QueueManager::new(transport.clone(), breaker, fast_config());

        let err = manager.submit(&TriggerEvent::created("order", "1")).await.unwrap_err();
        assert!(matches!(err, AutomationError::CircuitOpen(_)));
        assert_eq!(transport.counters().published.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_consumer_acks_processed_messages() {
        let transport = Arc::new(InMemoryQueueTransport::default());
        let manager = QueueManager::new(transport.clone(), breaker(5), fast_config());
        let processor = Arc::new(CountingProcessor {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        manager.start_consumers(processor.clone()).await.unwrap();

        let message = manager.submit(&TriggerEvent::created("stock_level", "1")).await.unwrap();
        assert_eq!(message.category, QueueCategory::Inventory);
        manager.submit(&TriggerEvent::created("order", "2")).await.unwrap();

        wait_for(|| transport.counters().acked.load(Ordering::SeqCst) == 2).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_processing_is_redelivered() {
        let transport = Arc::new(InMemoryQueueTransport::default());
        let manager = QueueManager::new(transport.clone(), breaker(5), fast_config());
        let processor = Arc::new(CountingProcessor {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        manager.start_consumers(processor.clone()).await.unwrap();

        manager.submit(&TriggerEvent::created("order", "1")).await.unwrap();

        wait_for(|| transport.counters().acked.load(Ordering::SeqCst) == 1).await;
        assert_eq!(transport.counters().naked.load(Ordering::SeqCst), 2);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_message_is_terminated() {
        let transport = Arc::new(InMemoryQueueTransport::default());
        let manager = QueueManager::new(transport.clone(), breaker(5), fast_config());
        let processor = Arc::new(CountingProcessor {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        manager.start_consumers(processor.clone()).await.unwrap();

        let mut message = QueueMessage::from_event(&TriggerEvent::created("order", "1"));
        message.entity_id = String::new();
        transport.publish(QueueCategory::Workflow, &message).await.unwrap();

        wait_for(|| transport.counters().termed.load(Ordering::SeqCst) == 1).await;
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_subscription_is_rejected() {
        let transport = InMemoryQueueTransport::default();
        let _stream = transport.subscribe(QueueCategory::Workflow).await.unwrap();

        assert!(matches!(
            transport.subscribe(QueueCategory::Workflow).await,
            Err(AutomationError::Queue(_))
        ));
    }
}
