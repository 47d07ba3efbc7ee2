//! Queue consumption: one send request per message.
//!
//! The ingestor polls a [`MessageSource`], decodes each message into a
//! [`SendRequest`] and submits it to the engine. Acknowledgement follows
//! the outcome:
//!
//! - submitted (whatever the first attempt did): ack
//! - payload cannot be decoded: ack and log, redelivery cannot fix it
//! - the record could not be created: release, so the queue redelivers it
//! - the record exists but its first attempt could not be saved: ack, the
//!   retry sweep owns the record from here
//!
//! A message is acknowledged only after its record is persisted, so a crash
//! between the two replays the message. Replays create duplicate records;
//! inbound requests carry no key to deduplicate them by.

use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc, time::Duration};

use courier_core::{storage::Storage, Clock, DeliveryStatus, SendRequest};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
};

/// Queue consumption settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Queue carrying send requests.
    pub queue_name: String,

    /// Messages claimed and processed concurrently per poll.
    pub batch_size: usize,

    /// Wait between polls when the queue is empty.
    pub poll_interval: Duration,

    /// How long a claimed message stays hidden before it is redelivered.
    pub visibility_timeout: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_name: crate::DEFAULT_QUEUE_NAME.to_string(),
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(600),
        }
    }
}

/// Handle used to acknowledge or release a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageReceipt(pub i64);

/// A message handed out by a [`MessageSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Acknowledgement handle.
    pub receipt: MessageReceipt,
    /// Raw message body.
    pub payload: String,
    /// How many times this message has been received, including this time.
    pub delivery_count: u32,
}

/// Source of inbound send requests with explicit acknowledgement.
pub trait MessageSource: Send + Sync + 'static {
    /// Receives up to `max` messages. Returns an empty batch when idle.
    fn receive(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InboundMessage>>> + Send + '_>>;

    /// Removes a processed message for good.
    fn ack(&self, receipt: MessageReceipt) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Returns a message to the queue for redelivery.
    fn release(
        &self,
        receipt: MessageReceipt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Message source backed by the PostgreSQL `send_queue` table.
pub struct PostgresMessageSource {
    storage: Arc<Storage>,
    queue_name: String,
    visibility_timeout: Duration,
}

impl PostgresMessageSource {
    /// Creates a source reading the queue named in `config`.
    pub fn new(storage: Arc<Storage>, config: &IngestConfig) -> Self {
        Self {
            storage,
            queue_name: config.queue_name.clone(),
            visibility_timeout: config.visibility_timeout,
        }
    }

    /// Enqueues a send request.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be encoded or stored.
    pub async fn publish(&self, request: &SendRequest) -> Result<MessageReceipt> {
        let payload = serde_json::to_string(request)
            .map_err(|e| DeliveryError::queue(format!("encode send request: {e}")))?;
        let id = self.storage.send_queue.publish(&self.queue_name, &payload).await?;
        Ok(MessageReceipt(id))
    }
}

impl MessageSource for PostgresMessageSource {
    fn receive(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InboundMessage>>> + Send + '_>> {
        Box::pin(async move {
            let claimed = self
                .storage
                .send_queue
                .claim(&self.queue_name, max, self.visibility_timeout)
                .await
                .map_err(|e| DeliveryError::queue(format!("claim from {}: {e}", self.queue_name)))?;

            Ok(claimed
                .into_iter()
                .map(|message| InboundMessage {
                    receipt: MessageReceipt(message.id),
                    payload: message.payload,
                    delivery_count: u32::try_from(message.receive_count).unwrap_or(0),
                })
                .collect())
        })
    }

    fn ack(&self, receipt: MessageReceipt) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.storage
                .send_queue
                .ack(receipt.0)
                .await
                .map_err(|e| DeliveryError::queue(format!("ack {}: {e}", receipt.0)))
        })
    }

    fn release(
        &self,
        receipt: MessageReceipt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.storage
                .send_queue
                .release(receipt.0)
                .await
                .map_err(|e| DeliveryError::queue(format!("release {}: {e}", receipt.0)))
        })
    }
}

#[derive(Debug, Default)]
struct MemoryQueue {
    next_receipt: i64,
    ready: VecDeque<InboundMessage>,
    in_flight: Vec<InboundMessage>,
    acked: usize,
}

/// In-process queue for tests and database-free runs.
///
/// Received messages stay in flight until acknowledged or released.
#[derive(Debug, Clone, Default)]
pub struct MemoryMessageSource {
    queue: Arc<Mutex<MemoryQueue>>,
}

impl MemoryMessageSource {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a send request encoded as JSON.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be encoded.
    pub async fn publish(&self, request: &SendRequest) -> Result<MessageReceipt> {
        let payload = serde_json::to_string(request)
            .map_err(|e| DeliveryError::queue(format!("encode send request: {e}")))?;
        Ok(self.publish_raw(payload).await)
    }

    /// Enqueues an arbitrary payload.
    pub async fn publish_raw(&self, payload: impl Into<String>) -> MessageReceipt {
        let mut queue = self.queue.lock().await;
        queue.next_receipt += 1;
        let receipt = MessageReceipt(queue.next_receipt);
        queue.ready.push_back(InboundMessage { receipt, payload: payload.into(), delivery_count: 0 });
        receipt
    }

    /// Messages waiting to be received.
    pub async fn ready_len(&self) -> usize {
        self.queue.lock().await.ready.len()
    }

    /// Messages received but neither acknowledged nor released.
    pub async fn in_flight_len(&self) -> usize {
        self.queue.lock().await.in_flight.len()
    }

    /// Messages acknowledged so far.
    pub async fn acked(&self) -> usize {
        self.queue.lock().await.acked
    }

    async fn settle(&self, receipt: MessageReceipt, requeue: bool) -> Result<()> {
        let mut queue = self.queue.lock().await;
        let position = queue
            .in_flight
            .iter()
            .position(|m| m.receipt == receipt)
            .ok_or_else(|| DeliveryError::queue(format!("unknown receipt {}", receipt.0)))?;
        let message = queue.in_flight.swap_remove(position);

        if requeue {
            queue.ready.push_back(message);
        } else {
            queue.acked += 1;
        }
        Ok(())
    }
}

impl MessageSource for MemoryMessageSource {
    fn receive(
        &self,
        max: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<InboundMessage>>> + Send + '_>> {
        Box::pin(async move {
            let mut queue = self.queue.lock().await;
            let take = max.min(queue.ready.len());
            let mut batch = Vec::with_capacity(take);

            for mut message in queue.ready.drain(..take).collect::<Vec<_>>() {
                message.delivery_count += 1;
                queue.in_flight.push(message.clone());
                batch.push(message);
            }
            Ok(batch)
        })
    }

    fn ack(&self, receipt: MessageReceipt) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.settle(receipt, false))
    }

    fn release(
        &self,
        receipt: MessageReceipt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.settle(receipt, true))
    }
}

/// How a message was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Submitted and acknowledged; carries the record's status after the
    /// first attempt.
    Submitted(DeliveryStatus),
    /// Undecodable payload, acknowledged and dropped.
    Dropped,
    /// Record created but its first attempt could not be persisted;
    /// acknowledged and left to the retry sweep.
    Deferred,
    /// Record could not be created, released for redelivery.
    Requeued,
}

/// Consumes send requests from a [`MessageSource`] and submits them.
#[derive(Clone)]
pub struct MessageIngestor {
    engine: Arc<DeliveryEngine>,
    source: Arc<dyn MessageSource>,
    config: IngestConfig,
    clock: Arc<dyn Clock>,
}

impl MessageIngestor {
    /// Creates an ingestor.
    pub fn new(
        engine: Arc<DeliveryEngine>,
        source: Arc<dyn MessageSource>,
        config: IngestConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { engine, source, config, clock }
    }

    /// Polls until `stop` is cancelled.
    ///
    /// A batch already received is processed to completion before the loop
    /// exits. Queue errors are logged and retried after a back-off.
    ///
    /// # Errors
    ///
    /// Currently never returns an error.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        info!(
            queue = %self.config.queue_name,
            batch_size = self.config.batch_size,
            "message ingestor started"
        );

        while !stop.is_cancelled() {
            let pause = match self.poll_once().await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => continue,
                Err(error) => {
                    error!(queue = %self.config.queue_name, error = %error, "queue poll failed");
                    self.config.poll_interval.max(Duration::from_secs(5))
                },
            };

            tokio::select! {
                () = self.clock.sleep(pause) => {},
                () = stop.cancelled() => break,
            }
        }

        info!(queue = %self.config.queue_name, "message ingestor stopped");
        Ok(())
    }

    /// Receives one batch and settles every message in it.
    ///
    /// Returns the number of messages received.
    ///
    /// # Errors
    ///
    /// Returns error if receiving from the queue fails.
    pub async fn poll_once(&self) -> Result<usize> {
        let batch = self.source.receive(self.config.batch_size).await?;
        let received = batch.len();
        if received == 0 {
            return Ok(0);
        }

        debug!(received, "processing message batch");

        let mut tasks = JoinSet::new();
        for message in batch {
            let ingestor = self.clone();
            tasks.spawn(async move { ingestor.handle(message).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(join_error) = joined {
                error!(error = %join_error, "message handler panicked");
            }
        }

        Ok(received)
    }

    /// Submits one message and settles it with the source.
    pub async fn handle(&self, message: InboundMessage) -> MessageDisposition {
        let receipt = message.receipt;

        let request = match serde_json::from_str::<SendRequest>(&message.payload) {
            Ok(request) => request,
            Err(decode_error) => {
                error!(
                    receipt = receipt.0,
                    error = %decode_error,
                    payload_len = message.payload.len(),
                    "dropping undecodable send request"
                );
                self.settle(receipt, false).await;
                return MessageDisposition::Dropped;
            },
        };

        if message.delivery_count > 1 {
            warn!(
                receipt = receipt.0,
                delivery_count = message.delivery_count,
                recipient = %request.recipient,
                "send request redelivered, a duplicate record may be created"
            );
        }

        let record = match self.engine.create(request).await {
            Ok(record) => record,
            Err(create_error) => {
                error!(
                    receipt = receipt.0,
                    error = %create_error,
                    "failed to record send request, releasing for redelivery"
                );
                self.settle(receipt, true).await;
                return MessageDisposition::Requeued;
            },
        };

        let disposition = match self.engine.attempt(record.clone()).await {
            Ok(attempted) => MessageDisposition::Submitted(attempted.status),
            Err(attempt_error) => {
                error!(
                    receipt = receipt.0,
                    delivery_id = ?record.id,
                    error = %attempt_error,
                    "first attempt could not be recorded, leaving record to the retry sweep"
                );
                MessageDisposition::Deferred
            },
        };

        self.settle(receipt, false).await;
        disposition
    }

    async fn settle(&self, receipt: MessageReceipt, requeue: bool) {
        let result = if requeue {
            self.source.release(receipt).await
        } else {
            self.source.ack(receipt).await
        };

        if let Err(error) = result {
            error!(receipt = receipt.0, requeue, error = %error, "failed to settle message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_queue_redelivers_released_messages() {
        let source = MemoryMessageSource::new();
        source.publish_raw("{}").await;

        let first = source.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(source.in_flight_len().await, 1);

        source.release(first[0].receipt).await.unwrap();
        let again = source.receive(10).await.unwrap();

        assert_eq!(again[0].receipt, first[0].receipt);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn memory_queue_forgets_acked_messages() {
        let source = MemoryMessageSource::new();
        source.publish(&SendRequest::new("a@example.com", "Hi", "Body")).await.unwrap();

        let batch = source.receive(10).await.unwrap();
        source.ack(batch[0].receipt).await.unwrap();

        assert_eq!(source.acked().await, 1);
        assert_eq!(source.ready_len().await, 0);
        assert_eq!(source.in_flight_len().await, 0);
        assert!(source.ack(batch[0].receipt).await.is_err());
    }

    #[tokio::test]
    async fn receive_respects_batch_limit() {
        let source = MemoryMessageSource::new();
        for i in 0..5 {
            source.publish_raw(format!("message {i}")).await;
        }

        assert_eq!(source.receive(3).await.unwrap().len(), 3);
        assert_eq!(source.ready_len().await, 2);
    }

    #[test]
    fn default_config_reads_email_queue() {
        let config = IngestConfig::default();
        assert_eq!(config.queue_name, "email_queue");
        assert!(config.batch_size > 0);
    }
}
