//! Work queue abstraction between the enqueuer and the consumer.
//!
//! A [`WorkQueue`] publishes opaque payloads and hands them to subscribers as
//! [`Delivery`] values. Under [`AckMode::Manual`] each delivery must be
//! settled with [`Delivery::ack`] or [`Delivery::nack`]; under
//! [`AckMode::Auto`] the broker considers it delivered on receipt and
//! settlement is a no-op.

mod memory;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

pub use memory::InMemoryQueue;

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
    #[error("publish failed: {0}")]
    PublishFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

/// When the broker treats a delivery as handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Acknowledged at receipt; the subscriber cannot reject it.
    Auto,
    /// The subscriber settles every delivery explicitly.
    Manual,
}

/// How a manual delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Put back at the tail with an incremented redelivery count.
    Requeue,
    /// Discard.
    Reject,
}

/// Broker-side hook that settles a manual delivery.
pub trait Acker: Send + Sync + fmt::Debug {
    /// # Errors
    ///
    /// Returns [`QueueError`] if the broker can no longer accept the settlement.
    fn settle(
        &self,
        settlement: Settlement,
        payload: &Bytes,
        redelivery_count: u32,
    ) -> Result<(), QueueError>;
}

/// One message handed to a subscriber.
#[derive(Debug)]
pub struct Delivery {
    payload: Bytes,
    redelivery_count: u32,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    /// An auto-acknowledged delivery.
    #[must_use]
    pub fn auto(payload: Bytes, redelivery_count: u32) -> Self {
        Self {
            payload,
            redelivery_count,
            acker: None,
        }
    }

    /// A delivery the subscriber must settle through `acker`.
    #[must_use]
    pub fn manual(payload: Bytes, redelivery_count: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            payload,
            redelivery_count,
            acker: Some(acker),
        }
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// How many times this payload was requeued before this delivery.
    #[must_use]
    pub fn redelivery_count(&self) -> u32 {
        self.redelivery_count
    }

    #[must_use]
    pub fn mode(&self) -> AckMode {
        if self.acker.is_some() {
            AckMode::Manual
        } else {
            AckMode::Auto
        }
    }

    /// # Errors
    ///
    /// Returns [`QueueError`] if the broker rejects the settlement.
    pub fn ack(self) -> Result<(), QueueError> {
        self.settle(Settlement::Ack)
    }

    /// Rejects the delivery, putting it back on the queue when `requeue` is set.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the broker can no longer take the payload
    /// back.
    pub fn nack(self, requeue: bool) -> Result<(), QueueError> {
        self.settle(if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        })
    }

    fn settle(self, settlement: Settlement) -> Result<(), QueueError> {
        match &self.acker {
            Some(acker) => acker.settle(settlement, &self.payload, self.redelivery_count),
            None => Ok(()),
        }
    }
}

/// Stream of deliveries for one subscription. Ends when the queue is closed,
/// its backlog drained and every manual delivery settled.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// A named point-to-point queue.
///
/// Object-safe so services can hold `Arc<dyn WorkQueue>` and tests can swap
/// in failing or slow brokers.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// # Errors
    ///
    /// Returns [`QueueError`] if the payload could not be handed to the broker.
    async fn publish(&self, payload: Bytes) -> Result<(), QueueError>;

    /// Opens a subscription. Concurrent subscriptions compete for messages.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::SubscribeFailed`] if the broker refuses the
    /// subscription.
    async fn subscribe(&self, mode: AckMode) -> Result<DeliveryStream, QueueError>;
}
