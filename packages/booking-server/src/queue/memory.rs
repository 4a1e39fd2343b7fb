//! In-process broker over a tokio mpsc channel.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};

use super::{AckMode, Acker, Delivery, DeliveryStream, QueueError, Settlement, WorkQueue};

#[derive(Debug)]
struct Envelope {
    payload: Bytes,
    redelivery_count: u32,
}

#[derive(Debug)]
struct Shared {
    name: String,
    sender: UnboundedSender<Envelope>,
    closed: AtomicBool,
    /// Manual deliveries handed out and not yet settled.
    unsettled: AtomicUsize,
    /// Woken on close and on every settlement.
    changed: Notify,
}

impl Shared {
    fn requeue(&self, payload: &Bytes, redelivery_count: u32) -> Result<(), QueueError> {
        self.sender
            .send(Envelope {
                payload: payload.clone(),
                redelivery_count: redelivery_count + 1,
            })
            .map_err(|_| QueueError::Closed)
    }

    /// Closed with nothing left that could still produce a delivery.
    fn finished(&self) -> bool {
        self.closed.load(Ordering::Acquire) && self.unsettled.load(Ordering::Acquire) == 0
    }
}

/// Named in-memory queue. Unbounded, FIFO per subscriber.
///
/// `close()` refuses further publishes with [`QueueError::Closed`] but keeps
/// accepting requeues: subscriptions end only once the backlog is drained
/// and every manual delivery has been settled, so a delivery that fails
/// during shutdown is retried instead of lost.
#[derive(Debug)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
    receiver: Arc<Mutex<UnboundedReceiver<Envelope>>>,
    published: AtomicU64,
}

impl InMemoryQueue {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                sender: tx,
                closed: AtomicBool::new(false),
                unsettled: AtomicUsize::new(0),
                changed: Notify::new(),
            }),
            receiver: Arc::new(Mutex::new(rx)),
            published: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of payloads accepted by `publish` (requeues not counted).
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::info!(queue = %self.shared.name, "queue closed");
            self.shared.changed.notify_waiters();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn publish(&self, payload: Bytes) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.shared
            .sender
            .send(Envelope {
                payload,
                redelivery_count: 0,
            })
            .map_err(|_| QueueError::Closed)?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(&self, mode: AckMode) -> Result<DeliveryStream, QueueError> {
        let shared = Arc::clone(&self.shared);
        let receiver = Arc::clone(&self.receiver);
        tracing::debug!(queue = %shared.name, ?mode, "subscribed");

        let stream = futures_util::stream::unfold((shared, receiver), move |(shared, receiver)| async move {
            let envelope = next_envelope(&shared, &receiver).await?;
            let delivery = match mode {
                AckMode::Auto => Delivery::auto(envelope.payload, envelope.redelivery_count),
                AckMode::Manual => {
                    shared.unsettled.fetch_add(1, Ordering::AcqRel);
                    Delivery::manual(
                        envelope.payload,
                        envelope.redelivery_count,
                        Box::new(MemoryAcker {
                            shared: Arc::clone(&shared),
                        }),
                    )
                }
            };
            Some((delivery, (shared, receiver)))
        });
        Ok(Box::pin(stream))
    }
}

/// Waits for the next envelope, or `None` once the queue is finished.
async fn next_envelope(
    shared: &Shared,
    receiver: &Mutex<UnboundedReceiver<Envelope>>,
) -> Option<Envelope> {
    loop {
        // Registered before the checks so a close or settlement racing with
        // them still wakes this waiter.
        let changed = shared.changed.notified();
        tokio::pin!(changed);
        changed.as_mut().enable();

        let mut rx = receiver.lock().await;
        match rx.try_recv() {
            Ok(envelope) => return Some(envelope),
            Err(TryRecvError::Disconnected) => return None,
            Err(TryRecvError::Empty) => {}
        }
        if shared.finished() {
            return None;
        }
        tokio::select! {
            envelope = rx.recv() => return envelope,
            () = &mut changed => {}
        }
    }
}

/// Settles manual deliveries. Dropping it, settled or not, releases the
/// delivery's hold on the queue.
#[derive(Debug)]
struct MemoryAcker {
    shared: Arc<Shared>,
}

impl Acker for MemoryAcker {
    fn settle(
        &self,
        settlement: Settlement,
        payload: &Bytes,
        redelivery_count: u32,
    ) -> Result<(), QueueError> {
        match settlement {
            Settlement::Ack | Settlement::Reject => Ok(()),
            Settlement::Requeue => self.shared.requeue(payload, redelivery_count),
        }
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.shared.unsettled.fetch_sub(1, Ordering::AcqRel);
        self.shared.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;

    use super::*;

    async fn next(stream: &mut DeliveryStream) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery should arrive")
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let queue = InMemoryQueue::new("hello");
        queue.publish(Bytes::from_static(b"a")).await.unwrap();
        queue.publish(Bytes::from_static(b"b")).await.unwrap();

        let mut stream = queue.subscribe(AckMode::Auto).await.unwrap();
        assert_eq!(next(&mut stream).await.unwrap().payload(), "a");
        assert_eq!(next(&mut stream).await.unwrap().payload(), "b");
        assert_eq!(queue.published_count(), 2);
    }

    #[tokio::test]
    async fn close_drains_backlog_then_ends() {
        let queue = InMemoryQueue::new("hello");
        queue.publish(Bytes::from_static(b"last")).await.unwrap();
        let mut stream = queue.subscribe(AckMode::Auto).await.unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert_eq!(next(&mut stream).await.unwrap().payload(), "last");
        assert!(next(&mut stream).await.is_none());
        assert_eq!(
            queue.publish(Bytes::from_static(b"late")).await,
            Err(QueueError::Closed)
        );
    }

    #[tokio::test]
    async fn auto_deliveries_ignore_settlement() {
        let queue = InMemoryQueue::new("hello");
        queue.publish(Bytes::from_static(b"x")).await.unwrap();
        let mut stream = queue.subscribe(AckMode::Auto).await.unwrap();

        let delivery = next(&mut stream).await.unwrap();
        assert_eq!(delivery.mode(), AckMode::Auto);
        delivery.nack(true).unwrap();

        queue.close();
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn manual_requeue_goes_to_tail_with_incremented_count() {
        let queue = InMemoryQueue::new("hello");
        queue.publish(Bytes::from_static(b"first")).await.unwrap();
        queue.publish(Bytes::from_static(b"second")).await.unwrap();
        let mut stream = queue.subscribe(AckMode::Manual).await.unwrap();

        let first = next(&mut stream).await.unwrap();
        assert_eq!(first.redelivery_count(), 0);
        first.nack(true).unwrap();

        let second = next(&mut stream).await.unwrap();
        assert_eq!(second.payload(), "second");
        second.ack().unwrap();

        let again = next(&mut stream).await.unwrap();
        assert_eq!(again.payload(), "first");
        assert_eq!(again.redelivery_count(), 1);
        again.nack(false).unwrap();

        queue.close();
        assert!(next(&mut stream).await.is_none());
        assert_eq!(queue.published_count(), 2);
    }

    #[tokio::test]
    async fn requeue_after_close_is_redelivered_before_the_stream_ends() {
        let queue = InMemoryQueue::new("hello");
        queue.publish(Bytes::from_static(b"x")).await.unwrap();
        let mut stream = queue.subscribe(AckMode::Manual).await.unwrap();
        let delivery = next(&mut stream).await.unwrap();

        queue.close();
        assert_eq!(
            queue.publish(Bytes::from_static(b"late")).await,
            Err(QueueError::Closed)
        );
        delivery.nack(true).unwrap();

        let again = next(&mut stream).await.unwrap();
        assert_eq!(again.payload(), "x");
        assert_eq!(again.redelivery_count(), 1);
        again.ack().unwrap();
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn closed_stream_waits_for_unsettled_delivery() {
        let queue = Arc::new(InMemoryQueue::new("hello"));
        queue.publish(Bytes::from_static(b"x")).await.unwrap();
        let mut stream = queue.subscribe(AckMode::Manual).await.unwrap();
        let delivery = next(&mut stream).await.unwrap();
        queue.close();

        let settle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            delivery.nack(true).unwrap();
        });

        // The stream is parked until the settlement, then sees the requeue.
        let again = next(&mut stream).await.unwrap();
        assert_eq!(again.redelivery_count(), 1);
        settle.await.unwrap();
        drop(again);
        assert!(next(&mut stream).await.is_none());
    }

    #[tokio::test]
    async fn competing_subscribers_split_messages() {
        let queue = InMemoryQueue::new("hello");
        let mut a = queue.subscribe(AckMode::Auto).await.unwrap();
        let mut b = queue.subscribe(AckMode::Auto).await.unwrap();
        queue.publish(Bytes::from_static(b"1")).await.unwrap();
        queue.publish(Bytes::from_static(b"2")).await.unwrap();

        let got_a = next(&mut a).await.unwrap();
        let got_b = next(&mut b).await.unwrap();
        assert_ne!(got_a.payload(), got_b.payload());
    }
}
