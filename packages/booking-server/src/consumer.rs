//! Queue consumer: the finalizing half of the booking workflow.
//!
//! One sequential loop per subscription. Each delivery is decoded, its
//! causal context extracted, and the booking finalized on the account
//! service under a `finalize` span. The [`AckPolicy`] decides what happens
//! to the delivery afterwards.

use std::sync::Arc;

use booking_core::WorkItem;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use crate::account::{AccountClient, UpstreamError};
use crate::observability::{BOOKING_FINALIZED, BOOKING_FINALIZE_FAILED, CONSUMER_DROPPED};
use crate::queue::{AckMode, Delivery, DeliveryStream, QueueError, WorkQueue};
use crate::trace::Tracer;

// ---------------------------------------------------------------------------
// Policy and outcomes
// ---------------------------------------------------------------------------

/// When a delivery counts as handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledged at receipt. A failed finalize loses the booking.
    OnReceipt,
    /// Acknowledged after finalize succeeds. Failures are requeued until a
    /// delivery has been redelivered `max_redeliveries` times, then dropped.
    OnSuccess { max_redeliveries: u32 },
}

impl AckPolicy {
    #[must_use]
    pub fn ack_mode(self) -> AckMode {
        match self {
            Self::OnReceipt => AckMode::Auto,
            Self::OnSuccess { .. } => AckMode::Manual,
        }
    }
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::OnSuccess {
            max_redeliveries: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumerConfig {
    pub ack_policy: AckPolicy,
}

/// Result of processing one delivery, before settlement.
#[derive(Debug)]
pub enum Outcome {
    Finalized,
    /// Undecodable payload or unreadable causal context. Never requeued.
    Dropped(String),
    FinalizeFailed(UpstreamError),
}

/// Counters returned when the loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub finalized: u64,
    pub dropped: u64,
    pub failed: u64,
    /// Failed deliveries the queue accepted back.
    pub requeued: u64,
    /// Failed deliveries whose requeue the queue refused.
    pub lost: u64,
}

// ---------------------------------------------------------------------------
// WorkConsumer
// ---------------------------------------------------------------------------

pub struct WorkConsumer {
    tracer: Tracer,
    account: AccountClient,
    policy: AckPolicy,
}

impl WorkConsumer {
    #[must_use]
    pub fn new(tracer: Tracer, account: AccountClient, policy: AckPolicy) -> Self {
        Self {
            tracer,
            account,
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> AckPolicy {
        self.policy
    }

    /// Subscribes to `queue` with the ack mode the policy needs and runs the
    /// loop on a background task.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] if the subscription is refused.
    pub async fn start(self: Arc<Self>, queue: &dyn WorkQueue) -> Result<ConsumerHandle, QueueError> {
        let stream = queue.subscribe(self.policy.ack_mode()).await?;
        Ok(ConsumerHandle::spawn(self, stream))
    }

    /// Decodes and finalizes one delivery without settling it.
    pub async fn process(&self, delivery: &Delivery) -> Outcome {
        let item = match WorkItem::from_slice(delivery.payload()) {
            Ok(item) => item,
            Err(err) => {
                warn!(error = %err, "dropping undecodable queue message");
                return Outcome::Dropped(err.to_string());
            }
        };

        let parent = match item.causal_context(self.tracer.propagator()) {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(
                    booking_id = item.subject_id(),
                    error = %err,
                    "dropping queue message without a usable trace context"
                );
                return Outcome::Dropped(err.to_string());
            }
        };

        let mut span = self.tracer.start_span("finalize", Some(&parent));
        span.set_tag("booking.id", item.subject_id());
        span.set_tag("redelivery_count", delivery.redelivery_count());

        let result = self
            .account
            .finalize(span.context(), item.subject_id(), None)
            .instrument(span.tracing_span().clone())
            .await;

        match result {
            Ok(()) => Outcome::Finalized,
            Err(err) => {
                span.set_error(err.to_string());
                Outcome::FinalizeFailed(err)
            }
        }
    }

    /// Processes deliveries one at a time until the stream ends or
    /// `shutdown` flips to `true`. A delivery already being processed runs
    /// to completion.
    pub async fn run(
        &self,
        mut stream: DeliveryStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> ConsumerStats {
        let mut stats = ConsumerStats::default();
        info!(policy = ?self.policy, "consumer started");

        loop {
            if *shutdown.borrow() {
                info!("consumer stopping on shutdown");
                break;
            }

            let delivery = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("shutdown channel dropped, consumer stopping");
                        break;
                    }
                    continue;
                }
                next = stream.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        info!("queue subscription ended");
                        break;
                    }
                },
            };

            self.handle(delivery, &mut stats).await;
        }

        info!(?stats, "consumer stopped");
        stats
    }

    async fn handle(&self, delivery: Delivery, stats: &mut ConsumerStats) {
        let outcome = self.process(&delivery).await;
        let redeliveries = delivery.redelivery_count();

        let settled = match outcome {
            Outcome::Finalized => {
                stats.finalized += 1;
                metrics::counter!(BOOKING_FINALIZED).increment(1);
                delivery.ack()
            }
            Outcome::Dropped(_) => {
                stats.dropped += 1;
                metrics::counter!(CONSUMER_DROPPED).increment(1);
                delivery.nack(false)
            }
            Outcome::FinalizeFailed(err) => {
                stats.failed += 1;
                metrics::counter!(BOOKING_FINALIZE_FAILED).increment(1);
                match self.policy {
                    AckPolicy::OnReceipt => {
                        error!(error = %err, "finalize failed after receipt ack, booking lost");
                        Ok(())
                    }
                    AckPolicy::OnSuccess { max_redeliveries } if redeliveries < max_redeliveries => {
                        match delivery.nack(true) {
                            Ok(()) => {
                                stats.requeued += 1;
                                warn!(error = %err, redeliveries, "finalize failed, requeued");
                            }
                            Err(requeue) => {
                                stats.lost += 1;
                                error!(
                                    error = %err,
                                    requeue_error = %requeue,
                                    redeliveries,
                                    "finalize failed and the queue refused the requeue, booking lost"
                                );
                            }
                        }
                        Ok(())
                    }
                    AckPolicy::OnSuccess { .. } => {
                        error!(
                            error = %err,
                            redeliveries,
                            "finalize failed, redelivery limit reached, dropping"
                        );
                        delivery.nack(false)
                    }
                }
            }
        };

        if let Err(err) = settled {
            warn!(error = %err, "failed to settle delivery");
        }
    }
}

// ---------------------------------------------------------------------------
// ConsumerHandle
// ---------------------------------------------------------------------------

/// A consumer loop running on a background task.
pub struct ConsumerHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<ConsumerStats>,
}

impl ConsumerHandle {
    #[must_use]
    pub fn spawn(consumer: Arc<WorkConsumer>, stream: DeliveryStream) -> Self {
        let (stop, shutdown) = watch::channel(false);
        let join = tokio::spawn(async move { consumer.run(stream, shutdown).await });
        Self { stop, join }
    }

    /// Signals the loop to stop after the current delivery and waits for it.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer task panicked.
    pub async fn stop(self) -> anyhow::Result<ConsumerStats> {
        self.stop.send_replace(true);
        Ok(self.join.await?)
    }

    /// Waits for the loop to end on its own, i.e. the queue closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the consumer task panicked.
    pub async fn join(self) -> anyhow::Result<ConsumerStats> {
        Ok(self.join.await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::put;
    use axum::Router;
    use booking_core::{CausalContext, JaegerPropagator};
    use bytes::Bytes;

    use super::*;
    use crate::account::UpstreamConfig;
    use crate::network::{NetworkConfig, NetworkModule, ServiceHandle};
    use crate::queue::{Acker, InMemoryQueue, Settlement};
    use crate::trace::{InMemoryExporter, TracingConfig};

    /// Finalize endpoint that fails the first `fail_first` calls, each after
    /// `failure_delay`.
    async fn flaky_account(
        fail_first: usize,
        failure_delay: Duration,
    ) -> (ServiceHandle, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let routes = Router::new()
            .route(
                "/account/booking/{id}",
                put(move |State(calls): State<Arc<AtomicUsize>>| async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < fail_first {
                        tokio::time::sleep(failure_delay).await;
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }),
            )
            .with_state(Arc::clone(&calls));
        let handle = NetworkModule::new(NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::for_service("account")
        })
        .spawn(routes)
        .await
        .unwrap();
        (handle, calls)
    }

    fn consumer(url: &str, policy: AckPolicy) -> (Arc<WorkConsumer>, InMemoryExporter) {
        let exporter = InMemoryExporter::new();
        let tracer = Tracer::new("consumer", TracingConfig::default(), exporter.clone());
        let account = AccountClient::new(
            &UpstreamConfig {
                account_url: url.to_string(),
                timeout: Duration::from_secs(2),
            },
            tracer.clone(),
        )
        .unwrap();
        (Arc::new(WorkConsumer::new(tracer, account, policy)), exporter)
    }

    /// Broker that has stopped taking deliveries back.
    #[derive(Debug)]
    struct RefusingAcker;

    impl Acker for RefusingAcker {
        fn settle(&self, settlement: Settlement, _: &Bytes, _: u32) -> Result<(), QueueError> {
            match settlement {
                Settlement::Requeue => Err(QueueError::Closed),
                Settlement::Ack | Settlement::Reject => Ok(()),
            }
        }
    }

    fn work_item(id: &str) -> (Bytes, CausalContext) {
        let ctx = CausalContext::root(true);
        let item = WorkItem::new(&ctx, id, &JaegerPropagator).unwrap();
        (Bytes::from(item.to_bytes().unwrap()), ctx)
    }

    async fn wait_for_calls(calls: &AtomicUsize, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("account service should be called");
    }

    #[test]
    fn default_policy_acks_on_success() {
        assert_eq!(
            AckPolicy::default(),
            AckPolicy::OnSuccess {
                max_redeliveries: 3
            }
        );
        assert_eq!(AckPolicy::default().ack_mode(), AckMode::Manual);
        assert_eq!(AckPolicy::OnReceipt.ack_mode(), AckMode::Auto);
    }

    #[tokio::test]
    async fn malformed_message_does_not_stop_the_loop() {
        let (account, calls) = flaky_account(0, Duration::ZERO).await;
        let (consumer, exporter) = consumer(&account.url(), AckPolicy::default());
        let queue = InMemoryQueue::new("hello");

        queue.publish(Bytes::from_static(b"{not json")).await.unwrap();
        queue
            .publish(Bytes::from_static(br#"{"span_id":"","message":"3"}"#))
            .await
            .unwrap();
        let (payload, ctx) = work_item("7");
        queue.publish(payload).await.unwrap();
        queue.close();

        let stats = consumer.start(&queue).await.unwrap().join().await.unwrap();
        assert_eq!(
            stats,
            ConsumerStats {
                finalized: 1,
                dropped: 2,
                failed: 0,
                requeued: 0,
                lost: 0,
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let spans = exporter.named("finalize");
        assert_eq!(spans.len(), 1);
        assert!(spans[0].context.same_trace(&ctx));
        assert_eq!(spans[0].context.parent_span_id, Some(ctx.span_id));

        account.stop().await.unwrap();
    }

    #[tokio::test]
    async fn on_success_requeues_until_finalized() {
        let (account, calls) = flaky_account(1, Duration::ZERO).await;
        let (consumer, _) = consumer(&account.url(), AckPolicy::default());
        let queue = InMemoryQueue::new("hello");
        queue.publish(work_item("7").0).await.unwrap();

        let handle = consumer.start(&queue).await.unwrap();
        wait_for_calls(&calls, 2).await;
        let stats = handle.stop().await.unwrap();

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.finalized, 1);
        account.stop().await.unwrap();
    }

    #[tokio::test]
    async fn on_success_gives_up_after_redelivery_limit() {
        let (account, calls) = flaky_account(usize::MAX, Duration::ZERO).await;
        let (consumer, _) = consumer(
            &account.url(),
            AckPolicy::OnSuccess {
                max_redeliveries: 2,
            },
        );
        let queue = InMemoryQueue::new("hello");
        queue.publish(work_item("7").0).await.unwrap();

        let handle = consumer.start(&queue).await.unwrap();
        wait_for_calls(&calls, 3).await;
        let stats = handle.stop().await.unwrap();

        assert_eq!(stats.failed, 3);
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.finalized, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        account.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failure_in_flight_at_close_is_retried_before_the_loop_ends() {
        let (account, calls) = flaky_account(1, Duration::from_millis(200)).await;
        let (consumer, _) = consumer(&account.url(), AckPolicy::default());
        let queue = InMemoryQueue::new("hello");
        queue.publish(work_item("7").0).await.unwrap();

        let handle = consumer.start(&queue).await.unwrap();
        wait_for_calls(&calls, 1).await;
        queue.close();
        let stats = handle.join().await.unwrap();

        assert_eq!(
            stats,
            ConsumerStats {
                finalized: 1,
                dropped: 0,
                failed: 1,
                requeued: 1,
                lost: 0,
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        account.stop().await.unwrap();
    }

    #[tokio::test]
    async fn refused_requeue_is_counted_as_lost() {
        let (account, calls) = flaky_account(usize::MAX, Duration::ZERO).await;
        let (consumer, _) = consumer(&account.url(), AckPolicy::default());
        let mut stats = ConsumerStats::default();

        let delivery = Delivery::manual(work_item("7").0, 0, Box::new(RefusingAcker));
        consumer.handle(delivery, &mut stats).await;

        assert_eq!(stats.failed, 1);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.lost, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        account.stop().await.unwrap();
    }

    #[tokio::test]
    async fn on_receipt_loses_failed_finalize() {
        let (account, calls) = flaky_account(1, Duration::ZERO).await;
        let (consumer, exporter) = consumer(&account.url(), AckPolicy::OnReceipt);
        let queue = InMemoryQueue::new("hello");
        queue.publish(work_item("7").0).await.unwrap();
        queue.close();

        let stats = consumer.start(&queue).await.unwrap().join().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.finalized, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(exporter.named("finalize")[0].error.is_some());

        account.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_interrupts_an_idle_loop() {
        let (consumer, _) = consumer("http://127.0.0.1:1", AckPolicy::default());
        let queue = InMemoryQueue::new("hello");
        let handle = consumer.start(&queue).await.unwrap();

        let stats = tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("idle consumer should stop promptly")
            .unwrap();
        assert_eq!(stats, ConsumerStats::default());
    }
}
