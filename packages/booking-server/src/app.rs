//! Assembles each service from its configuration and starts it on a
//! background task. Used by the binary and the integration tests.

use std::sync::Arc;
use std::time::Duration;

use crate::account::{self, AccountClient, AccountState, UpstreamConfig};
use crate::booking::{self, WorkEnqueuer};
use crate::consumer::{ConsumerConfig, ConsumerHandle, ConsumerStats, WorkConsumer};
use crate::network::{NetworkConfig, NetworkModule, ServiceHandle};
use crate::proxy::{self, ProxyConfig, ProxyState};
use crate::queue::{InMemoryQueue, WorkQueue};
use crate::store::BookingStore;
use crate::trace::Tracer;

/// Booking front door plus consumer settings.
#[derive(Debug, Clone)]
pub struct BookingConfig {
    pub upstream: UpstreamConfig,
    pub queue_name: String,
    pub publish_timeout: Duration,
    pub consumer: ConsumerConfig,
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            queue_name: "hello".to_string(),
            publish_timeout: Duration::from_secs(2),
            consumer: ConsumerConfig::default(),
        }
    }
}

/// Running account service.
pub struct AccountApp {
    pub http: ServiceHandle,
    pub store: BookingStore,
}

/// Starts the account service with a fresh store.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn start_account(network: NetworkConfig, tracer: Tracer) -> anyhow::Result<AccountApp> {
    let store = BookingStore::new();
    let routes = account::router(AccountState {
        tracer,
        store: store.clone(),
    });
    let http = NetworkModule::new(network).spawn(routes).await?;
    Ok(AccountApp { http, store })
}

/// Running booking front door and its consumer.
pub struct BookingApp {
    pub http: ServiceHandle,
    pub queue: Arc<InMemoryQueue>,
    consumer: ConsumerHandle,
}

impl BookingApp {
    /// Stops accepting requests, closes the queue, and waits for the
    /// consumer to drain the backlog. Deliveries that fail during the drain
    /// are requeued and retried under the ack policy before this returns.
    ///
    /// # Errors
    ///
    /// Returns the HTTP server's error or an error if the consumer panicked.
    pub async fn stop(self) -> anyhow::Result<ConsumerStats> {
        self.http.stop().await?;
        self.queue.close();
        self.consumer.join().await
    }
}

/// Starts the booking front door and a consumer sharing one in-process
/// queue.
///
/// # Errors
///
/// Returns an error for an unusable account url, a refused subscription, or
/// a bind failure.
pub async fn start_booking(
    network: NetworkConfig,
    config: &BookingConfig,
    tracer: Tracer,
) -> anyhow::Result<BookingApp> {
    let queue = Arc::new(InMemoryQueue::new(config.queue_name.clone()));
    let account = AccountClient::new(&config.upstream, tracer.clone())?;

    let consumer = Arc::new(WorkConsumer::new(
        tracer.clone(),
        account.clone(),
        config.consumer.ack_policy,
    ));
    let consumer = consumer.start(queue.as_ref()).await?;

    let shared: Arc<dyn WorkQueue> = queue.clone();
    let enqueuer = Arc::new(WorkEnqueuer::new(
        tracer,
        account,
        shared,
        config.publish_timeout,
    ));
    let http = NetworkModule::new(network)
        .spawn(booking::router(enqueuer))
        .await?;

    Ok(BookingApp {
        http,
        queue,
        consumer,
    })
}

/// Starts the edge proxy.
///
/// # Errors
///
/// Returns an error for an invalid routing table or a bind failure.
pub async fn start_proxy(
    network: NetworkConfig,
    config: &ProxyConfig,
    tracer: Tracer,
) -> anyhow::Result<ServiceHandle> {
    let state = ProxyState::from_config(config, tracer)?;
    NetworkModule::new(network).spawn(proxy::router(state)).await
}
