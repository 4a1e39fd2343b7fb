//! Booking relay services: edge proxy, account service, booking front door
//! and queue consumer, with causal trace context carried across HTTP and the
//! work queue.

pub mod account;
pub mod app;
pub mod booking;
pub mod cli;
pub mod consumer;
pub mod error;
pub mod network;
pub mod observability;
pub mod proxy;
pub mod queue;
pub mod store;
pub mod trace;

pub use account::{AccountClient, UpstreamConfig, UpstreamError};
pub use booking::{EnqueueError, WorkEnqueuer};
pub use consumer::{AckPolicy, ConsumerConfig, ConsumerHandle, ConsumerStats, Outcome, WorkConsumer};
pub use error::ApiError;
pub use proxy::{DispatchError, Dispatcher, ProxyConfig, ProxyTarget, RetryPolicy, RouteRule};
pub use queue::{AckMode, Delivery, DeliveryStream, InMemoryQueue, QueueError, WorkQueue};
pub use store::BookingStore;
pub use trace::{
    build_provider, FinishedSpan, InMemoryExporter, TraceSpan, Tracer, TracingConfig,
};
