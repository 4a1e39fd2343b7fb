//! Validate-then-publish: the producing half of the booking workflow.

use std::sync::Arc;
use std::time::Duration;

use booking_core::{CausalContext, WorkItem, WorkItemError};
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::Instrument;

use crate::account::{AccountClient, UpstreamError};
use crate::error::ApiError;
use crate::observability::{BOOKING_ENQUEUED, BOOKING_ENQUEUE_FAILED};
use crate::queue::{QueueError, WorkQueue};
use crate::trace::{TraceSpan, Tracer};

/// Why a booking was not queued.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("booking id must not be empty")]
    InvalidSubject,
    #[error("account service rejected the request with {status}")]
    UpstreamRejected { status: StatusCode },
    #[error("account service unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("work item encoding failed: {0}")]
    Encode(String),
    #[error("message queue failed: {0}")]
    EnqueueFailed(#[from] QueueError),
    #[error("publish did not complete within {0:?}")]
    PublishTimeout(Duration),
}

impl EnqueueError {
    /// Short label for metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidSubject => "invalid_subject",
            Self::UpstreamRejected { .. } => "upstream_rejected",
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::Encode(_) => "encode",
            Self::EnqueueFailed(_) => "enqueue_failed",
            Self::PublishTimeout(_) => "publish_timeout",
        }
    }
}

impl From<UpstreamError> for EnqueueError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Status(status) => Self::UpstreamRejected { status },
            other => Self::UpstreamUnreachable(other.to_string()),
        }
    }
}

impl From<WorkItemError> for EnqueueError {
    fn from(err: WorkItemError) -> Self {
        match err {
            WorkItemError::EmptySubject => Self::InvalidSubject,
            other => Self::Encode(other.to_string()),
        }
    }
}

impl From<EnqueueError> for ApiError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::InvalidSubject => ApiError::bad_request(err.to_string()),
            // The caller sees the account service's own status.
            EnqueueError::UpstreamRejected { status } => {
                ApiError::new(status, "account service failed")
            }
            EnqueueError::UpstreamUnreachable(_) => ApiError::bad_gateway(err.to_string()),
            EnqueueError::Encode(_) => ApiError::internal("json marshal failed"),
            EnqueueError::EnqueueFailed(_) | EnqueueError::PublishTimeout(_) => {
                ApiError::internal("message queue failed")
            }
        }
    }
}

/// Accepts a booking id, checks the account service, and publishes a work
/// item carrying the causal context for the consumer.
pub struct WorkEnqueuer {
    tracer: Tracer,
    account: AccountClient,
    queue: Arc<dyn WorkQueue>,
    publish_timeout: Duration,
}

impl WorkEnqueuer {
    #[must_use]
    pub fn new(
        tracer: Tracer,
        account: AccountClient,
        queue: Arc<dyn WorkQueue>,
        publish_timeout: Duration,
    ) -> Self {
        Self {
            tracer,
            account,
            queue,
            publish_timeout,
        }
    }

    #[must_use]
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    #[must_use]
    pub fn account(&self) -> &AccountClient {
        &self.account
    }

    /// Runs the enqueue steps in order; each one gates the next.
    ///
    /// 1. `queue_handler` span under `parent`
    /// 2. `GET /account/login` carrying that span
    /// 3. `message_queue` span under the handler span, injected into the
    ///    work item
    /// 4. publish, bounded by the publish timeout
    ///
    /// Nothing is retried here.
    ///
    /// # Errors
    ///
    /// Returns the first failing step as an [`EnqueueError`]; when
    /// validation fails nothing is published.
    pub async fn handle_incoming(
        &self,
        subject_id: &str,
        parent: Option<&CausalContext>,
    ) -> Result<(), EnqueueError> {
        let mut span = self.tracer.start_span("queue_handler", parent);
        span.set_tag("booking.id", subject_id);

        let result = self.validate_and_publish(&span, subject_id).await;
        match &result {
            Ok(()) => {
                metrics::counter!(BOOKING_ENQUEUED).increment(1);
                span.set_tag("outcome", "queued");
                span.tracing_span()
                    .in_scope(|| tracing::info!(booking_id = subject_id, "booking queued"));
            }
            Err(err) => {
                metrics::counter!(BOOKING_ENQUEUE_FAILED, "reason" => err.reason()).increment(1);
                span.set_error(err.to_string());
            }
        }
        result
    }

    async fn validate_and_publish(
        &self,
        handler: &TraceSpan,
        subject_id: &str,
    ) -> Result<(), EnqueueError> {
        if subject_id.is_empty() {
            return Err(EnqueueError::InvalidSubject);
        }

        self.account
            .login(handler.context())
            .instrument(handler.tracing_span().clone())
            .await?;

        let mut span = handler.child("message_queue");
        let result = self.publish(span.context(), subject_id).await;
        match &result {
            Ok(()) => span.set_tag("outcome", "published"),
            Err(err) => span.set_error(err.to_string()),
        }
        result
    }

    async fn publish(&self, ctx: &CausalContext, subject_id: &str) -> Result<(), EnqueueError> {
        let item = WorkItem::new(ctx, subject_id, self.tracer.propagator())?;
        let payload = Bytes::from(item.to_bytes()?);
        tracing::debug!(span_id = item.span_id(), "publishing work item");

        tokio::time::timeout(self.publish_timeout, self.queue.publish(payload))
            .await
            .map_err(|_| EnqueueError::PublishTimeout(self.publish_timeout))??;
        Ok(())
    }
}
