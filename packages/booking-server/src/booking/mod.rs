//! Booking front door.
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | PUT | `/booking/queue/{id}` | 200 `{"message":"queued"}` once published |
//! | GET | `/booking/{id}` | finalized record from the account service, or 404 |

mod enqueuer;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, put};
use axum::{Json, Router};
use booking_core::booking::messages;
use booking_core::{BookingRecord, MessageBody};

use crate::account::UpstreamError;
use crate::error::ApiError;

pub use enqueuer::{EnqueueError, WorkEnqueuer};

/// Booking routes, ready to hand to a `NetworkModule`.
pub fn router(enqueuer: Arc<WorkEnqueuer>) -> Router {
    Router::new()
        .route("/booking/queue/{id}", put(queue_booking))
        .route("/booking/{id}", get(booking_status))
        .with_state(enqueuer)
}

async fn queue_booking(
    State(enqueuer): State<Arc<WorkEnqueuer>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<MessageBody<&'static str>>, ApiError> {
    let parent = enqueuer.tracer().inbound_context(&headers);
    enqueuer.handle_incoming(&id, parent.as_ref()).await?;
    Ok(Json(MessageBody::new(messages::QUEUED)))
}

/// Polls the account service for the finalized record. This is how callers
/// of `PUT /booking/queue/{id}` learn whether finalize succeeded.
async fn booking_status(
    State(enqueuer): State<Arc<WorkEnqueuer>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<MessageBody<BookingRecord>>, ApiError> {
    let tracer = enqueuer.tracer();
    let parent = tracer.inbound_context(&headers);
    let mut span = tracer.start_span("booking_status", parent.as_ref());
    span.set_tag("booking.id", &id);

    match enqueuer.account().lookup(span.context(), &id).await {
        Ok(Some(record)) => Ok(Json(MessageBody::new(record))),
        Ok(None) => Err(ApiError::not_found(messages::BOOKING_NOT_FOUND)),
        Err(err) => {
            span.set_error(err.to_string());
            Err(match err {
                UpstreamError::Status(status) => ApiError::new(status, "account service failed"),
                other => ApiError::bad_gateway(other.to_string()),
            })
        }
    }
}
