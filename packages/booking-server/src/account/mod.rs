//! Account service: the validating gate and owner of the booking store.
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | GET | `/account/login` | 200 `{"message":"login"}` |
//! | GET | `/account/booking/{id}` | 200 `{"message": record}` or 404 |
//! | PUT | `/account/booking/{id}` | 200 `{"message":"booking created"}` |

pub mod client;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use booking_core::booking::messages;
use booking_core::{BookingRecord, MessageBody};
use bytes::Bytes;

use crate::error::ApiError;
use crate::store::BookingStore;
use crate::trace::Tracer;

pub use client::{AccountClient, UpstreamConfig, UpstreamError};

/// Shared handler state.
#[derive(Debug, Clone)]
pub struct AccountState {
    pub tracer: Tracer,
    pub store: BookingStore,
}

/// Account routes, ready to hand to a `NetworkModule`.
pub fn router(state: AccountState) -> Router {
    Router::new()
        .route("/account/login", get(login))
        .route("/account/booking/{id}", get(get_booking).put(put_booking))
        .with_state(state)
}

async fn login(
    State(state): State<AccountState>,
    headers: HeaderMap,
) -> Json<MessageBody<&'static str>> {
    let parent = state.tracer.inbound_context(&headers);
    let _span = state.tracer.start_span("login", parent.as_ref());
    Json(MessageBody::new(messages::LOGIN))
}

async fn get_booking(
    State(state): State<AccountState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<MessageBody<BookingRecord>>, ApiError> {
    let parent = state.tracer.inbound_context(&headers);
    let mut span = state.tracer.start_span("booking_get", parent.as_ref());
    span.set_tag("booking.id", &id);

    match state.store.get(&id) {
        Some(record) => Ok(Json(MessageBody::new(record))),
        None => {
            span.set_tag("found", false);
            Err(ApiError::not_found(messages::BOOKING_NOT_FOUND))
        }
    }
}

/// Overwrites the record for `id`. An empty body stores no payload; any
/// other body must be JSON.
async fn put_booking(
    State(state): State<AccountState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MessageBody<&'static str>>, ApiError> {
    let parent = state.tracer.inbound_context(&headers);
    let mut span = state.tracer.start_span("booking_put", parent.as_ref());
    span.set_tag("booking.id", &id);

    let mut record = BookingRecord::confirmed(id.clone());
    if !body.is_empty() {
        let payload: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
            span.set_error(format!("invalid payload: {e}"));
            ApiError::bad_request(format!("invalid booking payload: {e}"))
        })?;
        record = record.with_payload(payload);
    }

    if state.store.put(id, record).is_some() {
        span.set_tag("overwrite", true);
    }
    Ok(Json(MessageBody::new(messages::BOOKING_CREATED)))
}
