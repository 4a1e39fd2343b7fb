//! Booking record and the JSON envelope every service responds with.

use serde::{Deserialize, Serialize};

/// Lifecycle state written by the finalize call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
}

/// The state-store record. Identity is `id`; the last write wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: String,
    pub status: BookingStatus,
    /// Opaque caller-supplied data attached at finalize time.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<serde_json::Value>,
}

impl BookingRecord {
    /// A confirmed record with no payload.
    #[must_use]
    pub fn confirmed(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: BookingStatus::Confirmed,
            payload: None,
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// `{"message": ...}` response body shared by all endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBody<T> {
    pub message: T,
}

impl<T> MessageBody<T> {
    pub fn new(message: T) -> Self {
        Self { message }
    }
}

/// Fixed response texts.
pub mod messages {
    pub const LOGIN: &str = "login";
    pub const QUEUED: &str = "queued";
    pub const BOOKING_CREATED: &str = "booking created";
    pub const BOOKING_NOT_FOUND: &str = "booking not found";
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn record_omits_absent_payload() {
        let value = serde_json::to_value(BookingRecord::confirmed("7")).unwrap();
        assert_eq!(value, json!({"id": "7", "status": "confirmed"}));
    }

    #[test]
    fn record_round_trips_with_payload() {
        let record = BookingRecord::confirmed("9").with_payload(json!({"seats": 2}));
        let body = MessageBody::new(record.clone());

        let text = serde_json::to_string(&body).unwrap();
        let back: MessageBody<BookingRecord> = serde_json::from_str(&text).unwrap();
        assert_eq!(back.message, record);
    }

    #[test]
    fn message_envelope_shape() {
        let value = serde_json::to_value(MessageBody::new(messages::QUEUED)).unwrap();
        assert_eq!(value, json!({"message": "queued"}));
    }
}
