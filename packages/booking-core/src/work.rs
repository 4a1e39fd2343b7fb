//! The unit of work carried by the queue from the booking front door to the
//! consumer.
//!
//! Wire schema (UTF-8 JSON): `{"span_id": string, "message": string}` where
//! `message` is the booking id and `span_id` is the propagator's wire form of
//! the enqueueing span.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::trace::{CausalContext, ExtractError, Propagator};

/// Errors from building or decoding a [`WorkItem`].
#[derive(Debug, thiserror::Error)]
pub enum WorkItemError {
    #[error("work item subject id must not be empty")]
    EmptySubject,
    #[error("work item encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("work item decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Immutable queue entry. Construct with [`WorkItem::new`] or decode with
/// [`WorkItem::from_slice`]; both guarantee a non-empty subject id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    span_id: String,
    message: String,
}

impl WorkItem {
    /// Stamps `ctx` into a new work item for `subject_id`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkItemError::EmptySubject`] if `subject_id` is empty.
    pub fn new(
        ctx: &CausalContext,
        subject_id: impl Into<String>,
        propagator: &dyn Propagator,
    ) -> Result<Self, WorkItemError> {
        let message = subject_id.into();
        if message.is_empty() {
            return Err(WorkItemError::EmptySubject);
        }

        let mut carrier: HashMap<String, String> = HashMap::new();
        propagator.inject(ctx, &mut carrier);
        let span_id = carrier.remove(propagator.key()).unwrap_or_default();

        Ok(Self { span_id, message })
    }

    /// The injected causal context in its wire form.
    #[must_use]
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// The booking id this work item finalizes.
    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.message
    }

    /// Recovers the causal context that was injected at construction.
    ///
    /// # Errors
    ///
    /// Propagates [`ExtractError`] when the stored field is empty or does not
    /// parse with `propagator`.
    pub fn causal_context(&self, propagator: &dyn Propagator) -> Result<CausalContext, ExtractError> {
        let mut carrier: HashMap<String, String> = HashMap::new();
        if !self.span_id.is_empty() {
            carrier.insert(propagator.key().to_string(), self.span_id.clone());
        }
        propagator.extract(&carrier)
    }

    /// # Errors
    ///
    /// Returns [`WorkItemError::Encode`] if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WorkItemError> {
        serde_json::to_vec(self).map_err(WorkItemError::Encode)
    }

    /// # Errors
    ///
    /// Returns [`WorkItemError::Decode`] for invalid JSON or a schema mismatch,
    /// and [`WorkItemError::EmptySubject`] when `message` is empty.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WorkItemError> {
        let item: Self = serde_json::from_slice(bytes).map_err(WorkItemError::Decode)?;
        if item.message.is_empty() {
            return Err(WorkItemError::EmptySubject);
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{JaegerPropagator, W3cPropagator};

    #[test]
    fn serializes_to_reference_schema() {
        let ctx = CausalContext::root(true);
        let item = WorkItem::new(&ctx, "7", &JaegerPropagator).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&item.to_bytes().unwrap()).unwrap();
        assert_eq!(json["message"], "7");
        assert!(json["span_id"].as_str().unwrap().contains(':'));
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[test]
    fn context_survives_the_queue_hop() {
        let ctx = CausalContext::root(true).child();
        let item = WorkItem::new(&ctx, "booking-1", &JaegerPropagator).unwrap();

        let decoded = WorkItem::from_slice(&item.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.subject_id(), "booking-1");
        let extracted = decoded.causal_context(&JaegerPropagator).unwrap();
        assert_eq!(extracted.trace_id, ctx.trace_id);
        assert_eq!(extracted.span_id, ctx.span_id);
        assert!(extracted.sampled);
    }

    #[test]
    fn empty_subject_is_rejected_both_ways() {
        let ctx = CausalContext::root(false);
        assert!(matches!(
            WorkItem::new(&ctx, "", &W3cPropagator),
            Err(WorkItemError::EmptySubject)
        ));
        assert!(matches!(
            WorkItem::from_slice(br#"{"span_id":"x","message":""}"#),
            Err(WorkItemError::EmptySubject)
        ));
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            WorkItem::from_slice(b"not json"),
            Err(WorkItemError::Decode(_))
        ));
        assert!(matches!(
            WorkItem::from_slice(br#"{"message":"7"}"#),
            Err(WorkItemError::Decode(_))
        ));
    }

    #[test]
    fn wrong_format_fails_extraction() {
        let ctx = CausalContext::root(true);
        let item = WorkItem::new(&ctx, "7", &JaegerPropagator).unwrap();
        assert!(item.causal_context(&W3cPropagator).is_err());
    }

    #[test]
    fn blank_span_field_reports_missing() {
        let item = WorkItem::from_slice(br#"{"span_id":"","message":"7"}"#).unwrap();
        assert!(matches!(
            item.causal_context(&JaegerPropagator),
            Err(ExtractError::Missing { .. })
        ));
    }
}
