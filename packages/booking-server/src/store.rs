//! Concurrent keyed store for finalized bookings.

use std::sync::Arc;

use booking_core::BookingRecord;
use dashmap::DashMap;

/// Booking id to record. Writes replace the whole record atomically, so a
/// reader sees either the old or the new record, never a mix.
///
/// Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct BookingStore {
    records: Arc<DashMap<String, BookingRecord>>,
}

impl BookingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record` under `key`, returning the record it replaced.
    pub fn put(&self, key: impl Into<String>, record: BookingRecord) -> Option<BookingRecord> {
        self.records.insert(key.into(), record)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<BookingRecord> {
        self.records.get(key).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn get_missing_key_is_none() {
        let store = BookingStore::new();
        assert!(store.get("nope").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn put_returns_previous_record() {
        let store = BookingStore::new();
        assert!(store.put("1", BookingRecord::confirmed("1")).is_none());

        let updated = BookingRecord::confirmed("1").with_payload(json!({"seat": "4B"}));
        let previous = store.put("1", updated.clone()).unwrap();
        assert!(previous.payload.is_none());
        assert_eq!(store.get("1"), Some(updated));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let store = BookingStore::new();
        let other = store.clone();
        store.put("9", BookingRecord::confirmed("9"));
        assert!(other.get("9").is_some());
    }

    #[tokio::test]
    async fn concurrent_puts_on_distinct_keys_all_land() {
        let store = BookingStore::new();
        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.put(i.to_string(), BookingRecord::confirmed(i.to_string()));
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(store.len(), 64);
    }

    #[tokio::test]
    async fn concurrent_puts_on_one_key_leave_a_whole_record() {
        let store = BookingStore::new();
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let record = BookingRecord::confirmed("k").with_payload(json!({ "writer": i }));
                    store.put("k", record);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let record = store.get("k").unwrap();
        assert_eq!(record.id, "k");
        let writer = record.payload.unwrap()["writer"].as_i64().unwrap();
        assert!((0..32).contains(&writer));
    }

    proptest! {
        #[test]
        fn last_put_wins(key in "[a-z0-9]{1,8}", writes in prop::collection::vec(0u32..1000, 1..10)) {
            let store = BookingStore::new();
            for w in &writes {
                store.put(key.clone(), BookingRecord::confirmed(key.clone()).with_payload(json!(w)));
            }
            let last = *writes.last().unwrap();
            prop_assert_eq!(store.get(&key).unwrap().payload, Some(json!(last)));
            prop_assert_eq!(store.len(), 1);
        }
    }
}
