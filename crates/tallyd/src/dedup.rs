//! Attendance deduplication.
//!
//! Streaming clients submit a frame per animation tick; without this
//! layer every frame of a recognized face would append an attendance
//! row. Per `(identity, event_type)` key we keep the timestamp of the
//! most recently accepted event — seeded from the persisted log at
//! startup, kept authoritative by writing through on every acceptance.
//!
//! Locking is per key: the outer mutex only fetches or creates the
//! key's slot, the slot's own async mutex is held across the
//! check-append-update sequence. Concurrent frames for the same
//! identity cannot both be accepted; unrelated identities never
//! contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tally_core::EventType;
use tally_store::{Store, StoreError};
use tokio::sync::Mutex as AsyncMutex;

/// Durable destination for accepted events. `Store` is the production
/// implementation; tests inject failing sinks.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(
        &self,
        identity_id: &str,
        event_type: EventType,
        occurred_at: DateTime<Utc>,
        confidence: f32,
    ) -> Result<i64, StoreError>;
}

#[async_trait]
impl EventSink for Store {
    async fn append(
        &self,
        identity_id: &str,
        event_type: EventType,
        occurred_at: DateTime<Utc>,
        confidence: f32,
    ) -> Result<i64, StoreError> {
        self.append_event(identity_id, event_type, occurred_at, confidence)
            .await
    }
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    async fn append(
        &self,
        identity_id: &str,
        event_type: EventType,
        occurred_at: DateTime<Utc>,
        confidence: f32,
    ) -> Result<i64, StoreError> {
        (**self).append(identity_id, event_type, occurred_at, confidence).await
    }
}

/// Outcome of one dedup decision. Rejection is a normal outcome, not
/// an error.
#[derive(Debug, Clone)]
pub struct Decision {
    pub accepted: bool,
    /// Assigned event id when accepted.
    pub event_id: Option<i64>,
    /// When accepted: the new event's timestamp. When rejected: the
    /// prior accepted event's timestamp, for display.
    pub marked_at: DateTime<Utc>,
}

type Slot = Arc<AsyncMutex<Option<DateTime<Utc>>>>;

pub struct Deduplicator<S> {
    sink: S,
    cooldown: Duration,
    slots: Mutex<HashMap<(String, EventType), Slot>>,
}

impl<S: EventSink> Deduplicator<S> {
    /// Build with a seed map from `Store::last_accepted()` so cooldowns
    /// survive process restarts.
    pub fn new(
        sink: S,
        cooldown: std::time::Duration,
        seed: HashMap<(String, EventType), DateTime<Utc>>,
    ) -> Self {
        let slots = seed
            .into_iter()
            .map(|(key, at)| (key, Arc::new(AsyncMutex::new(Some(at))) as Slot))
            .collect();
        Self {
            sink,
            cooldown: Duration::from_std(cooldown).unwrap_or_else(|_| Duration::seconds(300)),
            slots: Mutex::new(slots),
        }
    }

    fn slot(&self, identity_id: &str, event_type: EventType) -> Slot {
        let mut slots = self.slots.lock().expect("dedup slot map poisoned");
        slots
            .entry((identity_id.to_string(), event_type))
            .or_default()
            .clone()
    }

    /// Decide whether a matched identity gets a new event right now.
    ///
    /// Atomic per key: the slot lock is held across the append, so a
    /// burst of parallel frames for one identity yields exactly one
    /// event. Only a durable append updates the cache — on a failed
    /// write the prior timestamp stands and a retry stays legitimate.
    pub async fn decide(
        &self,
        identity_id: &str,
        event_type: EventType,
        similarity: f32,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let slot = self.slot(identity_id, event_type);
        let mut last = slot.lock().await;

        if let Some(prior) = *last {
            if now.signed_duration_since(prior) < self.cooldown {
                tracing::debug!(
                    identity = identity_id,
                    event_type = %event_type,
                    prior = %prior,
                    "already marked within cooldown"
                );
                return Ok(Decision {
                    accepted: false,
                    event_id: None,
                    marked_at: prior,
                });
            }
        }

        let event_id = self
            .sink
            .append(identity_id, event_type, now, similarity)
            .await?;
        *last = Some(now);

        tracing::info!(
            identity = identity_id,
            event_type = %event_type,
            event_id,
            similarity,
            "attendance event accepted"
        );
        Ok(Decision {
            accepted: true,
            event_id: Some(event_id),
            marked_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration as StdDuration;

    /// Counts appends; optionally fails every call.
    struct StubSink {
        appended: AtomicI64,
        fail: bool,
    }

    impl StubSink {
        fn new() -> Self {
            Self { appended: AtomicI64::new(0), fail: false }
        }

        fn failing() -> Self {
            Self { appended: AtomicI64::new(0), fail: true }
        }

        fn count(&self) -> i64 {
            self.appended.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSink for StubSink {
        async fn append(
            &self,
            _identity_id: &str,
            _event_type: EventType,
            _occurred_at: DateTime<Utc>,
            _confidence: f32,
        ) -> Result<i64, StoreError> {
            if self.fail {
                return Err(StoreError::Db(tokio_rusqlite::Error::ConnectionClosed));
            }
            Ok(self.appended.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    impl<S: EventSink> Deduplicator<Arc<S>> {
        fn sink(&self) -> &S {
            &self.sink
        }
    }

    fn dedup_with(sink: Arc<StubSink>, cooldown_secs: u64) -> Deduplicator<Arc<StubSink>> {
        Deduplicator::new(
            sink,
            StdDuration::from_secs(cooldown_secs),
            HashMap::new(),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn second_submission_within_cooldown_is_rejected() {
        let dedup = dedup_with(Arc::new(StubSink::new()), 300);

        let first = dedup.decide("u1", EventType::Entry, 0.9, at(0)).await.unwrap();
        assert!(first.accepted);
        assert_eq!(first.event_id, Some(1));

        let second = dedup.decide("u1", EventType::Entry, 0.95, at(5)).await.unwrap();
        assert!(!second.accepted);
        assert!(second.event_id.is_none());
        // Rejection reports the first acceptance's timestamp.
        assert_eq!(second.marked_at, at(0));
        assert_eq!(dedup.sink().count(), 1);
    }

    #[tokio::test]
    async fn submission_after_cooldown_creates_second_event() {
        let dedup = dedup_with(Arc::new(StubSink::new()), 300);

        dedup.decide("u1", EventType::Entry, 0.9, at(0)).await.unwrap();
        let within = dedup.decide("u1", EventType::Entry, 0.9, at(299)).await.unwrap();
        assert!(!within.accepted);

        let after = dedup.decide("u1", EventType::Entry, 0.9, at(300)).await.unwrap();
        assert!(after.accepted);
        assert_eq!(dedup.sink().count(), 2);
    }

    #[tokio::test]
    async fn entry_and_exit_cooldowns_are_independent() {
        let dedup = dedup_with(Arc::new(StubSink::new()), 300);

        let entry = dedup.decide("u1", EventType::Entry, 0.9, at(0)).await.unwrap();
        let exit = dedup.decide("u1", EventType::Exit, 0.9, at(1)).await.unwrap();
        assert!(entry.accepted);
        assert!(exit.accepted);
        assert_eq!(dedup.sink().count(), 2);

        // Marking exit did not reset the entry cooldown.
        let entry_again = dedup.decide("u1", EventType::Entry, 0.9, at(2)).await.unwrap();
        assert!(!entry_again.accepted);
    }

    #[tokio::test]
    async fn distinct_identities_do_not_share_cooldowns() {
        let dedup = dedup_with(Arc::new(StubSink::new()), 300);
        assert!(dedup.decide("u1", EventType::Entry, 0.9, at(0)).await.unwrap().accepted);
        assert!(dedup.decide("u2", EventType::Entry, 0.9, at(0)).await.unwrap().accepted);
    }

    #[tokio::test]
    async fn seeded_timestamp_applies_before_any_runtime_acceptance() {
        let mut seed = HashMap::new();
        seed.insert(("u1".to_string(), EventType::Entry), at(0));
        let dedup = Deduplicator::new(
            Arc::new(StubSink::new()),
            StdDuration::from_secs(300),
            seed,
        );

        // Restart scenario: history from the log keeps the window closed.
        let within = dedup.decide("u1", EventType::Entry, 0.9, at(100)).await.unwrap();
        assert!(!within.accepted);
        assert_eq!(within.marked_at, at(0));

        let after = dedup.decide("u1", EventType::Entry, 0.9, at(400)).await.unwrap();
        assert!(after.accepted);
    }

    #[tokio::test]
    async fn failed_append_does_not_update_the_cache() {
        let dedup = dedup_with(Arc::new(StubSink::failing()), 300);

        let err = dedup.decide("u1", EventType::Entry, 0.9, at(0)).await;
        assert!(err.is_err());

        // The durable write failed, so a retry must still be allowed to
        // attempt an append rather than being reported as already marked.
        let retry = dedup.decide("u1", EventType::Entry, 0.9, at(1)).await;
        assert!(retry.is_err());
        assert_eq!(dedup.sink().count(), 0);
    }

    #[tokio::test]
    async fn concurrent_frames_for_one_key_accept_exactly_once() {
        let sink = Arc::new(StubSink::new());
        let dedup = Arc::new(dedup_with(sink.clone(), 300));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let dedup = Arc::clone(&dedup);
            tasks.push(tokio::spawn(async move {
                dedup.decide("u1", EventType::Entry, 0.9, at(0)).await.unwrap()
            }));
        }

        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(sink.count(), 1);
    }
}
