//! Session lifecycle and durable finalization.
//!
//! Every connection becomes exactly one session row at disconnect. The write
//! is retried with exponential backoff; deduplication happens in the store
//! (insert-if-absent on the session id), so a retry after an ambiguous
//! failure can never double-record. Sessions that exhaust their retries are
//! kept queryable for operators instead of silently vanishing.

use std::sync::Arc;
use std::time::Duration;

use chorus_db::sessions::{SessionStore, VoiceSessionRecord};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Teardown started; media and signaling are being released.
    Disconnecting,
    /// Writing the durable session record.
    Finalizing,
    Finalized,
    /// All persistence attempts failed; record retained in memory.
    FinalizationFailed,
}

/// Retry schedule for session persistence.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retrying after the given 1-based failed attempt.
    /// Doubles each time: 100ms, 200ms, 400ms with the defaults.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Persists closed sessions, retrying transient store failures.
pub struct SessionFinalizer {
    store: Arc<dyn SessionStore>,
    policy: BackoffPolicy,
    failed: DashMap<Uuid, VoiceSessionRecord>,
}

impl SessionFinalizer {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, policy: BackoffPolicy) -> Self {
        Self {
            store,
            policy,
            failed: DashMap::new(),
        }
    }

    /// Persist one closed session, retrying up to the policy's limit.
    pub async fn finalize(&self, record: VoiceSessionRecord) -> SessionState {
        for attempt in 1..=self.policy.max_attempts {
            match self.store.persist(&record).await {
                Ok(()) => {
                    info!(
                        session = %record.id,
                        user = %record.user_id,
                        duration_secs = record.duration_secs,
                        "Voice session finalized"
                    );
                    self.failed.remove(&record.id);
                    return SessionState::Finalized;
                }
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        session = %record.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Session persist failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        session = %record.id,
                        user = %record.user_id,
                        attempts = self.policy.max_attempts,
                        error = %e,
                        "Session persist failed after all retries"
                    );
                }
            }
        }
        self.failed.insert(record.id, record);
        SessionState::FinalizationFailed
    }

    /// Finalize in the background so disconnect handling does not wait on
    /// database retries.
    pub fn spawn_finalize(
        self: &Arc<Self>,
        record: VoiceSessionRecord,
    ) -> JoinHandle<SessionState> {
        let finalizer = Arc::clone(self);
        tokio::spawn(async move { finalizer.finalize(record).await })
    }

    /// Sessions whose persistence gave up, for operator inspection and
    /// manual replay.
    #[must_use]
    pub fn failed_sessions(&self) -> Vec<VoiceSessionRecord> {
        self.failed.iter().map(|r| r.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chorus_db::sessions::{MemorySessionStore, SessionStoreError};
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn record() -> VoiceSessionRecord {
        let connected = Utc::now() - chrono::Duration::seconds(42);
        VoiceSessionRecord::close(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            connected,
            Utc::now(),
        )
    }

    /// Fails the first `failures` persist calls, then succeeds.
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
        inner: MemorySessionStore,
    }

    impl FlakyStore {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                inner: MemorySessionStore::new(),
            }
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn persist(&self, record: &VoiceSessionRecord) -> Result<(), SessionStoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(SessionStoreError::Unavailable("pool timeout".into()));
            }
            self.inner.persist(record).await
        }
    }

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn finalizes_on_first_attempt() {
        let store = Arc::new(MemorySessionStore::new());
        let finalizer = SessionFinalizer::new(store.clone(), fast_policy());

        let state = finalizer.finalize(record()).await;
        assert_eq!(state, SessionState::Finalized);
        assert_eq!(store.records().len(), 1);
        assert!(finalizer.failed_sessions().is_empty());
    }

    #[tokio::test]
    async fn retries_then_succeeds_exactly_once() {
        let store = Arc::new(FlakyStore::new(2));
        let finalizer = SessionFinalizer::new(store.clone(), fast_policy());
        let rec = record();

        let state = finalizer.finalize(rec.clone()).await;
        assert_eq!(state, SessionState::Finalized);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.inner.records().len(), 1);
        assert_eq!(store.inner.records()[0].id, rec.id);
    }

    #[tokio::test]
    async fn exhausted_retries_keep_record_queryable() {
        let store = Arc::new(FlakyStore::new(10));
        let finalizer = SessionFinalizer::new(store.clone(), fast_policy());
        let rec = record();

        let state = finalizer.finalize(rec.clone()).await;
        assert_eq!(state, SessionState::FinalizationFailed);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);

        let failed = finalizer.failed_sessions();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, rec.id);
    }

    #[tokio::test]
    async fn spawned_finalize_reports_state() {
        let finalizer = Arc::new(SessionFinalizer::new(
            Arc::new(MemorySessionStore::new()),
            fast_policy(),
        ));
        let state = finalizer.spawn_finalize(record()).await.unwrap();
        assert_eq!(state, SessionState::Finalized);
    }
}
