//! Screen-share admission control.
//!
//! Concurrent shares per channel are counted in a shared slot store so the
//! limit holds across server instances. Acquisition is a single atomic
//! check-and-increment in the store; this layer adds the failure policy for
//! when the store itself is unreachable.

use std::sync::Arc;
use std::time::Duration;

use chorus_db::slots::{SlotStore, SlotStoreError};
use tracing::error;
use uuid::Uuid;

use crate::error::VoiceError;

/// What to do when the slot store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFailPolicy {
    /// Deny new shares while the store is down. The default: an unreachable
    /// store must not turn the limit off.
    #[default]
    FailClosed,
    /// Admit without counting while the store is down.
    FailOpen,
}

impl StoreFailPolicy {
    /// Parse the config value, defaulting to fail-closed on anything
    /// unrecognized.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "fail_open" => Self::FailOpen,
            _ => Self::FailClosed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdmissionConfig {
    /// Concurrent screen shares allowed per channel.
    pub max_shares: u32,
    /// Slot lifetime; holders must outlive crashes, not leak forever.
    pub slot_ttl: Duration,
    pub fail_policy: StoreFailPolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_shares: 2,
            slot_ttl: Duration::from_secs(300),
            fail_policy: StoreFailPolicy::FailClosed,
        }
    }
}

/// Gate on the per-channel screen-share limit.
pub struct AdmissionController {
    store: Arc<dyn SlotStore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    #[must_use]
    pub fn new(store: Arc<dyn SlotStore>, config: AdmissionConfig) -> Self {
        Self { store, config }
    }

    /// Try to claim a share slot in `channel_id`.
    ///
    /// Returns `LimitReached` when the channel is full, `StoreUnavailable`
    /// when the store is down and policy is fail-closed.
    pub async fn acquire(&self, channel_id: Uuid) -> Result<(), VoiceError> {
        match self
            .store
            .try_acquire(channel_id, self.config.max_shares, self.config.slot_ttl)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(VoiceError::LimitReached),
            Err(SlotStoreError::Unavailable(reason)) => {
                error!(
                    channel = %channel_id,
                    policy = ?self.config.fail_policy,
                    %reason,
                    "Slot store unavailable during acquire"
                );
                match self.config.fail_policy {
                    StoreFailPolicy::FailClosed => Err(VoiceError::StoreUnavailable(reason)),
                    StoreFailPolicy::FailOpen => Ok(()),
                }
            }
        }
    }

    /// Release a previously claimed slot. Store failures are logged and
    /// swallowed: the TTL reclaims the slot if the decrement never lands.
    pub async fn release(&self, channel_id: Uuid) {
        if let Err(SlotStoreError::Unavailable(reason)) = self.store.release(channel_id).await {
            error!(
                channel = %channel_id,
                %reason,
                "Slot store unavailable during release, slot will expire via TTL"
            );
        }
    }

    /// Current share count for a channel, zero if the store is unreachable.
    pub async fn current(&self, channel_id: Uuid) -> u32 {
        match self.store.current(channel_id).await {
            Ok(count) => count,
            Err(SlotStoreError::Unavailable(reason)) => {
                error!(channel = %channel_id, %reason, "Slot store unavailable during count");
                0
            }
        }
    }

    #[must_use]
    pub fn max_shares(&self) -> u32 {
        self.config.max_shares
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chorus_db::slots::MemorySlotStore;

    struct DownStore;

    #[async_trait]
    impl SlotStore for DownStore {
        async fn try_acquire(
            &self,
            _channel_id: Uuid,
            _max: u32,
            _ttl: Duration,
        ) -> Result<bool, SlotStoreError> {
            Err(SlotStoreError::Unavailable("connection refused".into()))
        }

        async fn release(&self, _channel_id: Uuid) -> Result<(), SlotStoreError> {
            Err(SlotStoreError::Unavailable("connection refused".into()))
        }

        async fn current(&self, _channel_id: Uuid) -> Result<u32, SlotStoreError> {
            Err(SlotStoreError::Unavailable("connection refused".into()))
        }
    }

    fn controller(max_shares: u32, fail_policy: StoreFailPolicy) -> AdmissionController {
        AdmissionController::new(
            Arc::new(MemorySlotStore::new()),
            AdmissionConfig {
                max_shares,
                slot_ttl: Duration::from_secs(300),
                fail_policy,
            },
        )
    }

    #[tokio::test]
    async fn enforces_channel_limit() {
        let admission = controller(2, StoreFailPolicy::FailClosed);
        let channel = Uuid::new_v4();

        admission.acquire(channel).await.unwrap();
        admission.acquire(channel).await.unwrap();
        assert!(matches!(
            admission.acquire(channel).await,
            Err(VoiceError::LimitReached)
        ));

        admission.release(channel).await;
        admission.acquire(channel).await.unwrap();
    }

    #[tokio::test]
    async fn fail_closed_denies_when_store_is_down() {
        let admission = AdmissionController::new(
            Arc::new(DownStore),
            AdmissionConfig::default(),
        );
        assert!(matches!(
            admission.acquire(Uuid::new_v4()).await,
            Err(VoiceError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn fail_open_admits_when_store_is_down() {
        let admission = AdmissionController::new(
            Arc::new(DownStore),
            AdmissionConfig {
                fail_policy: StoreFailPolicy::FailOpen,
                ..AdmissionConfig::default()
            },
        );
        assert!(admission.acquire(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn release_with_store_down_does_not_panic() {
        let admission = AdmissionController::new(
            Arc::new(DownStore),
            AdmissionConfig::default(),
        );
        admission.release(Uuid::new_v4()).await;
    }

    #[test]
    fn policy_parse_defaults_closed() {
        assert_eq!(StoreFailPolicy::parse("fail_open"), StoreFailPolicy::FailOpen);
        assert_eq!(StoreFailPolicy::parse("fail_closed"), StoreFailPolicy::FailClosed);
        assert_eq!(StoreFailPolicy::parse("banana"), StoreFailPolicy::FailClosed);
    }
}
