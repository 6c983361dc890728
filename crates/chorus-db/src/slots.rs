//! Per-channel screen-share slot counters.
//!
//! The counter is shared state: with several voice nodes behind one Redis,
//! admission decisions stay correct because check-and-increment happens in a
//! single atomic script. Every successful acquire refreshes the key TTL, so a
//! sharer that vanishes without a clean stop only leaks its slot until the
//! key expires.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use uuid::Uuid;

/// Errors from the slot store. All variants mean the store could not answer;
/// the admission controller decides what that implies.
#[derive(Debug, thiserror::Error)]
pub enum SlotStoreError {
    #[error("slot store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for SlotStoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Atomic counting store for concurrent screen shares per channel.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Atomically increment the channel's counter if it is below `max`.
    /// Returns `true` if a slot was acquired. Refreshes the TTL on success.
    async fn try_acquire(
        &self,
        channel_id: Uuid,
        max: u32,
        ttl: Duration,
    ) -> Result<bool, SlotStoreError>;

    /// Decrement the channel's counter, clamped at zero.
    async fn release(&self, channel_id: Uuid) -> Result<(), SlotStoreError>;

    /// Current counter value (zero when absent or expired).
    async fn current(&self, channel_id: Uuid) -> Result<u32, SlotStoreError>;
}

/// INCR, compare against the limit, DECR back on overflow, refresh the TTL.
/// Running as a script makes the whole check-and-increment one atomic step,
/// so two racing acquires can never both pass a stale peek.
const ACQUIRE_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count > tonumber(ARGV[1]) then
    redis.call('DECR', KEYS[1])
    return 0
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
return 1
";

/// DECR only while positive, so repeated releases never drive the counter
/// negative.
const RELEASE_SCRIPT: &str = r"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count > 0 then
    redis.call('DECR', KEYS[1])
end
return 0
";

/// Redis-backed slot store shared by all voice nodes.
#[derive(Clone)]
pub struct RedisSlotStore {
    conn: ConnectionManager,
}

impl RedisSlotStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(channel_id: Uuid) -> String {
        format!("voice:shares:{channel_id}")
    }
}

#[async_trait]
impl SlotStore for RedisSlotStore {
    async fn try_acquire(
        &self,
        channel_id: Uuid,
        max: u32,
        ttl: Duration,
    ) -> Result<bool, SlotStoreError> {
        let mut conn = self.conn.clone();
        let acquired: i64 = redis::Script::new(ACQUIRE_SCRIPT)
            .key(Self::key(channel_id))
            .arg(max)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(acquired == 1)
    }

    async fn release(&self, channel_id: Uuid) -> Result<(), SlotStoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(channel_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn current(&self, channel_id: Uuid) -> Result<u32, SlotStoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u32> = redis::AsyncCommands::get(&mut conn, Self::key(channel_id)).await?;
        Ok(count.unwrap_or(0))
    }
}

struct SlotEntry {
    count: u32,
    expires_at: Instant,
}

/// In-memory slot store for single-process deployments and tests.
/// Honors the same TTL semantics as the Redis store.
#[derive(Default)]
pub struct MemorySlotStore {
    slots: Mutex<HashMap<Uuid, SlotEntry>>,
}

impl MemorySlotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotStore for MemorySlotStore {
    async fn try_acquire(
        &self,
        channel_id: Uuid,
        max: u32,
        ttl: Duration,
    ) -> Result<bool, SlotStoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let entry = slots.entry(channel_id).or_insert(SlotEntry {
            count: 0,
            expires_at: now + ttl,
        });
        if entry.expires_at <= now {
            entry.count = 0;
        }
        if entry.count >= max {
            return Ok(false);
        }
        entry.count += 1;
        entry.expires_at = now + ttl;
        Ok(true)
    }

    async fn release(&self, channel_id: Uuid) -> Result<(), SlotStoreError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        if let Some(entry) = slots.get_mut(&channel_id) {
            if entry.expires_at > now && entry.count > 0 {
                entry.count -= 1;
            }
            if entry.count == 0 {
                slots.remove(&channel_id);
            }
        }
        Ok(())
    }

    async fn current(&self, channel_id: Uuid) -> Result<u32, SlotStoreError> {
        let now = Instant::now();
        let slots = self.slots.lock();
        Ok(slots
            .get(&channel_id)
            .filter(|entry| entry.expires_at > now)
            .map_or(0, |entry| entry.count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn acquire_up_to_limit_then_reject() {
        let store = MemorySlotStore::new();
        let channel = Uuid::new_v4();

        assert!(store.try_acquire(channel, 2, TTL).await.unwrap());
        assert!(store.try_acquire(channel, 2, TTL).await.unwrap());
        assert!(!store.try_acquire(channel, 2, TTL).await.unwrap());
        assert_eq!(store.current(channel).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn release_clamps_at_zero() {
        let store = MemorySlotStore::new();
        let channel = Uuid::new_v4();

        assert!(store.try_acquire(channel, 1, TTL).await.unwrap());
        store.release(channel).await.unwrap();
        store.release(channel).await.unwrap();
        assert_eq!(store.current(channel).await.unwrap(), 0);

        // Counter still usable after the double release.
        assert!(store.try_acquire(channel, 1, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn zero_limit_rejects_first_acquire() {
        let store = MemorySlotStore::new();
        let channel = Uuid::new_v4();
        assert!(!store.try_acquire(channel, 0, TTL).await.unwrap());
    }

    #[tokio::test]
    async fn stale_slot_expires_and_is_reclaimed() {
        let store = MemorySlotStore::new();
        let channel = Uuid::new_v4();
        let ttl = Duration::from_millis(30);

        assert!(store.try_acquire(channel, 1, ttl).await.unwrap());
        assert!(!store.try_acquire(channel, 1, ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(50)).await;

        // The holder never released, but the slot self-heals after expiry.
        assert_eq!(store.current(channel).await.unwrap(), 0);
        assert!(store.try_acquire(channel, 1, ttl).await.unwrap());
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let store = MemorySlotStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(store.try_acquire(a, 1, TTL).await.unwrap());
        assert!(store.try_acquire(b, 1, TTL).await.unwrap());
        assert!(!store.try_acquire(a, 1, TTL).await.unwrap());
    }
}
