//! Connected-peer registry.
//!
//! Two sharded indexes over the same `Arc<Peer>` entries: by user for
//! signaling lookups, by channel for room fan-out. Mutable per-peer flags
//! (muted, speaking, screen sharing) are atomics inside the shared `Peer`,
//! so high-frequency speaking toggles never touch the structural maps.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::VoiceError;
use crate::events::{ParticipantInfo, VoiceEvent};

/// One connected voice peer.
pub struct Peer {
    pub user_id: Uuid,
    pub channel_id: Uuid,
    pub guild_id: Option<Uuid>,
    /// Durable session row this connection will finalize into.
    pub session_id: Uuid,
    pub connected_at: DateTime<Utc>,
    /// Signaling channel to this peer's client.
    pub events: mpsc::Sender<VoiceEvent>,
    muted: AtomicBool,
    speaking: AtomicBool,
    screen_sharing: AtomicBool,
}

impl Peer {
    #[must_use]
    pub fn new(
        user_id: Uuid,
        channel_id: Uuid,
        guild_id: Option<Uuid>,
        events: mpsc::Sender<VoiceEvent>,
    ) -> Self {
        Self {
            user_id,
            channel_id,
            guild_id,
            session_id: Uuid::new_v4(),
            connected_at: Utc::now(),
            events,
            muted: AtomicBool::new(false),
            speaking: AtomicBool::new(false),
            screen_sharing: AtomicBool::new(false),
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::Relaxed)
    }

    pub fn set_screen_sharing(&self, sharing: bool) {
        self.screen_sharing.store(sharing, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.screen_sharing.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn participant_info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id,
            muted: self.is_muted(),
            speaking: self.is_speaking(),
            screen_sharing: self.is_screen_sharing(),
        }
    }
}

/// Index of connected peers, one entry per user.
#[derive(Default)]
pub struct PeerRegistry {
    by_user: DashMap<Uuid, Arc<Peer>>,
    by_channel: DashMap<Uuid, Vec<Arc<Peer>>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Fails if the user is already connected to this
    /// channel; connecting to a different channel is the caller's
    /// leave-then-join flow.
    pub fn insert(&self, peer: Arc<Peer>) -> Result<(), VoiceError> {
        use dashmap::mapref::entry::Entry;

        match self.by_user.entry(peer.user_id) {
            Entry::Occupied(_) => Err(VoiceError::AlreadyJoined),
            Entry::Vacant(vacant) => {
                self.by_channel
                    .entry(peer.channel_id)
                    .or_default()
                    .push(peer.clone());
                vacant.insert(peer);
                Ok(())
            }
        }
    }

    /// Remove a peer, returning it for finalization. `None` if the user is
    /// not connected.
    pub fn remove(&self, user_id: Uuid) -> Option<Arc<Peer>> {
        let (_, peer) = self.by_user.remove(&user_id)?;
        if let Some(mut peers) = self.by_channel.get_mut(&peer.channel_id) {
            peers.retain(|p| p.user_id != user_id);
        }
        self.by_channel
            .remove_if(&peer.channel_id, |_, peers| peers.is_empty());
        Some(peer)
    }

    #[must_use]
    pub fn get(&self, user_id: Uuid) -> Option<Arc<Peer>> {
        self.by_user.get(&user_id).map(|p| p.clone())
    }

    /// The channel a user is connected to, if any.
    #[must_use]
    pub fn channel_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.by_user.get(&user_id).map(|p| p.channel_id)
    }

    /// All peers in a channel.
    #[must_use]
    pub fn channel_peers(&self, channel_id: Uuid) -> Vec<Arc<Peer>> {
        self.by_channel
            .get(&channel_id)
            .map(|peers| peers.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn channel_len(&self, channel_id: Uuid) -> usize {
        self.by_channel.get(&channel_id).map_or(0, |p| p.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_user.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }
}
