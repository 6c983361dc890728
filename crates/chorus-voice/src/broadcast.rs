//! Signaling event fan-out.
//!
//! Sends are non-blocking: peer lists are snapshotted from the registry
//! first, then events go out with no locks held, so one slow client cannot
//! stall a room-wide announcement. Every delivery failure is logged with the
//! event kind and target.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::error::VoiceError;
use crate::events::VoiceEvent;
use crate::registry::{Peer, PeerRegistry};

pub struct EventBroadcaster {
    registry: Arc<PeerRegistry>,
}

impl EventBroadcaster {
    #[must_use]
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    fn deliver(peer: &Peer, event: VoiceEvent) -> Result<(), VoiceError> {
        let kind = event.kind();
        peer.events.try_send(event).map_err(|e| {
            warn!(
                target_user = %peer.user_id,
                channel = %peer.channel_id,
                event = kind,
                error = %e,
                "Failed to deliver signaling event"
            );
            VoiceError::TransportUnavailable
        })
    }

    /// Send an event to one user.
    pub fn send_to(&self, user_id: Uuid, event: VoiceEvent) -> Result<(), VoiceError> {
        let peer = self
            .registry
            .get(user_id)
            .ok_or(VoiceError::NotInChannel)?;
        Self::deliver(&peer, event)
    }

    /// Send an event to every peer in a channel. Per-peer failures are
    /// logged and skipped.
    pub fn broadcast(&self, channel_id: Uuid, event: &VoiceEvent) {
        for peer in self.registry.channel_peers(channel_id) {
            let _ = Self::deliver(&peer, event.clone());
        }
    }

    /// Send an event to every peer in a channel except one, typically the
    /// user the event is about.
    pub fn broadcast_except(&self, channel_id: Uuid, except: Uuid, event: &VoiceEvent) {
        for peer in self.registry.channel_peers(channel_id) {
            if peer.user_id != except {
                let _ = Self::deliver(&peer, event.clone());
            }
        }
    }
}
