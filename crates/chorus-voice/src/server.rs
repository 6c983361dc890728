//! Voice server orchestration.
//!
//! [`VoiceServer`] ties the pieces together: peers join channels, publish
//! tracks into the router, get auto-subscribed to each other, and announce
//! structural changes over signaling. Media never passes through this module;
//! it only wires sources to sinks and owns the bookkeeping around them.

use std::sync::Arc;

use async_trait::async_trait;
use chorus_common::config::VoiceConfig;
use chorus_db::sessions::{SessionStore, VoiceSessionRecord};
use chorus_db::slots::SlotStore;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::admission::{AdmissionConfig, AdmissionController, StoreFailPolicy};
use crate::broadcast::EventBroadcaster;
use crate::error::VoiceError;
use crate::events::{RoomSnapshot, StopReason, VoiceEvent};
use crate::lifecycle::{BackoffPolicy, SessionFinalizer, SessionState};
use crate::quality::Quality;
use crate::registry::{Peer, PeerRegistry};
use crate::router::{KeyframeRequester, MediaSource, RouterError, SinkFactory, TrackRouter};
use crate::screen_share::{ScreenShareSession, validate_source_label};
use crate::track::TrackSource;

/// External screen-share permission check. The chat backend decides; the
/// voice server only asks.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn can_screen_share(&self, user_id: Uuid, channel_id: Uuid) -> bool;
}

/// Permits everything. Used when permissions are enforced upstream.
pub struct AllowAll;

#[async_trait]
impl PermissionChecker for AllowAll {
    async fn can_screen_share(&self, _user_id: Uuid, _channel_id: Uuid) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct VoiceServerConfig {
    pub admission: AdmissionConfig,
    pub backoff: BackoffPolicy,
    pub max_packet_bytes: usize,
    pub sink_failure_limit: u32,
    /// Capacity of each peer's signaling event queue.
    pub event_queue_len: usize,
}

impl Default for VoiceServerConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            backoff: BackoffPolicy::default(),
            max_packet_bytes: 1500,
            sink_failure_limit: 5,
            event_queue_len: 64,
        }
    }
}

impl VoiceServerConfig {
    #[must_use]
    pub fn from_config(voice: &VoiceConfig) -> Self {
        Self {
            admission: AdmissionConfig {
                max_shares: voice.max_screen_shares,
                slot_ttl: std::time::Duration::from_secs(voice.slot_ttl_secs),
                fail_policy: StoreFailPolicy::parse(&voice.slot_store_fail_policy),
            },
            backoff: BackoffPolicy {
                max_attempts: voice.finalize_max_attempts,
                base_delay: std::time::Duration::from_millis(voice.finalize_backoff_ms),
            },
            max_packet_bytes: voice.max_packet_bytes,
            sink_failure_limit: voice.sink_failure_limit,
            event_queue_len: 64,
        }
    }
}

pub struct VoiceServer {
    registry: Arc<PeerRegistry>,
    router: Arc<TrackRouter>,
    broadcaster: EventBroadcaster,
    admission: AdmissionController,
    finalizer: Arc<SessionFinalizer>,
    permissions: Arc<dyn PermissionChecker>,
    media: Arc<dyn SinkFactory>,
    /// Active screen shares, one per sharing user.
    shares: DashMap<Uuid, ScreenShareSession>,
    event_queue_len: usize,
}

impl VoiceServer {
    #[must_use]
    pub fn new(
        config: VoiceServerConfig,
        slots: Arc<dyn SlotStore>,
        sessions: Arc<dyn SessionStore>,
        permissions: Arc<dyn PermissionChecker>,
        media: Arc<dyn SinkFactory>,
    ) -> Self {
        let registry = Arc::new(PeerRegistry::new());
        Self {
            broadcaster: EventBroadcaster::new(registry.clone()),
            registry,
            router: Arc::new(TrackRouter::new(
                config.max_packet_bytes,
                config.sink_failure_limit,
            )),
            admission: AdmissionController::new(slots, config.admission),
            finalizer: Arc::new(SessionFinalizer::new(sessions, config.backoff)),
            permissions,
            media,
            shares: DashMap::new(),
            event_queue_len: config.event_queue_len,
        }
    }

    /// Connect a user to a voice channel.
    ///
    /// A user connected elsewhere is moved: the old channel sees a normal
    /// leave before the new join. Joining the channel the user is already in
    /// fails with `AlreadyJoined`. The new peer receives a full
    /// [`RoomSnapshot`] and is subscribed to every track already published in
    /// the channel.
    pub async fn join(
        &self,
        user_id: Uuid,
        channel_id: Uuid,
        guild_id: Option<Uuid>,
    ) -> Result<(Arc<Peer>, mpsc::Receiver<VoiceEvent>), VoiceError> {
        match self.registry.channel_of(user_id) {
            Some(current) if current == channel_id => return Err(VoiceError::AlreadyJoined),
            Some(_) => {
                let _ = self.leave(user_id).await?;
            }
            None => {}
        }

        let (events_tx, events_rx) = mpsc::channel(self.event_queue_len);
        let peer = Arc::new(Peer::new(user_id, channel_id, guild_id, events_tx));
        self.registry.insert(peer.clone())?;

        // Subscribe the newcomer to everything already flowing in the room.
        for other in self.registry.channel_peers(channel_id) {
            if other.user_id == user_id {
                continue;
            }
            for source in self.router.published_sources(other.user_id) {
                let sink = self.media.sink_for(user_id, other.user_id, source);
                let _ = self.router.subscribe(user_id, other.user_id, source, sink);
            }
        }

        self.broadcaster.send_to(
            user_id,
            VoiceEvent::RoomState(self.room_snapshot(channel_id)),
        )?;
        self.broadcaster.broadcast_except(
            channel_id,
            user_id,
            &VoiceEvent::UserJoined {
                channel_id,
                user_id,
            },
        );

        info!(user = %user_id, channel = %channel_id, "User joined voice channel");
        Ok((peer, events_rx))
    }

    /// Disconnect a user: tear down their tracks and share, announce the
    /// leave, and finalize the session in the background. The returned handle
    /// resolves to the finalization outcome.
    pub async fn leave(&self, user_id: Uuid) -> Result<JoinHandle<SessionState>, VoiceError> {
        let peer = self
            .registry
            .remove(user_id)
            .ok_or(VoiceError::NotInChannel)?;
        let channel_id = peer.channel_id;

        if self.shares.contains_key(&user_id) {
            self.teardown_share(&peer, StopReason::Disconnected).await;
        }

        self.router.remove_publisher(user_id);
        self.router.remove_subscriber_everywhere(user_id);

        self.broadcaster.broadcast(
            channel_id,
            &VoiceEvent::UserLeft {
                channel_id,
                user_id,
            },
        );

        let record = VoiceSessionRecord::close(
            peer.session_id,
            peer.user_id,
            peer.channel_id,
            peer.guild_id,
            peer.connected_at,
            Utc::now(),
        );
        info!(user = %user_id, channel = %channel_id, "User left voice channel");
        Ok(self.finalizer.spawn_finalize(record))
    }

    /// Publish a media track and subscribe every other peer in the channel
    /// to it.
    pub fn publish(
        &self,
        user_id: Uuid,
        source: TrackSource,
        stream: impl MediaSource + 'static,
        keyframe: KeyframeRequester,
    ) -> Result<JoinHandle<()>, VoiceError> {
        let peer = self.registry.get(user_id).ok_or(VoiceError::NotInChannel)?;
        if source != TrackSource::Microphone && !peer.is_screen_sharing() {
            return Err(VoiceError::NotSharing);
        }

        let handle = self
            .router
            .publish(user_id, source, stream, keyframe)
            .map_err(map_router_err)?;

        for other in self.registry.channel_peers(peer.channel_id) {
            if other.user_id == user_id {
                continue;
            }
            let sink = self.media.sink_for(other.user_id, user_id, source);
            let _ = self.router.subscribe(other.user_id, user_id, source, sink);
        }
        Ok(handle)
    }

    /// Stop publishing a track. Idempotent.
    pub fn unpublish(&self, user_id: Uuid, source: TrackSource) {
        self.router.unpublish(user_id, source);
    }

    /// Subscribe a peer to a published track in its channel.
    pub fn subscribe(
        &self,
        subscriber_id: Uuid,
        publisher_id: Uuid,
        source: TrackSource,
    ) -> Result<(), VoiceError> {
        let subscriber = self
            .registry
            .get(subscriber_id)
            .ok_or(VoiceError::NotInChannel)?;
        let publisher = self
            .registry
            .get(publisher_id)
            .ok_or(VoiceError::NotInChannel)?;
        if subscriber.channel_id != publisher.channel_id {
            return Err(VoiceError::NotInChannel);
        }

        let sink = self.media.sink_for(subscriber_id, publisher_id, source);
        self.router
            .subscribe(subscriber_id, publisher_id, source, sink)
            .map_err(map_router_err)
    }

    /// Remove a subscription. Idempotent.
    pub fn unsubscribe(&self, subscriber_id: Uuid, publisher_id: Uuid, source: TrackSource) {
        self.router.unsubscribe(subscriber_id, publisher_id, source);
    }

    pub fn set_muted(&self, user_id: Uuid, muted: bool) -> Result<(), VoiceError> {
        let peer = self.registry.get(user_id).ok_or(VoiceError::NotInChannel)?;
        peer.set_muted(muted);
        self.broadcaster.broadcast(
            peer.channel_id,
            &VoiceEvent::MuteChanged {
                channel_id: peer.channel_id,
                user_id,
                muted,
            },
        );
        Ok(())
    }

    /// Speaking toggles are frequent; they flip an atomic and notify the
    /// rest of the room, nothing more.
    pub fn set_speaking(&self, user_id: Uuid, speaking: bool) -> Result<(), VoiceError> {
        let peer = self.registry.get(user_id).ok_or(VoiceError::NotInChannel)?;
        peer.set_speaking(speaking);
        self.broadcaster.broadcast_except(
            peer.channel_id,
            user_id,
            &VoiceEvent::SpeakingChanged {
                channel_id: peer.channel_id,
                user_id,
                speaking,
            },
        );
        Ok(())
    }

    /// Start a screen share: permission check, label validation, then an
    /// atomic slot claim against the channel limit.
    pub async fn start_screen_share(
        &self,
        user_id: Uuid,
        quality: Quality,
        has_audio: bool,
        source_label: String,
    ) -> Result<ScreenShareSession, VoiceError> {
        let peer = self.registry.get(user_id).ok_or(VoiceError::NotInChannel)?;
        validate_source_label(&source_label)?;
        if !self
            .permissions
            .can_screen_share(user_id, peer.channel_id)
            .await
        {
            return Err(VoiceError::PermissionDenied);
        }
        if self.shares.contains_key(&user_id) {
            return Err(VoiceError::AlreadySharing);
        }

        self.admission.acquire(peer.channel_id).await?;

        let session = ScreenShareSession::new(
            user_id,
            peer.channel_id,
            quality,
            has_audio,
            source_label.clone(),
        );
        // Entry API: a racing second start must not replace the winner's
        // session. The guard is dropped before the slot release awaits.
        let lost_race = match self.shares.entry(user_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => true,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(session.clone());
                false
            }
        };
        if lost_race {
            self.admission.release(peer.channel_id).await;
            return Err(VoiceError::AlreadySharing);
        }
        peer.set_screen_sharing(true);

        self.broadcaster.broadcast(
            peer.channel_id,
            &VoiceEvent::ScreenShareStarted {
                channel_id: peer.channel_id,
                user_id,
                quality,
                has_audio,
                source_label,
            },
        );
        info!(
            user = %user_id,
            channel = %peer.channel_id,
            ?quality,
            has_audio,
            "Screen share started"
        );
        Ok(session)
    }

    /// Stop the caller's own screen share.
    pub async fn stop_screen_share(&self, user_id: Uuid) -> Result<(), VoiceError> {
        self.stop_share_with_reason(user_id, StopReason::UserStopped)
            .await
    }

    /// Administratively terminate a user's screen share.
    pub async fn force_stop_screen_share(&self, user_id: Uuid) -> Result<(), VoiceError> {
        self.stop_share_with_reason(user_id, StopReason::Forced)
            .await
    }

    async fn stop_share_with_reason(
        &self,
        user_id: Uuid,
        reason: StopReason,
    ) -> Result<(), VoiceError> {
        let peer = self.registry.get(user_id).ok_or(VoiceError::NotInChannel)?;
        if !self.shares.contains_key(&user_id) {
            return Err(VoiceError::NotSharing);
        }
        self.teardown_share(&peer, reason).await;
        Ok(())
    }

    /// Release everything tied to a share. Caller has verified one exists.
    async fn teardown_share(&self, peer: &Peer, reason: StopReason) {
        let user_id = peer.user_id;
        self.shares.remove(&user_id);
        peer.set_screen_sharing(false);
        self.router.unpublish(user_id, TrackSource::ScreenVideo);
        self.router.unpublish(user_id, TrackSource::ScreenAudio);
        self.admission.release(peer.channel_id).await;
        self.broadcaster.broadcast(
            peer.channel_id,
            &VoiceEvent::ScreenShareStopped {
                channel_id: peer.channel_id,
                user_id,
                reason,
            },
        );
        info!(user = %user_id, channel = %peer.channel_id, ?reason, "Screen share stopped");
    }

    /// Change the quality tier of an active share.
    pub fn change_screen_share_quality(
        &self,
        user_id: Uuid,
        quality: Quality,
    ) -> Result<(), VoiceError> {
        let peer = self.registry.get(user_id).ok_or(VoiceError::NotInChannel)?;
        let mut share = self
            .shares
            .get_mut(&user_id)
            .ok_or(VoiceError::NotSharing)?;
        share.quality = quality;
        drop(share);

        self.broadcaster.broadcast(
            peer.channel_id,
            &VoiceEvent::ScreenShareQualityChanged {
                channel_id: peer.channel_id,
                user_id,
                quality,
            },
        );
        Ok(())
    }

    /// Current state of a channel as clients should render it.
    #[must_use]
    pub fn room_snapshot(&self, channel_id: Uuid) -> RoomSnapshot {
        let participants = self
            .registry
            .channel_peers(channel_id)
            .iter()
            .map(|p| p.participant_info())
            .collect();
        let screen_shares = self
            .shares
            .iter()
            .filter(|s| s.channel_id == channel_id)
            .map(|s| s.clone())
            .collect();
        RoomSnapshot {
            channel_id,
            participants,
            screen_shares,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn router(&self) -> &Arc<TrackRouter> {
        &self.router
    }

    /// Sessions whose durable write failed permanently.
    #[must_use]
    pub fn failed_sessions(&self) -> Vec<VoiceSessionRecord> {
        self.finalizer.failed_sessions()
    }
}

fn map_router_err(e: RouterError) -> VoiceError {
    match e {
        RouterError::NotPublishing(user, source) => VoiceError::NotPublishing(user, source),
        RouterError::AlreadyPublishing(user, source) => {
            VoiceError::AlreadyPublishing(user, source)
        }
        RouterError::PacketTooLarge { .. } | RouterError::Source(_) => {
            VoiceError::TransportUnavailable
        }
    }
}
