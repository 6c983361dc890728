//! End-to-end voice flows: join, screen share, contention, crash recovery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chorus_db::sessions::{MemorySessionStore, SessionStore, SessionStoreError, VoiceSessionRecord};
use chorus_db::slots::{MemorySlotStore, SlotStore};
use chorus_voice::admission::AdmissionConfig;
use chorus_voice::lifecycle::{BackoffPolicy, SessionState};
use chorus_voice::router::{ChannelSinkFactory, ChannelSource, KeyframeRequester};
use chorus_voice::server::{AllowAll, VoiceServer, VoiceServerConfig};
use chorus_voice::{Quality, StopReason, TrackSource, VoiceError, VoiceEvent};
use uuid::Uuid;

struct Harness {
    server: Arc<VoiceServer>,
    media: Arc<ChannelSinkFactory>,
    sessions: Arc<MemorySessionStore>,
    slots: Arc<MemorySlotStore>,
}

fn harness(config: VoiceServerConfig) -> Harness {
    let media = Arc::new(ChannelSinkFactory::new(64));
    let sessions = Arc::new(MemorySessionStore::new());
    let slots = Arc::new(MemorySlotStore::new());
    let server = Arc::new(VoiceServer::new(
        config,
        slots.clone(),
        sessions.clone(),
        Arc::new(AllowAll),
        media.clone(),
    ));
    Harness {
        server,
        media,
        sessions,
        slots,
    }
}

fn single_share_config() -> VoiceServerConfig {
    VoiceServerConfig {
        admission: AdmissionConfig {
            max_shares: 1,
            ..AdmissionConfig::default()
        },
        ..VoiceServerConfig::default()
    }
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<VoiceEvent>) -> VoiceEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn late_joiner_sees_active_share_and_receives_media() {
    let h = harness(VoiceServerConfig::default());
    let channel = Uuid::new_v4();
    let sharer = Uuid::new_v4();
    let viewer = Uuid::new_v4();

    h.server.join(sharer, channel, None).await.unwrap();
    h.server
        .start_screen_share(sharer, Quality::High, false, "Display 1".into())
        .await
        .unwrap();

    let (feed, stream) = ChannelSource::new(16);
    let (keyframe, mut kf_rx) = KeyframeRequester::channel(8);
    h.server
        .publish(sharer, TrackSource::ScreenVideo, stream, keyframe)
        .unwrap();

    // Late joiner: the room snapshot must carry the active share, and the
    // auto-subscription must trigger a keyframe request so video starts
    // immediately.
    let (_peer, mut events) = h.server.join(viewer, channel, None).await.unwrap();
    match next_event(&mut events).await {
        VoiceEvent::RoomState(snapshot) => {
            assert_eq!(snapshot.participants.len(), 2);
            assert_eq!(snapshot.screen_shares.len(), 1);
            assert_eq!(snapshot.screen_shares[0].user_id, sharer);
            assert_eq!(snapshot.screen_shares[0].quality, Quality::High);
        }
        other => panic!("expected room state, got {other:?}"),
    }

    let req = kf_rx.recv().await.unwrap();
    assert_eq!(req.publisher_id, sharer);
    assert_eq!(req.source, TrackSource::ScreenVideo);

    let mut media_rx = h
        .media
        .take_receiver(viewer, sharer, TrackSource::ScreenVideo)
        .expect("viewer should have been auto-subscribed");
    feed.send(Bytes::from_static(b"frame-0")).await.unwrap();
    let packet = tokio::time::timeout(Duration::from_secs(1), media_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet, Bytes::from_static(b"frame-0"));
}

#[tokio::test]
async fn second_share_waits_for_first_to_stop() {
    let h = harness(single_share_config());
    let channel = Uuid::new_v4();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    h.server.join(first, channel, None).await.unwrap();
    let (_peer, mut events) = h.server.join(second, channel, None).await.unwrap();
    let _ = next_event(&mut events).await; // room state

    h.server
        .start_screen_share(first, Quality::Medium, false, "Display 1".into())
        .await
        .unwrap();
    let _ = next_event(&mut events).await; // share started

    assert!(matches!(
        h.server
            .start_screen_share(second, Quality::Medium, false, "Display 2".into())
            .await,
        Err(VoiceError::LimitReached)
    ));

    h.server.stop_screen_share(first).await.unwrap();
    match next_event(&mut events).await {
        VoiceEvent::ScreenShareStopped { reason, user_id, .. } => {
            assert_eq!(reason, StopReason::UserStopped);
            assert_eq!(user_id, first);
        }
        other => panic!("expected stop event, got {other:?}"),
    }

    // Retry after the stop event succeeds.
    h.server
        .start_screen_share(second, Quality::Medium, false, "Display 2".into())
        .await
        .unwrap();
}

#[tokio::test]
async fn crashed_holder_slot_is_reclaimed_by_ttl() {
    let h = harness(single_share_config());
    let channel = Uuid::new_v4();
    let user = Uuid::new_v4();

    // A holder on a crashed instance claimed the slot but never released it.
    h.slots
        .try_acquire(channel, 1, Duration::from_millis(30))
        .await
        .unwrap();

    h.server.join(user, channel, None).await.unwrap();
    assert!(matches!(
        h.server
            .start_screen_share(user, Quality::Medium, false, "Display 1".into())
            .await,
        Err(VoiceError::LimitReached)
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.server
        .start_screen_share(user, Quality::Medium, false, "Display 1".into())
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_acquires_admit_exactly_the_limit() {
    let slots = Arc::new(MemorySlotStore::new());
    let channel = Uuid::new_v4();
    let max = 2u32;

    let mut handles = Vec::new();
    for _ in 0..(max + 1) {
        let slots = slots.clone();
        handles.push(tokio::spawn(async move {
            slots
                .try_acquire(channel, max, Duration::from_secs(300))
                .await
                .unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, max);
    assert_eq!(slots.current(channel).await.unwrap(), max);
}

/// Fails the first `failures` persists, then succeeds.
struct FlakyStore {
    failures: u32,
    calls: AtomicU32,
    inner: MemorySessionStore,
}

#[async_trait]
impl SessionStore for FlakyStore {
    async fn persist(&self, record: &VoiceSessionRecord) -> Result<(), SessionStoreError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(SessionStoreError::Unavailable("connection reset".into()));
        }
        self.inner.persist(record).await
    }
}

fn flaky_harness(failures: u32) -> (Arc<VoiceServer>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore {
        failures,
        calls: AtomicU32::new(0),
        inner: MemorySessionStore::new(),
    });
    let config = VoiceServerConfig {
        backoff: BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        },
        ..VoiceServerConfig::default()
    };
    let server = Arc::new(VoiceServer::new(
        config,
        Arc::new(MemorySlotStore::new()),
        store.clone(),
        Arc::new(AllowAll),
        Arc::new(ChannelSinkFactory::new(64)),
    ));
    (server, store)
}

#[tokio::test]
async fn session_survives_two_transient_store_failures() {
    let (server, store) = flaky_harness(2);
    let user = Uuid::new_v4();

    server.join(user, Uuid::new_v4(), None).await.unwrap();
    let handle = server.leave(user).await.unwrap();
    assert_eq!(handle.await.unwrap(), SessionState::Finalized);

    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.inner.records().len(), 1);
    assert_eq!(store.inner.records()[0].user_id, user);
    assert!(server.failed_sessions().is_empty());
}

#[tokio::test]
async fn exhausted_retries_leave_session_queryable() {
    let (server, store) = flaky_harness(10);
    let user = Uuid::new_v4();

    server.join(user, Uuid::new_v4(), None).await.unwrap();
    let handle = server.leave(user).await.unwrap();
    assert_eq!(handle.await.unwrap(), SessionState::FinalizationFailed);

    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    assert!(store.inner.records().is_empty());
    let failed = server.failed_sessions();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].user_id, user);
}

#[tokio::test]
async fn disconnect_tears_down_tracks_and_persists_session() {
    let h = harness(VoiceServerConfig::default());
    let channel = Uuid::new_v4();
    let sharer = Uuid::new_v4();
    let viewer = Uuid::new_v4();

    h.server.join(sharer, channel, None).await.unwrap();
    h.server
        .start_screen_share(sharer, Quality::Medium, true, "Display 1".into())
        .await
        .unwrap();

    let (_feed_v, video) = ChannelSource::new(8);
    let (kf_v, _rx_v) = KeyframeRequester::channel(4);
    h.server
        .publish(sharer, TrackSource::ScreenVideo, video, kf_v)
        .unwrap();
    let (_feed_a, audio) = ChannelSource::new(8);
    let (kf_a, _rx_a) = KeyframeRequester::channel(4);
    h.server
        .publish(sharer, TrackSource::ScreenAudio, audio, kf_a)
        .unwrap();

    let (_peer, mut events) = h.server.join(viewer, channel, None).await.unwrap();
    let _ = next_event(&mut events).await; // room state

    let handle = h.server.leave(sharer).await.unwrap();
    assert_eq!(handle.await.unwrap(), SessionState::Finalized);

    // Viewer hears about the share ending before the leave.
    match next_event(&mut events).await {
        VoiceEvent::ScreenShareStopped { reason, .. } => {
            assert_eq!(reason, StopReason::Disconnected);
        }
        other => panic!("expected stop event, got {other:?}"),
    }
    assert!(matches!(
        next_event(&mut events).await,
        VoiceEvent::UserLeft { user_id, .. } if user_id == sharer
    ));

    assert!(!h.server.router().is_publishing(sharer, TrackSource::ScreenVideo));
    assert!(!h.server.router().is_publishing(sharer, TrackSource::ScreenAudio));
    assert_eq!(h.sessions.records().len(), 1);
    assert_eq!(h.sessions.records()[0].user_id, sharer);
}
