//! Track routing — forwards published media packets to subscribers.
//!
//! One forwarding task per published track reads packets into a reusable
//! buffer and writes them to every subscriber's sink. The subscription table
//! is a sharded concurrent map keyed by (publisher, source); per-key
//! subscriber lists sit behind short-critical-section locks that are never
//! held across an await, so the packet hot path never queues behind
//! administrative subscribe/unsubscribe traffic on other keys.
//!
//! Sinks are non-blocking. A failed send is logged and skipped; a subscriber
//! that fails several sends in a row is dropped from the fan-out entirely so
//! a stalled client cannot churn the loop forever.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::track::{TrackKey, TrackSource};

/// Default forwarding buffer size (MTU-sized).
pub const DEFAULT_MAX_PACKET_BYTES: usize = 1500;

/// Default number of consecutive failed sends before a subscriber is dropped.
pub const DEFAULT_SINK_FAILURE_LIMIT: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no published track for ({0}, {1:?})")]
    NotPublishing(Uuid, TrackSource),

    #[error("track already published for ({0}, {1:?})")]
    AlreadyPublishing(Uuid, TrackSource),

    #[error("packet of {got} bytes exceeds the {max}-byte forwarding buffer")]
    PacketTooLarge { got: usize, max: usize },

    #[error("media source error: {0}")]
    Source(String),
}

/// Non-blocking write failure to a subscriber sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink full")]
    Full,
    #[error("sink closed")]
    Closed,
}

/// Outbound sink for one subscriber of one track.
///
/// `try_send` must never block: the forwarding loop calls it while holding
/// the fan-out read lock. A slow subscriber surfaces as `Full`.
pub trait MediaSink: Send + Sync {
    fn try_send(&self, packet: &[u8]) -> Result<(), SinkError>;
}

/// Inbound packet stream for one published track.
#[async_trait]
pub trait MediaSource: Send {
    /// Read the next packet into `buf`, returning its length, or `None` once
    /// the stream has ended.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, RouterError>;
}

/// Builds an outbound sink for a subscriber onto a publisher's track.
/// Implemented by the media transport layer; invoked whenever the SFU
/// auto-subscribes a peer.
pub trait SinkFactory: Send + Sync {
    fn sink_for(
        &self,
        subscriber_id: Uuid,
        publisher_id: Uuid,
        source: TrackSource,
    ) -> Arc<dyn MediaSink>;
}

/// A request for the publisher's encoder to emit a keyframe (PLI).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyframeRequest {
    pub publisher_id: Uuid,
    pub source: TrackSource,
}

/// Non-blocking handle for sending keyframe requests back to a publisher.
#[derive(Clone)]
pub struct KeyframeRequester {
    tx: mpsc::Sender<KeyframeRequest>,
}

impl KeyframeRequester {
    /// Create a requester and the receiving end the publisher's transport
    /// drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<KeyframeRequest>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn request(&self, publisher_id: Uuid, source: TrackSource) {
        let req = KeyframeRequest {
            publisher_id,
            source,
        };
        if let Err(e) = self.tx.try_send(req) {
            warn!(
                publisher = %publisher_id,
                source = ?source,
                error = %e,
                "Failed to deliver keyframe request"
            );
        }
    }
}

struct SubscriberEntry {
    subscriber_id: Uuid,
    sink: Arc<dyn MediaSink>,
    consecutive_failures: AtomicU32,
}

/// Fan-out state for one published track.
struct TrackFanout {
    publisher_id: Uuid,
    source: TrackSource,
    subscribers: RwLock<Vec<SubscriberEntry>>,
    keyframe: KeyframeRequester,
    stop: Notify,
}

impl TrackFanout {
    /// Forward one packet to every subscriber. Failures are per-subscriber:
    /// logged, counted, and skipped, never fatal to the rest of the list.
    fn forward(&self, packet: &[u8], failure_limit: u32) {
        let mut over_limit = false;
        {
            let subs = self.subscribers.read();
            for entry in subs.iter() {
                match entry.sink.try_send(packet) {
                    Ok(()) => {
                        entry.consecutive_failures.store(0, Ordering::Relaxed);
                    }
                    Err(e) => {
                        let failures =
                            entry.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            publisher = %self.publisher_id,
                            source = ?self.source,
                            subscriber = %entry.subscriber_id,
                            failures,
                            error = %e,
                            "Failed to forward packet to subscriber"
                        );
                        if failures >= failure_limit {
                            over_limit = true;
                        }
                    }
                }
            }
        }

        if over_limit {
            let mut subs = self.subscribers.write();
            subs.retain(|entry| {
                let stalled =
                    entry.consecutive_failures.load(Ordering::Relaxed) >= failure_limit;
                if stalled {
                    warn!(
                        publisher = %self.publisher_id,
                        source = ?self.source,
                        subscriber = %entry.subscriber_id,
                        "Dropping stalled subscriber from fan-out"
                    );
                }
                !stalled
            });
        }
    }
}

/// Routes packets from publishers to subscribers, keyed by
/// (publisher, source).
///
/// Owned by the SFU instance and injectable, so tests construct isolated
/// routers per case.
pub struct TrackRouter {
    tracks: DashMap<TrackKey, Arc<TrackFanout>>,
    max_packet_bytes: usize,
    sink_failure_limit: u32,
}

impl TrackRouter {
    #[must_use]
    pub fn new(max_packet_bytes: usize, sink_failure_limit: u32) -> Self {
        Self {
            tracks: DashMap::new(),
            max_packet_bytes,
            sink_failure_limit,
        }
    }

    /// Register a track and spawn its forwarding task.
    ///
    /// The task owns one reusable buffer for its lifetime and exits when the
    /// source ends or the track is unpublished. The returned handle completes
    /// when forwarding has fully stopped.
    pub fn publish(
        self: &Arc<Self>,
        publisher_id: Uuid,
        source: TrackSource,
        mut stream: impl MediaSource + 'static,
        keyframe: KeyframeRequester,
    ) -> Result<JoinHandle<()>, RouterError> {
        let key = (publisher_id, source);
        let fanout = Arc::new(TrackFanout {
            publisher_id,
            source,
            subscribers: RwLock::new(Vec::new()),
            keyframe,
            stop: Notify::new(),
        });

        match self.tracks.entry(key) {
            Entry::Occupied(_) => {
                return Err(RouterError::AlreadyPublishing(publisher_id, source));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fanout.clone());
            }
        }

        debug!(publisher = %publisher_id, source = ?source, "Track published");

        let router = Arc::clone(self);
        let failure_limit = self.sink_failure_limit;
        let mut buf = vec![0u8; self.max_packet_bytes];

        let handle = tokio::spawn(async move {
            loop {
                let len = tokio::select! {
                    _ = fanout.stop.notified() => break,
                    next = stream.recv(&mut buf) => match next {
                        Ok(Some(len)) => len,
                        Ok(None) => break,
                        Err(e) => {
                            debug!(
                                publisher = %publisher_id,
                                source = ?source,
                                error = %e,
                                "Media source ended"
                            );
                            break;
                        }
                    },
                };
                fanout.forward(&buf[..len], failure_limit);
            }

            // The source ended on its own or unpublish fired. Clear the table
            // entry only if it still belongs to this generation of the track.
            router
                .tracks
                .remove_if(&key, |_, current| Arc::ptr_eq(current, &fanout));
            debug!(publisher = %publisher_id, source = ?source, "Forwarding stopped");
        });

        Ok(handle)
    }

    /// Add a subscriber to a track's fan-out.
    ///
    /// For video sources this also requests a keyframe from the publisher, so
    /// a late joiner is not stuck on a frozen frame until the next natural
    /// keyframe. Re-subscribing replaces the existing sink.
    pub fn subscribe(
        &self,
        subscriber_id: Uuid,
        publisher_id: Uuid,
        source: TrackSource,
        sink: Arc<dyn MediaSink>,
    ) -> Result<(), RouterError> {
        let fanout = self
            .tracks
            .get(&(publisher_id, source))
            .ok_or(RouterError::NotPublishing(publisher_id, source))?;

        {
            let mut subs = fanout.subscribers.write();
            if let Some(existing) = subs
                .iter_mut()
                .find(|entry| entry.subscriber_id == subscriber_id)
            {
                existing.sink = sink;
                existing.consecutive_failures.store(0, Ordering::Relaxed);
            } else {
                subs.push(SubscriberEntry {
                    subscriber_id,
                    sink,
                    consecutive_failures: AtomicU32::new(0),
                });
            }
        }

        if source.is_video() {
            fanout.keyframe.request(publisher_id, source);
        }

        debug!(
            subscriber = %subscriber_id,
            publisher = %publisher_id,
            source = ?source,
            "Subscriber added"
        );
        Ok(())
    }

    /// Remove a subscriber from a track's fan-out. Idempotent: removing an
    /// unknown subscriber (or from an unpublished track) is a no-op.
    ///
    /// Once this returns, no further packets reach the subscriber: removal
    /// waits out any in-flight forward cycle on this key.
    pub fn unsubscribe(&self, subscriber_id: Uuid, publisher_id: Uuid, source: TrackSource) {
        if let Some(fanout) = self.tracks.get(&(publisher_id, source)) {
            fanout
                .subscribers
                .write()
                .retain(|entry| entry.subscriber_id != subscriber_id);
        }
    }

    /// Stop forwarding a track and clear its subscribers. Idempotent.
    pub fn unpublish(&self, publisher_id: Uuid, source: TrackSource) {
        if let Some((_, fanout)) = self.tracks.remove(&(publisher_id, source)) {
            // notify_one stores a permit, so a stop that fires while the task
            // is inside forward() is picked up on its next select cycle.
            fanout.stop.notify_one();
            fanout.subscribers.write().clear();
            debug!(publisher = %publisher_id, source = ?source, "Track unpublished");
        }
    }

    /// Unpublish every track of a publisher (on leave/disconnect).
    pub fn remove_publisher(&self, publisher_id: Uuid) {
        for source in TrackSource::all() {
            self.unpublish(publisher_id, source);
        }
    }

    /// Remove a subscriber from every fan-out it appears in (on
    /// leave/disconnect).
    pub fn remove_subscriber_everywhere(&self, subscriber_id: Uuid) {
        for fanout in self.tracks.iter() {
            fanout
                .subscribers
                .write()
                .retain(|entry| entry.subscriber_id != subscriber_id);
        }
    }

    /// Whether a track is currently published.
    #[must_use]
    pub fn is_publishing(&self, publisher_id: Uuid, source: TrackSource) -> bool {
        self.tracks.contains_key(&(publisher_id, source))
    }

    /// Active track keys for a publisher.
    #[must_use]
    pub fn published_sources(&self, publisher_id: Uuid) -> Vec<TrackSource> {
        TrackSource::all()
            .into_iter()
            .filter(|source| self.is_publishing(publisher_id, *source))
            .collect()
    }

    /// Number of subscribers on a track (zero if unpublished).
    #[must_use]
    pub fn subscriber_count(&self, publisher_id: Uuid, source: TrackSource) -> usize {
        self.tracks
            .get(&(publisher_id, source))
            .map_or(0, |fanout| fanout.subscribers.read().len())
    }
}

impl Default for TrackRouter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_BYTES, DEFAULT_SINK_FAILURE_LIMIT)
    }
}

/// Channel-backed [`MediaSink`]: packets are copied into a bounded queue the
/// subscriber's transport drains. A full queue surfaces as `SinkError::Full`
/// rather than blocking the forwarding loop.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl MediaSink for ChannelSink {
    fn try_send(&self, packet: &[u8]) -> Result<(), SinkError> {
        self.tx
            .try_send(Bytes::copy_from_slice(packet))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => SinkError::Full,
                mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
            })
    }
}

/// Channel-backed [`MediaSource`] fed by the media transport.
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSource {
    #[must_use]
    pub fn new(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }
}

#[async_trait]
impl MediaSource for ChannelSource {
    async fn recv(&mut self, buf: &mut [u8]) -> Result<Option<usize>, RouterError> {
        match self.rx.recv().await {
            Some(packet) => {
                if packet.len() > buf.len() {
                    return Err(RouterError::PacketTooLarge {
                        got: packet.len(),
                        max: buf.len(),
                    });
                }
                buf[..packet.len()].copy_from_slice(&packet);
                Ok(Some(packet.len()))
            }
            None => Ok(None),
        }
    }
}

/// [`SinkFactory`] producing [`ChannelSink`]s and parking their receivers for
/// the transport layer to claim. Used by the in-process transport bridge and
/// by tests.
#[derive(Default)]
pub struct ChannelSinkFactory {
    capacity: usize,
    receivers: DashMap<(Uuid, Uuid, TrackSource), mpsc::Receiver<Bytes>>,
}

impl ChannelSinkFactory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            receivers: DashMap::new(),
        }
    }

    /// Claim the receiving end for a (subscriber, publisher, source) sink.
    pub fn take_receiver(
        &self,
        subscriber_id: Uuid,
        publisher_id: Uuid,
        source: TrackSource,
    ) -> Option<mpsc::Receiver<Bytes>> {
        self.receivers
            .remove(&(subscriber_id, publisher_id, source))
            .map(|(_, rx)| rx)
    }
}

impl SinkFactory for ChannelSinkFactory {
    fn sink_for(
        &self,
        subscriber_id: Uuid,
        publisher_id: Uuid,
        source: TrackSource,
    ) -> Arc<dyn MediaSink> {
        let capacity = if self.capacity == 0 { 64 } else { self.capacity };
        let (sink, rx) = ChannelSink::new(capacity);
        self.receivers
            .insert((subscriber_id, publisher_id, source), rx);
        Arc::new(sink)
    }
}
