//! Voice service errors.
//!
//! Failures that reach a client carry a stable snake_case `code` so the UI
//! can render a specific message ("screen share limit reached") instead of a
//! blanket error.

use thiserror::Error;
use uuid::Uuid;

use crate::track::TrackSource;

/// Errors returned to the signaling layer by voice operations.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// The external permission check said no.
    #[error("no permission to screen share in this channel")]
    PermissionDenied,

    /// The channel's concurrent screen-share limit is reached.
    #[error("screen share limit reached")]
    LimitReached,

    /// The user is not connected to the voice channel.
    #[error("not in voice channel")]
    NotInChannel,

    /// The user is already connected to this voice channel.
    #[error("already in voice channel")]
    AlreadyJoined,

    /// The user already has an active screen share.
    #[error("already sharing screen")]
    AlreadySharing,

    /// The user has no active screen share to operate on.
    #[error("no active screen share")]
    NotSharing,

    /// No published track under (publisher, source).
    #[error("no published track for ({0}, {1:?})")]
    NotPublishing(Uuid, TrackSource),

    /// A track is already published under (publisher, source).
    #[error("track already published for ({0}, {1:?})")]
    AlreadyPublishing(Uuid, TrackSource),

    /// Screen-share source label failed validation.
    #[error("invalid source label")]
    InvalidSourceLabel,

    /// The signaling transport to a peer is gone.
    #[error("signaling transport unavailable")]
    TransportUnavailable,

    /// The shared slot store is unreachable and policy is fail-closed.
    #[error("slot store unavailable: {0}")]
    StoreUnavailable(String),
}

impl VoiceError {
    /// Stable machine-readable reason code for clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "no_permission",
            Self::LimitReached => "limit_reached",
            Self::NotInChannel => "not_in_channel",
            Self::AlreadyJoined => "already_joined",
            Self::AlreadySharing => "already_sharing",
            Self::NotSharing => "not_sharing",
            Self::NotPublishing(..) => "not_publishing",
            Self::AlreadyPublishing(..) => "already_publishing",
            Self::InvalidSourceLabel => "invalid_source_label",
            Self::TransportUnavailable => "transport_unavailable",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}
