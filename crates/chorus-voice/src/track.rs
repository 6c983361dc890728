//! Track identification.
//!
//! A peer may publish several simultaneous tracks (microphone plus screen
//! video plus optional screen audio), so routing is keyed by publisher *and*
//! source, not publisher alone.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// The source of a published track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    /// Microphone audio.
    Microphone,
    /// Screen-share video.
    ScreenVideo,
    /// Screen-share system audio.
    ScreenAudio,
}

impl TrackSource {
    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        match self {
            Self::Microphone | Self::ScreenAudio => TrackKind::Audio,
            Self::ScreenVideo => TrackKind::Video,
        }
    }

    /// Video sources need a keyframe request when a subscriber joins
    /// mid-stream; audio frames are independently decodable.
    #[must_use]
    pub const fn is_video(&self) -> bool {
        matches!(self.kind(), TrackKind::Video)
    }

    #[must_use]
    pub const fn is_audio(&self) -> bool {
        matches!(self.kind(), TrackKind::Audio)
    }

    #[must_use]
    pub const fn all() -> [Self; 3] {
        [Self::Microphone, Self::ScreenVideo, Self::ScreenAudio]
    }
}

/// Identifies one forwarding fan-out list: (publisher, source).
pub type TrackKey = (Uuid, TrackSource);
