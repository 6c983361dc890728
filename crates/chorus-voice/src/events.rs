//! Signaling events — the control-plane contract with clients.
//!
//! Structural state changes (joins, leaves, screen-share transitions) are
//! announced over each peer's signaling channel, separate from the media
//! path. Schemas here are stable: clients key their UI state off these
//! fields.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::quality::Quality;
use crate::screen_share::ScreenShareSession;

/// A participant as rendered in room state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: Uuid,
    pub muted: bool,
    pub speaking: bool,
    pub screen_sharing: bool,
}

/// Full room state, sent to a newly joined client so it can render
/// immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub channel_id: Uuid,
    pub participants: Vec<ParticipantInfo>,
    pub screen_shares: Vec<ScreenShareSession>,
}

/// Why a screen share ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The sharer stopped it.
    UserStopped,
    /// The sharer left or dropped off.
    Disconnected,
    /// Terminated administratively.
    Forced,
}

/// Server → client signaling events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum VoiceEvent {
    /// Sent once to a client right after it joins.
    RoomState(RoomSnapshot),

    UserJoined {
        channel_id: Uuid,
        user_id: Uuid,
    },

    UserLeft {
        channel_id: Uuid,
        user_id: Uuid,
    },

    ScreenShareStarted {
        channel_id: Uuid,
        user_id: Uuid,
        quality: Quality,
        has_audio: bool,
        source_label: String,
    },

    ScreenShareStopped {
        channel_id: Uuid,
        user_id: Uuid,
        reason: StopReason,
    },

    ScreenShareQualityChanged {
        channel_id: Uuid,
        user_id: Uuid,
        quality: Quality,
    },

    SpeakingChanged {
        channel_id: Uuid,
        user_id: Uuid,
        speaking: bool,
    },

    MuteChanged {
        channel_id: Uuid,
        user_id: Uuid,
        muted: bool,
    },

    /// Operation failure echoed back to the requesting client.
    Error {
        code: String,
        message: String,
    },
}

impl VoiceEvent {
    /// Event kind for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RoomState(_) => "room_state",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::ScreenShareStarted { .. } => "screen_share_started",
            Self::ScreenShareStopped { .. } => "screen_share_stopped",
            Self::ScreenShareQualityChanged { .. } => "screen_share_quality_changed",
            Self::SpeakingChanged { .. } => "speaking_changed",
            Self::MuteChanged { .. } => "mute_changed",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tag_content_encoded() {
        let event = VoiceEvent::ScreenShareStarted {
            channel_id: Uuid::nil(),
            user_id: Uuid::nil(),
            quality: Quality::Medium,
            has_audio: false,
            source_label: "Display 1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"screen_share_started\""));
        assert!(json.contains("\"quality\":\"medium\""));
    }

    #[test]
    fn stop_reason_strings() {
        assert_eq!(
            serde_json::to_string(&StopReason::UserStopped).unwrap(),
            "\"user_stopped\""
        );
        assert_eq!(
            serde_json::to_string(&StopReason::Disconnected).unwrap(),
            "\"disconnected\""
        );
    }

    #[test]
    fn round_trips() {
        let event = VoiceEvent::SpeakingChanged {
            channel_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            speaking: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: VoiceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "speaking_changed");
    }
}
