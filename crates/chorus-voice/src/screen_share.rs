//! Screen-share session state and validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::VoiceError;
use crate::quality::Quality;

/// Maximum length of a screen-share source label.
const MAX_SOURCE_LABEL_LEN: usize = 255;

/// One active screen share. Exactly one may exist per (publisher, channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenShareSession {
    /// User who is sharing.
    pub user_id: Uuid,
    pub channel_id: Uuid,
    /// Current quality tier.
    pub quality: Quality,
    /// Whether system audio is included.
    pub has_audio: bool,
    /// Label of the shared source (e.g. "Display 1", "Firefox").
    pub source_label: String,
    pub started_at: DateTime<Utc>,
}

impl ScreenShareSession {
    #[must_use]
    pub fn new(
        user_id: Uuid,
        channel_id: Uuid,
        quality: Quality,
        has_audio: bool,
        source_label: String,
    ) -> Self {
        Self {
            user_id,
            channel_id,
            quality,
            has_audio,
            source_label,
            started_at: Utc::now(),
        }
    }
}

/// Validate a client-supplied source label.
///
/// Labels come straight from window titles and end up in other clients' UIs,
/// so the charset is an allowlist: alphanumeric, whitespace, and common
/// punctuation.
pub fn validate_source_label(label: &str) -> Result<(), VoiceError> {
    if label.len() > MAX_SOURCE_LABEL_LEN {
        return Err(VoiceError::InvalidSourceLabel);
    }
    for ch in label.chars() {
        if !ch.is_alphanumeric() && !ch.is_whitespace() && !"()-_.,:;'\"!?#@&+".contains(ch) {
            return Err(VoiceError::InvalidSourceLabel);
        }
    }
    Ok(())
}
