//! Screen-share quality tiers.
//!
//! Each tier fixes resolution, frame rate, and bitrate targets. The tier set
//! is part of the client contract; `premium` may additionally be gated by an
//! external entitlement check, which is not enforced here.

use serde::{Deserialize, Serialize};

/// Video quality tier for screen sharing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    /// 480p @ 15fps — fallback for poor connections.
    Low,
    /// 720p @ 30fps — the default.
    #[default]
    Medium,
    /// 1080p @ 30fps.
    High,
    /// 1080p @ 60fps — gated by an external entitlement.
    Premium,
}

impl Quality {
    #[must_use]
    pub const fn max_width(&self) -> u32 {
        match self {
            Self::Low => 854,
            Self::Medium => 1280,
            Self::High | Self::Premium => 1920,
        }
    }

    #[must_use]
    pub const fn max_height(&self) -> u32 {
        match self {
            Self::Low => 480,
            Self::Medium => 720,
            Self::High | Self::Premium => 1080,
        }
    }

    #[must_use]
    pub const fn max_fps(&self) -> u32 {
        match self {
            Self::Low => 15,
            Self::Medium | Self::High => 30,
            Self::Premium => 60,
        }
    }

    /// Bitrate the encoder should aim for under normal conditions, bits/s.
    #[must_use]
    pub const fn target_bitrate(&self) -> u32 {
        match self {
            Self::Low => 750_000,
            Self::Medium => 2_000_000,
            Self::High => 4_000_000,
            Self::Premium => 6_000_000,
        }
    }

    /// Hard upper bitrate limit, bits/s.
    #[must_use]
    pub const fn max_bitrate(&self) -> u32 {
        match self {
            Self::Low => 1_000_000,
            Self::Medium => 3_000_000,
            Self::High => 5_000_000,
            Self::Premium => 8_000_000,
        }
    }

    #[must_use]
    pub const fn requires_entitlement(&self) -> bool {
        matches!(self, Self::Premium)
    }

    /// Next lower tier, saturating at `Low`. Used for adaptive downgrades.
    #[must_use]
    pub const fn downgrade(&self) -> Self {
        match self {
            Self::Premium => Self::High,
            Self::High => Self::Medium,
            Self::Medium | Self::Low => Self::Low,
        }
    }

    #[must_use]
    pub const fn all() -> [Self; 4] {
        [Self::Low, Self::Medium, Self::High, Self::Premium]
    }
}
