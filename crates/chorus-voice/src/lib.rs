//! # chorus-voice
//!
//! Voice and screen-share backend for Chorus: a Selective Forwarding Unit.
//!
//! Architecture:
//! ```text
//!   Client A ──publish──▶ SFU ──forward──▶ Client B
//!   Client B ──publish──▶ SFU ──forward──▶ Client A
//!   Client C ──publish──▶ SFU ──forward──▶ Client A, Client B
//! ```
//!
//! Each participant publishes its media tracks (microphone, screen video,
//! optional screen audio) to the SFU, which forwards the opaque packets to
//! every subscriber in the channel. No transcoding or mixing — the server
//! just routes packets, so forwarding stays cheap and clients keep control
//! over volume and layout.
//!
//! The media transport (DTLS/SRTP, codecs, congestion control) is a separate
//! layer; this crate sees packet streams and non-blocking sinks. What lives
//! here:
//! - the track router: keyed fan-out with per-track forwarding tasks
//! - the peer registry: who is in which channel, with what flags
//! - admission control for concurrent screen shares (shared TTL counter)
//! - crash-safe session finalization with retry
//! - the signaling event broadcaster and its WebSocket surface

pub mod admission;
pub mod broadcast;
pub mod error;
pub mod events;
pub mod handler;
pub mod lifecycle;
pub mod quality;
pub mod registry;
pub mod router;
pub mod screen_share;
pub mod server;
pub mod track;

pub use error::VoiceError;
pub use events::{ParticipantInfo, RoomSnapshot, StopReason, VoiceEvent};
pub use quality::Quality;
pub use screen_share::ScreenShareSession;
pub use server::{VoiceServer, VoiceServerConfig};
pub use track::{TrackKey, TrackKind, TrackSource};
