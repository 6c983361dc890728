//! Voice signaling WebSocket handler.
//!
//! One socket per client, carrying control traffic only:
//!
//! 1. Client connects to /voice/ws?user_id=...
//! 2. Sends "Join" with channel_id
//! 3. Server registers the peer and replies with RoomState
//! 4. Structural events (joins, shares, mutes) stream down the socket
//! 5. Client sends "Leave" or disconnects → teardown + session finalize
//!
//! Authentication happens upstream at the edge proxy, which injects the
//! verified user id. Media flows over the transport layer, never here.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::VoiceError;
use crate::events::VoiceEvent;
use crate::quality::Quality;
use crate::server::VoiceServer;

/// Shared state for all voice signaling connections.
#[derive(Clone)]
pub struct VoiceAppState {
    pub server: Arc<VoiceServer>,
}

/// Client → server signaling messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d")]
pub enum ClientSignal {
    /// Join a voice channel, leaving the current one if any.
    Join {
        channel_id: Uuid,
        guild_id: Option<Uuid>,
    },

    /// Leave the current voice channel.
    Leave,

    /// Update self mute state.
    Mute {
        muted: bool,
    },

    /// Voice activity detection result.
    Speaking {
        speaking: bool,
    },

    StartScreenShare {
        quality: Quality,
        has_audio: bool,
        source_label: String,
    },

    StopScreenShare,

    ChangeScreenShareQuality {
        quality: Quality,
    },
}

#[derive(Debug, Deserialize)]
struct WsParams {
    user_id: Uuid,
}

/// Build the voice signaling WebSocket router.
pub fn build_router(state: VoiceAppState) -> Router {
    Router::new()
        .route("/voice/ws", get(ws_handler))
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<VoiceAppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_voice_connection(socket, state, params.user_id))
}

/// Resolve the next downstream event, parking forever while not joined.
async fn next_event(events: &mut Option<mpsc::Receiver<VoiceEvent>>) -> Option<VoiceEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a single voice signaling connection.
async fn handle_voice_connection(socket: WebSocket, state: VoiceAppState, user_id: Uuid) {
    let (mut sender, mut receiver) = socket.split();
    let mut events: Option<mpsc::Receiver<VoiceEvent>> = None;
    let mut joined = false;

    tracing::debug!(user = %user_id, "Voice WebSocket connected");

    loop {
        tokio::select! {
            event = next_event(&mut events) => {
                match event {
                    Some(event) => send_event(&mut sender, &event).await,
                    // Server-side teardown (e.g. force disconnect) closed
                    // the queue.
                    None => break,
                }
            }

            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let signal = match serde_json::from_str::<ClientSignal>(&text) {
                            Ok(s) => s,
                            Err(e) => {
                                send_event(
                                    &mut sender,
                                    &VoiceEvent::Error {
                                        code: "invalid_message".into(),
                                        message: format!("Invalid message: {e}"),
                                    },
                                )
                                .await;
                                continue;
                            }
                        };

                        if let Err(e) =
                            dispatch(&state, user_id, signal, &mut events, &mut joined).await
                        {
                            send_event(
                                &mut sender,
                                &VoiceEvent::Error {
                                    code: e.code().into(),
                                    message: e.to_string(),
                                },
                            )
                            .await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    // Cleanup on disconnect; an explicit Leave already removed the peer.
    if joined {
        let _ = state.server.leave(user_id).await;
    }
    tracing::debug!(user = %user_id, "Voice WebSocket disconnected");
}

async fn dispatch(
    state: &VoiceAppState,
    user_id: Uuid,
    signal: ClientSignal,
    events: &mut Option<mpsc::Receiver<VoiceEvent>>,
    joined: &mut bool,
) -> Result<(), VoiceError> {
    match signal {
        ClientSignal::Join {
            channel_id,
            guild_id,
        } => {
            let (_peer, rx) = state.server.join(user_id, channel_id, guild_id).await?;
            *events = Some(rx);
            *joined = true;
        }
        ClientSignal::Leave => {
            let _ = state.server.leave(user_id).await?;
            *events = None;
            *joined = false;
        }
        ClientSignal::Mute { muted } => {
            state.server.set_muted(user_id, muted)?;
        }
        ClientSignal::Speaking { speaking } => {
            state.server.set_speaking(user_id, speaking)?;
        }
        ClientSignal::StartScreenShare {
            quality,
            has_audio,
            source_label,
        } => {
            state
                .server
                .start_screen_share(user_id, quality, has_audio, source_label)
                .await?;
        }
        ClientSignal::StopScreenShare => {
            state.server.stop_screen_share(user_id).await?;
        }
        ClientSignal::ChangeScreenShareQuality { quality } => {
            state.server.change_screen_share_quality(user_id, quality)?;
        }
    }
    Ok(())
}

/// Send one event down the socket, dropping it if serialization or the
/// socket fails; the receive loop notices a dead socket on its next poll.
async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &VoiceEvent) {
    if let Ok(json) = serde_json::to_string(event) {
        let _ = sender.send(Message::Text(json.into())).await;
    }
}
