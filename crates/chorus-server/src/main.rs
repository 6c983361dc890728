//! # Chorus Server
//!
//! Main binary for the Chorus voice backend. Wires the storage layer
//! (PostgreSQL for session accounting, Redis for shared screen-share slot
//! counters) to the SFU and exposes the signaling WebSocket.

use std::net::SocketAddr;
use std::sync::Arc;

use chorus_db::Database;
use chorus_db::sessions::PgSessionStore;
use chorus_db::slots::RedisSlotStore;
use axum::routing::get;
use chorus_voice::handler::{VoiceAppState, build_router};
use chorus_voice::router::ChannelSinkFactory;
use chorus_voice::server::{AllowAll, VoiceServer, VoiceServerConfig};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = chorus_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chorus=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("Starting Chorus voice server v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::connect(config).await?;
    db.migrate().await?;

    let slots = Arc::new(RedisSlotStore::new(db.redis.clone()));
    let sessions = Arc::new(PgSessionStore::new(db.pg.clone()));

    // In-process transport bridge; the media layer claims its receivers from
    // the factory as peers subscribe.
    let media = Arc::new(ChannelSinkFactory::new(256));

    let server = Arc::new(VoiceServer::new(
        VoiceServerConfig::from_config(&config.voice),
        slots,
        sessions,
        Arc::new(AllowAll),
        media,
    ));

    let app = build_router(VoiceAppState { server })
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("Voice signaling listening on ws://{addr}/voice/ws");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
