//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config.toml > defaults

use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration.
///
/// # Panics
/// Panics if config has not been initialized via [`init`].
pub fn get() -> &'static AppConfig {
    CONFIG
        .get()
        .expect("Config not initialized. Call chorus_common::config::init() first.")
}

/// Initialize the global configuration from environment.
///
/// Should be called once at application startup, before any other code accesses config.
pub fn init() -> Result<&'static AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8090)?
        .set_default("database.max_connections", 20)?
        .set_default("database.min_connections", 5)?
        .set_default("voice.max_screen_shares", 2)?
        .set_default("voice.slot_ttl_secs", 300)?
        .set_default("voice.slot_store_fail_policy", "fail_closed")?
        .set_default("voice.sink_failure_limit", 5)?
        .set_default("voice.max_packet_bytes", 1500)?
        .set_default("voice.finalize_max_attempts", 3)?
        .set_default("voice.finalize_backoff_ms", 100)?
        // Optional config file
        .add_source(config::File::with_name("config").required(false))
        // Environment variables (CHORUS_SERVER__HOST, CHORUS_DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("CHORUS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub voice: VoiceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Tunables for the voice SFU.
#[derive(Debug, Deserialize, Clone)]
pub struct VoiceConfig {
    /// Maximum concurrent screen shares per channel.
    pub max_screen_shares: u32,
    /// TTL on the shared slot counter so stale slots self-heal after a crash.
    pub slot_ttl_secs: u64,
    /// What to do when the slot store is unreachable: "fail_closed" rejects
    /// new shares, "fail_open" admits them without a limit.
    pub slot_store_fail_policy: String,
    /// A subscriber is dropped from a track's fan-out after this many
    /// consecutive failed sends.
    pub sink_failure_limit: u32,
    /// Size of the reusable per-track forwarding buffer.
    pub max_packet_bytes: usize,
    /// Session finalization retry attempts before giving up.
    pub finalize_max_attempts: u32,
    /// Initial finalization retry delay; doubles on each attempt.
    pub finalize_backoff_ms: u64,
}
