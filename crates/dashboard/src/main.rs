mod auth;
mod config;
mod devices;
mod poller;
mod sample;
mod state;
mod store;
mod web;

use anyhow::{Context, Result};
use std::{env, path::Path, sync::Arc};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use auth::Identity;
use devices::Devices;
use state::{AppState, SystemState};
use store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:irrigation.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let seed_sample = env::var("SEED_SAMPLE")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // ── Store ───────────────────────────────────────────────────────
    let store = Store::connect(&db_url).await?;
    store.migrate().await?;
    let devices = Devices::new(store.clone());

    // ── Config file (seed the device document) ──────────────────────
    let cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        tracing::warn!(path = %config_path, "config file not found, using defaults");
        config::Config::default()
    };
    config::apply(&cfg, &devices).await?;
    let identity = Identity::new(store.pool().clone(), cfg.session_ttl());

    let device_id = cfg.dashboard.device_id.clone();
    let display_offset = cfg.display_offset();
    tracing::info!(
        device = %device_id,
        display_offset = %display_offset,
        db = %db_url,
        "dashboard starting"
    );

    if seed_sample {
        let mut rng = fastrand::Rng::new();
        sample::seed_moisture(&devices, &device_id, OffsetDateTime::now_utc(), &mut rng)
            .await
            .context("failed to seed sample history")?;
    }

    // ── Shared state ────────────────────────────────────────────────
    let shared = SystemState::shared();
    shared
        .write()
        .await
        .record_system("dashboard started".to_string());

    let app = AppState {
        config: Arc::new(cfg),
        devices: devices.clone(),
        identity,
        shared: Arc::clone(&shared),
        display_offset,
    };

    // ── Poller ──────────────────────────────────────────────────────
    let interval = app.config.dashboard.poll_interval_sec;
    tokio::spawn(poller::run(devices, device_id, shared, interval));

    // ── Web server ──────────────────────────────────────────────────
    web::serve(app).await
}
