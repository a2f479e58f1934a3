use anyhow::{Context, Result};
use presence_core::{EmbeddingCache, Matcher};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod embedder;
mod engine;
mod store;

use config::Config;
use dbus_interface::{AppState, PresenceService};
use embedder::OnnxEmbedder;
use store::AttendanceStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env();

    let store = AttendanceStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open store at {}", config.db_path.display()))?;

    let cache = Arc::new(EmbeddingCache::new());
    let profiles = store
        .load_all_profiles(&config.tenant)
        .await
        .context("failed to load enrolled profiles")?;
    tracing::info!(count = profiles.len(), tenant = %config.tenant, "gallery loaded");
    cache.refresh(profiles);

    let model_path = config.model_path.to_string_lossy().into_owned();
    let onnx = OnnxEmbedder::load(&model_path)
        .with_context(|| format!("failed to load embedding model from {model_path}"))?;

    let engine = engine::spawn_engine(
        cache.clone(),
        store.clone(),
        onnx,
        config.coordinator_config(),
        tokio::runtime::Handle::current(),
    );

    let matcher = Matcher::new(cache.clone());
    let session_bus = config.session_bus;
    let state = Arc::new(Mutex::new(AppState {
        config,
        store,
        cache,
        matcher,
        engine,
    }));
    let service = PresenceService { state };

    let builder = if session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name("org.freedesktop.Presence1")?
        .serve_at("/org/freedesktop/Presence1", service)?
        .build()
        .await
        .context("failed to register D-Bus service")?;

    tracing::info!("presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
