use presence_core::{Embedding, EmbeddingCache, FaceProfile, Matcher};
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::store::AttendanceStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub store: AttendanceStore,
    pub cache: Arc<EmbeddingCache>,
    pub matcher: Matcher,
    pub engine: EngineHandle,
}

/// D-Bus interface for the Presence check-in daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
pub struct PresenceService {
    pub state: Arc<Mutex<AppState>>,
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Reload the gallery from the store for the configured tenant.
    ///
    /// Returns the number of enrolled profiles now in RAM.
    async fn refresh_gallery(&self) -> zbus::fdo::Result<u32> {
        let state = self.state.lock().await;
        let profiles = state
            .store
            .load_all_profiles(&state.config.tenant)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "gallery refresh failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;
        let count = profiles.len() as u32;
        state.cache.refresh(profiles);
        tracing::info!(count, tenant = %state.config.tenant, "gallery refreshed");
        Ok(count)
    }

    /// Empty the in-RAM gallery and cancel any in-progress session.
    ///
    /// Called on tenant logout: stale identities must never answer queries
    /// for the next tenant.
    async fn clear_gallery(&self) -> zbus::fdo::Result<()> {
        let state = self.state.lock().await;
        state.cache.clear();
        state
            .engine
            .force_reset()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        tracing::info!("gallery cleared");
        Ok(())
    }

    /// Enroll a new identity from a pre-extracted embedding (JSON array of
    /// floats). Rejects duplicates of an already-enrolled face.
    ///
    /// Returns the identity ID on success.
    async fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        embedding_json: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity_id, display_name, "enroll requested");

        let raw: Vec<f32> = serde_json::from_str(embedding_json)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad embedding JSON: {e}")))?;
        let embedding = Embedding::from_raw(raw)
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

        let state = self.state.lock().await;

        if let Some(existing) =
            state
                .matcher
                .detect_duplicate(&embedding, state.config.duplicate_threshold)
        {
            tracing::warn!(identity_id, existing = %existing, "enroll rejected — duplicate face");
            return Err(zbus::fdo::Error::Failed(format!(
                "embedding duplicates enrolled identity '{existing}'"
            )));
        }

        let profile = FaceProfile {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            embedding,
            metadata: None,
        };
        state
            .store
            .insert_profile(&state.config.tenant, &profile)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "enroll: store insert failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        // Republish so the kiosk recognizes the new face immediately.
        let profiles = state
            .store
            .load_all_profiles(&state.config.tenant)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        state.cache.refresh(profiles);

        tracing::info!(identity_id, "enrolled successfully");
        Ok(identity_id.to_string())
    }

    /// Remove an enrolled profile by identity ID.
    async fn remove_profile(&self, identity_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(identity_id, "remove_profile requested");
        let state = self.state.lock().await;
        let removed = state
            .store
            .remove_profile(&state.config.tenant, identity_id)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if removed {
            let profiles = state
                .store
                .load_all_profiles(&state.config.tenant)
                .await
                .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
            state.cache.refresh(profiles);
            tracing::info!(identity_id, "profile removed");
        } else {
            tracing::warn!(identity_id, "profile not found for tenant");
        }
        Ok(removed)
    }

    /// List enrolled profiles for the configured tenant as JSON.
    async fn list_profiles(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let profiles = state
            .store
            .list_profiles(&state.config.tenant)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&profiles).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// The most recent check-ins as JSON, newest first.
    async fn recent_checkins(&self, limit: u32) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let records = state
            .store
            .recent_checkins(limit)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Cancel any in-progress check-in session.
    async fn force_reset(&self) -> zbus::fdo::Result<()> {
        let state = self.state.lock().await;
        state
            .engine
            .force_reset()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let profile_count = state.store.count_profiles().await.unwrap_or(0);
        let last_result = state.engine.results().borrow().clone();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "tenant": state.config.tenant,
            "profiles_enrolled": profile_count,
            "gallery_size": state.cache.len(),
            "gallery_version": state.cache.version(),
            "rejection_threshold": state.config.rejection_threshold,
            "duplicate_threshold": state.config.duplicate_threshold,
            "cooldown_secs": state.config.cooldown_secs,
            "last_result": last_result,
        })
        .to_string())
    }
}
