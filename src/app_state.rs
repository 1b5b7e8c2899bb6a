use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::services::{
    batch_tracker::BatchTracker, orchestrator::ImageProcessor, session::SessionStore,
    stager::TempAssetStager, uploads::UploadStore,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionStore>,
    pub uploads: Arc<UploadStore>,
    pub stager: Arc<TempAssetStager>,
    pub tracker: Arc<BatchTracker>,
    pub processor: ImageProcessor,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        sessions: SessionStore,
        uploads: UploadStore,
        stager: Arc<TempAssetStager>,
        tracker: BatchTracker,
        processor: ImageProcessor,
    ) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(sessions),
            uploads: Arc::new(uploads),
            stager,
            tracker: Arc::new(tracker),
            processor,
        }
    }

    /// Start the periodic temp-asset sweep and the session/batch expiry sweep.
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        let stager = Arc::clone(&self.stager).spawn_sweeper(self.config.temp_sweep_interval());

        let state = self.clone();
        let interval = Duration::from_secs(60);
        let expiry = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                state.sweep_sessions().await;
            }
        });

        vec![stager, expiry]
    }

    /// Expire idle batches and sessions, deleting the uploads of expired sessions.
    pub async fn sweep_sessions(&self) {
        self.tracker.sweep_expired().await;
        for (session_id, files) in self.sessions.sweep_expired().await {
            self.tracker.clear_session(&session_id).await;
            self.uploads.delete_all(&files).await;
            tracing::info!(session_id = %session_id, files = files.len(), "Expired idle session");
        }
    }
}
