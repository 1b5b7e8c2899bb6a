//! In-memory ledger of batches and their per-image status.
//!
//! The tracker is the only writer to batch state. Every mutation takes the
//! map's write lock, so transitions for one image never interleave.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::batch::{Batch, BatchCounters, BatchProgress, BatchStatus, ImageRecord, ImageStatus};
use crate::models::processing::ProcessingResult;
use crate::models::upload::UploadedFile;
use crate::services::orchestrator::BatchObserver;

pub struct BatchTracker {
    batches: RwLock<HashMap<Uuid, Batch>>,
    ttl: Duration,
}

impl BatchTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Register a batch with every image pending. Each file may appear once.
    pub async fn create_batch(&self, session_id: &str, files: &[UploadedFile]) -> Result<Batch, TrackerError> {
        let mut seen = HashSet::with_capacity(files.len());
        if let Some(duplicate) = files.iter().find(|f| !seen.insert(f.id)) {
            return Err(TrackerError::DuplicateImage(duplicate.id));
        }

        let images: Vec<ImageRecord> = files
            .iter()
            .map(|f| ImageRecord {
                file_id: f.id,
                filename: f.filename.clone(),
                status: ImageStatus::Pending,
                error: None,
                metadata: None,
            })
            .collect();

        let mut batch = Batch {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            status: BatchStatus::Pending,
            progress: BatchCounters::default(),
            images,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_activity: Instant::now(),
        };
        batch.refresh();

        let mut batches = self.batches.write().await;
        batches.insert(batch.id, batch.clone());
        metrics::counter!("batches_created_total").increment(1);
        metrics::gauge!("active_batches").set(batches.len() as f64);
        tracing::info!(batch_id = %batch.id, session_id, total = batch.progress.total, "Batch created");

        Ok(batch)
    }

    pub async fn start_batch(&self, batch_id: Uuid) -> Result<(), TrackerError> {
        let mut batches = self.batches.write().await;
        let batch = batches.get_mut(&batch_id).ok_or(TrackerError::NotFound(batch_id))?;
        if batch.started_at.is_none() {
            batch.started_at = Some(Utc::now());
        }
        batch.last_activity = Instant::now();
        batch.refresh();
        Ok(())
    }

    /// Move one image forward. Regressions and moves out of a terminal
    /// state are rejected and leave the batch untouched.
    pub async fn update_image_status(
        &self,
        batch_id: Uuid,
        file_id: Uuid,
        status: ImageStatus,
        error: Option<String>,
    ) -> Result<BatchCounters, TrackerError> {
        self.apply(batch_id, file_id, status, |record| {
            if error.is_some() {
                record.error = error;
            }
        })
        .await
    }

    /// Record a finished result: metadata or error plus the terminal status,
    /// applied as one transition.
    pub async fn record_result(
        &self,
        batch_id: Uuid,
        file_id: Uuid,
        result: &ProcessingResult,
    ) -> Result<BatchCounters, TrackerError> {
        let status = if result.success {
            ImageStatus::Completed
        } else {
            ImageStatus::Failed
        };
        self.apply(batch_id, file_id, status, |record| {
            record.metadata = result.metadata.clone();
            record.error = result.error.as_ref().map(|e| e.message.clone());
        })
        .await
    }

    async fn apply(
        &self,
        batch_id: Uuid,
        file_id: Uuid,
        status: ImageStatus,
        update: impl FnOnce(&mut ImageRecord),
    ) -> Result<BatchCounters, TrackerError> {
        let mut batches = self.batches.write().await;
        let batch = batches.get_mut(&batch_id).ok_or(TrackerError::NotFound(batch_id))?;
        let record = batch
            .image_mut(file_id)
            .ok_or(TrackerError::UnknownImage { batch_id, file_id })?;

        if !record.status.can_transition_to(status) {
            return Err(TrackerError::InvalidTransition {
                file_id,
                from: record.status,
                to: status,
            });
        }

        record.status = status;
        update(record);
        batch.last_activity = Instant::now();
        batch.refresh();

        if batch.status == BatchStatus::Completed {
            tracing::info!(
                batch_id = %batch_id,
                completed = batch.progress.completed,
                failed = batch.progress.failed,
                "Batch finished"
            );
        }
        Ok(batch.progress)
    }

    fn is_expired(&self, batch: &Batch) -> bool {
        batch.last_activity.elapsed() >= self.ttl
    }

    /// Look up a batch owned by `session_id`. A batch owned by another
    /// session is indistinguishable from a missing one.
    pub async fn get_batch(&self, batch_id: Uuid, session_id: &str) -> Option<Batch> {
        let mut batches = self.batches.write().await;
        let expired = match batches.get(&batch_id) {
            None => return None,
            Some(batch) if batch.session_id != session_id => return None,
            Some(batch) => self.is_expired(batch),
        };
        if expired {
            batches.remove(&batch_id);
            metrics::gauge!("active_batches").set(batches.len() as f64);
            return None;
        }

        let batch = batches.get_mut(&batch_id)?;
        batch.last_activity = Instant::now();
        Some(batch.clone())
    }

    pub async fn get_progress(&self, batch_id: Uuid, session_id: &str) -> Option<BatchProgress> {
        self.get_batch(batch_id, session_id)
            .await
            .map(|b| BatchProgress::from(&b))
    }

    /// Batches owned by `session_id`, newest first.
    pub async fn list_batches(&self, session_id: &str) -> Vec<BatchProgress> {
        let batches = self.batches.read().await;
        let mut owned: Vec<&Batch> = batches
            .values()
            .filter(|b| b.session_id == session_id && !self.is_expired(b))
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned.into_iter().map(BatchProgress::from).collect()
    }

    /// Remove a batch. Returns false when it does not exist for this session.
    pub async fn clear_batch(&self, batch_id: Uuid, session_id: &str) -> bool {
        let mut batches = self.batches.write().await;
        match batches.get(&batch_id) {
            Some(batch) if batch.session_id == session_id => {
                batches.remove(&batch_id);
                metrics::gauge!("active_batches").set(batches.len() as f64);
                true
            }
            _ => false,
        }
    }

    /// Drop every batch belonging to a session, e.g. when the session expires.
    pub async fn clear_session(&self, session_id: &str) -> usize {
        let mut batches = self.batches.write().await;
        let before = batches.len();
        batches.retain(|_, b| b.session_id != session_id);
        metrics::gauge!("active_batches").set(batches.len() as f64);
        before - batches.len()
    }

    /// Drop batches idle for longer than the TTL.
    pub async fn sweep_expired(&self) -> usize {
        let mut batches = self.batches.write().await;
        let before = batches.len();
        batches.retain(|_, b| b.last_activity.elapsed() < self.ttl);
        let removed = before - batches.len();
        metrics::gauge!("active_batches").set(batches.len() as f64);
        if removed > 0 {
            tracing::info!(removed, "Expired idle batches");
        }
        removed
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_expired().await;
            }
        })
    }
}

/// Feeds orchestrator events for one batch into the tracker.
pub struct TrackerObserver {
    tracker: Arc<BatchTracker>,
    batch_id: Uuid,
}

impl TrackerObserver {
    pub fn new(tracker: Arc<BatchTracker>, batch_id: Uuid) -> Self {
        Self { tracker, batch_id }
    }
}

#[async_trait]
impl BatchObserver for TrackerObserver {
    async fn image_started(&self, file: &UploadedFile) {
        if let Err(e) = self
            .tracker
            .update_image_status(self.batch_id, file.id, ImageStatus::Processing, None)
            .await
        {
            tracing::warn!(batch_id = %self.batch_id, file_id = %file.id, error = %e, "Failed to mark image processing");
        }
    }

    async fn image_finished(&self, file: &UploadedFile, result: &ProcessingResult) {
        if let Err(e) = self.tracker.record_result(self.batch_id, file.id, result).await {
            tracing::warn!(batch_id = %self.batch_id, file_id = %file.id, error = %e, "Failed to record image result");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Batch {0} not found")]
    NotFound(Uuid),

    #[error("Image {0} appears more than once in the batch")]
    DuplicateImage(Uuid),

    #[error("Image {file_id} is not part of batch {batch_id}")]
    UnknownImage { batch_id: Uuid, file_id: Uuid },

    #[error("Image {file_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        file_id: Uuid,
        from: ImageStatus,
        to: ImageStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::Metadata;
    use crate::models::processing::{ErrorCode, ProcessingError, Stage};
    use std::path::PathBuf;

    fn files(n: usize) -> Vec<UploadedFile> {
        (0..n)
            .map(|i| UploadedFile::new(Uuid::new_v4(), format!("img{i}.jpg"), 100, PathBuf::from(format!("/tmp/{i}"))))
            .collect()
    }

    fn metadata(filename: &str) -> Metadata {
        Metadata {
            filename: filename.to_string(),
            title: "A title".to_string(),
            keywords: "a, b".to_string(),
            category: 1,
        }
    }

    #[tokio::test]
    async fn test_create_batch_initial_counters() {
        let tracker = BatchTracker::new(Duration::from_secs(60));
        let batch = tracker.create_batch("s1", &files(3)).await.unwrap();

        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(
            batch.progress,
            BatchCounters { total: 3, completed: 0, failed: 0, processing: 0, pending: 3 }
        );
        assert!(batch.images.iter().all(|i| i.status == ImageStatus::Pending));
    }

    #[tokio::test]
    async fn test_duplicate_files_are_rejected() {
        let tracker = BatchTracker::new(Duration::from_secs(60));
        let files = files(2);
        let listed = vec![files[0].clone(), files[1].clone(), files[0].clone()];

        let err = tracker.create_batch("s1", &listed).await.unwrap_err();
        assert!(matches!(err, TrackerError::DuplicateImage(id) if id == files[0].id));
        assert!(tracker.list_batches("s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_full_lifecycle_completes_batch() {
        let tracker = BatchTracker::new(Duration::from_secs(60));
        let files = files(3);
        let batch = tracker.create_batch("s1", &files).await.unwrap();
        tracker.start_batch(batch.id).await.unwrap();

        let started = tracker.get_batch(batch.id, "s1").await.unwrap();
        assert_eq!(started.status, BatchStatus::Processing);
        assert!(started.started_at.is_some());

        for f in &files {
            let c = tracker
                .update_image_status(batch.id, f.id, ImageStatus::Processing, None)
                .await
                .unwrap();
            assert!(c.is_consistent());
        }

        tracker
            .record_result(batch.id, files[0].id, &ProcessingResult::succeeded(metadata("img0.jpg")))
            .await
            .unwrap();
        tracker
            .record_result(batch.id, files[1].id, &ProcessingResult::succeeded(metadata("img1.jpg")))
            .await
            .unwrap();
        let failure = ProcessingResult::failed(
            "img2.jpg",
            ProcessingError::new(ErrorCode::ExternalServiceError, Stage::GenerateMetadata, "boom"),
        );
        let counters = tracker.record_result(batch.id, files[2].id, &failure).await.unwrap();

        assert_eq!(
            counters,
            BatchCounters { total: 3, completed: 2, failed: 1, processing: 0, pending: 0 }
        );
        let done = tracker.get_batch(batch.id, "s1").await.unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert!(done.completed_at.is_some());
        assert_eq!(done.images[2].error.as_deref(), Some("boom"));
        assert_eq!(done.images[0].metadata.as_ref().unwrap().title, "A title");
    }

    #[tokio::test]
    async fn test_status_regression_is_rejected() {
        let tracker = BatchTracker::new(Duration::from_secs(60));
        let files = files(1);
        let batch = tracker.create_batch("s1", &files).await.unwrap();

        tracker
            .update_image_status(batch.id, files[0].id, ImageStatus::Completed, None)
            .await
            .unwrap();
        let err = tracker
            .update_image_status(batch.id, files[0].id, ImageStatus::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidTransition { .. }));

        let batch = tracker.get_batch(batch.id, "s1").await.unwrap();
        assert_eq!(batch.images[0].status, ImageStatus::Completed);
        assert_eq!(batch.status, BatchStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let tracker = BatchTracker::new(Duration::from_secs(60));
        let batch = tracker.create_batch("s1", &files(1)).await.unwrap();

        assert!(matches!(
            tracker.start_batch(Uuid::new_v4()).await,
            Err(TrackerError::NotFound(_))
        ));
        assert!(matches!(
            tracker
                .update_image_status(batch.id, Uuid::new_v4(), ImageStatus::Processing, None)
                .await,
            Err(TrackerError::UnknownImage { .. })
        ));
    }

    #[tokio::test]
    async fn test_wrong_session_looks_like_missing() {
        let tracker = BatchTracker::new(Duration::from_secs(60));
        let batch = tracker.create_batch("owner", &files(2)).await.unwrap();

        assert!(tracker.get_batch(batch.id, "intruder").await.is_none());
        assert!(tracker.get_batch(Uuid::new_v4(), "intruder").await.is_none());
        assert!(tracker.get_progress(batch.id, "intruder").await.is_none());
        assert!(!tracker.clear_batch(batch.id, "intruder").await);
        assert!(tracker.get_batch(batch.id, "owner").await.is_some());
    }

    #[tokio::test]
    async fn test_expiry_is_lazy_and_swept() {
        let tracker = BatchTracker::new(Duration::from_millis(50));
        let a = tracker.create_batch("s1", &files(1)).await.unwrap();
        let b = tracker.create_batch("s1", &files(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(tracker.get_batch(a.id, "s1").await.is_none());
        assert_eq!(tracker.sweep_expired().await, 1);
        assert!(tracker.get_batch(b.id, "s1").await.is_none());
    }

    #[tokio::test]
    async fn test_progress_percent() {
        let tracker = BatchTracker::new(Duration::from_secs(60));
        let files = files(4);
        let batch = tracker.create_batch("s1", &files).await.unwrap();
        tracker
            .update_image_status(batch.id, files[0].id, ImageStatus::Failed, Some("bad".to_string()))
            .await
            .unwrap();

        let progress = tracker.get_progress(batch.id, "s1").await.unwrap();
        assert_eq!(progress.percent, 25);
        assert_eq!(progress.counters.failed, 1);
        assert_eq!(progress.status, BatchStatus::Processing);
    }

    #[tokio::test]
    async fn test_clear_session() {
        let tracker = BatchTracker::new(Duration::from_secs(60));
        tracker.create_batch("s1", &files(1)).await.unwrap();
        tracker.create_batch("s1", &files(1)).await.unwrap();
        let keep = tracker.create_batch("s2", &files(1)).await.unwrap();

        assert_eq!(tracker.clear_session("s1").await, 2);
        assert_eq!(tracker.list_batches("s1").await.len(), 0);
        assert_eq!(tracker.list_batches("s2").await[0].batch_id, keep.id);
    }
}
