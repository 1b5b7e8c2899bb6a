use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

use crate::models::metadata::Metadata;

/// Status of one image inside a batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ImageStatus {
    fn rank(self) -> u8 {
        match self {
            ImageStatus::Pending => 0,
            ImageStatus::Processing => 1,
            ImageStatus::Completed | ImageStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Status only ever moves forward; terminal states are final.
    pub fn can_transition_to(self, next: ImageStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Overall batch status, derived from its images.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRecord {
    pub file_id: Uuid,
    pub filename: String,
    pub status: ImageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Aggregate counters. `completed + failed + processing + pending == total`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchCounters {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub processing: usize,
    pub pending: usize,
}

impl BatchCounters {
    pub fn from_images(images: &[ImageRecord]) -> Self {
        let mut counters = Self {
            total: images.len(),
            ..Self::default()
        };
        for image in images {
            match image.status {
                ImageStatus::Pending => counters.pending += 1,
                ImageStatus::Processing => counters.processing += 1,
                ImageStatus::Completed => counters.completed += 1,
                ImageStatus::Failed => counters.failed += 1,
            }
        }
        counters
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed
    }

    pub fn is_consistent(&self) -> bool {
        self.completed + self.failed + self.processing + self.pending == self.total
    }
}

/// A set of images submitted together, owned by one session.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub id: Uuid,
    #[serde(skip)]
    pub session_id: String,
    pub status: BatchStatus,
    pub images: Vec<ImageRecord>,
    pub progress: BatchCounters,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_activity: Instant,
}

impl Batch {
    /// Recompute counters and overall status after an image changed.
    pub fn refresh(&mut self) {
        self.progress = BatchCounters::from_images(&self.images);
        let all_terminal = self.progress.total > 0 && self.progress.finished() == self.progress.total;

        self.status = if all_terminal {
            BatchStatus::Completed
        } else if self.started_at.is_some() || self.progress.processing > 0 || self.progress.finished() > 0 {
            BatchStatus::Processing
        } else {
            BatchStatus::Pending
        };

        if self.status == BatchStatus::Completed && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn image_mut(&mut self, file_id: Uuid) -> Option<&mut ImageRecord> {
        self.images.iter_mut().find(|i| i.file_id == file_id)
    }
}

/// Lightweight progress view returned by the progress endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    #[serde(flatten)]
    pub counters: BatchCounters,
    pub percent: u8,
}

impl From<&Batch> for BatchProgress {
    fn from(batch: &Batch) -> Self {
        let percent = if batch.progress.total == 0 {
            0
        } else {
            (batch.progress.finished() * 100 / batch.progress.total) as u8
        };
        Self {
            batch_id: batch.id,
            status: batch.status,
            counters: batch.progress,
            percent,
        }
    }
}
