use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// An image accepted by the upload endpoint and written to local storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadedFile {
    pub id: Uuid,
    pub filename: String,
    pub size: u64,
    #[serde(skip)]
    pub path: PathBuf,
    pub uploaded_at: DateTime<Utc>,
}

impl UploadedFile {
    pub fn new(id: Uuid, filename: impl Into<String>, size: u64, path: PathBuf) -> Self {
        Self {
            id,
            filename: filename.into(),
            size,
            path,
            uploaded_at: Utc::now(),
        }
    }
}
