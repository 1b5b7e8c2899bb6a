use image::ImageFormat;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::upload::UploadedFile;

/// Local storage for uploaded originals.
pub struct UploadStore {
    dir: PathBuf,
    max_file_bytes: usize,
}

impl UploadStore {
    pub async fn new(dir: impl Into<PathBuf>, max_file_bytes: usize) -> Result<Self, UploadError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| UploadError::Io {
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir, max_file_bytes })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Validate and persist one uploaded image.
    pub async fn save(&self, filename: &str, data: &[u8]) -> Result<UploadedFile, UploadError> {
        let filename = sanitize_filename(filename);
        if data.is_empty() {
            return Err(UploadError::Empty(filename));
        }
        if data.len() > self.max_file_bytes {
            return Err(UploadError::TooLarge {
                filename,
                size: data.len(),
                limit: self.max_file_bytes,
            });
        }

        match image::guess_format(data) {
            Ok(ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP) => {}
            _ => return Err(UploadError::UnsupportedFormat(filename)),
        }

        let id = Uuid::new_v4();
        let path = self.dir.join(id.to_string());
        if let Err(e) = tokio::fs::write(&path, data).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(UploadError::Io { path, source: e });
        }

        tracing::debug!(file_id = %id, filename = %filename, size = data.len(), "Stored upload");
        Ok(UploadedFile::new(id, filename, data.len() as u64, path))
    }

    /// Remove an upload from disk. Missing files are not an error.
    pub async fn delete(&self, file: &UploadedFile) -> Result<(), UploadError> {
        match tokio::fs::remove_file(&file.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UploadError::Io {
                path: file.path.clone(),
                source: e,
            }),
        }
    }

    pub async fn delete_all(&self, files: &[UploadedFile]) {
        for file in files {
            if let Err(e) = self.delete(file).await {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to delete upload");
            }
        }
    }
}

/// Keep only the final path component and drop characters that would break
/// the CSV export or the file system.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control() && !matches!(c, '"' | '<' | '>' | '|' | ':' | '*' | '?'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "image".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("File {0} is empty")]
    Empty(String),

    #[error("File {filename} is {size} bytes, limit is {limit}")]
    TooLarge {
        filename: String,
        size: usize,
        limit: usize,
    },

    #[error("File {0} is not a JPEG, PNG or WebP image")]
    UnsupportedFormat(String),

    #[error("Upload storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
