//! Temporary hosting of compressed image copies for the vision model.
//!
//! Each staged image lives at `{temp_dir}/{uuid}.jpg` and is served as
//! `{base_url}/temp/{uuid}.jpg`. A per-asset timer deletes it after the
//! configured lifetime; a periodic sweep removes anything older than the
//! safety threshold in case a timer was lost.

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

/// Longest edge of a staged image, in pixels.
pub const MAX_DIMENSION: u32 = 1024;

/// JPEG quality of staged images.
pub const JPEG_QUALITY: u8 = 85;

/// Turns raw image bytes into a short-lived public URL.
#[async_trait]
pub trait AssetStager: Send + Sync {
    async fn create_temp_url(&self, image: &[u8]) -> Result<String, StagingError>;
}

#[derive(Debug, Clone)]
pub struct StagerConfig {
    pub dir: PathBuf,
    pub base_url: String,
    pub lifetime: Duration,
    pub max_age: Duration,
}

/// Local-disk stager.
pub struct TempAssetStager {
    config: StagerConfig,
    scheduled: Arc<Mutex<HashMap<Uuid, AbortHandle>>>,
}

impl TempAssetStager {
    pub async fn new(config: StagerConfig) -> Result<Self, StagingError> {
        tokio::fs::create_dir_all(&config.dir)
            .await
            .map_err(|e| StagingError::Io {
                path: config.dir.clone(),
                source: e,
            })?;

        Ok(Self {
            config,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn url_for(&self, id: Uuid) -> String {
        format!("{}/temp/{}.jpg", self.config.base_url.trim_end_matches('/'), id)
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.config.dir.join(format!("{id}.jpg"))
    }

    /// Map a served file name (`{uuid}.jpg`) to its path on disk. Anything
    /// else is rejected so the temp route cannot escape the directory.
    pub fn resolve_name(&self, name: &str) -> Option<PathBuf> {
        let id = name.strip_suffix(".jpg")?;
        let id = Uuid::parse_str(id).ok()?;
        Some(self.path_for(id))
    }

    /// Number of assets with a pending scheduled deletion.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Compress and stage `image`, returning its id.
    pub async fn stage(&self, image: &[u8]) -> Result<Uuid, StagingError> {
        let id = Uuid::new_v4();
        let path = self.path_for(id);

        let bytes = image.to_vec();
        let encoded = tokio::task::spawn_blocking(move || compress(&bytes))
            .await
            .map_err(|e| StagingError::Encode(format!("encoder task failed: {e}")))??;

        if let Err(e) = tokio::fs::write(&path, &encoded).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(StagingError::Io { path, source: e });
        }

        self.schedule_deletion(id);
        metrics::counter!("temp_assets_created_total").increment(1);
        tracing::debug!(asset_id = %id, bytes = encoded.len(), "Staged temporary asset");

        Ok(id)
    }

    fn schedule_deletion(&self, id: Uuid) {
        let path = self.path_for(id);
        let lifetime = self.config.lifetime;
        let scheduled = Arc::clone(&self.scheduled);

        // Hold the lock across spawn so the task cannot remove its entry
        // before it has been inserted.
        let mut guard = self.scheduled.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            remove_quietly(&path).await;
            scheduled
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&id);
            tracing::debug!(asset_id = %id, "Scheduled deletion of temporary asset");
        });
        guard.insert(id, handle.abort_handle());
    }

    /// Delete a staged asset now and cancel its timer. Unknown ids are a no-op.
    pub async fn cleanup(&self, id: Uuid) -> Result<(), StagingError> {
        let handle = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(handle) = handle {
            handle.abort();
        }

        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StagingError::Io { path, source: e }),
        }
    }

    /// Remove every staged file older than the safety threshold. Returns the
    /// number of files removed.
    pub async fn sweep(&self) -> Result<usize, StagingError> {
        let dir = &self.config.dir;
        let mut entries = tokio::fs::read_dir(dir).await.map_err(|e| StagingError::Io {
            path: dir.clone(),
            source: e,
        })?;

        let now = SystemTime::now();
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await.map_err(|e| StagingError::Io {
            path: dir.clone(),
            source: e,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jpg") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < self.config.max_age {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to sweep temporary asset"),
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            {
                if let Some(handle) = self
                    .scheduled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id)
                {
                    handle.abort();
                }
            }
        }

        if removed > 0 {
            metrics::counter!("temp_assets_swept_total").increment(removed as u64);
            tracing::info!(removed, "Swept stale temporary assets");
        }
        Ok(removed)
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the task is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep().await {
                    tracing::warn!(error = %e, "Temporary asset sweep failed");
                }
            }
        })
    }
}

#[async_trait]
impl AssetStager for TempAssetStager {
    async fn create_temp_url(&self, image: &[u8]) -> Result<String, StagingError> {
        let id = self.stage(image).await?;
        Ok(self.url_for(id))
    }
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete temporary asset"),
    }
}

/// Downscale to fit within [`MAX_DIMENSION`], flatten alpha onto white and
/// encode as a progressive JPEG.
pub fn compress(image: &[u8]) -> Result<Vec<u8>, StagingError> {
    let decoded = image::load_from_memory(image).map_err(|e| StagingError::Decode(e.to_string()))?;

    let (width, height) = decoded.dimensions();
    let resized = if width > MAX_DIMENSION || height > MAX_DIMENSION {
        decoded.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Lanczos3)
    } else {
        decoded
    };

    let rgb = flatten_on_white(&resized);
    let (width, height) = rgb.dimensions();

    let mut output = Vec::new();
    let mut encoder = jpeg_encoder::Encoder::new(&mut output, JPEG_QUALITY);
    encoder.set_progressive(true);
    encoder
        .encode(rgb.as_raw(), width as u16, height as u16, jpeg_encoder::ColorType::Rgb)
        .map_err(|e| StagingError::Encode(e.to_string()))?;

    Ok(output)
}

fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.to_rgb8();
    }

    let rgba = image.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (src, dst) in rgba.pixels().zip(out.pixels_mut()) {
        let [r, g, b, a] = src.0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        dst.0 = [blend(r), blend(g), blend(b)];
    }
    out
}

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("Could not decode image: {0}")]
    Decode(String),

    #[error("Could not encode staged JPEG: {0}")]
    Encode(String),

    #[error("Temporary storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn png_bytes(width: u32, height: u32, pixel: Rgba<u8>) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, pixel);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    async fn stager(dir: &TempDir, lifetime: Duration, max_age: Duration) -> TempAssetStager {
        TempAssetStager::new(StagerConfig {
            dir: dir.path().to_path_buf(),
            base_url: "http://localhost:3000/".to_string(),
            lifetime,
            max_age,
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_compress_downscales_preserving_aspect() {
        let jpeg = compress(&png_bytes(2048, 1024, Rgba([10, 20, 30, 255]))).unwrap();
        let out = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(out.dimensions(), (1024, 512));
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_compress_never_upscales() {
        let jpeg = compress(&png_bytes(300, 200, Rgba([0, 0, 0, 255]))).unwrap();
        let out = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(out.dimensions(), (300, 200));
    }

    #[test]
    fn test_transparency_becomes_white() {
        let jpeg = compress(&png_bytes(16, 16, Rgba([0, 0, 0, 0]))).unwrap();
        let out = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        let px = out.get_pixel(8, 8).0;
        assert!(px.iter().all(|c| *c > 245), "expected white, got {px:?}");
    }

    #[test]
    fn test_compress_rejects_garbage() {
        assert!(matches!(compress(b"not an image"), Err(StagingError::Decode(_))));
    }

    #[tokio::test]
    async fn test_create_temp_url_writes_file() {
        let dir = TempDir::new().unwrap();
        let stager = stager(&dir, Duration::from_secs(60), Duration::from_secs(120)).await;

        let url = stager
            .create_temp_url(&png_bytes(32, 32, Rgba([255, 0, 0, 255])))
            .await
            .unwrap();

        assert!(url.starts_with("http://localhost:3000/temp/"));
        assert!(url.ends_with(".jpg"));
        let name = url.rsplit('/').next().unwrap();
        let path = stager.resolve_name(name).unwrap();
        assert!(path.exists());
        assert_eq!(stager.scheduled_count(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_deletion_fires() {
        let dir = TempDir::new().unwrap();
        let stager = stager(&dir, Duration::from_millis(50), Duration::from_secs(120)).await;

        let id = stager.stage(&png_bytes(8, 8, Rgba([1, 2, 3, 255]))).await.unwrap();
        let path = stager.path_for(id);
        assert!(path.exists());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!path.exists());
        assert_eq!(stager.scheduled_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_cancels_timer_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let stager = stager(&dir, Duration::from_secs(60), Duration::from_secs(120)).await;

        let id = stager.stage(&png_bytes(8, 8, Rgba([1, 2, 3, 255]))).await.unwrap();
        stager.cleanup(id).await.unwrap();
        assert!(!stager.path_for(id).exists());
        assert_eq!(stager.scheduled_count(), 0);

        stager.cleanup(id).await.unwrap();
        stager.cleanup(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_old_files() {
        let dir = TempDir::new().unwrap();
        let stager = stager(&dir, Duration::from_secs(60), Duration::from_millis(100)).await;

        let old = stager.stage(&png_bytes(8, 8, Rgba([1, 2, 3, 255]))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        let fresh = stager.stage(&png_bytes(8, 8, Rgba([1, 2, 3, 255]))).await.unwrap();

        let removed = stager.sweep().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!stager.path_for(old).exists());
        assert!(stager.path_for(fresh).exists());
        assert_eq!(stager.sweep().await.unwrap(), 0);
    }

    #[test]
    fn test_resolve_name_rejects_traversal() {
        let config = StagerConfig {
            dir: PathBuf::from("/tmp/stage"),
            base_url: String::new(),
            lifetime: Duration::from_secs(1),
            max_age: Duration::from_secs(1),
        };
        let stager = TempAssetStager {
            config,
            scheduled: Arc::new(Mutex::new(HashMap::new())),
        };
        assert!(stager.resolve_name("../etc/passwd").is_none());
        assert!(stager.resolve_name("abc.jpg").is_none());
        let id = Uuid::new_v4();
        assert_eq!(
            stager.resolve_name(&format!("{id}.jpg")),
            Some(PathBuf::from(format!("/tmp/stage/{id}.jpg")))
        );
    }
}
