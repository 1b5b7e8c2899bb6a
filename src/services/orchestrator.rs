//! Per-image pipeline and bounded-concurrency batch processing.
//!
//! One image: read upload → stage a compressed copy → ask the vision model
//! (with retry) → normalize. A batch runs a fixed pool of workers that pull
//! the next unstarted image until the input is exhausted. Results come back
//! in input order.

use async_trait::async_trait;
use futures::future::join_all;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::models::processing::{ErrorCode, ProcessingError, ProcessingResult, ProgressSnapshot, Stage};
use crate::models::upload::UploadedFile;
use crate::services::inference::{InferenceError, MetadataGenerator};
use crate::services::normalize;
use crate::services::retry::{with_retry, HttpStatus, RetryOptions};
use crate::services::stager::{AssetStager, StagingError};

pub type ProgressCallback = Arc<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Receives per-image lifecycle events while a batch runs.
#[async_trait]
pub trait BatchObserver: Send + Sync {
    async fn image_started(&self, file: &UploadedFile);
    async fn image_finished(&self, file: &UploadedFile, result: &ProcessingResult);
}

/// Defaults applied when a batch call leaves an option unset.
#[derive(Clone)]
pub struct ProcessorSettings {
    pub concurrency: usize,
    pub timeout: Duration,
    pub continue_on_error: bool,
    pub retry: RetryOptions<InferenceError>,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            timeout: Duration::from_secs(30),
            continue_on_error: true,
            retry: RetryOptions::default(),
        }
    }
}

#[derive(Clone, Default)]
pub struct BatchOptions {
    pub concurrency: Option<usize>,
    pub continue_on_error: Option<bool>,
    pub timeout: Option<Duration>,
    pub retry_attempts: Option<u32>,
    pub on_progress: Option<ProgressCallback>,
    pub observer: Option<Arc<dyn BatchObserver>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("No files to process")]
    EmptyFileList,

    #[error("Invalid batch options: {0}")]
    Validation(String),
}

#[derive(Clone)]
pub struct ImageProcessor {
    stager: Arc<dyn AssetStager>,
    generator: Arc<dyn MetadataGenerator>,
    settings: Arc<ProcessorSettings>,
}

impl ImageProcessor {
    pub fn new(
        stager: Arc<dyn AssetStager>,
        generator: Arc<dyn MetadataGenerator>,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            stager,
            generator,
            settings: Arc::new(settings),
        }
    }

    /// Run one image through every stage. Failures come back as a failed
    /// result, never as an error.
    pub async fn process_image(&self, file: &UploadedFile) -> ProcessingResult {
        let started = Instant::now();
        let result = self.run_stages(file, &self.settings.retry).await;
        record_outcome(&result, started);
        result
    }

    async fn run_stages(&self, file: &UploadedFile, retry: &RetryOptions<InferenceError>) -> ProcessingResult {
        let context = || serde_json::json!({ "file_id": file.id });

        let bytes = match tokio::fs::read(&file.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return ProcessingResult::failed(
                    &file.filename,
                    ProcessingError::new(
                        ErrorCode::InternalError,
                        Stage::CreateTempUrl,
                        format!("Could not read uploaded file: {e}"),
                    )
                    .with_context(context()),
                );
            }
        };

        let url = match self.stager.create_temp_url(&bytes).await {
            Ok(url) => url,
            Err(e) => {
                let code = match e {
                    StagingError::Decode(_) => ErrorCode::ValidationError,
                    _ => ErrorCode::ExternalServiceError,
                };
                return ProcessingResult::failed(
                    &file.filename,
                    ProcessingError::new(code, Stage::CreateTempUrl, e.to_string()).with_context(context()),
                );
            }
        };
        tracing::debug!(file_id = %file.id, url = %url, "Image staged");

        let attempts = AtomicU32::new(0);
        let generator = &self.generator;
        let url_ref = url.as_str();
        let attempts_ref = &attempts;
        let raw = with_retry(retry, move |attempt| {
            attempts_ref.store(attempt, Ordering::Relaxed);
            generator.generate_metadata(url_ref)
        })
        .await;

        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                let code = match e {
                    InferenceError::InvalidResponse { .. } => ErrorCode::InvalidResponse,
                    InferenceError::Request { .. } => ErrorCode::ExternalServiceError,
                };
                return ProcessingResult::failed(
                    &file.filename,
                    ProcessingError::new(code, Stage::GenerateMetadata, e.to_string()).with_context(serde_json::json!({
                        "file_id": file.id,
                        "image_url": url,
                        "attempts": attempts.load(Ordering::Relaxed),
                        "status": e.http_status(),
                    })),
                );
            }
        };

        match normalize::normalize(&file.filename, &raw) {
            Ok(metadata) => ProcessingResult::succeeded(metadata),
            Err(e) => ProcessingResult::failed(
                &file.filename,
                ProcessingError::new(ErrorCode::ValidationError, Stage::GenerateMetadata, e.to_string())
                    .with_context(context()),
            ),
        }
    }

    /// Race one image against `timeout`. On expiry the spawned work is left
    /// running and its eventual result dropped; staged assets still expire
    /// on their own timers. Metrics are recorded here only; an abandoned
    /// run is never counted.
    async fn process_with_timeout(
        &self,
        file: &UploadedFile,
        retry: &RetryOptions<InferenceError>,
        timeout: Duration,
    ) -> ProcessingResult {
        let this = self.clone();
        let owned = file.clone();
        let retry = retry.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move { this.run_stages(&owned, &retry).await });

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => {
                record_outcome(&result, started);
                result
            }
            Ok(Err(e)) => {
                metrics::counter!("images_processed_total", "outcome" => "failure").increment(1);
                ProcessingResult::failed(
                    &file.filename,
                    ProcessingError::new(
                        ErrorCode::InternalError,
                        Stage::BatchProcessing,
                        format!("Image task failed: {e}"),
                    ),
                )
            }
            Err(_) => {
                metrics::counter!("images_processed_total", "outcome" => "timeout").increment(1);
                ProcessingResult::failed(
                    &file.filename,
                    ProcessingError::new(
                        ErrorCode::ProcessingTimeout,
                        Stage::BatchProcessing,
                        format!("Processing timed out after {} ms", timeout.as_millis()),
                    )
                    .with_context(serde_json::json!({
                        "file_id": file.id,
                        "timeout_ms": timeout.as_millis() as u64,
                    })),
                )
            }
        }
    }

    /// Process `files` with at most `concurrency` images in flight.
    pub async fn process_batch(
        &self,
        files: Vec<UploadedFile>,
        options: BatchOptions,
    ) -> Result<Vec<ProcessingResult>, BatchError> {
        if files.is_empty() {
            return Err(BatchError::EmptyFileList);
        }

        let concurrency = options.concurrency.unwrap_or(self.settings.concurrency);
        if concurrency == 0 {
            return Err(BatchError::Validation("concurrency must be at least 1".to_string()));
        }
        let timeout = options.timeout.unwrap_or(self.settings.timeout);
        if timeout.is_zero() {
            return Err(BatchError::Validation("timeout must be positive".to_string()));
        }
        let retry = match options.retry_attempts {
            Some(0) => return Err(BatchError::Validation("retry attempts must be at least 1".to_string())),
            Some(n) => self.settings.retry.clone().with_max_attempts(n),
            None => self.settings.retry.clone(),
        };

        let total = files.len();
        let started = Instant::now();
        tracing::info!(total, concurrency, timeout_ms = timeout.as_millis() as u64, "Starting batch processing");

        let run = BatchRun {
            files: &files,
            cursor: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            ledger: Mutex::new(Ledger::new(total)),
            retry,
            timeout,
            continue_on_error: options.continue_on_error.unwrap_or(self.settings.continue_on_error),
            on_progress: options.on_progress,
            observer: options.observer,
        };

        join_all((0..concurrency.min(total)).map(|_| self.run_worker(&run))).await;

        let slots = run.ledger.into_inner().unwrap_or_else(PoisonError::into_inner).results;
        let mut results = Vec::with_capacity(total);
        for (file, slot) in files.iter().zip(slots) {
            let result = match slot {
                Some(result) => result,
                None => {
                    let aborted = ProcessingResult::failed(
                        &file.filename,
                        ProcessingError::new(
                            ErrorCode::BatchAborted,
                            Stage::BatchProcessing,
                            "Skipped after an earlier image failed",
                        ),
                    );
                    if let Some(observer) = &run.observer {
                        observer.image_finished(file, &aborted).await;
                    }
                    aborted
                }
            };
            results.push(result);
        }

        let successful = results.iter().filter(|r| r.success).count();
        tracing::info!(
            successful,
            failed = total - successful,
            total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch processing finished"
        );

        Ok(results)
    }

    async fn run_worker(&self, run: &BatchRun<'_>) {
        loop {
            if run.aborted.load(Ordering::SeqCst) {
                break;
            }
            let index = run.cursor.fetch_add(1, Ordering::SeqCst);
            let Some(file) = run.files.get(index) else {
                break;
            };

            run.lock_ledger().processing += 1;
            if let Some(observer) = &run.observer {
                observer.image_started(file).await;
            }

            let result = self.process_with_timeout(file, &run.retry, run.timeout).await;

            if let Some(error) = &result.error {
                tracing::warn!(
                    file_id = %file.id,
                    filename = %file.filename,
                    stage = %error.stage,
                    code = %error.code,
                    error = %error.message,
                    "Image processing failed"
                );
                if !run.continue_on_error {
                    run.aborted.store(true, Ordering::SeqCst);
                }
            }

            if let Some(observer) = &run.observer {
                observer.image_finished(file, &result).await;
            }

            let snapshot = {
                let mut ledger = run.lock_ledger();
                ledger.finish(index, result);
                run.on_progress.as_ref().map(|_| ledger.snapshot())
            };
            if let (Some(callback), Some(snapshot)) = (&run.on_progress, snapshot) {
                if catch_unwind(AssertUnwindSafe(|| callback(&snapshot))).is_err() {
                    tracing::warn!("Progress callback panicked; continuing batch");
                }
            }
        }
    }
}

fn record_outcome(result: &ProcessingResult, started: Instant) {
    let outcome = if result.success { "success" } else { "failure" };
    metrics::counter!("images_processed_total", "outcome" => outcome).increment(1);
    metrics::histogram!("image_processing_seconds").record(started.elapsed().as_secs_f64());
}

struct BatchRun<'a> {
    files: &'a [UploadedFile],
    cursor: AtomicUsize,
    aborted: AtomicBool,
    ledger: Mutex<Ledger>,
    retry: RetryOptions<InferenceError>,
    timeout: Duration,
    continue_on_error: bool,
    on_progress: Option<ProgressCallback>,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl BatchRun<'_> {
    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Ledger {
    results: Vec<Option<ProcessingResult>>,
    processing: usize,
    successful: usize,
    failed: usize,
}

impl Ledger {
    fn new(total: usize) -> Self {
        Self {
            results: vec![None; total],
            processing: 0,
            successful: 0,
            failed: 0,
        }
    }

    fn finish(&mut self, index: usize, result: ProcessingResult) {
        self.processing = self.processing.saturating_sub(1);
        if result.success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.results[index] = Some(result);
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let total = self.results.len();
        let completed = self.successful + self.failed;
        ProgressSnapshot {
            completed,
            pending: total - completed - self.processing,
            processing: self.processing,
            total,
            successful: self.successful,
            failed: self.failed,
            results: self.results.iter().flatten().cloned().collect(),
        }
    }
}
