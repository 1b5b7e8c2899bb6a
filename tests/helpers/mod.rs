//! Test doubles for the staging and inference collaborators.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

use stock_meta::models::metadata::{CategoryValue, KeywordsValue, RawMetadata};
use stock_meta::models::upload::UploadedFile;
use stock_meta::services::inference::{InferenceError, MetadataGenerator};
use stock_meta::services::orchestrator::{ImageProcessor, ProcessorSettings};
use stock_meta::services::retry::RetryOptions;
use stock_meta::services::stager::{AssetStager, StagingError};

/// Write one file per name into `dir`. Each file's content is its own name,
/// which the mocks below use to pick a behavior.
pub fn write_files(dir: &TempDir, names: &[&str]) -> Vec<UploadedFile> {
    names
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, name.as_bytes()).unwrap();
            UploadedFile::new(Uuid::new_v4(), *name, name.len() as u64, path)
        })
        .collect()
}

/// Stager that returns `mock://{content}` (printable ASCII only) and can
/// fail or hang per image.
#[derive(Default)]
pub struct MockStager {
    failing: HashSet<String>,
    hanging: HashSet<String>,
    pub calls: AtomicUsize,
}

impl MockStager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub fn hanging(mut self, name: &str) -> Self {
        self.hanging.insert(name.to_string());
        self
    }
}

#[async_trait]
impl AssetStager for MockStager {
    async fn create_temp_url(&self, image: &[u8]) -> Result<String, StagingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name: String = String::from_utf8_lossy(image)
            .chars()
            .filter(|c| c.is_ascii_graphic())
            .collect();
        if self.hanging.contains(&name) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.failing.contains(&name) {
            return Err(StagingError::Decode(format!("cannot decode {name}")));
        }
        Ok(format!("mock://{name}"))
    }
}

/// How the mock generator answers for one image.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Fail the first `n` attempts with `status`, then succeed.
    FailTimes(u32, u16),
    /// Fail every attempt with `status`.
    AlwaysFail(u16),
    /// Reply with something that is not metadata.
    Invalid,
    /// Succeed after a delay.
    Delay(Duration),
}

/// Generator that succeeds by default and tracks attempts and concurrency.
#[derive(Default)]
pub struct MockGenerator {
    behaviors: HashMap<String, Behavior>,
    attempts: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub calls: AtomicUsize,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(name.to_string(), behavior);
        self
    }

    /// Each of `names` waits `delay` before succeeding.
    pub fn all_delayed(mut self, names: &[&str], delay: Duration) -> Self {
        for name in names {
            self.behaviors.insert(name.to_string(), Behavior::Delay(delay));
        }
        self
    }

    pub fn attempts_for(&self, name: &str) -> u32 {
        self.attempts.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn request_error(name: &str, status: u16) -> InferenceError {
        InferenceError::Request {
            image_url: format!("mock://{name}"),
            model: "mock".to_string(),
            status: Some(status),
            message: format!("HTTP {status}"),
            source: None,
        }
    }

    fn metadata(name: &str) -> RawMetadata {
        RawMetadata {
            title: format!("Title for {name}"),
            keywords: KeywordsValue::List(vec!["sky".to_string(), "blue".to_string(), "Sky".to_string()]),
            category: CategoryValue::Number(11.0),
        }
    }
}

#[async_trait]
impl MetadataGenerator for MockGenerator {
    async fn generate_metadata(&self, image_url: &str) -> Result<RawMetadata, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = image_url.trim_start_matches("mock://").to_string();
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(name.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = match self.behaviors.get(&name).cloned() {
            None => Ok(Self::metadata(&name)),
            Some(Behavior::FailTimes(n, status)) if attempt <= n => Err(Self::request_error(&name, status)),
            Some(Behavior::FailTimes(..)) => Ok(Self::metadata(&name)),
            Some(Behavior::AlwaysFail(status)) => Err(Self::request_error(&name, status)),
            Some(Behavior::Invalid) => Err(InferenceError::InvalidResponse {
                model: "mock".to_string(),
                reason: "not JSON".to_string(),
            }),
            Some(Behavior::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(Self::metadata(&name))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Settings with millisecond backoff so retry tests stay fast.
pub fn fast_settings() -> ProcessorSettings {
    ProcessorSettings {
        retry: RetryOptions::default().with_delays(Duration::from_millis(1), Duration::from_millis(5)),
        ..ProcessorSettings::default()
    }
}

pub fn processor(stager: Arc<MockStager>, generator: Arc<MockGenerator>) -> ImageProcessor {
    ImageProcessor::new(stager, generator, fast_settings())
}
