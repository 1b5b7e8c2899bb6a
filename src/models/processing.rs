use serde::{Deserialize, Serialize};
use strum::Display;

use crate::models::metadata::Metadata;

/// Pipeline stage an image failed in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    CreateTempUrl,
    GenerateMetadata,
    BatchProcessing,
}

/// Machine-readable failure classification carried on every failed result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Bad input; retrying will not help.
    ValidationError,
    /// Staging or inference transport failure.
    ExternalServiceError,
    /// The model answered but not with usable JSON.
    InvalidResponse,
    /// Per-image deadline exceeded.
    ProcessingTimeout,
    /// Not attempted because an earlier image failed and the batch stopped.
    BatchAborted,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingError {
    pub code: ErrorCode,
    pub message: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ProcessingError {
    pub fn new(code: ErrorCode, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            stage,
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Outcome of one image in one processing attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingResult {
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProcessingError>,
}

impl ProcessingResult {
    pub fn succeeded(metadata: Metadata) -> Self {
        Self {
            filename: metadata.filename.clone(),
            success: true,
            metadata: Some(metadata),
            error: None,
        }
    }

    pub fn failed(filename: impl Into<String>, error: ProcessingError) -> Self {
        Self {
            filename: filename.into(),
            success: false,
            metadata: None,
            error: Some(error),
        }
    }

    /// Stage of the failure, if this result is one.
    pub fn stage(&self) -> Option<Stage> {
        self.error.as_ref().map(|e| e.stage)
    }
}

/// Snapshot handed to progress callbacks after each image finishes.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub pending: usize,
    pub processing: usize,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Finished results so far, in input order.
    pub results: Vec<ProcessingResult>,
}
