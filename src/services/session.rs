//! Anonymous sessions: uploaded files and per-session image quota.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::upload::UploadedFile;

/// Cookie carrying the session id.
pub const SESSION_COOKIE: &str = "sid";

#[derive(Debug, Clone)]
struct Session {
    created_at: DateTime<Utc>,
    last_seen: Instant,
    files: Vec<UploadedFile>,
    images_used: usize,
}

/// Quota and storage summary for the session endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub images_used: usize,
    pub images_remaining: usize,
    pub quota: usize,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    ttl: Duration,
    quota: usize,
}

impl SessionStore {
    pub fn new(ttl: Duration, quota: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            quota,
        }
    }

    /// Return the live session for `cookie`, or start a new one when the
    /// cookie is missing, unknown or expired. Files of an expired session
    /// are returned for deletion.
    pub async fn resolve(&self, cookie: Option<&str>) -> (String, Vec<UploadedFile>) {
        let mut sessions = self.sessions.write().await;
        let mut orphaned = Vec::new();

        if let Some(id) = cookie {
            let live = match sessions.get_mut(id) {
                Some(session) if session.last_seen.elapsed() < self.ttl => {
                    session.last_seen = Instant::now();
                    true
                }
                _ => false,
            };
            if live {
                return (id.to_string(), orphaned);
            }
            if let Some(expired) = sessions.remove(id) {
                orphaned = expired.files;
            }
        }

        let id = Uuid::new_v4().simple().to_string();
        sessions.insert(
            id.clone(),
            Session {
                created_at: Utc::now(),
                last_seen: Instant::now(),
                files: Vec::new(),
                images_used: 0,
            },
        );
        tracing::debug!(session_id = %id, "Started anonymous session");
        (id, orphaned)
    }

    pub async fn summary(&self, session_id: &str) -> Result<SessionSummary, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or(SessionError::NotFound)?;
        Ok(SessionSummary {
            session_id: session_id.to_string(),
            created_at: session.created_at,
            file_count: session.files.len(),
            images_used: session.images_used,
            images_remaining: self.quota.saturating_sub(session.images_used),
            quota: self.quota,
        })
    }

    pub async fn add_files(&self, session_id: &str, files: Vec<UploadedFile>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or(SessionError::NotFound)?;
        session.files.extend(files);
        session.last_seen = Instant::now();
        Ok(())
    }

    pub async fn files(&self, session_id: &str) -> Result<Vec<UploadedFile>, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or(SessionError::NotFound)?;
        Ok(session.files.clone())
    }

    pub async fn file(&self, session_id: &str, file_id: Uuid) -> Result<UploadedFile, SessionError> {
        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id).ok_or(SessionError::NotFound)?;
        session
            .files
            .iter()
            .find(|f| f.id == file_id)
            .cloned()
            .ok_or(SessionError::FileNotFound(file_id))
    }

    /// Resolve `ids` against the session's files, keeping the requested order.
    /// `None` selects every file. An id may appear only once.
    pub async fn select_files(&self, session_id: &str, ids: Option<&[Uuid]>) -> Result<Vec<UploadedFile>, SessionError> {
        let files = self.files(session_id).await?;
        let Some(ids) = ids else {
            return Ok(files);
        };
        let mut seen = HashSet::with_capacity(ids.len());
        if let Some(duplicate) = ids.iter().find(|id| !seen.insert(**id)) {
            return Err(SessionError::DuplicateFile(*duplicate));
        }
        ids.iter()
            .map(|id| {
                files
                    .iter()
                    .find(|f| f.id == *id)
                    .cloned()
                    .ok_or(SessionError::FileNotFound(*id))
            })
            .collect()
    }

    pub async fn remove_file(&self, session_id: &str, file_id: Uuid) -> Result<UploadedFile, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or(SessionError::NotFound)?;
        let index = session
            .files
            .iter()
            .position(|f| f.id == file_id)
            .ok_or(SessionError::FileNotFound(file_id))?;
        Ok(session.files.remove(index))
    }

    /// Reserve quota for `count` images, all or nothing.
    pub async fn reserve_quota(&self, session_id: &str, count: usize) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(session_id).ok_or(SessionError::NotFound)?;
        let remaining = self.quota.saturating_sub(session.images_used);
        if count > remaining {
            return Err(SessionError::QuotaExceeded {
                requested: count,
                remaining,
            });
        }
        session.images_used += count;
        Ok(remaining - count)
    }

    /// Drop sessions idle past the TTL, returning their ids and files.
    pub async fn sweep_expired(&self) -> Vec<(String, Vec<UploadedFile>)> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| s.last_seen.elapsed() >= self.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id).map(|s| (id, s.files)))
            .collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found")]
    NotFound,

    #[error("File {0} not found")]
    FileNotFound(Uuid),

    #[error("File {0} is listed more than once")]
    DuplicateFile(Uuid),

    #[error("Image quota exceeded: requested {requested}, {remaining} remaining")]
    QuotaExceeded { requested: usize, remaining: usize },
}
