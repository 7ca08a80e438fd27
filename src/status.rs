//! Deployment status exposure: the JSON status file and in-memory history

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::Result;
use crate::event::PushEvent;
use crate::executor::{DeploymentAttempt, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Succeeded,
    Failed,
}

/// Latest deployment request, as written to the status file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub timestamp: DateTime<Utc>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub author: Option<String>,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl StatusRecord {
    pub fn pending(event: &PushEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            repository: non_empty(&event.repository_name),
            branch: non_empty(&event.branch),
            commit: non_empty(&event.commit_sha),
            author: non_empty(&event.pusher_name),
            status: RecordStatus::Pending,
            deployment_id: None,
            failed_step: None,
            error: None,
        }
    }

    pub fn finished(attempt: &DeploymentAttempt) -> Self {
        let status = if attempt.succeeded() {
            RecordStatus::Succeeded
        } else {
            RecordStatus::Failed
        };
        Self {
            timestamp: attempt.completed_at,
            deployment_id: Some(attempt.id.clone()),
            status,
            failed_step: attempt.failed_step(),
            error: attempt.error().map(String::from),
            ..Self::pending(&attempt.event)
        }
    }
}

/// Writes the status record to a fixed path for external inspection
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the file contents; readers never see a half-written record.
    ///
    /// Writes through clones of one `StatusFile` land in call order. Each
    /// write stages into its own temp file, so writers that don't share the
    /// lock cannot steal each other's rename.
    pub async fn write(&self, record: &StatusRecord) -> Result<()> {
        let data = serde_json::to_vec_pretty(record)?;
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", Uuid::now_v7().simple()));
        if let Err(e) = fs::write(&tmp, data).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Wrote deployment status to {}", self.path.display());
        Ok(())
    }

    /// Like `write`, but failures are only logged
    pub async fn write_logged(&self, record: &StatusRecord) {
        if let Err(e) = self.write(record).await {
            error!(
                "Failed to write deployment status to {}: {}",
                self.path.display(),
                e
            );
        }
    }

    pub async fn read(&self) -> Result<StatusRecord> {
        let data = fs::read(&self.path).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

/// Bounded list of recent attempts, newest first
#[derive(Debug)]
pub struct DeploymentHistory {
    attempts: VecDeque<DeploymentAttempt>,
    capacity: usize,
}

impl DeploymentHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            attempts: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, attempt: DeploymentAttempt) {
        self.attempts.push_front(attempt);
        self.attempts.truncate(self.capacity);
    }

    pub fn latest(&self) -> Option<&DeploymentAttempt> {
        self.attempts.front()
    }

    pub fn recent(&self, limit: usize) -> Vec<DeploymentAttempt> {
        self.attempts.iter().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
