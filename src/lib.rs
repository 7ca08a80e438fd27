pub mod api;
pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod logging;
pub mod pipeline;
pub mod signature;
pub mod status;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use config::{BusyPolicy, DeployConfig, DeployMode};
use event::PushEvent;
use executor::{DeploymentAttempt, DeploymentExecutor};
use signature::SignatureVerifier;
use status::{DeploymentHistory, StatusFile, StatusRecord};

pub use api::router;

/// Everything request handlers share. Built once in `main`.
pub struct AppState {
    pub verifier: SignatureVerifier,
    pub executor: Arc<DeploymentExecutor>,
    pub history: Mutex<DeploymentHistory>,
    pub status_file: Option<StatusFile>,
    pub mode: DeployMode,
    pub busy_policy: BusyPolicy,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        verifier: SignatureVerifier,
        executor: Arc<DeploymentExecutor>,
        config: &DeployConfig,
    ) -> Self {
        Self {
            verifier,
            executor,
            history: Mutex::new(DeploymentHistory::new(config.history_size)),
            status_file: config.status_path().map(StatusFile::new),
            mode: config.mode,
            busy_policy: config.busy_policy,
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }

    /// Written once the delivery holds the pipeline, so the file always
    /// describes the run in progress or the last one finished.
    pub async fn record_pending(&self, event: &PushEvent) {
        if let Some(file) = &self.status_file {
            file.write_logged(&StatusRecord::pending(event)).await;
        }
    }

    pub async fn record_finished(&self, attempt: &DeploymentAttempt) {
        if let Some(file) = &self.status_file {
            file.write_logged(&StatusRecord::finished(attempt)).await;
        }
        self.history.lock().await.push(attempt.clone());
    }
}

pub type SharedState = Arc<AppState>;
