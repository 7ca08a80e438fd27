//! The deployment pipeline: update source, build image, replace the container.
//!
//! Runs are serialized by an async mutex held for the whole pipeline, so two
//! webhook deliveries can never interleave steps on the shared working tree,
//! image tag or container name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::DeployConfig;
use crate::event::PushEvent;
use crate::pipeline::{
    ContainerRuntime, DockerCli, GitSource, ImageBuilder, SourceControl, StepError,
};

/// Pipeline steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    SourceUpdate,
    ImageBuild,
    Teardown,
    Start,
}

impl Step {
    pub const ALL: [Step; 4] = [
        Step::SourceUpdate,
        Step::ImageBuild,
        Step::Teardown,
        Step::Start,
    ];

    /// 1-based position in the pipeline
    pub fn number(self) -> usize {
        match self {
            Step::SourceUpdate => 1,
            Step::ImageBuild => 2,
            Step::Teardown => 3,
            Step::Start => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::SourceUpdate => "source_update",
            Step::ImageBuild => "image_build",
            Step::Teardown => "teardown",
            Step::Start => "start",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the executor is in its current (or most recent) run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Updating,
    Building,
    TearingDownOld,
    Starting,
    Succeeded,
    Failed(Step),
}

impl PipelineState {
    fn running(step: Step) -> Self {
        match step {
            Step::SourceUpdate => PipelineState::Updating,
            Step::ImageBuild => PipelineState::Building,
            Step::Teardown => PipelineState::TearingDownOld,
            Step::Start => PipelineState::Starting,
        }
    }
}

/// Result of tearing down the previous container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Removed,
    /// No container had the configured name; nothing to do
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// Teardown found no old container
    NotFound,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: Step,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeploymentStatus {
    Succeeded,
    Failed {
        step: Step,
        step_number: usize,
        error: String,
    },
}

/// Record of one pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentAttempt {
    pub id: String,
    pub event: PushEvent,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub steps: Vec<StepRecord>,
    pub status: DeploymentStatus,
}

impl DeploymentAttempt {
    pub fn succeeded(&self) -> bool {
        self.status == DeploymentStatus::Succeeded
    }

    pub fn failed_step(&self) -> Option<Step> {
        match &self.status {
            DeploymentStatus::Failed { step, .. } => Some(*step),
            DeploymentStatus::Succeeded => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.status {
            DeploymentStatus::Failed { error, .. } => Some(error),
            DeploymentStatus::Succeeded => None,
        }
    }
}

/// The fixed repository/container pair being deployed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployTarget {
    pub repo_path: PathBuf,
    pub image_tag: String,
    pub container_name: String,
    pub network: String,
}

impl From<&DeployConfig> for DeployTarget {
    fn from(config: &DeployConfig) -> Self {
        Self {
            repo_path: config.repo_path.clone(),
            image_tag: config.image_tag.clone(),
            container_name: config.container_name.clone(),
            network: config.network.clone(),
        }
    }
}

/// Deliveries allowed to wait behind the running deployment
const MAX_WAITING_RUNS: usize = 1;

/// A reserved place in the pipeline queue.
///
/// Holds the run lock already when it came from `try_acquire`.
pub struct QueueSlot {
    slot: OwnedSemaphorePermit,
    guard: Option<OwnedMutexGuard<()>>,
}

/// Exclusive use of the pipeline; released on drop
pub struct RunPermit {
    _guard: OwnedMutexGuard<()>,
    _slot: Option<OwnedSemaphorePermit>,
}

pub struct DeploymentExecutor {
    target: DeployTarget,
    step_timeout: Duration,
    source: Arc<dyn SourceControl>,
    builder: Arc<dyn ImageBuilder>,
    runtime: Arc<dyn ContainerRuntime>,
    run_lock: Arc<Mutex<()>>,
    queue: Arc<Semaphore>,
    state: std::sync::Mutex<PipelineState>,
    container_absent: AtomicBool,
}

impl DeploymentExecutor {
    pub fn new(
        target: DeployTarget,
        step_timeout: Duration,
        source: Arc<dyn SourceControl>,
        builder: Arc<dyn ImageBuilder>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            target,
            step_timeout,
            source,
            builder,
            runtime,
            run_lock: Arc::new(Mutex::new(())),
            queue: Arc::new(Semaphore::new(1 + MAX_WAITING_RUNS)),
            state: std::sync::Mutex::new(PipelineState::Idle),
            container_absent: AtomicBool::new(false),
        }
    }

    /// Executor wired to the real `git` and `docker` binaries
    pub fn from_config(config: &DeployConfig) -> Self {
        let docker = Arc::new(DockerCli::default());
        Self::new(
            DeployTarget::from(config),
            config.step_timeout(),
            Arc::new(GitSource::new(config.remote.clone())),
            docker.clone(),
            docker,
        )
    }

    pub fn target(&self) -> &DeployTarget {
        &self.target
    }

    pub fn state(&self) -> PipelineState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(PipelineState::Idle)
    }

    /// True while a run holds the pipeline lock
    pub fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// True from a teardown that removed the old container until a later
    /// start succeeds, whatever happened to the runs in between.
    pub fn container_absent(&self) -> bool {
        self.container_absent.load(Ordering::SeqCst)
    }

    /// Reserve a place behind the running deployment.
    ///
    /// Returns `None` when a delivery is already waiting.
    pub fn reserve(&self) -> Option<QueueSlot> {
        let slot = self.queue.clone().try_acquire_owned().ok()?;
        Some(QueueSlot { slot, guard: None })
    }

    /// Take the pipeline only if nothing is running or waiting.
    pub fn try_acquire(&self) -> Option<QueueSlot> {
        let slot = self.queue.clone().try_acquire_owned().ok()?;
        let guard = self.run_lock.clone().try_lock_owned().ok()?;
        Some(QueueSlot {
            slot,
            guard: Some(guard),
        })
    }

    /// Wait until the running deployment, if any, has finished.
    pub async fn wait_turn(&self, slot: QueueSlot) -> RunPermit {
        let guard = match slot.guard {
            Some(guard) => guard,
            None => self.run_lock.clone().lock_owned().await,
        };
        RunPermit {
            _guard: guard,
            _slot: Some(slot.slot),
        }
    }

    /// Run the pipeline, waiting for any in-flight run to finish first.
    ///
    /// Bypasses the waiting limit that `reserve` applies.
    pub async fn run(&self, event: &PushEvent) -> DeploymentAttempt {
        let permit = RunPermit {
            _guard: self.run_lock.clone().lock_owned().await,
            _slot: None,
        };
        self.run_with(&permit, event).await
    }

    /// Run the pipeline under a permit from `wait_turn`.
    pub async fn run_with(&self, _permit: &RunPermit, event: &PushEvent) -> DeploymentAttempt {
        self.run_locked(event).await
    }

    fn set_state(&self, next: PipelineState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    async fn run_locked(&self, event: &PushEvent) -> DeploymentAttempt {
        let id = Uuid::now_v7().to_string();
        let started_at = Utc::now();
        info!(
            "Deployment {} - push to '{}' branch '{}' ({}) by '{}'",
            id, event.repository_name, event.branch, event.commit_sha, event.pusher_name
        );

        let mut steps = Vec::with_capacity(Step::ALL.len());
        let mut status = DeploymentStatus::Succeeded;

        for step in Step::ALL {
            self.set_state(PipelineState::running(step));
            let timer = Instant::now();
            let result = self.perform_with_timeout(step, event).await;
            let duration_ms = timer.elapsed().as_millis() as u64;

            match result {
                Ok((outcome, detail)) => {
                    info!("Deployment {} - step {} {:?}", id, step, outcome);
                    match (step, outcome) {
                        (Step::Teardown, StepOutcome::Succeeded) => {
                            self.container_absent.store(true, Ordering::SeqCst)
                        }
                        (Step::Start, StepOutcome::Succeeded) => {
                            self.container_absent.store(false, Ordering::SeqCst)
                        }
                        _ => {}
                    }
                    steps.push(StepRecord {
                        step,
                        outcome,
                        duration_ms,
                        detail,
                    });
                }
                Err(e) => {
                    error!("Deployment {} - step {} failed: {}", id, step, e);
                    let error = e.to_string();
                    steps.push(StepRecord {
                        step,
                        outcome: StepOutcome::Failed,
                        duration_ms,
                        detail: error.clone(),
                    });
                    status = DeploymentStatus::Failed {
                        step,
                        step_number: step.number(),
                        error,
                    };
                    break;
                }
            }
        }

        let final_state = match &status {
            DeploymentStatus::Succeeded => PipelineState::Succeeded,
            DeploymentStatus::Failed { step, .. } => PipelineState::Failed(*step),
        };
        self.set_state(final_state);

        let attempt = DeploymentAttempt {
            id,
            event: event.clone(),
            started_at,
            completed_at: Utc::now(),
            steps,
            status,
        };
        if !attempt.succeeded() && self.container_absent() {
            warn!(
                "Deployment {} - no container named '{}' is running since an earlier teardown",
                attempt.id, self.target.container_name
            );
        }
        attempt
    }

    async fn perform_with_timeout(
        &self,
        step: Step,
        event: &PushEvent,
    ) -> Result<(StepOutcome, String), StepError> {
        match tokio::time::timeout(self.step_timeout, self.perform(step, event)).await {
            Ok(result) => result,
            Err(_) => Err(StepError::Timeout {
                after: self.step_timeout,
            }),
        }
    }

    async fn perform(&self, step: Step, event: &PushEvent) -> Result<(StepOutcome, String), StepError> {
        let target = &self.target;
        match step {
            Step::SourceUpdate => self
                .source
                .pull_branch(&target.repo_path, event)
                .await
                .map(|out| (StepOutcome::Succeeded, out)),
            Step::ImageBuild => self
                .builder
                .build(&target.repo_path, &target.image_tag, event)
                .await
                .map(|out| (StepOutcome::Succeeded, out)),
            Step::Teardown => match self.teardown().await? {
                TeardownOutcome::Removed => Ok((
                    StepOutcome::Succeeded,
                    format!("removed container '{}'", target.container_name),
                )),
                TeardownOutcome::NotFound => Ok((
                    StepOutcome::NotFound,
                    format!("no container named '{}'", target.container_name),
                )),
            },
            Step::Start => self
                .runtime
                .run(&target.container_name, &target.image_tag, &target.network, event)
                .await
                .map(|out| (StepOutcome::Succeeded, out)),
        }
    }

    /// Stop and remove the old container if there is one.
    pub async fn teardown(&self) -> Result<TeardownOutcome, StepError> {
        let name = &self.target.container_name;
        if self.runtime.find(name).await?.is_none() {
            info!("No running container named '{}', skipping teardown", name);
            return Ok(TeardownOutcome::NotFound);
        }
        self.runtime.stop(name).await?;
        self.runtime.remove(name).await?;
        Ok(TeardownOutcome::Removed)
    }
}
