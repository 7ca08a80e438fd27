//! In-memory pipeline used by tests.
//!
//! Every call is appended to a shared journal as `begin <op>` / `end <op>`
//! pairs so tests can check ordering and interleaving.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ContainerRuntime, ImageBuilder, SourceControl, StepError};
use crate::event::PushEvent;

/// Operations the fake can be told to fail or stall on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeOp {
    Pull,
    Build,
    Find,
    Stop,
    Remove,
    Run,
}

impl FakeOp {
    fn name(self) -> &'static str {
        match self {
            FakeOp::Pull => "pull",
            FakeOp::Build => "build",
            FakeOp::Find => "find",
            FakeOp::Stop => "stop",
            FakeOp::Remove => "remove",
            FakeOp::Run => "run",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakePipeline {
    journal: Arc<Mutex<Vec<String>>>,
    container_present: Arc<AtomicBool>,
    fail_on: Arc<Mutex<Option<FakeOp>>>,
    stall_on: Option<(FakeOp, Duration)>,
    delay: Duration,
}

impl Default for FakePipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePipeline {
    pub fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            container_present: Arc::new(AtomicBool::new(true)),
            fail_on: Arc::new(Mutex::new(None)),
            stall_on: None,
            delay: Duration::ZERO,
        }
    }

    /// Make `op` return a non-zero exit error
    pub fn failing_on(self, op: FakeOp) -> Self {
        self.set_failing(Some(op));
        self
    }

    /// Change the failing operation; shared by every clone
    pub fn set_failing(&self, op: Option<FakeOp>) {
        if let Ok(mut fail_on) = self.fail_on.lock() {
            *fail_on = op;
        }
    }

    fn fails(&self, op: FakeOp) -> bool {
        self.fail_on.lock().map(|f| *f == Some(op)).unwrap_or(false)
    }

    /// Make `op` sleep for `duration` before completing
    pub fn stalling_on(mut self, op: FakeOp, duration: Duration) -> Self {
        self.stall_on = Some((op, duration));
        self
    }

    /// Sleep inside every operation, to widen interleaving windows
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn without_container(self) -> Self {
        self.container_present.store(false, Ordering::SeqCst);
        self
    }

    pub fn container_present(&self) -> bool {
        self.container_present.load(Ordering::SeqCst)
    }

    /// Snapshot of every recorded call
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// Only the `begin` entries, without the prefix
    pub fn calls(&self) -> Vec<String> {
        self.journal()
            .into_iter()
            .filter_map(|e| e.strip_prefix("begin ").map(String::from))
            .collect()
    }

    fn record(&self, entry: String) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(entry);
        }
    }

    async fn perform(&self, op: FakeOp, detail: &str) -> Result<String, StepError> {
        let label = format!("{} {}", op.name(), detail);
        self.record(format!("begin {}", label));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some((stall_op, duration)) = self.stall_on {
            if stall_op == op {
                tokio::time::sleep(duration).await;
            }
        }

        let result = if self.fails(op) {
            Err(StepError::NonZeroExit {
                command: label.clone(),
                code: Some(1),
                stderr: format!("{} failed", op.name()),
            })
        } else {
            Ok(format!("{} ok", op.name()))
        };

        self.record(format!("end {}", label));
        result
    }
}

#[async_trait]
impl SourceControl for FakePipeline {
    async fn pull_branch(&self, _repo_path: &Path, event: &PushEvent) -> Result<String, StepError> {
        self.perform(FakeOp::Pull, &event.branch).await
    }
}

#[async_trait]
impl ImageBuilder for FakePipeline {
    async fn build(&self, _context: &Path, tag: &str, _event: &PushEvent) -> Result<String, StepError> {
        self.perform(FakeOp::Build, tag).await
    }
}

#[async_trait]
impl ContainerRuntime for FakePipeline {
    async fn find(&self, name: &str) -> Result<Option<String>, StepError> {
        self.perform(FakeOp::Find, name).await?;
        Ok(self.container_present().then(|| format!("{}-id", name)))
    }

    async fn stop(&self, name: &str) -> Result<String, StepError> {
        self.perform(FakeOp::Stop, name).await
    }

    async fn remove(&self, name: &str) -> Result<String, StepError> {
        let out = self.perform(FakeOp::Remove, name).await?;
        self.container_present.store(false, Ordering::SeqCst);
        Ok(out)
    }

    async fn run(
        &self,
        name: &str,
        image: &str,
        _network: &str,
        _event: &PushEvent,
    ) -> Result<String, StepError> {
        let out = self.perform(FakeOp::Run, &format!("{} {}", name, image)).await?;
        self.container_present.store(true, Ordering::SeqCst);
        Ok(out)
    }
}
