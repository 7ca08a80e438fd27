//! Capabilities the deployment pipeline needs from the outside world.
//!
//! `DeploymentExecutor` only talks to these traits. `GitSource` and
//! `DockerCli` shell out to the real tools; `fake::FakePipeline` records calls
//! for tests.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use crate::event::PushEvent;

pub mod command;
pub mod docker;
pub mod fake;
pub mod git;

pub use docker::DockerCli;
pub use git::GitSource;

/// Failure of a single external step
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("{command} failed to start: {message}")]
    Spawn { command: String, message: String },

    #[error("{command} exited with code {code:?}: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("step timed out after {after:?}")]
    Timeout { after: Duration },

    #[error("{0}")]
    Invalid(String),
}

/// Brings the deployment working tree to the head of a branch
#[async_trait]
pub trait SourceControl: Send + Sync {
    async fn pull_branch(&self, repo_path: &Path, event: &PushEvent) -> Result<String, StepError>;
}

/// Builds the service image from the working tree
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, context: &Path, tag: &str, event: &PushEvent)
    -> Result<String, StepError>;
}

/// Lifecycle of the single named container
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// `Ok(None)` means no container with that name exists, which is not a failure.
    async fn find(&self, name: &str) -> Result<Option<String>, StepError>;
    async fn stop(&self, name: &str) -> Result<String, StepError>;
    async fn remove(&self, name: &str) -> Result<String, StepError>;
    async fn run(
        &self,
        name: &str,
        image: &str,
        network: &str,
        event: &PushEvent,
    ) -> Result<String, StepError>;
}
