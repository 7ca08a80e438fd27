use async_trait::async_trait;
use std::path::Path;

use super::command::{CommandSpec, run_command};
use super::{ContainerRuntime, ImageBuilder, StepError};
use crate::event::PushEvent;

/// `ImageBuilder` and `ContainerRuntime` backed by the `docker` CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(self.binary.as_str())
    }

    /// Event metadata exported to the child process
    fn with_event_env(spec: CommandSpec, event: &PushEvent) -> CommandSpec {
        spec.env("DEPLOY_REPOSITORY", event.repository_name.as_str())
            .env("DEPLOY_BRANCH", event.branch.as_str())
            .env("DEPLOY_COMMIT", event.commit_sha.as_str())
            .env("DEPLOY_PUSHER", event.pusher_name.as_str())
    }

    pub fn build_command(&self, context: &Path, tag: &str, event: &PushEvent) -> CommandSpec {
        let spec = self
            .command()
            .args(["build", "-t", tag])
            .arg("--label")
            .arg(format!("deploy.commit={}", event.commit_sha))
            .arg("--label")
            .arg(format!("deploy.branch={}", event.branch))
            .arg(context.to_string_lossy());
        Self::with_event_env(spec, event)
    }

    pub fn find_command(&self, name: &str) -> CommandSpec {
        self.command()
            .args(["ps", "-a", "--filter"])
            .arg(format!("name=^/{}$", name))
            .args(["--format", "{{.ID}}"])
    }

    pub fn start_command(&self, name: &str, image: &str, network: &str, event: &PushEvent) -> CommandSpec {
        let spec = self
            .command()
            .args(["run", "-d", "--name", name, "--network", network, image]);
        Self::with_event_env(spec, event)
    }
}

#[async_trait]
impl ImageBuilder for DockerCli {
    async fn build(&self, context: &Path, tag: &str, event: &PushEvent) -> Result<String, StepError> {
        run_command(&self.build_command(context, tag, event), Some(context)).await
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn find(&self, name: &str) -> Result<Option<String>, StepError> {
        let out = run_command(&self.find_command(name), None).await?;
        Ok(out.lines().map(str::trim).find(|l| !l.is_empty()).map(String::from))
    }

    async fn stop(&self, name: &str) -> Result<String, StepError> {
        run_command(&self.command().args(["stop", name]), None).await
    }

    async fn remove(&self, name: &str) -> Result<String, StepError> {
        run_command(&self.command().args(["rm", name]), None).await
    }

    async fn run(
        &self,
        name: &str,
        image: &str,
        network: &str,
        event: &PushEvent,
    ) -> Result<String, StepError> {
        run_command(&self.start_command(name, image, network, event), None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> PushEvent {
        PushEvent {
            repository_name: "site".into(),
            branch: "main".into(),
            commit_sha: "abc123".into(),
            pusher_name: "octocat".into(),
        }
    }

    #[test]
    fn build_tags_and_labels_the_image() {
        let docker = DockerCli::default();
        let spec = docker.build_command(Path::new("/srv/site"), "site:latest", &event());
        assert_eq!(
            spec.display(),
            "docker build -t site:latest --label deploy.commit=abc123 --label deploy.branch=main /srv/site"
        );
        assert!(spec.env.contains(&("DEPLOY_COMMIT".into(), "abc123".into())));
    }

    #[test]
    fn find_matches_the_exact_name() {
        let spec = DockerCli::default().find_command("site");
        assert_eq!(
            spec.display(),
            "docker ps -a --filter name=^/site$ --format {{.ID}}"
        );
    }

    #[test]
    fn run_is_detached_on_the_network() {
        let spec = DockerCli::default().start_command("site", "site:latest", "web", &event());
        assert_eq!(
            spec.display(),
            "docker run -d --name site --network web site:latest"
        );
    }

    #[tokio::test]
    async fn find_treats_empty_output_as_absent() {
        // `true` ignores its arguments and prints nothing
        let runtime = DockerCli::new("true");
        assert_eq!(runtime.find("site").await.unwrap(), None);
    }

    #[tokio::test]
    async fn find_returns_first_id() {
        let runtime = DockerCli::new("echo");
        let found = runtime.find("site").await.unwrap();
        assert_eq!(
            found.as_deref(),
            Some("ps -a --filter name=^/site$ --format {{.ID}}")
        );
    }
}
