use async_trait::async_trait;
use std::path::Path;

use super::command::{CommandSpec, run_command};
use super::{SourceControl, StepError};
use crate::event::PushEvent;

const FETCH_HEAD: &str = "FETCH_HEAD";

/// `SourceControl` backed by the `git` binary
#[derive(Debug, Clone)]
pub struct GitSource {
    remote: String,
}

impl GitSource {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
        }
    }

    /// The commands run, in order, to move the working tree to `branch`.
    ///
    /// Everything after the fetch works from `FETCH_HEAD`, so single-branch
    /// clones without remote-tracking refs work too. A full ref such as
    /// `refs/tags/v1` is checked out detached instead of becoming a branch.
    pub fn commands(&self, branch: &str) -> Vec<CommandSpec> {
        let checkout = if branch.starts_with("refs/") {
            CommandSpec::new("git").args(["checkout", "--detach", FETCH_HEAD])
        } else {
            CommandSpec::new("git").args(["checkout", "-B", branch, FETCH_HEAD])
        };
        vec![
            CommandSpec::new("git").args(["fetch", self.remote.as_str(), branch]),
            checkout,
            CommandSpec::new("git").args(["reset", "--hard", FETCH_HEAD]),
        ]
    }
}

#[async_trait]
impl SourceControl for GitSource {
    async fn pull_branch(&self, repo_path: &Path, event: &PushEvent) -> Result<String, StepError> {
        if event.branch.is_empty() {
            return Err(StepError::Invalid("push event carried no branch".into()));
        }
        // Refuse anything git would read as an option.
        if event.branch.starts_with('-') {
            return Err(StepError::Invalid(format!(
                "refusing suspicious branch name '{}'",
                event.branch
            )));
        }

        let mut output = String::new();
        for spec in self.commands(&event.branch) {
            let out = run_command(&spec, Some(repo_path)).await?;
            if !out.is_empty() {
                output.push_str(&out);
                output.push('\n');
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_target_the_pushed_branch() {
        let git = GitSource::new("origin");
        let shown: Vec<String> = git.commands("release").iter().map(|c| c.display()).collect();
        assert_eq!(
            shown,
            vec![
                "git fetch origin release",
                "git checkout -B release FETCH_HEAD",
                "git reset --hard FETCH_HEAD",
            ]
        );
    }

    #[test]
    fn non_branch_ref_is_checked_out_detached() {
        let git = GitSource::new("upstream");
        let shown: Vec<String> = git
            .commands("refs/tags/v1")
            .iter()
            .map(|c| c.display())
            .collect();
        assert_eq!(
            shown,
            vec![
                "git fetch upstream refs/tags/v1",
                "git checkout --detach FETCH_HEAD",
                "git reset --hard FETCH_HEAD",
            ]
        );
    }

    #[tokio::test]
    async fn single_branch_clone_can_switch_branches() {
        let root = tempfile::tempdir().unwrap();
        let origin = root.path().join("origin");
        let clone = root.path().join("clone");
        let sh = |script: String| {
            let status = std::process::Command::new("sh")
                .arg("-c")
                .arg(script)
                .status()
                .unwrap();
            assert!(status.success());
        };
        sh(format!(
            "git init -q -b main {o} && cd {o} \
             && git -c user.name=t -c user.email=t@t commit -q --allow-empty -m one \
             && git checkout -q -b release \
             && git -c user.name=t -c user.email=t@t commit -q --allow-empty -m two \
             && git clone -q --single-branch -b main {o} {c}",
            o = origin.display(),
            c = clone.display()
        ));

        let event = PushEvent {
            branch: "release".into(),
            ..Default::default()
        };
        GitSource::new("origin")
            .pull_branch(&clone, &event)
            .await
            .unwrap();

        let head = std::process::Command::new("git")
            .args(["log", "-1", "--format=%s"])
            .current_dir(&clone)
            .output()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&head.stdout).trim(), "two");
    }

    #[tokio::test]
    async fn empty_branch_is_rejected_before_running_git() {
        let git = GitSource::new("origin");
        let err = git
            .pull_branch(Path::new("/nonexistent"), &PushEvent::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Invalid(_)));
    }

    #[tokio::test]
    async fn option_like_branch_is_rejected() {
        let git = GitSource::new("origin");
        let event = PushEvent {
            branch: "--upload-pack=evil".into(),
            ..Default::default()
        };
        let err = git
            .pull_branch(Path::new("/nonexistent"), &event)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Invalid(_)));
    }
}
