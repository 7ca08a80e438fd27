use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info};

use super::StepError;

/// Maximum bytes of stdout/stderr kept per command
pub const MAX_OUTPUT_SIZE: usize = 16 * 1024;

/// An external command plus the environment it runs with
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        let mut cmd = self.program.clone();
        for arg in &self.args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        cmd
    }
}

fn truncate_output(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= MAX_OUTPUT_SIZE {
        return text.trim_end().to_string();
    }
    let mut cut = MAX_OUTPUT_SIZE;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n... (output truncated)", &text[..cut])
}

/// Runs a command to completion and returns its stdout.
///
/// The child is killed if the returned future is dropped, which is how step
/// timeouts in the executor reach the process.
pub async fn run_command(spec: &CommandSpec, cwd: Option<&Path>) -> Result<String, StepError> {
    let shown = spec.display();
    match cwd {
        Some(dir) => info!("Running (cwd = '{}'): {}", dir.display(), shown),
        None => info!("Running: {}", shown),
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await.map_err(|e| {
        error!("{} failed to start: {}", shown, e);
        StepError::Spawn {
            command: shown.clone(),
            message: e.to_string(),
        }
    })?;

    let stdout = truncate_output(&output.stdout);
    if !output.status.success() {
        let stderr = truncate_output(&output.stderr);
        error!("{} failed: {}", shown, stderr);
        return Err(StepError::NonZeroExit {
            command: shown,
            code: output.status.code(),
            stderr,
        });
    }

    debug!("{} output:\n{}", shown, stdout);
    Ok(stdout)
}
