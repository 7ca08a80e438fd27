//! Startup configuration: the deployment target definition and the webhook secret.
//!
//! The target is read from an optional TOML file and then overridden by
//! environment variables. The secret only ever comes from the environment.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DeployError, Result};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8000";
pub const DEFAULT_CONFIG_PATH: &str = "deploy.toml";
pub const DEFAULT_STATUS_FILE: &str = "/deploy/deploy.json";
const DEFAULT_REPO_PATH: &str = "/srv/app";
const DEFAULT_REMOTE: &str = "origin";
const DEFAULT_IMAGE_TAG: &str = "app:latest";
const DEFAULT_CONTAINER_NAME: &str = "app";
const DEFAULT_NETWORK: &str = "bridge";
const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;
const DEFAULT_HISTORY_SIZE: usize = 24;

/// Shared secret used to key webhook signatures.
///
/// Never printed: `Debug` is redacted and there is no `Display`.
#[derive(Clone)]
pub struct WebhookSecret(Vec<u8>);

impl WebhookSecret {
    /// Wraps a secret value, rejecting an empty one.
    pub fn new(value: impl Into<Vec<u8>>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(DeployError::MissingSecret);
        }
        Ok(Self(value))
    }

    /// Reads `WEBHOOK_SECRET`. Unset and empty are both a configuration error.
    pub fn from_env() -> Result<Self> {
        let value = std::env::var("WEBHOOK_SECRET").map_err(|_| DeployError::MissingSecret)?;
        Self::new(value)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(<redacted>)")
    }
}

/// Whether the webhook request waits for the pipeline to finish
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Sync,
    Background,
}

impl std::str::FromStr for DeployMode {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sync" => Ok(DeployMode::Sync),
            "background" => Ok(DeployMode::Background),
            other => Err(DeployError::Config(format!(
                "unknown deploy mode '{}', expected 'sync' or 'background'",
                other
            ))),
        }
    }
}

/// What a delivery does when a deployment is already running
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait behind the running deployment; at most one delivery waits
    #[default]
    Queue,
    /// Answer 409 straight away
    Reject,
}

impl std::str::FromStr for BusyPolicy {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "queue" => Ok(BusyPolicy::Queue),
            "reject" => Ok(BusyPolicy::Reject),
            other => Err(DeployError::Config(format!(
                "unknown busy policy '{}', expected 'queue' or 'reject'",
                other
            ))),
        }
    }
}

/// The single repository/container pair this process deploys
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    pub repo_path: PathBuf,
    pub remote: String,
    pub image_tag: String,
    pub container_name: String,
    pub network: String,
    pub step_timeout_secs: u64,
    /// Empty string disables the status file
    pub status_file: String,
    pub history_size: usize,
    pub mode: DeployMode,
    pub busy_policy: BusyPolicy,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from(DEFAULT_REPO_PATH),
            remote: DEFAULT_REMOTE.to_string(),
            image_tag: DEFAULT_IMAGE_TAG.to_string(),
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            status_file: DEFAULT_STATUS_FILE.to_string(),
            history_size: DEFAULT_HISTORY_SIZE,
            mode: DeployMode::Sync,
            busy_policy: BusyPolicy::Queue,
        }
    }
}

impl DeployConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    /// Returns the status file path, or None when disabled.
    pub fn status_path(&self) -> Option<PathBuf> {
        if self.status_file.trim().is_empty() {
            None
        } else {
            Some(PathBuf::from(&self.status_file))
        }
    }

    fn validate(&self) -> Result<()> {
        if self.image_tag.trim().is_empty() {
            return Err(DeployError::Config("image_tag must not be empty".into()));
        }
        if self.container_name.trim().is_empty() {
            return Err(DeployError::Config(
                "container_name must not be empty".into(),
            ));
        }
        if self.step_timeout_secs == 0 {
            return Err(DeployError::Config(
                "step_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.history_size == 0 {
            return Err(DeployError::Config(
                "history_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply `DEPLOY_*` overrides using the given lookup.
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DEPLOY_REPO_PATH") {
            self.repo_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("DEPLOY_REMOTE") {
            self.remote = v;
        }
        if let Some(v) = lookup("DEPLOY_IMAGE_TAG") {
            self.image_tag = v;
        }
        if let Some(v) = lookup("DEPLOY_CONTAINER_NAME") {
            self.container_name = v;
        }
        if let Some(v) = lookup("DEPLOY_NETWORK") {
            self.network = v;
        }
        if let Some(v) = lookup("DEPLOY_STATUS_FILE") {
            self.status_file = v;
        }
        if let Some(v) = lookup("DEPLOY_STEP_TIMEOUT_SECS") {
            self.step_timeout_secs = v.parse().map_err(|e| {
                DeployError::Config(format!("invalid DEPLOY_STEP_TIMEOUT_SECS '{}': {}", v, e))
            })?;
        }
        if let Some(v) = lookup("DEPLOY_MODE") {
            self.mode = v.parse()?;
        }
        if let Some(v) = lookup("DEPLOY_BUSY_POLICY") {
            self.busy_policy = v.parse()?;
        }
        Ok(())
    }
}

/// Parse a pipeline definition from TOML text
pub fn parse_config(config_str: &str) -> Result<DeployConfig> {
    let config: DeployConfig = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

/// Load the pipeline definition.
///
/// A missing file means built-in defaults; a present but broken file is an error.
pub fn load_config(path: &Path) -> Result<DeployConfig> {
    load_config_with(path, |key| std::env::var(key).ok())
}

fn load_config_with<F>(path: &Path, lookup: F) -> Result<DeployConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = if path.exists() {
        let config_str = std::fs::read_to_string(path).map_err(|e| {
            DeployError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str::<DeployConfig>(&config_str).map_err(|e| {
            DeployError::Config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?
    } else {
        DeployConfig::default()
    };

    config.apply_overrides(lookup)?;
    config.validate()?;
    Ok(config)
}
