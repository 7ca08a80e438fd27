use std::io;

/// Errors surfaced while configuring or running the deploy service
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("WEBHOOK_SECRET is not configured")]
    MissingSecret,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Helper type for Results that use DeployError
pub type Result<T> = std::result::Result<T, DeployError>;
