//! Push event decoding

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_HEADER: &str = "X-GitHub-Event";
pub const PUSH_EVENT: &str = "push";
pub const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Data extracted from an authenticated push payload.
/// Missing fields are left empty rather than failing the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub repository_name: String,
    pub branch: String,
    pub commit_sha: String,
    pub pusher_name: String,
}

/// Result of decoding a webhook delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    Push(PushEvent),
    /// Any other event category; acknowledged and ignored
    NotAPushEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Strips `refs/heads/` from a ref; any other ref is returned unchanged
pub fn branch_from_ref(git_ref: &str) -> &str {
    git_ref.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(git_ref)
}

fn string_at(payload: &Value, path: &[&str]) -> String {
    path.iter()
        .try_fold(payload, |value, key| value.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Decode a webhook body given the value of the event-type header.
pub fn parse(body: &[u8], event_type: Option<&str>) -> Result<ParsedEvent, ParseError> {
    if event_type != Some(PUSH_EVENT) {
        return Ok(ParsedEvent::NotAPushEvent);
    }

    let payload: Value = serde_json::from_slice(body)?;

    Ok(ParsedEvent::Push(PushEvent {
        repository_name: string_at(&payload, &["repository", "name"]),
        branch: branch_from_ref(&string_at(&payload, &["ref"])).to_string(),
        commit_sha: string_at(&payload, &["after"]),
        pusher_name: string_at(&payload, &["pusher", "name"]),
    }))
}
