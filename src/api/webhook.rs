//! Webhook handler for push events

use axum::{
    Json,
    body::Bytes,
    extract::State as AxumState,
    http::{HeaderMap, StatusCode, header},
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::SharedState;
use crate::config::{BusyPolicy, DeployMode};
use crate::event::{self, EVENT_HEADER, ParsedEvent, PushEvent};
use crate::executor::{DeploymentAttempt, DeploymentStatus, QueueSlot};
use crate::signature::SIGNATURE_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: ResponseStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentAttempt>,
}

type Reply = (StatusCode, Json<WebhookResponse>);

fn reply(code: StatusCode, message: impl Into<String>) -> Reply {
    let status = if code.is_success() {
        ResponseStatus::Success
    } else {
        ResponseStatus::Error
    };
    (
        code,
        Json(WebhookResponse {
            status,
            message: message.into(),
            deployment: None,
        }),
    )
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

/// Run the pipeline on its own task and record the outcome.
///
/// Both status records are written while the pipeline is held. The join
/// handle doubles as the catch-all for panics inside the pipeline.
fn spawn_deployment(
    state: SharedState,
    slot: QueueSlot,
    event: PushEvent,
) -> JoinHandle<DeploymentAttempt> {
    tokio::spawn(async move {
        let permit = state.executor.wait_turn(slot).await;
        state.record_pending(&event).await;
        let attempt = state.executor.run_with(&permit, &event).await;
        state.record_finished(&attempt).await;
        drop(permit);
        attempt
    })
}

/// Answer for a delivery that found the pipeline taken
fn busy_reply(policy: BusyPolicy) -> Reply {
    match policy {
        BusyPolicy::Reject => {
            info!("Rejected push event, a deployment is in progress");
            reply(StatusCode::CONFLICT, "deployment in progress")
        }
        // The waiting run fetches the branch head when it starts.
        BusyPolicy::Queue => {
            info!("Push event folded into the already queued deployment");
            reply(StatusCode::ACCEPTED, "deployment already queued")
        }
    }
}

/// Handles the webhook POST request.
pub async fn handle_webhook(
    AxumState(state): AxumState<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    // Verify against the raw body before anything looks at its contents.
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if !state.verifier.verify(&body, signature) {
        warn!("Rejected webhook delivery with invalid signature");
        return reply(StatusCode::UNAUTHORIZED, "invalid signature");
    }

    if !is_json(&headers) {
        info!("Rejected webhook delivery with non-JSON content type");
        return reply(StatusCode::BAD_REQUEST, "expected application/json");
    }

    let event_type = headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok());
    let event = match event::parse(&body, event_type) {
        Ok(ParsedEvent::Push(event)) => event,
        Ok(ParsedEvent::NotAPushEvent) => {
            info!("Not push event; Received {:?} event", event_type);
            return reply(
                StatusCode::OK,
                format!("ignored {} event", event_type.unwrap_or("unknown")),
            );
        }
        Err(e) => {
            info!("Could not parse JSON body: {}", e);
            return reply(StatusCode::BAD_REQUEST, "invalid JSON payload");
        }
    };

    info!(
        "Push event for repository '{}' branch '{}' ({}) by '{}'",
        event.repository_name, event.branch, event.commit_sha, event.pusher_name
    );

    let slot = match state.busy_policy {
        BusyPolicy::Reject => state.executor.try_acquire(),
        BusyPolicy::Queue => state.executor.reserve(),
    };
    let Some(slot) = slot else {
        return busy_reply(state.busy_policy);
    };

    let handle = spawn_deployment(state.clone(), slot, event);

    if state.mode == DeployMode::Background {
        return reply(StatusCode::OK, "deployment started");
    }

    match handle.await {
        Ok(attempt) => {
            let (code, message) = match &attempt.status {
                DeploymentStatus::Succeeded => {
                    (StatusCode::OK, "deployment succeeded".to_string())
                }
                DeploymentStatus::Failed {
                    step,
                    step_number,
                    error,
                } => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(
                        "deployment failed at step {} ({}): {}",
                        step_number, step, error
                    ),
                ),
            };
            let (code, Json(mut body)) = reply(code, message);
            body.deployment = Some(attempt);
            (code, Json(body))
        }
        Err(e) => {
            error!("Deployment task ended unexpectedly: {}", e);
            reply(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn content_type_parameters_are_allowed() {
        let mut headers = HeaderMap::new();
        assert!(!is_json(&headers));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(is_json(&headers));

        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        assert!(!is_json(&headers));
    }
}
