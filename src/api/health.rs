//! Liveness and configuration probe

use axum::{Json, extract::State as AxumState};
use serde_json::{Value, json};

use crate::SharedState;

/// GET /health
///
/// `partialState` is set from a teardown that removed the old container until
/// a new one starts. Failed runs in between do not clear it.
pub async fn health(AxumState(state): AxumState<SharedState>) -> Json<Value> {
    let last = state.history.lock().await.latest().cloned();
    let target = state.executor.target();

    Json(json!({
        "status": "ok",
        "secretConfigured": state.verifier.has_secret(),
        "version": env!("CARGO_PKG_VERSION"),
        "startedAt": state.started_at,
        "uptimeSeconds": state.start_time.elapsed().as_secs(),
        "deploying": state.executor.is_busy(),
        "pipelineState": state.executor.state(),
        "target": {
            "repoPath": target.repo_path,
            "image": target.image_tag,
            "container": target.container_name,
            "network": target.network,
        },
        "partialState": state.executor.container_absent(),
        "lastDeployment": last,
    }))
}
