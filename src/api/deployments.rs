//! Recent deployment attempts

use axum::{
    Json,
    extract::{Query, State as AxumState},
};
use serde::{Deserialize, Serialize};

use crate::SharedState;
use crate::executor::DeploymentAttempt;

const DEFAULT_LIMIT: usize = 10;

#[derive(Debug, Deserialize)]
pub struct DeploymentsQuery {
    /// Number of attempts to return (default: 10)
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DeploymentsResponse {
    pub deployments: Vec<DeploymentAttempt>,
    pub count: usize,
    pub deploying: bool,
}

/// GET /deployments - Recent attempts, newest first
pub async fn get_deployments(
    AxumState(state): AxumState<SharedState>,
    Query(params): Query<DeploymentsQuery>,
) -> Json<DeploymentsResponse> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    let deployments = state.history.lock().await.recent(limit);

    Json(DeploymentsResponse {
        count: deployments.len(),
        deployments,
        deploying: state.executor.is_busy(),
    })
}
