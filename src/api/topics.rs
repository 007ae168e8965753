//! Topic API endpoints.

use axum::extract::State;

use super::{success, ApiResult};
use crate::models::Topic;
use crate::AppState;

/// GET /api/topics - List all topics.
pub async fn list_topics(State(state): State<AppState>) -> ApiResult<Vec<Topic>> {
    success(state.repo.list_topics().await?)
}
