//! Notification API endpoints.

use axum::extract::{Query, State};
use serde::Deserialize;

use super::{success, ApiResult};
use crate::errors::AppError;
use crate::models::StoredNotification;
use crate::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// Query parameters for notification listing.
#[derive(Debug, Deserialize)]
pub struct NotificationQuery {
    /// Only return notifications with a greater id
    #[serde(default)]
    pub after: i64,
    pub limit: Option<i64>,
}

/// GET /api/notifications - Notifications newer than `after`, oldest first.
pub async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationQuery>,
) -> ApiResult<Vec<StoredNotification>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(AppError::BadRequest(format!(
            "limit must be between 1 and {}",
            MAX_LIMIT
        )));
    }

    success(state.repo.list_notifications(query.after, limit).await?)
}
