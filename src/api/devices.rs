//! Device API endpoints.

use axum::{
    extract::{Path, State},
    Json,
};

use super::{success, ApiResult};
use crate::errors::AppError;
use crate::models::{Device, RegisterDeviceRequest};
use crate::AppState;

/// POST /api/devices - Register a device for push delivery.
pub async fn register_device(
    State(state): State<AppState>,
    Json(request): Json<RegisterDeviceRequest>,
) -> ApiResult<Device> {
    let device_id = request
        .device_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let device = state
        .repo
        .register_device(&device_id, &request.public_key)
        .await?;
    tracing::info!(device = %device.device_id, "Device registered");
    success(device)
}

/// GET /api/devices/:id - Get a registered device.
pub async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Device> {
    match state.repo.get_device(&id).await? {
        Some(device) => success(device),
        None => Err(AppError::NotFound(format!("Device {} not found", id))),
    }
}

/// DELETE /api/devices/:id - Unsubscribe a device.
pub async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<String> {
    if !state.repo.delete_device(&id).await? {
        return Err(AppError::NotFound(format!("Device {} not found", id)));
    }
    tracing::info!(device = %id, "Device unsubscribed");
    success(id)
}
