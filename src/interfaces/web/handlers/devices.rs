use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::super::AppState;
use super::{AddressesRequest, bad_request, error_response};

pub async fn list_devices(State(state): State<AppState>) -> Response {
    match state.orchestrator.devices().await {
        Ok(devices) => Json(serde_json::json!({ "success": true, "devices": devices }))
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_device(Path(address): Path<String>, State(state): State<AppState>) -> Response {
    match state.orchestrator.device(&address).await {
        Ok(device) => {
            Json(serde_json::json!({ "success": true, "device": device })).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn clear_devices(State(state): State<AppState>) -> Response {
    match state.orchestrator.clear_inventory().await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct TargetRequest {
    /// `null` clears the target.
    pub image: Option<String>,
}

pub async fn set_target(
    Path(address): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<TargetRequest>,
) -> Response {
    let image = payload.image.as_deref().map(str::trim).filter(|i| !i.is_empty());
    match state.orchestrator.set_target_image(&address, image).await {
        Ok(device) => {
            Json(serde_json::json!({ "success": true, "device": device })).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn discover(
    State(state): State<AppState>,
    Json(payload): Json<AddressesRequest>,
) -> Response {
    let addresses = payload.normalized();
    if addresses.is_empty() {
        return bad_request("addresses must not be empty");
    }
    let jobs = state.orchestrator.discover(&addresses).await;
    Json(serde_json::json!({ "success": true, "jobs": jobs })).into_response()
}

pub async fn run_prechecks(
    State(state): State<AppState>,
    Json(payload): Json<AddressesRequest>,
) -> Response {
    let addresses = payload.normalized();
    if addresses.is_empty() {
        return bad_request("addresses must not be empty");
    }
    let jobs = state.orchestrator.run_prechecks(&addresses).await;
    Json(serde_json::json!({ "success": true, "jobs": jobs })).into_response()
}

pub async fn get_prechecks(Path(address): Path<String>, State(state): State<AppState>) -> Response {
    match state.orchestrator.prechecks(&address).await {
        Ok(results) => {
            Json(serde_json::json!({ "success": true, "results": results })).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct ChannelRequest {
    pub addresses: Vec<String>,
    pub enable: bool,
}

pub async fn toggle_channel(
    State(state): State<AppState>,
    Json(payload): Json<ChannelRequest>,
) -> Response {
    let addresses = AddressesRequest {
        addresses: payload.addresses,
    }
    .normalized();
    if addresses.is_empty() {
        return bad_request("addresses must not be empty");
    }
    let jobs = state
        .orchestrator
        .toggle_channel(&addresses, payload.enable)
        .await;
    Json(serde_json::json!({ "success": true, "jobs": jobs })).into_response()
}
