pub mod devices;
pub mod events;
pub mod jobs;
pub mod system;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::core::orchestrator::OrchestratorError;

/// Body shared by the batch endpoints.
#[derive(Deserialize)]
pub struct AddressesRequest {
    pub addresses: Vec<String>,
}

impl AddressesRequest {
    /// Trimmed, non-blank, de-duplicated addresses in request order.
    pub fn normalized(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.addresses
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .filter(|a| seen.insert(a.clone()))
            .collect()
    }
}

pub(crate) fn error_response(err: OrchestratorError) -> Response {
    let status = match &err {
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Conflict { .. } | OrchestratorError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        OrchestratorError::PrecheckGate { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestratorError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let mut body = json!({ "success": false, "error": err.to_string() });
    match &err {
        OrchestratorError::Conflict { job_id, .. } => body["job_id"] = json!(job_id),
        OrchestratorError::PrecheckGate { failing, .. } => body["failing"] = json!(failing),
        _ => {}
    }
    (status, Json(body)).into_response()
}

pub(crate) fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message })),
    )
        .into_response()
}
