use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};

use super::super::AppState;
use super::error_response;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let settings = state.orchestrator.settings();
    Json(serde_json::json!({
        "success": true,
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "max_concurrent": settings.max_concurrent,
        "default_timezone": settings.default_timezone,
        "event_subscribers": state.orchestrator.bus().subscriber_count(),
    }))
}

pub async fn list_images(State(state): State<AppState>) -> Response {
    match state.orchestrator.images().await {
        Ok(images) => {
            let images: Vec<serde_json::Value> = images
                .into_iter()
                .map(|image| {
                    let version = image.version();
                    let mut value = serde_json::json!(image);
                    value["version"] = serde_json::json!(version);
                    value
                })
                .collect();
            Json(serde_json::json!({ "success": true, "images": images })).into_response()
        }
        Err(e) => error_response(e),
    }
}
