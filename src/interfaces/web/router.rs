use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::handlers::{devices, events, jobs, system};
use super::{AppState, sse_logs_endpoint};

fn build_localhost_cors(port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/api/images", get(system::list_images))
        .route("/api/discovery", post(devices::discover))
        .route(
            "/api/devices",
            get(devices::list_devices).delete(devices::clear_devices),
        )
        .route("/api/devices/{address}", get(devices::get_device))
        .route("/api/devices/{address}/target", post(devices::set_target))
        .route("/api/channel", post(devices::toggle_channel))
        .route("/api/prechecks", post(devices::run_prechecks))
        .route("/api/prechecks/{address}", get(devices::get_prechecks))
        .route("/api/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/api/jobs/{job_id}", get(jobs::get_job))
        .route("/api/jobs/{job_id}/log", get(jobs::get_job_log))
        .route("/api/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .route("/api/jobs/{job_id}/reschedule", post(jobs::reschedule_job))
        .route("/api/jobs/{job_id}/events", get(events::stream_job_events))
        .route("/api/events", get(events::stream_all_events))
        .route("/api/logs", get(sse_logs_endpoint))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.port))
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}
