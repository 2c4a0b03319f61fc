use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use tokio_stream::StreamExt;

use crate::core::events::JobEvent;

use super::super::AppState;
use super::error_response;

/// Upper bound on persisted entries replayed before going live.
const REPLAY_LIMIT: usize = 100_000;

fn to_sse(event: &JobEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| event.message.clone());
    Event::default()
        .event("log")
        .id(event.seq.to_string())
        .data(data)
}

/// Persisted log of one job, then its live events. Terminal jobs get the
/// stored log followed by a `done` event.
pub async fn stream_job_events(
    Path(job_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    // Subscribe before reading the log so nothing falls between the two.
    let live = state.orchestrator.bus().subscribe_job(&job_id);

    let job = match state.orchestrator.job(&job_id).await {
        Ok(job) => job,
        Err(e) => return error_response(e),
    };
    let persisted = match state.orchestrator.job_log(&job_id, 0, REPLAY_LIMIT).await {
        Ok(entries) => entries,
        Err(e) => return error_response(e),
    };
    let last_seq = persisted.last().map(|entry| entry.seq).unwrap_or(0);
    let replay: Vec<JobEvent> = persisted.into_iter().map(JobEvent::from).collect();

    if job.status.is_terminal() {
        let done = Event::default()
            .event("done")
            .data(serde_json::json!({ "status": job.status }).to_string());
        let stream = tokio_stream::iter(replay)
            .map(|event| to_sse(&event))
            .chain(tokio_stream::once(done))
            .map(Ok::<_, Infallible>);
        return Sse::new(stream).into_response();
    }

    let stream = tokio_stream::iter(replay)
        .chain(live.filter(move |event| event.seq > last_seq))
        .map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Live events of every job.
pub async fn stream_all_events(State(state): State<AppState>) -> Response {
    let stream = state
        .orchestrator
        .bus()
        .subscribe()
        .map(|event| Ok::<_, Infallible>(to_sse(&event)));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}
