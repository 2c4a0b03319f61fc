mod handlers;
mod router;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::Orchestrator;

pub struct ApiServer {
    orchestrator: Orchestrator,
    log_tx: broadcast::Sender<String>,
    host: String,
    port: u16,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) orchestrator: Orchestrator,
    pub(crate) log_tx: broadcast::Sender<String>,
    pub(crate) port: u16,
}

impl ApiServer {
    pub fn new(
        orchestrator: Orchestrator,
        log_tx: broadcast::Sender<String>,
        host: String,
        port: u16,
    ) -> Self {
        Self {
            orchestrator,
            log_tx,
            host,
            port,
            shutdown: CancellationToken::new(),
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver).map(|msg| match msg {
        Ok(line) => Ok(Event::default().data(line)),
        Err(_) => Ok(Event::default().event("lagged").data("log stream lagged")),
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    async fn on_init(&mut self) -> Result<()> {
        info!("API server initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        // Bind here so a taken port fails the start instead of a background task.
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let state = AppState {
            orchestrator: self.orchestrator.clone(),
            log_tx: self.log_tx.clone(),
            port: self.port,
        };
        let app = router::build_api_router(state);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!("API server running at http://{addr}");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("API server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("API server shutting down...");
        self.shutdown.cancel();
        Ok(())
    }
}
