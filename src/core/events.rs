//! Job log distribution.
//!
//! Every line is appended to the persisted job log first and then broadcast
//! to live subscribers. Subscribers that fall behind lose lines; they can
//! catch up from the persisted log using `seq`.

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::core::store::{JobLogEntry, Store};

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: String,
    pub seq: i64,
    pub message: String,
    pub at: String,
}

impl From<JobLogEntry> for JobEvent {
    fn from(entry: JobLogEntry) -> Self {
        Self {
            job_id: entry.job_id,
            seq: entry.seq,
            message: entry.message,
            at: entry.created_at,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    store: Store,
    sender: broadcast::Sender<JobEvent>,
    // Held across append + send so broadcast order matches `seq` order.
    order: Arc<Mutex<()>>,
}

impl EventBus {
    pub fn new(store: Store, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            store,
            sender,
            order: Arc::new(Mutex::new(())),
        }
    }

    pub async fn publish(&self, job_id: &str, message: impl Into<String>) -> Result<JobEvent> {
        let message = message.into();
        let _order = self.order.lock().await;
        let entry = self.store.append_job_log(job_id, &message).await?;
        let event = JobEvent::from(entry);
        // No subscribers is fine.
        let _ = self.sender.send(event.clone());
        Ok(event)
    }

    /// Live events of all jobs from now on.
    pub fn subscribe(&self) -> impl Stream<Item = JobEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                debug!("Event subscriber lagged, {} events dropped", missed);
                None
            }
        })
    }

    pub fn subscribe_job(&self, job_id: &str) -> impl Stream<Item = JobEvent> + Send + 'static {
        let job_id = job_id.to_string();
        self.subscribe().filter(move |event| event.job_id == job_id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
