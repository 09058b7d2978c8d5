//! Progress events for streamed operations (pipeline runs, on-demand
//! verification). The HTTP layer turns them into SSE frames; the CLI prints
//! them as JSON lines.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub event: String,
    pub data: Value,
}

impl ProgressEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }
}

/// Where a long-running operation reports progress.
#[derive(Clone, Default)]
pub enum Progress {
    /// Background callers (the verification worker) emit nowhere.
    #[default]
    Silent,
    Channel(mpsc::Sender<ProgressEvent>),
}

impl Progress {
    /// A bounded channel pair; the receiver side feeds an SSE response.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Progress::Channel(tx), rx)
    }

    /// A disconnected listener never aborts the operation it was watching.
    pub async fn emit(&self, event: &str, data: Value) {
        if let Progress::Channel(tx) = self {
            let _ = tx.send(ProgressEvent::new(event, data)).await;
        }
    }
}
