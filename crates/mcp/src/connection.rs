// Ordered request processing for one client connection

use crate::protocol::JsonRpcRequest;
use crate::session::{Chunk, Session, NOTIFICATION_CANCELLED};
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ChannelClosed,
}

/// Queues a connection's requests and runs them one at a time, so responses
/// leave in request order. Cancellation notifications skip the queue.
///
/// Dropping the connection closes its session, which cancels whatever is
/// still queued or running.
pub struct Connection {
    session: Arc<Session>,
    queue: Option<mpsc::UnboundedSender<JsonRpcRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start the worker. Chunks of every request are written to `output`.
    pub fn spawn(session: Arc<Session>, output: mpsc::Sender<Chunk>) -> Self {
        let (queue, mut requests) = mpsc::unbounded_channel::<JsonRpcRequest>();
        let worker_session = Arc::clone(&session);
        let worker = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let mut chunks = worker_session.produce(request);
                while let Some(chunk) = chunks.next().await {
                    if output.send(chunk).await.is_err() {
                        tracing::debug!(session_id = %worker_session.id(), "Output closed, stopping worker");
                        worker_session.close();
                        return;
                    }
                }
            }
        });

        Self {
            session,
            queue: Some(queue),
            worker: Some(worker),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Accept a message from the client
    pub fn submit(&self, request: JsonRpcRequest) -> Result<(), TransportError> {
        if request.is_notification() && request.method == NOTIFICATION_CANCELLED {
            self.session.cancel_request(&request);
            return Ok(());
        }

        let queue = self.queue.as_ref().ok_or(TransportError::ChannelClosed)?;
        self.session.register(&request);
        queue.send(request).map_err(|_| TransportError::ChannelClosed)
    }

    /// Stop accepting requests and wait for the worker to finish what is
    /// queued. With `cancel`, in-flight executions are killed first.
    pub async fn shutdown(mut self, cancel: bool) {
        if cancel {
            self.session.close();
        }
        self.queue.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        self.session.close();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.session.close();
    }
}
