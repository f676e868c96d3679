//! Background accept-loop handle shared by the server transports.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a running accept loop. Dropping it shuts the loop down.
#[derive(Debug)]
pub struct ListenerHandle {
    endpoint: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Spawn `accept_loop`, handing it the accept-shutdown receiver and the
    /// receiver open connections watch for shutdown.
    pub fn spawn<F, Fut>(endpoint: impl Into<String>, accept_loop: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>, watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let task_handle = tokio::spawn(accept_loop(shutdown_rx, conn_shutdown_rx));

        Self {
            endpoint: endpoint.into(),
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop accepting and tell open connections to close.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            debug!("Stopping listener on {}", self.endpoint);
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }

    /// Shut down and wait up to `grace` for the loop to exit, so the
    /// endpoint is free again when this returns.
    pub async fn stop(mut self, grace: Duration) {
        self.shutdown();
        if let Some(mut handle) = self.task_handle.take() {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                warn!("Listener on {} did not stop within {:?}", self.endpoint, grace);
                handle.abort();
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}
