//! Pipe listener and per-connection servicing for the IPC transport.
//!
//! The accept loop runs in a background task and hands each connection its
//! own task. A connection reads request frames one after another, runs each
//! through the server chain and writes the reply before reading the next.
//!
//! # Failure handling
//!
//! Anything that goes wrong while servicing a connection (a bad frame, a
//! failed dispatch, a dropped continuation, a panicking sink) ends that
//! connection only. The error goes to the [`ConnectionObserver`] and the
//! accept loop keeps going.
//!
//! [`ConnectionObserver`]: crate::observe::ConnectionObserver

use super::frame::{read_frame, write_frame};
use super::pipe::{PipeListener, PipeStream};
use super::url;
use crate::config::TransportConfig;
use crate::connection::{ConnectionIdCounter, ConnectionInfo, TransportKind};
use crate::error::{ChannelError, Result};
use crate::headers::keys;
use crate::listener::ListenerHandle;
use crate::observe::SharedObserver;
use crate::sink::{Completion, ServerSinkChain};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info};

/// Source of accepted pipe streams.
#[async_trait]
trait Accept: Send + 'static {
    async fn accept(&mut self) -> Result<PipeStream>;
    fn name(&self) -> &str;
}

#[async_trait]
impl Accept for PipeListener {
    async fn accept(&mut self) -> Result<PipeStream> {
        PipeListener::accept(self).await
    }

    fn name(&self) -> &str {
        PipeListener::name(self)
    }
}

/// Runs a request under the calling client's identity.
///
/// The returned guard reverts the identity when dropped, which happens after
/// dispatch whether it succeeded, failed or panicked.
///
/// Dispatch awaits while the guard is held, and on a multi-thread runtime the
/// task may resume on another worker. The guard can therefore be dropped on a
/// different thread than the one `impersonate` ran on, so the identity must
/// belong to the task or process. Thread-bound identities are not supported.
pub trait Impersonation: Send + Sync + 'static {
    fn impersonate(&self, connection: &ConnectionInfo) -> Result<ImpersonationGuard>;
}

/// Reverts an impersonation on drop.
#[must_use = "the identity is reverted as soon as the guard is dropped"]
pub struct ImpersonationGuard {
    revert: Option<Box<dyn FnOnce() + Send>>,
}

impl ImpersonationGuard {
    pub fn new(revert: impl FnOnce() + Send + 'static) -> Self {
        Self {
            revert: Some(Box::new(revert)),
        }
    }

    /// A guard with nothing to revert.
    pub fn noop() -> Self {
        Self { revert: None }
    }
}

impl Drop for ImpersonationGuard {
    fn drop(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert();
        }
    }
}

impl std::fmt::Debug for ImpersonationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpersonationGuard")
            .field("armed", &self.revert.is_some())
            .finish()
    }
}

/// Server transport for one pipe.
pub struct IpcServerTransportSink {
    chain: Arc<ServerSinkChain>,
    ids: ConnectionIdCounter,
    observer: SharedObserver,
    impersonation: Option<Arc<dyn Impersonation>>,
    max_frame_size: usize,
}

impl IpcServerTransportSink {
    pub fn new(
        chain: Arc<ServerSinkChain>,
        ids: ConnectionIdCounter,
        observer: SharedObserver,
        max_frame_size: usize,
    ) -> Self {
        Self {
            chain,
            ids,
            observer,
            impersonation: None,
            max_frame_size,
        }
    }

    pub fn with_impersonation(mut self, impersonation: Arc<dyn Impersonation>) -> Self {
        self.impersonation = Some(impersonation);
        self
    }

    pub fn chain(&self) -> &Arc<ServerSinkChain> {
        &self.chain
    }

    /// Start accepting on `listener` in the background.
    pub fn spawn(self: &Arc<Self>, listener: PipeListener) -> ListenerHandle {
        info!("IPC server listening on {}", listener.endpoint());
        let sink = self.clone();
        ListenerHandle::spawn(listener.endpoint(), move |shutdown_rx, conn_shutdown_rx| {
            sink.accept_loop(listener, shutdown_rx, conn_shutdown_rx)
        })
    }

    async fn accept_loop<L: Accept>(
        self: Arc<Self>,
        mut listener: L,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
    ) {
        let pipe_name = listener.name().to_string();
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("IPC server on pipe {} shutting down", pipe_name);
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok(stream) => {
                            let info = ConnectionInfo {
                                id: self.ids.next_id(),
                                transport: TransportKind::Ipc,
                                peer: pipe_name.clone(),
                            };
                            let sink = self.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Accepted {}", info);
                                let serviced = AssertUnwindSafe(
                                    sink.handle_connection(&info, stream, &mut conn_shutdown),
                                )
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| {
                                    Err(ChannelError::Other("connection handler panicked".to_string()))
                                });
                                if let Err(e) = serviced {
                                    sink.observer.servicing_failed(&info, &e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error on pipe {}: {}", pipe_name, e);
                            tokio::select! {
                                _ = &mut shutdown_rx => {
                                    info!("IPC server on pipe {} shutting down", pipe_name);
                                    break;
                                }
                                _ = tokio::time::sleep(TransportConfig::IPC_ACCEPT_RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        info: &ConnectionInfo,
        mut stream: PipeStream,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            let mut request = tokio::select! {
                result = read_frame(&mut stream, self.max_frame_size) => {
                    match result? {
                        Some(request) => request,
                        None => return Ok(()),
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(());
                }
            };

            if let Some(uri) = request.headers.request_uri() {
                let path = url::request_path(uri);
                request.headers.set_request_uri(path);
            }
            request.headers.set(keys::CONNECTION_ID, info.id);

            let completion = {
                let _guard = match &self.impersonation {
                    Some(hook) => hook.impersonate(info)?,
                    None => ImpersonationGuard::noop(),
                };
                self.chain.dispatch(request).await?
            };

            match completion {
                Completion::Reply(Ok(response)) => write_frame(&mut stream, &response).await?,
                Completion::Reply(Err(e)) => return Err(e),
                Completion::OneWay => {
                    debug!("One-way request on {}; closing", info);
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for IpcServerTransportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcServerTransportSink")
            .field("chain", &self.chain)
            .field("impersonation", &self.impersonation.is_some())
            .finish()
    }
}
