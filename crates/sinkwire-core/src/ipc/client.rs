//! Terminal client sink for the IPC transport.
//!
//! Every call opens its own pipe connection, writes one request frame and,
//! unless the call is one-way, reads one response frame back. Connecting
//! retries with backoff while the pipe is missing or busy, bounded by the
//! configured connection timeout.

use super::frame::{read_frame, write_frame};
use super::pipe::{self, PipeStream};
use super::url;
use crate::config::{IpcClientConfig, TransportConfig};
use crate::error::{ChannelError, Result};
use crate::headers::Exchange;
use crate::retry::{retry_until, RetryConfig, RetryError};
use crate::sink::{CallTarget, ClientSinkStack, ClientTransportSink};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::debug;

/// Sends requests over a named pipe.
#[derive(Debug, Clone)]
pub struct IpcClientTransportSink {
    config: IpcClientConfig,
    retry: RetryConfig,
}

impl IpcClientTransportSink {
    pub fn new(config: IpcClientConfig) -> Self {
        let retry = RetryConfig::new()
            .with_base_delay(TransportConfig::IPC_CONNECT_BASE_DELAY)
            .with_max_delay(TransportConfig::IPC_CONNECT_MAX_DELAY);
        Self { config, retry }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn connect(&self, target: &CallTarget) -> Result<PipeStream> {
        let (_, pipe_name) = url::parse(&target.channel_uri).ok_or_else(|| ChannelError::InvalidUrl {
            url: target.channel_uri.clone(),
            message: "not an ipc:// channel URI".to_string(),
        })?;
        let deadline = Instant::now() + self.config.connect_timeout;
        let pipe_name = pipe_name.as_str();
        let dir = self.config.pipe_dir.as_path();

        retry_until(
            deadline,
            &self.retry,
            || pipe::connect(pipe_name, dir),
            ChannelError::is_retryable,
        )
        .await
        .map_err(|e| match e {
            RetryError::Fatal(e) => ChannelError::Connect {
                endpoint: target.channel_uri.clone(),
                message: e.to_string(),
            },
            RetryError::DeadlineExceeded(last) => {
                if let Some(last) = last {
                    debug!("Last connect error for {}: {}", target.channel_uri, last);
                }
                ChannelError::ConnectTimeout {
                    endpoint: target.channel_uri.clone(),
                    timeout: self.config.connect_timeout,
                }
            }
        })
    }

    /// Connect and write `request`, returning the open stream.
    async fn send(&self, target: &CallTarget, mut request: Exchange) -> Result<PipeStream> {
        if request.headers.request_uri().is_none() {
            request.headers.set_request_uri(target.url.clone());
        }
        let mut stream = self.connect(target).await?;
        write_frame(&mut stream, &request).await?;
        debug!("Sent IPC request to {}", target.url);
        Ok(stream)
    }
}

async fn receive(mut stream: PipeStream, max_frame_size: usize) -> Result<Exchange> {
    let reply = read_frame(&mut stream, max_frame_size).await;
    let _ = stream.shutdown().await;
    reply?.ok_or(ChannelError::ConnectionClosed)
}

#[async_trait]
impl ClientTransportSink for IpcClientTransportSink {
    async fn process_message(&self, target: &CallTarget, request: Exchange) -> Result<Exchange> {
        let stream = self.send(target, request).await?;
        receive(stream, self.config.max_frame_size).await
    }

    async fn async_process_request(
        &self,
        target: &CallTarget,
        stack: ClientSinkStack,
        request: Exchange,
    ) -> Result<()> {
        let mut stream = self.send(target, request).await?;
        if stack.is_one_way() {
            let _ = stream.shutdown().await;
            return Ok(());
        }

        let max_frame_size = self.config.max_frame_size;
        tokio::spawn(async move {
            let reply = receive(stream, max_frame_size).await;
            stack.resume(reply);
        });
        Ok(())
    }
}
