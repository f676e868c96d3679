//! Dispatcher that sends every request body straight back.

use async_trait::async_trait;
use sinkwire_core::{keys, Exchange, HeaderBag, ProcessingOutcome, Result, ServerDispatch, ServerSinkStack};
use tracing::debug;

/// Header stamped on every echoed reply.
pub const ECHO_HEADER: &str = "Echo";

/// Replies with the request body and content type, plus `Echo: 1`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoDispatch;

#[async_trait]
impl ServerDispatch for EchoDispatch {
    async fn dispatch(
        &self,
        _stack: &mut ServerSinkStack,
        request: Exchange,
    ) -> Result<ProcessingOutcome> {
        debug!(
            "Echoing {} bytes for {}",
            request.body.len(),
            request.headers.request_uri().unwrap_or("/")
        );
        let mut headers = HeaderBag::new().with(ECHO_HEADER, "1");
        if let Some(content_type) = request.headers.content_type() {
            headers.set(keys::CONTENT_TYPE, content_type);
        }
        Ok(ProcessingOutcome::Complete(Exchange::new(headers, request.body)))
    }
}
