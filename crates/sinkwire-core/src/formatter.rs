//! Message formatting at the edge of the sink chains.
//!
//! Transports move opaque bytes. A [`MessageFormatter`] turns typed calls
//! into those bytes and back. [`FormatterDispatch`] puts a typed
//! [`CallHandler`] behind a server chain, and [`invoke`] is the matching
//! client-side helper.
//!
//! Replies travel as a [`CallResult`]: either the return value or a
//! [`RemoteFault`]. A fault is also flagged with HTTP status 500, which the
//! HTTP client passes through as a normal reply.

use crate::channel::MessageSink;
use crate::error::{ChannelError, Result};
use crate::headers::{keys, Exchange, HeaderBag};
use crate::sink::{ProcessingOutcome, ServerDispatch, ServerSinkStack};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Serializes one message type.
pub trait MessageFormatter<T>: Send + Sync + 'static {
    /// Value for the `Content-Type` header.
    fn content_type(&self) -> &str;
    fn serialize(&self, message: &T) -> Result<Bytes>;
    fn deserialize(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON formatting through `serde_json`.
pub struct JsonFormatter<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFormatter<T> {
    pub const CONTENT_TYPE: &'static str = "application/json";

    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonFormatter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonFormatter<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonFormatter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonFormatter")
    }
}

impl<T> MessageFormatter<T> for JsonFormatter<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn serialize(&self, message: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Error raised by a remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub message: String,
}

impl RemoteFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// What a call sends back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResult<T> {
    Return(T),
    Fault(RemoteFault),
}

/// Typed server-side call target.
#[async_trait]
pub trait CallHandler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + Sync + 'static;

    /// Handle one call addressed to `object_uri`.
    async fn call(
        &self,
        object_uri: &str,
        request: Self::Request,
    ) -> std::result::Result<Self::Response, RemoteFault>;
}

/// Dispatch point that decodes requests, calls a [`CallHandler`] and
/// encodes its result.
pub struct FormatterDispatch<H, Q, R> {
    handler: Arc<H>,
    requests: Q,
    responses: R,
}

impl<H: CallHandler> FormatterDispatch<H, JsonFormatter<H::Request>, JsonFormatter<CallResult<H::Response>>> {
    /// JSON in both directions.
    pub fn json(handler: H) -> Self {
        Self::new(handler, JsonFormatter::new(), JsonFormatter::new())
    }
}

impl<H, Q, R> FormatterDispatch<H, Q, R> {
    pub fn new(handler: H, requests: Q, responses: R) -> Self {
        Self {
            handler: Arc::new(handler),
            requests,
            responses,
        }
    }
}

impl<H, Q, R> fmt::Debug for FormatterDispatch<H, Q, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatterDispatch").finish_non_exhaustive()
    }
}

#[async_trait]
impl<H, Q, R> ServerDispatch for FormatterDispatch<H, Q, R>
where
    H: CallHandler,
    Q: MessageFormatter<H::Request>,
    R: MessageFormatter<CallResult<H::Response>>,
{
    async fn dispatch(
        &self,
        _stack: &mut ServerSinkStack,
        request: Exchange,
    ) -> Result<ProcessingOutcome> {
        let object_uri = request
            .headers
            .request_uri()
            .map(object_uri_of)
            .unwrap_or_default();
        let call = self.requests.deserialize(&request.body)?;

        let result = match self.handler.call(&object_uri, call).await {
            Ok(value) => CallResult::Return(value),
            Err(fault) => {
                debug!("Call to {} faulted: {}", object_uri, fault);
                CallResult::Fault(fault)
            }
        };

        let mut headers = HeaderBag::new().with(keys::CONTENT_TYPE, self.responses.content_type());
        if matches!(result, CallResult::Fault(_)) {
            headers.set(keys::HTTP_STATUS_CODE, 500u16);
        }
        let body = self.responses.serialize(&result)?;
        Ok(ProcessingOutcome::Complete(Exchange::new(headers, body)))
    }
}

/// Object URI from a request URI: no leading `/`, no query.
fn object_uri_of(request_uri: &str) -> String {
    let path = request_uri.split('?').next().unwrap_or_default();
    path.trim_start_matches('/').to_string()
}

/// Call the object behind `sink` with a typed request.
pub async fn invoke<Req, Resp, Q, R>(
    sink: &MessageSink,
    requests: &Q,
    responses: &R,
    request: &Req,
) -> Result<Resp>
where
    Q: MessageFormatter<Req>,
    R: MessageFormatter<CallResult<Resp>>,
{
    let mut headers = HeaderBag::new()
        .with(keys::CONTENT_TYPE, requests.content_type())
        .with(keys::REQUEST_VERB, crate::config::TransportConfig::DEFAULT_HTTP_VERB);
    if let Some(object_uri) = sink.object_uri() {
        headers.set_request_uri(format!("/{}", object_uri));
    }
    let body = requests.serialize(request)?;

    let reply = sink.process_message(Exchange::new(headers, body)).await?;
    match responses.deserialize(&reply.body) {
        Ok(CallResult::Return(value)) => Ok(value),
        Ok(CallResult::Fault(fault)) => Err(ChannelError::Dispatch(fault.message)),
        Err(_) if reply.headers.status_code() == Some(500) => Err(ChannelError::Dispatch(
            String::from_utf8_lossy(&reply.body).into_owned(),
        )),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    struct Calculator;

    #[async_trait]
    impl CallHandler for Calculator {
        type Request = Add;
        type Response = i64;

        async fn call(&self, object_uri: &str, request: Add) -> std::result::Result<i64, RemoteFault> {
            if object_uri != "Calc" {
                return Err(RemoteFault::new(format!("no object at {}", object_uri)));
            }
            Ok(request.a + request.b)
        }
    }

    async fn run(uri: &str, body: &[u8]) -> Exchange {
        let dispatch = FormatterDispatch::json(Calculator);
        let (mut stack, _completion) = ServerSinkStack::new();
        let request = Exchange::new(
            HeaderBag::new().with(keys::REQUEST_URI, uri),
            Bytes::copy_from_slice(body),
        );
        match dispatch.dispatch(&mut stack, request).await.unwrap() {
            ProcessingOutcome::Complete(reply) => reply,
            other => panic!("Expected Complete, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_return_value_is_encoded() {
        let reply = run("/Calc", br#"{"a":2,"b":3}"#).await;
        assert_eq!(reply.headers.content_type(), Some("application/json"));
        assert!(reply.headers.status_code().is_none());

        let result: CallResult<i64> = JsonFormatter::new().deserialize(&reply.body).unwrap();
        assert_eq!(result, CallResult::Return(5));
    }

    #[tokio::test]
    async fn test_fault_sets_status_500() {
        let reply = run("/Other?x=1", br#"{"a":2,"b":3}"#).await;
        assert_eq!(reply.headers.status_code(), Some(500));

        let result: CallResult<i64> = JsonFormatter::new().deserialize(&reply.body).unwrap();
        assert_eq!(result, CallResult::Fault(RemoteFault::new("no object at Other")));
    }

    #[tokio::test]
    async fn test_undecodable_request_is_an_error() {
        let dispatch = FormatterDispatch::json(Calculator);
        let (mut stack, _completion) = ServerSinkStack::new();
        let request = Exchange::new(HeaderBag::new(), &b"not json"[..]);
        let err = dispatch.dispatch(&mut stack, request).await.unwrap_err();
        assert!(matches!(err, ChannelError::Json { .. }));
    }

    #[test]
    fn test_object_uri_strips_slash_and_query() {
        assert_eq!(object_uri_of("/Calc?x=1"), "Calc");
        assert_eq!(object_uri_of("app/Calc"), "app/Calc");
    }
}
