//! Forwarding sinks that log each call and its latency.

use super::{
    ClientChannelSink, ClientNext, ClientSinkStack, PendingResponse, ProcessingOutcome, Reply,
    ServerChannelSink, ServerNext, ServerSinkStack, SinkState,
};
use crate::error::Result;
use crate::headers::Exchange;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Frame state pushed by the tracing sinks.
struct Started {
    at: Instant,
    uri: String,
}

impl Started {
    fn new(uri: impl Into<String>) -> SinkState {
        Some(Box::new(Started {
            at: Instant::now(),
            uri: uri.into(),
        }))
    }
}

fn take_started(state: SinkState) -> (String, Option<Duration>) {
    match state.and_then(|s| s.downcast::<Started>().ok()) {
        Some(started) => (started.uri, Some(started.at.elapsed())),
        None => (String::new(), None),
    }
}

fn log_reply(side: &str, uri: &str, reply: &Reply, took: Option<Duration>) {
    match reply {
        Ok(response) => debug!(
            "{} call {} completed: {} body bytes in {:?}",
            side,
            uri,
            response.body.len(),
            took
        ),
        Err(e) => warn!("{} call {} failed after {:?}: {}", side, uri, took, e),
    }
}

/// Client-side tracing stage.
#[derive(Debug, Default, Clone)]
pub struct TraceClientSink;

#[async_trait]
impl ClientChannelSink for TraceClientSink {
    async fn process_message(&self, request: Exchange, next: ClientNext<'_>) -> Result<Exchange> {
        let url = next.target().url.clone();
        let started = Instant::now();
        debug!("client call {} sending {} body bytes", url, request.body.len());
        let reply = next.process_message(request).await;
        log_reply("client", &url, &reply, Some(started.elapsed()));
        reply
    }

    async fn async_process_request(
        &self,
        mut stack: ClientSinkStack,
        request: Exchange,
        next: ClientNext<'_>,
    ) -> Result<()> {
        debug!(
            "client async call {} sending {} body bytes",
            next.target().url,
            request.body.len()
        );
        if !stack.is_one_way() {
            stack.push(next.current(), Started::new(next.target().url.as_str()));
        }
        next.async_process_request(stack, request).await
    }

    fn async_process_response(&self, stack: ClientSinkStack, state: SinkState, reply: Reply) {
        let (uri, took) = take_started(state);
        log_reply("client async", &uri, &reply, took);
        stack.resume(reply);
    }
}

/// Server-side tracing stage.
#[derive(Debug, Default, Clone)]
pub struct TraceServerSink;

#[async_trait]
impl ServerChannelSink for TraceServerSink {
    async fn process_message(
        &self,
        stack: &mut ServerSinkStack,
        request: Exchange,
        next: ServerNext<'_>,
    ) -> Result<ProcessingOutcome> {
        let uri = request.headers.request_uri().unwrap_or_default().to_string();
        let me = next.current();
        stack.push(me.clone(), Started::new(uri.as_str()));

        let outcome = next.process_message(stack, request).await?;
        match &outcome {
            ProcessingOutcome::Complete(response) => {
                let (_, took) = take_started(stack.pop(&me)?);
                debug!(
                    "server call {} completed: {} body bytes in {:?}",
                    uri,
                    response.body.len(),
                    took
                );
            }
            ProcessingOutcome::OneWay => {
                stack.pop(&me)?;
                debug!("server call {} is one-way", uri);
            }
            ProcessingOutcome::Async => debug!("server call {} continues asynchronously", uri),
        }
        Ok(outcome)
    }

    fn async_process_response(&self, stack: PendingResponse, state: SinkState, reply: Reply) {
        let (uri, took) = take_started(state);
        log_reply("server async", &uri, &reply, took);
        stack.resume(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderBag;
    use crate::sink::{Completion, ServerDispatch, ServerSinkChain};
    use std::sync::Arc;

    struct Deferred;

    #[async_trait]
    impl ServerDispatch for Deferred {
        async fn dispatch(
            &self,
            stack: &mut ServerSinkStack,
            request: Exchange,
        ) -> Result<ProcessingOutcome> {
            // The trace frame must travel with the suspended stack.
            assert_eq!(stack.depth(), 1);
            let pending = stack.suspend();
            tokio::spawn(async move { pending.async_process_response(request) });
            Ok(ProcessingOutcome::Async)
        }
    }

    struct Immediate;

    #[async_trait]
    impl ServerDispatch for Immediate {
        async fn dispatch(
            &self,
            _stack: &mut ServerSinkStack,
            request: Exchange,
        ) -> Result<ProcessingOutcome> {
            Ok(ProcessingOutcome::Complete(request))
        }
    }

    #[tokio::test]
    async fn test_trace_sink_passes_responses_through() {
        for dispatch in [
            Arc::new(Deferred) as Arc<dyn ServerDispatch>,
            Arc::new(Immediate) as Arc<dyn ServerDispatch>,
        ] {
            let chain = ServerSinkChain::builder()
                .forwarding(TraceServerSink)
                .build(dispatch);
            let request = Exchange::new(HeaderBag::new().with("k", "v"), &b"abc"[..]);

            match chain.dispatch(request.clone()).await.unwrap() {
                Completion::Reply(Ok(response)) => assert_eq!(response, request),
                other => panic!("Expected reply, got: {:?}", other),
            }
        }
    }
}
