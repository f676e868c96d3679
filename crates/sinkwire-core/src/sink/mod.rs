//! Sink chains: the request/response processing pipelines of a channel.
//!
//! A chain is an immutable, ordered list of forwarding stages followed by
//! exactly one terminal stage. Forwarding stages transform the request and
//! hand it on through a `Next` handle; the terminal stage does the real work
//! (network I/O on the client, dispatch on the server).
//!
//! # Architecture
//!
//! ```text
//! client:  MessageSink -> [ClientChannelSink]* -> ClientTransportSink -> wire
//! server:  wire -> listener -> [ServerChannelSink]* -> ServerDispatch
//! ```
//!
//! Chains are built once, when the owning channel is constructed, and shared
//! behind an `Arc` by every call on that channel.

pub mod stack;
pub mod trace;

pub use stack::{
    ClientSinkStack, Completion, CompletionReceiver, PendingResponse, Reply, ReplySink,
    ServerSinkStack, SinkState,
};
pub use trace::{TraceClientSink, TraceServerSink};

use crate::error::{ChannelError, Result};
use crate::headers::Exchange;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Where a client call is going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTarget {
    /// Full URL as handed to the channel.
    pub url: String,
    /// URL without the object URI.
    pub channel_uri: String,
    pub object_uri: Option<String>,
}

/// Result of running a request through the server chain.
#[derive(Debug)]
pub enum ProcessingOutcome {
    /// The response is ready now.
    Complete(Exchange),
    /// No response will be sent; the connection may close.
    OneWay,
    /// The stack was suspended and will be resumed exactly once later.
    Async,
}

/// Forwarding stage of a client chain.
#[async_trait]
pub trait ClientChannelSink: Send + Sync + 'static {
    /// Synchronous round trip through the rest of the chain.
    async fn process_message(&self, request: Exchange, next: ClientNext<'_>) -> Result<Exchange> {
        next.process_message(request).await
    }

    /// Start an asynchronous call. Push onto `stack` to see the response.
    async fn async_process_request(
        &self,
        stack: ClientSinkStack,
        request: Exchange,
        next: ClientNext<'_>,
    ) -> Result<()> {
        next.async_process_request(stack, request).await
    }

    /// Called with the state this sink pushed. Must resume `stack`.
    fn async_process_response(&self, stack: ClientSinkStack, _state: SinkState, reply: Reply) {
        stack.resume(reply);
    }
}

/// Terminal stage of a client chain: performs the network round trip.
#[async_trait]
pub trait ClientTransportSink: Send + Sync + 'static {
    async fn process_message(&self, target: &CallTarget, request: Exchange) -> Result<Exchange>;

    /// Issue the request and return; the response resumes `stack` from
    /// whichever task completes the I/O.
    async fn async_process_request(
        &self,
        target: &CallTarget,
        stack: ClientSinkStack,
        request: Exchange,
    ) -> Result<()>;
}

/// Forwarding stage of a server chain.
#[async_trait]
pub trait ServerChannelSink: Send + Sync + 'static {
    async fn process_message(
        &self,
        stack: &mut ServerSinkStack,
        request: Exchange,
        next: ServerNext<'_>,
    ) -> Result<ProcessingOutcome> {
        next.process_message(stack, request).await
    }

    /// Called while a suspended stack unwinds. Must resume `stack`.
    fn async_process_response(&self, stack: PendingResponse, _state: SinkState, reply: Reply) {
        stack.resume(reply);
    }
}

/// Terminal stage of a server chain, implemented by the application.
///
/// To answer later, call [`ServerSinkStack::suspend`], keep the returned
/// [`PendingResponse`] and return [`ProcessingOutcome::Async`].
#[async_trait]
pub trait ServerDispatch: Send + Sync + 'static {
    async fn dispatch(
        &self,
        stack: &mut ServerSinkStack,
        request: Exchange,
    ) -> Result<ProcessingOutcome>;
}

/// A stage produced by a client sink provider.
pub enum ClientStage {
    Forwarding(Arc<dyn ClientChannelSink>),
    Terminal(Arc<dyn ClientTransportSink>),
}

/// A stage produced by a server sink provider.
pub enum ServerStage {
    Forwarding(Arc<dyn ServerChannelSink>),
    Dispatch(Arc<dyn ServerDispatch>),
}

/// Creates one client stage when a chain is built.
pub trait ClientSinkProvider: Send + Sync {
    fn create_stage(&self) -> ClientStage;
}

impl<F> ClientSinkProvider for F
where
    F: Fn() -> ClientStage + Send + Sync,
{
    fn create_stage(&self) -> ClientStage {
        self()
    }
}

/// Creates one server stage when a chain is built.
pub trait ServerSinkProvider: Send + Sync {
    fn create_stage(&self) -> ServerStage;
}

impl<F> ServerSinkProvider for F
where
    F: Fn() -> ServerStage + Send + Sync,
{
    fn create_stage(&self) -> ServerStage {
        self()
    }
}

/// Immutable client pipeline.
pub struct ClientSinkChain {
    stages: Vec<Arc<dyn ClientChannelSink>>,
    terminal: Arc<dyn ClientTransportSink>,
}

impl ClientSinkChain {
    pub fn builder() -> ClientChainBuilder {
        ClientChainBuilder::default()
    }

    /// Number of stages, terminal included.
    pub fn len(&self) -> usize {
        self.stages.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub async fn process_message(&self, target: &CallTarget, request: Exchange) -> Result<Exchange> {
        match self.stages.first() {
            Some(first) => {
                first
                    .process_message(request, ClientNext::new(self, target, 0))
                    .await
            }
            None => self.terminal.process_message(target, request).await,
        }
    }

    pub async fn async_process_request(
        &self,
        target: &CallTarget,
        stack: ClientSinkStack,
        request: Exchange,
    ) -> Result<()> {
        match self.stages.first() {
            Some(first) => {
                first
                    .async_process_request(stack, request, ClientNext::new(self, target, 0))
                    .await
            }
            None => {
                self.terminal
                    .async_process_request(target, stack, request)
                    .await
            }
        }
    }
}

impl fmt::Debug for ClientSinkChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSinkChain")
            .field("stages", &self.len())
            .finish()
    }
}

/// Handle to the remainder of a client chain, given to each forwarding stage.
pub struct ClientNext<'a> {
    chain: &'a ClientSinkChain,
    target: &'a CallTarget,
    /// Position of the stage holding this handle.
    position: usize,
}

impl<'a> ClientNext<'a> {
    fn new(chain: &'a ClientSinkChain, target: &'a CallTarget, position: usize) -> Self {
        Self {
            chain,
            target,
            position,
        }
    }

    pub fn target(&self) -> &CallTarget {
        self.target
    }

    /// The stage holding this handle, for pushing onto a sink stack.
    pub fn current(&self) -> Arc<dyn ClientChannelSink> {
        self.chain.stages[self.position].clone()
    }

    pub async fn process_message(self, request: Exchange) -> Result<Exchange> {
        let following = self.position + 1;
        match self.chain.stages.get(following) {
            Some(stage) => {
                stage
                    .process_message(request, ClientNext::new(self.chain, self.target, following))
                    .await
            }
            None => self.chain.terminal.process_message(self.target, request).await,
        }
    }

    pub async fn async_process_request(self, stack: ClientSinkStack, request: Exchange) -> Result<()> {
        let following = self.position + 1;
        match self.chain.stages.get(following) {
            Some(stage) => {
                stage
                    .async_process_request(
                        stack,
                        request,
                        ClientNext::new(self.chain, self.target, following),
                    )
                    .await
            }
            None => {
                self.chain
                    .terminal
                    .async_process_request(self.target, stack, request)
                    .await
            }
        }
    }
}

/// Appends client stages front to back.
#[derive(Default)]
pub struct ClientChainBuilder {
    stages: Vec<Arc<dyn ClientChannelSink>>,
    terminal: Option<Arc<dyn ClientTransportSink>>,
}

impl ClientChainBuilder {
    /// Append a stage.
    ///
    /// # Panics
    ///
    /// Panics if a terminal stage has already been appended: the terminal
    /// sink is always last.
    pub fn stage(mut self, stage: ClientStage) -> Self {
        if self.terminal.is_some() {
            panic!("cannot attach a sink after the terminal transport sink");
        }
        match stage {
            ClientStage::Forwarding(sink) => self.stages.push(sink),
            ClientStage::Terminal(sink) => self.terminal = Some(sink),
        }
        self
    }

    pub fn forwarding(self, sink: impl ClientChannelSink) -> Self {
        self.stage(ClientStage::Forwarding(Arc::new(sink)))
    }

    pub fn providers(self, providers: &[Arc<dyn ClientSinkProvider>]) -> Self {
        providers
            .iter()
            .fold(self, |builder, provider| builder.stage(provider.create_stage()))
    }

    pub fn has_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    /// Finish the chain, appending `default_terminal` if no provider
    /// supplied a terminal stage.
    pub fn build_with(
        self,
        default_terminal: impl FnOnce() -> Arc<dyn ClientTransportSink>,
    ) -> ClientSinkChain {
        ClientSinkChain {
            stages: self.stages,
            terminal: self.terminal.unwrap_or_else(default_terminal),
        }
    }
}

/// Immutable server pipeline.
pub struct ServerSinkChain {
    stages: Vec<Arc<dyn ServerChannelSink>>,
    dispatch: Arc<dyn ServerDispatch>,
}

impl ServerSinkChain {
    pub fn builder() -> ServerChainBuilder {
        ServerChainBuilder::default()
    }

    /// Number of stages, dispatch point included.
    pub fn len(&self) -> usize {
        self.stages.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub async fn process_message(
        &self,
        stack: &mut ServerSinkStack,
        request: Exchange,
    ) -> Result<ProcessingOutcome> {
        match self.stages.first() {
            Some(first) => {
                first
                    .process_message(stack, request, ServerNext::new(self, 0))
                    .await
            }
            None => self.dispatch.dispatch(stack, request).await,
        }
    }

    /// Run `request` through the chain and wait out an asynchronous outcome.
    pub async fn dispatch(&self, request: Exchange) -> Result<Completion> {
        let (mut stack, completion) = ServerSinkStack::new();
        match self.process_message(&mut stack, request).await? {
            ProcessingOutcome::Complete(response) => Ok(Completion::Reply(Ok(response))),
            ProcessingOutcome::OneWay => Ok(Completion::OneWay),
            ProcessingOutcome::Async => {
                if !stack.is_suspended() {
                    return Err(ChannelError::NotSuspended);
                }
                drop(stack);
                completion.wait().await
            }
        }
    }
}

impl fmt::Debug for ServerSinkChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSinkChain")
            .field("stages", &self.len())
            .finish()
    }
}

/// Handle to the remainder of a server chain, given to each forwarding stage.
pub struct ServerNext<'a> {
    chain: &'a ServerSinkChain,
    position: usize,
}

impl<'a> ServerNext<'a> {
    fn new(chain: &'a ServerSinkChain, position: usize) -> Self {
        Self { chain, position }
    }

    /// The stage holding this handle, for pushing onto a sink stack.
    pub fn current(&self) -> Arc<dyn ServerChannelSink> {
        self.chain.stages[self.position].clone()
    }

    pub async fn process_message(
        self,
        stack: &mut ServerSinkStack,
        request: Exchange,
    ) -> Result<ProcessingOutcome> {
        let following = self.position + 1;
        match self.chain.stages.get(following) {
            Some(stage) => {
                stage
                    .process_message(stack, request, ServerNext::new(self.chain, following))
                    .await
            }
            None => self.chain.dispatch.dispatch(stack, request).await,
        }
    }
}

/// Appends server stages front to back.
#[derive(Default)]
pub struct ServerChainBuilder {
    stages: Vec<Arc<dyn ServerChannelSink>>,
    dispatch: Option<Arc<dyn ServerDispatch>>,
}

impl ServerChainBuilder {
    /// Append a stage.
    ///
    /// # Panics
    ///
    /// Panics if the dispatch point has already been appended.
    pub fn stage(mut self, stage: ServerStage) -> Self {
        if self.dispatch.is_some() {
            panic!("cannot attach a sink after the dispatch sink");
        }
        match stage {
            ServerStage::Forwarding(sink) => self.stages.push(sink),
            ServerStage::Dispatch(dispatch) => self.dispatch = Some(dispatch),
        }
        self
    }

    pub fn forwarding(self, sink: impl ServerChannelSink) -> Self {
        self.stage(ServerStage::Forwarding(Arc::new(sink)))
    }

    pub fn providers(self, providers: &[Arc<dyn ServerSinkProvider>]) -> Self {
        providers
            .iter()
            .fold(self, |builder, provider| builder.stage(provider.create_stage()))
    }

    pub fn has_dispatch(&self) -> bool {
        self.dispatch.is_some()
    }

    /// Finish the chain, ending in `dispatch` unless a provider already
    /// supplied a dispatch point.
    pub fn build(self, dispatch: Arc<dyn ServerDispatch>) -> ServerSinkChain {
        ServerSinkChain {
            stages: self.stages,
            dispatch: self.dispatch.unwrap_or(dispatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderBag;
    use std::sync::Mutex;

    /// Tags the request on the way in and the response on the way out.
    struct Tagger(&'static str);

    #[async_trait]
    impl ClientChannelSink for Tagger {
        async fn process_message(&self, mut request: Exchange, next: ClientNext<'_>) -> Result<Exchange> {
            request.headers.set(self.0, "in");
            let mut response = next.process_message(request).await?;
            response.headers.set(self.0, "out");
            Ok(response)
        }
    }

    #[async_trait]
    impl ServerChannelSink for Tagger {
        async fn process_message(
            &self,
            stack: &mut ServerSinkStack,
            request: Exchange,
            next: ServerNext<'_>,
        ) -> Result<ProcessingOutcome> {
            let me = next.current();
            stack.push(me.clone(), Some(Box::new(self.0)));
            match next.process_message(stack, request).await? {
                ProcessingOutcome::Complete(mut response) => {
                    let state = stack.pop(&me)?;
                    let tag = state
                        .and_then(|s| s.downcast::<&'static str>().ok())
                        .map(|b| *b)
                        .unwrap_or_default();
                    response.headers.set(tag, "sync");
                    Ok(ProcessingOutcome::Complete(response))
                }
                other => Ok(other),
            }
        }

        fn async_process_response(&self, stack: PendingResponse, _state: SinkState, reply: Reply) {
            let tag = self.0;
            stack.resume(reply.map(|mut response| {
                response.headers.set(tag, "async");
                response
            }));
        }
    }

    /// Echoes the request, recording which headers reached it.
    struct Loopback {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ClientTransportSink for Loopback {
        async fn process_message(&self, _target: &CallTarget, request: Exchange) -> Result<Exchange> {
            self.seen
                .lock()
                .unwrap()
                .extend(request.headers.iter().map(|(k, _)| k.to_string()));
            Ok(request)
        }

        async fn async_process_request(
            &self,
            _target: &CallTarget,
            stack: ClientSinkStack,
            request: Exchange,
        ) -> Result<()> {
            tokio::spawn(async move { stack.async_process_response(request) });
            Ok(())
        }
    }

    enum Mode {
        Now,
        Later,
        Forget,
        Lie,
    }

    struct Echo(Mode);

    #[async_trait]
    impl ServerDispatch for Echo {
        async fn dispatch(
            &self,
            stack: &mut ServerSinkStack,
            request: Exchange,
        ) -> Result<ProcessingOutcome> {
            match self.0 {
                Mode::Now => Ok(ProcessingOutcome::Complete(request)),
                Mode::Later => {
                    let pending = stack.suspend();
                    tokio::spawn(async move { pending.async_process_response(request) });
                    Ok(ProcessingOutcome::Async)
                }
                Mode::Forget => {
                    drop(stack.suspend());
                    Ok(ProcessingOutcome::Async)
                }
                Mode::Lie => Ok(ProcessingOutcome::Async),
            }
        }
    }

    fn target() -> CallTarget {
        CallTarget {
            url: "ipc://test/Foo".into(),
            channel_uri: "ipc://test".into(),
            object_uri: Some("Foo".into()),
        }
    }

    fn server_chain(mode: Mode) -> ServerSinkChain {
        ServerSinkChain::builder()
            .forwarding(Tagger("outer"))
            .forwarding(Tagger("inner"))
            .build(Arc::new(Echo(mode)))
    }

    #[tokio::test]
    async fn test_client_chain_runs_stages_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = ClientSinkChain::builder()
            .forwarding(Tagger("first"))
            .forwarding(Tagger("second"))
            .build_with(|| Arc::new(Loopback { seen: seen.clone() }));
        assert_eq!(chain.len(), 3);

        let response = chain
            .process_message(&target(), Exchange::new(HeaderBag::new(), &b"x"[..]))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(response.headers.get_str("first"), Some("out"));
        assert_eq!(response.headers.get_str("second"), Some("out"));
    }

    #[tokio::test]
    async fn test_client_async_request_resumes_reply_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let chain = ClientSinkChain::builder().build_with(|| Arc::new(Loopback { seen }));

        let (stack, rx) = ClientSinkStack::with_reply_channel();
        chain
            .async_process_request(&target(), stack, Exchange::new(HeaderBag::new(), &b"hi"[..]))
            .await
            .unwrap();

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(&reply.body[..], b"hi");
    }

    #[test]
    fn test_provider_terminal_is_kept() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let custom: Arc<dyn ClientSinkProvider> = Arc::new(move || {
            ClientStage::Terminal(Arc::new(Loopback { seen: seen.clone() }))
        });

        let builder = ClientSinkChain::builder().providers(&[custom]);
        assert!(builder.has_terminal());
        let chain = builder.build_with(|| panic!("default terminal must not be used"));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    #[should_panic(expected = "terminal transport sink")]
    fn test_stage_after_terminal_panics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _ = ClientSinkChain::builder()
            .stage(ClientStage::Terminal(Arc::new(Loopback { seen })))
            .forwarding(Tagger("late"));
    }

    #[test]
    #[should_panic(expected = "dispatch sink")]
    fn test_stage_after_dispatch_panics() {
        let _ = ServerSinkChain::builder()
            .stage(ServerStage::Dispatch(Arc::new(Echo(Mode::Now))))
            .forwarding(Tagger("late"));
    }

    #[tokio::test]
    async fn test_server_chain_complete_pops_frames() {
        let chain = server_chain(Mode::Now);
        match chain.dispatch(Exchange::default()).await.unwrap() {
            Completion::Reply(Ok(response)) => {
                assert_eq!(response.headers.get_str("outer"), Some("sync"));
                assert_eq!(response.headers.get_str("inner"), Some("sync"));
            }
            other => panic!("Expected reply, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_chain_async_unwinds_suspended_frames() {
        let chain = server_chain(Mode::Later);
        match chain.dispatch(Exchange::default()).await.unwrap() {
            Completion::Reply(Ok(response)) => {
                assert_eq!(response.headers.get_str("outer"), Some("async"));
                assert_eq!(response.headers.get_str("inner"), Some("async"));
            }
            other => panic!("Expected reply, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_chain_detects_missing_continuation() {
        let err = server_chain(Mode::Forget)
            .dispatch(Exchange::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::ContinuationDropped));

        let err = server_chain(Mode::Lie)
            .dispatch(Exchange::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotSuspended));
    }
}
