//! Channel-level interfaces: what a transport exposes to its owner.
//!
//! A channel is a named, prioritized transport. Senders turn URLs into
//! [`MessageSink`]s bound to their client chain; receivers own a listener
//! and a server chain and advertise the URIs clients should use.

use crate::connection::ConnectionIdCounter;
use crate::error::{ChannelError, Result};
use crate::headers::Exchange;
use crate::ipc::server::Impersonation;
use crate::observe::{default_observer, SharedObserver};
use crate::sink::{
    CallTarget, ClientSinkChain, ClientSinkProvider, ClientSinkStack, ClientTransportSink, Reply,
    ServerDispatch, ServerSinkChain, ServerSinkProvider, TraceClientSink, TraceServerSink,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// A URL split at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// Everything that identifies the endpoint.
    pub channel_uri: String,
    /// What the endpoint should route to, without a leading `/`.
    pub object_uri: Option<String>,
}

/// Name, priority and URL grammar shared by every channel.
pub trait Channel: Send + Sync + 'static {
    fn channel_name(&self) -> &str;

    /// Higher values are preferred when several senders accept a URL.
    fn channel_priority(&self) -> i32;

    /// Split `url` if this channel's scheme accepts it.
    fn parse(&self, url: &str) -> Option<ParsedUrl>;

    fn as_sender(&self) -> Option<&dyn ChannelSender> {
        None
    }

    fn as_receiver(&self) -> Option<&dyn ChannelReceiver> {
        None
    }
}

/// Client half of a channel.
pub trait ChannelSender: Channel {
    /// Bind a message sink to `url`, or `None` when the URL belongs to
    /// another transport.
    fn create_message_sink(&self, url: &str) -> Option<MessageSink>;
}

/// Server half of a channel.
#[async_trait]
pub trait ChannelReceiver: Channel {
    fn channel_data(&self) -> ChannelData;

    /// URLs a client can use to reach `object_uri` on this receiver.
    fn urls_for_uri(&self, object_uri: &str) -> Vec<String>;

    /// Start the listener. Calling it while listening does nothing.
    async fn start_listening(&self) -> Result<()>;

    /// Stop the listener. Calling it while stopped does nothing.
    async fn stop_listening(&self) -> Result<()>;

    fn is_listening(&self) -> bool;
}

/// Endpoint information a receiver advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelData {
    pub channel_uris: Vec<String>,
}

impl ChannelData {
    pub fn new(channel_uris: Vec<String>) -> Self {
        Self { channel_uris }
    }

    /// Empty data, for receivers configured not to advertise.
    pub fn suppressed() -> Self {
        Self::default()
    }
}

/// Entry point of a client chain, bound to one URL.
#[derive(Debug, Clone)]
pub struct MessageSink {
    chain: Arc<ClientSinkChain>,
    target: Arc<CallTarget>,
}

impl MessageSink {
    pub fn new(chain: Arc<ClientSinkChain>, url: impl Into<String>, parsed: ParsedUrl) -> Self {
        Self {
            chain,
            target: Arc::new(CallTarget {
                url: url.into(),
                channel_uri: parsed.channel_uri,
                object_uri: parsed.object_uri,
            }),
        }
    }

    pub fn target(&self) -> &CallTarget {
        &self.target
    }

    pub fn object_uri(&self) -> Option<&str> {
        self.target.object_uri.as_deref()
    }

    /// Send `request` and wait for the response.
    pub async fn process_message(&self, request: Exchange) -> Result<Exchange> {
        self.chain.process_message(&self.target, request).await
    }

    /// Send `request`; the response, if any, is delivered through `stack`.
    pub async fn async_process_request(&self, stack: ClientSinkStack, request: Exchange) -> Result<()> {
        self.chain
            .async_process_request(&self.target, stack, request)
            .await
    }

    /// Send through the asynchronous path and wait for the reply.
    pub async fn call(&self, request: Exchange) -> Reply {
        let (stack, reply) = ClientSinkStack::with_reply_channel();
        self.async_process_request(stack, request).await?;
        reply
            .await
            .map_err(|_| ChannelError::ContinuationDropped)?
    }

    /// Send without waiting for, or expecting, a reply.
    pub async fn send_one_way(&self, request: Exchange) -> Result<()> {
        self.async_process_request(ClientSinkStack::one_way(), request)
            .await
    }
}

/// Chain setup for a client channel.
///
/// Without explicit providers the chain is a [`TraceClientSink`] followed by
/// the transport's own terminal sink.
#[derive(Clone, Default)]
pub struct ClientChannelOptions {
    providers: Option<Vec<Arc<dyn ClientSinkProvider>>>,
}

impl ClientChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default stages. A provider may end the chain with its own
    /// terminal sink.
    pub fn with_providers(mut self, providers: Vec<Arc<dyn ClientSinkProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub(crate) fn build_chain(
        &self,
        terminal: impl FnOnce() -> Arc<dyn ClientTransportSink>,
    ) -> ClientSinkChain {
        let builder = ClientSinkChain::builder();
        let builder = match &self.providers {
            Some(providers) => builder.providers(providers),
            None => builder.forwarding(TraceClientSink),
        };
        builder.build_with(terminal)
    }
}

impl fmt::Debug for ClientChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannelOptions")
            .field("providers", &self.providers.as_ref().map(Vec::len))
            .finish()
    }
}

/// Chain and listener setup for a server channel.
///
/// Without explicit providers the chain is a [`TraceServerSink`] followed by
/// the dispatcher.
#[derive(Clone)]
pub struct ServerChannelOptions {
    providers: Option<Vec<Arc<dyn ServerSinkProvider>>>,
    pub(crate) observer: SharedObserver,
    pub(crate) ids: ConnectionIdCounter,
    pub(crate) impersonation: Option<Arc<dyn Impersonation>>,
}

impl Default for ServerChannelOptions {
    fn default() -> Self {
        Self {
            providers: None,
            observer: default_observer(),
            ids: ConnectionIdCounter::new(),
            impersonation: None,
        }
    }
}

impl ServerChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_providers(mut self, providers: Vec<Arc<dyn ServerSinkProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Where per-connection failures are reported.
    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Share a connection-id sequence between several listeners.
    pub fn with_connection_ids(mut self, ids: ConnectionIdCounter) -> Self {
        self.ids = ids;
        self
    }

    /// Hook used when an IPC server is configured to impersonate callers.
    pub fn with_impersonation(mut self, impersonation: Arc<dyn Impersonation>) -> Self {
        self.impersonation = Some(impersonation);
        self
    }

    pub(crate) fn build_chain(&self, dispatch: Arc<dyn ServerDispatch>) -> ServerSinkChain {
        let builder = ServerSinkChain::builder();
        let builder = match &self.providers {
            Some(providers) => builder.providers(providers),
            None => builder.forwarding(TraceServerSink),
        };
        builder.build(dispatch)
    }
}

impl fmt::Debug for ServerChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerChannelOptions")
            .field("providers", &self.providers.as_ref().map(Vec::len))
            .field("impersonation", &self.impersonation.is_some())
            .finish()
    }
}
