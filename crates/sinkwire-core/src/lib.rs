//! Sinkwire Core - transport sink chains and remoting channels.
//!
//! A channel moves opaque request bodies plus a [`HeaderBag`] between a
//! client and a server. Both sides run every call through a chain of sinks:
//! forwarding stages that may inspect or rewrite the message, and one
//! terminal stage that talks to the wire (client) or dispatches the call
//! (server). Two transports are provided:
//!
//! - [`http`]: request/response over HTTP/1.1 (reqwest on the client, axum
//!   on the server).
//! - [`ipc`]: length-prefixed frames over local named pipes (Unix domain
//!   sockets on Unix, named pipes on Windows).
//!
//! Channels are registered in a [`ChannelRegistry`], which picks a sender
//! for an outbound URL and lists the URLs under which a local object is
//! reachable.
//!
//! # Example
//!
//! ```rust,ignore
//! use sinkwire_core::{ChannelRegistry, Exchange, HeaderBag, HttpClientChannel, HttpClientConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sinkwire_core::Result<()> {
//!     let registry = ChannelRegistry::new();
//!     registry.register(Arc::new(HttpClientChannel::new(HttpClientConfig::default())?))?;
//!
//!     let sink = registry.create_message_sink("http://localhost:8085/Echo")?;
//!     let reply = sink
//!         .process_message(Exchange::new(HeaderBag::new(), &b"hello"[..]))
//!         .await?;
//!     println!("{} bytes back", reply.body.len());
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod formatter;
pub mod headers;
pub mod http;
pub mod ipc;
pub mod listener;
pub mod observe;
pub mod registry;
pub mod retry;
pub mod sink;

// Re-export commonly used types
pub use channel::{
    Channel, ChannelData, ChannelReceiver, ChannelSender, ClientChannelOptions, MessageSink,
    ParsedUrl, ServerChannelOptions,
};
pub use config::{
    ChannelProperties, HttpClientConfig, HttpServerConfig, IpcClientConfig, IpcServerConfig,
    TransportConfig,
};
pub use connection::{ConnectionIdCounter, ConnectionInfo, TransportKind};
pub use error::{ChannelError, Result};
pub use formatter::{CallHandler, CallResult, FormatterDispatch, JsonFormatter, MessageFormatter, RemoteFault};
pub use headers::{keys, Exchange, HeaderBag, HeaderValue};
pub use http::{HttpChannel, HttpClientChannel, HttpServerChannel};
pub use ipc::{IpcChannel, IpcClientChannel, IpcServerChannel};
pub use observe::{ConnectionObserver, SharedObserver, TracingObserver};
pub use registry::ChannelRegistry;
pub use sink::{
    CallTarget, ClientChannelSink, ClientSinkChain, ClientSinkProvider, ClientSinkStack,
    ClientTransportSink, Completion, ProcessingOutcome, ServerChannelSink, ServerDispatch,
    ServerSinkChain, ServerSinkProvider, ServerSinkStack,
};
