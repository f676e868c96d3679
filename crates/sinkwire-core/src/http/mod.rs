//! Remoting over HTTP/1.1.
//!
//! The client side sends each call as one request through `reqwest`; the
//! server side runs an axum router whose fallback handler feeds every
//! request into the server chain.

pub mod channel;
pub mod client;
pub mod server;
pub mod url;

pub use channel::{HttpChannel, HttpClientChannel, HttpServerChannel};
pub use client::HttpClientTransportSink;
pub use server::HttpServerTransportSink;
