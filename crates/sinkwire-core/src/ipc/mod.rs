//! Local inter-process transport over named pipes.
//!
//! Requests and responses travel as length-prefixed frames (see [`frame`]) on
//! a per-call pipe connection. URLs take the form `ipc://<pipe>/<object>`.

pub mod channel;
pub mod client;
pub mod frame;
pub mod pipe;
pub mod server;
pub mod url;

pub use channel::{IpcChannel, IpcClientChannel, IpcServerChannel};
pub use client::IpcClientTransportSink;
pub use pipe::{DuplexStream, PipeListener, PipeStream};
pub use server::{Impersonation, ImpersonationGuard, IpcServerTransportSink};
