//! Per-connection identity shared by the server transports.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Hands out connection ids. Ids wrap around after `u32::MAX`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionIdCounter {
    next: Arc<Mutex<u32>>,
}

impl ConnectionIdCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting at `first`.
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: Arc::new(Mutex::new(first)),
        }
    }

    pub fn next_id(&self) -> u32 {
        let mut next = self.next.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }
}

/// Transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Ipc,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Http => f.write_str("http"),
            TransportKind::Ipc => f.write_str("ipc"),
        }
    }
}

/// What the server knows about one inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u32,
    pub transport: TransportKind,
    /// Peer address or pipe name.
    pub peer: String,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} connection {} from {}", self.transport, self.id, self.peer)
    }
}
