//! Observability hook for failures the accept loops absorb.
//!
//! A failure while servicing one connection never stops the listener. The
//! connection is dropped and the error is reported here instead.

use crate::connection::ConnectionInfo;
use crate::error::ChannelError;
use std::sync::Arc;
use tracing::{error, warn};

/// Receives per-connection servicing failures.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn servicing_failed(&self, connection: &ConnectionInfo, error: &ChannelError);
}

/// Default observer: logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn servicing_failed(&self, connection: &ConnectionInfo, err: &ChannelError) {
        if err.is_contract_violation() {
            error!("{} failed: {}", connection, err);
        } else {
            warn!("{} failed: {}", connection, err);
        }
    }
}

impl<F> ConnectionObserver for F
where
    F: Fn(&ConnectionInfo, &ChannelError) + Send + Sync + 'static,
{
    fn servicing_failed(&self, connection: &ConnectionInfo, err: &ChannelError) {
        self(connection, err)
    }
}

/// Shared observer handle.
pub type SharedObserver = Arc<dyn ConnectionObserver>;

pub fn default_observer() -> SharedObserver {
    Arc::new(TracingObserver)
}
