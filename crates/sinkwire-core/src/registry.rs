//! Process-level set of registered channels.
//!
//! Channels are kept in descending priority order; among equal priorities
//! the earlier registration wins. Outbound calls go to the first sender that
//! accepts the URL.

use crate::channel::{Channel, MessageSink};
use crate::error::{ChannelError, Result};
use std::future::Future;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Registered channels plus the one-time configuration flag.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<Vec<Arc<dyn Channel>>>,
    configured: Mutex<bool>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Channel>>> {
        self.channels.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Channel>>> {
        self.channels.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add `channel`. Names must be unique.
    pub fn register(&self, channel: Arc<dyn Channel>) -> Result<()> {
        let mut channels = self.write();
        let name = channel.channel_name().to_string();
        if channels.iter().any(|c| c.channel_name() == name) {
            return Err(ChannelError::DuplicateChannel(name));
        }
        let priority = channel.channel_priority();
        let at = channels
            .iter()
            .position(|c| c.channel_priority() < priority)
            .unwrap_or(channels.len());
        channels.insert(at, channel);
        info!("Registered channel {:?} (priority {})", name, priority);
        Ok(())
    }

    /// Remove the channel called `name`, stopping its listener if it has one.
    pub async fn unregister(&self, name: &str) -> Result<Arc<dyn Channel>> {
        let channel = {
            let mut channels = self.write();
            let at = channels
                .iter()
                .position(|c| c.channel_name() == name)
                .ok_or_else(|| ChannelError::NoChannel(name.to_string()))?;
            channels.remove(at)
        };
        if let Some(receiver) = channel.as_receiver() {
            receiver.stop_listening().await?;
        }
        info!("Unregistered channel {:?}", name);
        Ok(channel)
    }

    pub fn channel(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.read().iter().find(|c| c.channel_name() == name).cloned()
    }

    /// All channels, highest priority first.
    pub fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.read().clone()
    }

    /// Message sink from the highest-priority sender that accepts `url`.
    pub fn create_message_sink(&self, url: &str) -> Result<MessageSink> {
        for channel in self.channels() {
            if let Some(sink) = channel.as_sender().and_then(|s| s.create_message_sink(url)) {
                debug!("Channel {:?} takes {}", channel.channel_name(), url);
                return Ok(sink);
            }
        }
        Err(ChannelError::NoChannel(url.to_string()))
    }

    /// Every URL at which `object_uri` is reachable through a listening
    /// receiver.
    pub fn urls_for_object(&self, object_uri: &str) -> Vec<String> {
        self.channels()
            .iter()
            .filter_map(|c| c.as_receiver())
            .filter(|r| r.is_listening())
            .flat_map(|r| r.urls_for_uri(object_uri))
            .collect()
    }

    /// Run `configure` once for the life of the registry. Returns `true` if
    /// this call ran it.
    ///
    /// The flag is checked and set under one lock, so concurrent callers
    /// wait for the first to finish. A failed `configure` leaves the flag
    /// unset.
    pub async fn ensure_configured<F, Fut>(&self, configure: F) -> Result<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut configured = self.configured.lock().await;
        if *configured {
            return Ok(false);
        }
        configure().await?;
        *configured = true;
        Ok(true)
    }

    /// Stop every listener and drop every channel.
    pub async fn shutdown(&self) {
        let channels = std::mem::take(&mut *self.write());
        for channel in channels {
            if let Some(receiver) = channel.as_receiver() {
                if let Err(e) = receiver.stop_listening().await {
                    warn!("Stopping channel {:?} failed: {}", channel.channel_name(), e);
                }
            }
        }
        info!("Channel registry shut down");
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .read()
            .iter()
            .map(|c| c.channel_name().to_string())
            .collect();
        f.debug_struct("ChannelRegistry").field("channels", &names).finish()
    }
}
