//! IPC channels: client, server and the combined form.

use super::client::IpcClientTransportSink;
use super::pipe::PipeListener;
use super::server::IpcServerTransportSink;
use super::url;
use crate::channel::{
    Channel, ChannelData, ChannelReceiver, ChannelSender, ClientChannelOptions, MessageSink,
    ParsedUrl, ServerChannelOptions,
};
use crate::config::{ChannelProperties, IpcClientConfig, IpcServerConfig, TransportConfig};
use crate::error::{ChannelError, Result};
use crate::listener::ListenerHandle;
use crate::sink::{ClientSinkChain, ClientTransportSink, ServerDispatch};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Sends calls to `ipc://` URLs.
#[derive(Debug)]
pub struct IpcClientChannel {
    config: IpcClientConfig,
    chain: Arc<ClientSinkChain>,
}

impl IpcClientChannel {
    pub fn new(config: IpcClientConfig) -> Self {
        Self::with_options(config, ClientChannelOptions::default())
    }

    pub fn with_options(config: IpcClientConfig, options: ClientChannelOptions) -> Self {
        let terminal = IpcClientTransportSink::new(config.clone());
        let chain = options.build_chain(|| Arc::new(terminal) as Arc<dyn ClientTransportSink>);
        Self {
            config,
            chain: Arc::new(chain),
        }
    }

    pub fn from_properties(props: &ChannelProperties) -> Result<Self> {
        Ok(Self::new(IpcClientConfig::from_properties(props)?))
    }

    pub fn config(&self) -> &IpcClientConfig {
        &self.config
    }
}

impl Channel for IpcClientChannel {
    fn channel_name(&self) -> &str {
        &self.config.name
    }

    fn channel_priority(&self) -> i32 {
        self.config.priority
    }

    fn parse(&self, url: &str) -> Option<ParsedUrl> {
        url::parse(url).map(|(parsed, _)| parsed)
    }

    fn as_sender(&self) -> Option<&dyn ChannelSender> {
        Some(self)
    }
}

impl ChannelSender for IpcClientChannel {
    fn create_message_sink(&self, url: &str) -> Option<MessageSink> {
        let (parsed, _) = url::parse(url)?;
        Some(MessageSink::new(self.chain.clone(), url, parsed))
    }
}

/// Serves one named pipe.
#[derive(Debug)]
pub struct IpcServerChannel {
    config: IpcServerConfig,
    sink: Arc<IpcServerTransportSink>,
    listener: Mutex<Option<ListenerHandle>>,
    listening: AtomicBool,
}

impl IpcServerChannel {
    /// Build the channel and, unless `listen` is off, start listening.
    pub async fn new(config: IpcServerConfig, dispatch: Arc<dyn ServerDispatch>) -> Result<Self> {
        Self::with_options(config, ServerChannelOptions::default(), dispatch).await
    }

    pub async fn with_options(
        config: IpcServerConfig,
        options: ServerChannelOptions,
        dispatch: Arc<dyn ServerDispatch>,
    ) -> Result<Self> {
        if !url::is_valid_pipe_name(&config.pipe_name) {
            return Err(ChannelError::InvalidPipeName(config.pipe_name.clone()));
        }

        let chain = Arc::new(options.build_chain(dispatch));
        let mut sink = IpcServerTransportSink::new(
            chain,
            options.ids.clone(),
            options.observer.clone(),
            config.max_frame_size,
        );
        if config.impersonate {
            match options.impersonation.clone() {
                Some(hook) => sink = sink.with_impersonation(hook),
                None => warn!(
                    "Impersonation requested on pipe {} but no hook is installed; requests run under the server identity",
                    config.pipe_name
                ),
            }
        }

        let channel = Self {
            config,
            sink: Arc::new(sink),
            listener: Mutex::new(None),
            listening: AtomicBool::new(false),
        };
        if channel.config.listen {
            channel.start_listening().await?;
        }
        Ok(channel)
    }

    pub async fn from_properties(
        props: &ChannelProperties,
        dispatch: Arc<dyn ServerDispatch>,
    ) -> Result<Self> {
        Self::new(IpcServerConfig::from_properties(props)?, dispatch).await
    }

    pub fn pipe_name(&self) -> &str {
        &self.config.pipe_name
    }

    pub fn channel_uri(&self) -> String {
        format!("{}{}", url::SCHEME_PREFIX, self.config.pipe_name)
    }
}

impl Channel for IpcServerChannel {
    fn channel_name(&self) -> &str {
        &self.config.name
    }

    fn channel_priority(&self) -> i32 {
        self.config.priority
    }

    fn parse(&self, url: &str) -> Option<ParsedUrl> {
        url::parse(url).map(|(parsed, _)| parsed)
    }

    fn as_receiver(&self) -> Option<&dyn ChannelReceiver> {
        Some(self)
    }
}

#[async_trait]
impl ChannelReceiver for IpcServerChannel {
    fn channel_data(&self) -> ChannelData {
        if self.config.suppress_channel_data {
            ChannelData::suppressed()
        } else {
            ChannelData::new(vec![self.channel_uri()])
        }
    }

    fn urls_for_uri(&self, object_uri: &str) -> Vec<String> {
        vec![url::object_url(&self.config.pipe_name, object_uri)]
    }

    async fn start_listening(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }
        let pipe = PipeListener::bind(&self.config.pipe_name, &self.config.pipe_dir).await?;
        *listener = Some(self.sink.spawn(pipe));
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if let Some(handle) = listener.take() {
            handle.stop(TransportConfig::LISTENER_STOP_GRACE).await;
            info!("Stopped listening on pipe {}", self.config.pipe_name);
        }
        self.listening.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

/// Client and, optionally, server over IPC under one name.
#[derive(Debug)]
pub struct IpcChannel {
    client: IpcClientChannel,
    server: Option<IpcServerChannel>,
}

impl IpcChannel {
    pub fn new(client: IpcClientChannel, server: Option<IpcServerChannel>) -> Self {
        Self { client, server }
    }

    /// Client from the shared properties; a server too when `portName` is
    /// set.
    pub async fn from_properties(
        props: &ChannelProperties,
        dispatch: Option<Arc<dyn ServerDispatch>>,
    ) -> Result<Self> {
        let client = IpcClientChannel::from_properties(props)?;
        let server = match (props.get_str("portName"), dispatch) {
            (None, _) => None,
            (Some(_), Some(dispatch)) => Some(IpcServerChannel::from_properties(props, dispatch).await?),
            (Some(_), None) => {
                return Err(ChannelError::config(
                    "portName",
                    "a listening channel needs a dispatcher",
                ))
            }
        };
        Ok(Self { client, server })
    }

    pub fn client(&self) -> &IpcClientChannel {
        &self.client
    }

    pub fn server(&self) -> Option<&IpcServerChannel> {
        self.server.as_ref()
    }
}

impl Channel for IpcChannel {
    fn channel_name(&self) -> &str {
        self.client.channel_name()
    }

    fn channel_priority(&self) -> i32 {
        self.client.channel_priority()
    }

    fn parse(&self, url: &str) -> Option<ParsedUrl> {
        self.client.parse(url)
    }

    fn as_sender(&self) -> Option<&dyn ChannelSender> {
        Some(&self.client)
    }

    fn as_receiver(&self) -> Option<&dyn ChannelReceiver> {
        self.server.as_ref().map(|server| server as &dyn ChannelReceiver)
    }
}
