//! HTTP channels: client, server and the combined form.

use super::client::HttpClientTransportSink;
use super::server::HttpServerTransportSink;
use super::url;
use crate::channel::{
    Channel, ChannelData, ChannelReceiver, ChannelSender, ClientChannelOptions, MessageSink,
    ParsedUrl, ServerChannelOptions,
};
use crate::config::{ChannelProperties, HttpClientConfig, HttpServerConfig, TransportConfig};
use crate::error::{ChannelError, Result};
use crate::listener::ListenerHandle;
use crate::sink::{ClientSinkChain, ClientTransportSink, ServerDispatch};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

/// Sends calls to `http://` and `https://` URLs.
#[derive(Debug)]
pub struct HttpClientChannel {
    config: HttpClientConfig,
    chain: Arc<ClientSinkChain>,
}

impl HttpClientChannel {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        Self::with_options(config, ClientChannelOptions::default())
    }

    pub fn with_options(config: HttpClientConfig, options: ClientChannelOptions) -> Result<Self> {
        let terminal = HttpClientTransportSink::new(&config)?;
        let chain = options.build_chain(|| Arc::new(terminal) as Arc<dyn ClientTransportSink>);
        Ok(Self {
            config,
            chain: Arc::new(chain),
        })
    }

    pub fn from_properties(props: &ChannelProperties) -> Result<Self> {
        Self::new(HttpClientConfig::from_properties(props)?)
    }

    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }
}

impl Channel for HttpClientChannel {
    fn channel_name(&self) -> &str {
        &self.config.name
    }

    fn channel_priority(&self) -> i32 {
        self.config.priority
    }

    fn parse(&self, url: &str) -> Option<ParsedUrl> {
        url::parse(url)
    }

    fn as_sender(&self) -> Option<&dyn ChannelSender> {
        Some(self)
    }
}

impl ChannelSender for HttpClientChannel {
    fn create_message_sink(&self, url: &str) -> Option<MessageSink> {
        let parsed = url::parse(url)?;
        Some(MessageSink::new(self.chain.clone(), url, parsed))
    }
}

/// Serves remoting calls over HTTP on one TCP port.
#[derive(Debug)]
pub struct HttpServerChannel {
    config: HttpServerConfig,
    sink: Arc<HttpServerTransportSink>,
    listener: Mutex<Option<ListenerHandle>>,
    listening: AtomicBool,
    /// Last bound address; reused on restart so a port picked by the OS
    /// stays stable.
    bound: StdMutex<Option<SocketAddr>>,
}

impl HttpServerChannel {
    /// Build the channel and, unless `listen` is off, start listening.
    pub async fn new(config: HttpServerConfig, dispatch: Arc<dyn ServerDispatch>) -> Result<Self> {
        Self::with_options(config, ServerChannelOptions::default(), dispatch).await
    }

    pub async fn with_options(
        config: HttpServerConfig,
        options: ServerChannelOptions,
        dispatch: Arc<dyn ServerDispatch>,
    ) -> Result<Self> {
        let chain = Arc::new(options.build_chain(dispatch));
        let sink = HttpServerTransportSink::new(chain, options.ids.clone(), options.observer.clone());
        let channel = Self {
            config,
            sink: Arc::new(sink),
            listener: Mutex::new(None),
            listening: AtomicBool::new(false),
            bound: StdMutex::new(None),
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
        Self::new(HttpServerConfig::from_properties(props)?, dispatch).await
    }

    /// Address the listener is (or was last) bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Port clients should use: the bound port once known, else the
    /// configured one.
    pub fn port(&self) -> u16 {
        self.local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port)
    }

    fn advertised_host(&self) -> String {
        if let Some(name) = &self.config.machine_name {
            return name.clone();
        }
        if !self.config.use_ip_address {
            return "localhost".to_string();
        }
        let ip = match self.config.bind_to {
            IpAddr::V4(v4) if v4.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(v6) if v6.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        }
    }

    pub fn channel_uri(&self) -> String {
        format!("http://{}:{}", self.advertised_host(), self.port())
    }
}

impl Channel for HttpServerChannel {
    fn channel_name(&self) -> &str {
        &self.config.name
    }

    fn channel_priority(&self) -> i32 {
        self.config.priority
    }

    fn parse(&self, url: &str) -> Option<ParsedUrl> {
        url::parse(url)
    }

    fn as_receiver(&self) -> Option<&dyn ChannelReceiver> {
        Some(self)
    }
}

#[async_trait]
impl ChannelReceiver for HttpServerChannel {
    fn channel_data(&self) -> ChannelData {
        if self.config.suppress_channel_data {
            ChannelData::suppressed()
        } else {
            ChannelData::new(vec![self.channel_uri()])
        }
    }

    fn urls_for_uri(&self, object_uri: &str) -> Vec<String> {
        vec![url::join(&self.channel_uri(), object_uri)]
    }

    async fn start_listening(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }
        let addr = SocketAddr::new(self.config.bind_to, self.port());
        let tcp = TcpListener::bind(addr).await.map_err(|e| ChannelError::Io {
            message: format!("binding {} failed: {}", addr, e),
            source: Some(e),
        })?;
        let local = tcp.local_addr()?;
        *self.bound.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(local);

        *listener = Some(self.sink.spawn(tcp)?);
        self.listening.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_listening(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if let Some(handle) = listener.take() {
            handle.stop(TransportConfig::LISTENER_STOP_GRACE).await;
            info!("Stopped listening on port {}", self.port());
        }
        self.listening.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }
}

/// Client and, optionally, server over HTTP under one name.
#[derive(Debug)]
pub struct HttpChannel {
    client: HttpClientChannel,
    server: Option<HttpServerChannel>,
}

impl HttpChannel {
    pub fn new(client: HttpClientChannel, server: Option<HttpServerChannel>) -> Self {
        Self { client, server }
    }

    /// Client from the shared properties; a server too when `port` is set.
    pub async fn from_properties(
        props: &ChannelProperties,
        dispatch: Option<Arc<dyn ServerDispatch>>,
    ) -> Result<Self> {
        let client = HttpClientChannel::from_properties(props)?;
        let server = match (props.get_str("port"), dispatch) {
            (None, _) => None,
            (Some(_), Some(dispatch)) => Some(HttpServerChannel::from_properties(props, dispatch).await?),
            (Some(_), None) => {
                return Err(ChannelError::config(
                    "port",
                    "a listening channel needs a dispatcher",
                ))
            }
        };
        Ok(Self { client, server })
    }

    pub fn client(&self) -> &HttpClientChannel {
        &self.client
    }

    pub fn server(&self) -> Option<&HttpServerChannel> {
        self.server.as_ref()
    }
}

impl Channel for HttpChannel {
    fn channel_name(&self) -> &str {
        self.client.channel_name()
    }

    fn channel_priority(&self) -> i32 {
        self.client.channel_priority()
    }

    fn parse(&self, url: &str) -> Option<ParsedUrl> {
        url::parse(url)
    }

    fn as_sender(&self) -> Option<&dyn ChannelSender> {
        Some(&self.client)
    }

    fn as_receiver(&self) -> Option<&dyn ChannelReceiver> {
        self.server.as_ref().map(|server| server as &dyn ChannelReceiver)
    }
}
