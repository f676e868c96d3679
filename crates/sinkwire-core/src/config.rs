//! Centralized configuration for sinkwire channels.
//!
//! Channel settings arrive from an external loader as a flat string-keyed
//! property map ([`ChannelProperties`]) and are consumed once, when a channel
//! is constructed. The typed configs below can also be built directly with
//! their `with_*` methods.

use crate::error::{ChannelError, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Transport-wide defaults and limits.
pub struct TransportConfig;

impl TransportConfig {
    pub const DEFAULT_PRIORITY: i32 = 1;
    pub const HTTP_CHANNEL_NAME: &'static str = "http";
    pub const IPC_CHANNEL_NAME: &'static str = "ipc";
    pub const DEFAULT_HTTP_VERB: &'static str = "POST";
    pub const DEFAULT_USER_AGENT: &'static str = "sinkwire/0.3";

    // IPC connect behaviour
    pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const IPC_CONNECT_BASE_DELAY: Duration = Duration::from_millis(20);
    pub const IPC_CONNECT_MAX_DELAY: Duration = Duration::from_millis(500);
    /// Pause after a failed accept before trying again.
    pub const IPC_ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

    // IPC framing
    pub const MAX_IPC_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB per field
    pub const PIPE_FILE_SUFFIX: &'static str = ".pipe";
    pub const PIPE_DIR_NAME: &'static str = "sinkwire";

    /// How long `stop_listening` waits for an accept loop to wind down.
    pub const LISTENER_STOP_GRACE: Duration = Duration::from_secs(5);
    pub const MAX_HTTP_BODY_SIZE: usize = 64 * 1024 * 1024;
}

/// Flat string-keyed property map handed over by a configuration loader.
#[derive(Debug, Clone, Default)]
pub struct ChannelProperties {
    values: HashMap<String, String>,
}

impl ChannelProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get_str(key) {
            None => Ok(None),
            Some(v) => match v.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Some(true)),
                "false" | "no" | "0" => Ok(Some(false)),
                other => Err(ChannelError::config(
                    key,
                    format!("expected a boolean, got {:?}", other),
                )),
            },
        }
    }

    pub fn get_i32(&self, key: &str) -> Result<Option<i32>> {
        self.parse_with(key, "an integer")
    }

    pub fn get_u16(&self, key: &str) -> Result<Option<u16>> {
        self.parse_with(key, "a port number")
    }

    /// Milliseconds; a negative value means "infinite" and maps to `None`.
    pub fn get_duration_ms(&self, key: &str) -> Result<Option<Duration>> {
        let ms: Option<i64> = self.parse_with(key, "a duration in milliseconds")?;
        Ok(ms.and_then(|ms| u64::try_from(ms).ok().map(Duration::from_millis)))
    }

    fn parse_with<T: std::str::FromStr>(&self, key: &str, what: &str) -> Result<Option<T>> {
        match self.get_str(key) {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ChannelError::config(key, format!("expected {}, got {:?}", what, v))),
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ChannelProperties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = ChannelProperties::new();
        for (k, v) in iter {
            props.insert(k, v);
        }
        props
    }
}

/// Client side of the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub name: String,
    pub priority: i32,
    /// `None` waits forever.
    pub timeout: Option<Duration>,
    pub proxy: Option<(String, u16)>,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            name: TransportConfig::HTTP_CHANNEL_NAME.to_string(),
            priority: TransportConfig::DEFAULT_PRIORITY,
            timeout: None,
            proxy: None,
            user_agent: TransportConfig::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl HttpClientConfig {
    pub fn from_properties(props: &ChannelProperties) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = props.get_str("name") {
            config.name = name.to_string();
        }
        if let Some(priority) = props.get_i32("priority")? {
            config.priority = priority;
        }
        config.timeout = props.get_duration_ms("timeout")?;
        if let Some(agent) = props.get_str("userAgent") {
            config.user_agent = agent.to_string();
        }
        if let Some(host) = props.get_str("proxyName") {
            let port = props.get_u16("proxyPort")?.unwrap_or(80);
            config.proxy = Some((host.to_string(), port));
        }
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Server side of the HTTP transport.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub name: String,
    pub priority: i32,
    /// 0 lets the OS pick a port.
    pub port: u16,
    pub bind_to: IpAddr,
    /// Host advertised in channel URIs; overrides the bind address.
    pub machine_name: Option<String>,
    pub use_ip_address: bool,
    pub listen: bool,
    pub suppress_channel_data: bool,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            name: TransportConfig::HTTP_CHANNEL_NAME.to_string(),
            priority: TransportConfig::DEFAULT_PRIORITY,
            port: 0,
            bind_to: IpAddr::from([127, 0, 0, 1]),
            machine_name: None,
            use_ip_address: true,
            listen: true,
            suppress_channel_data: false,
        }
    }
}

impl HttpServerConfig {
    pub fn from_properties(props: &ChannelProperties) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = props.get_str("name") {
            config.name = name.to_string();
        }
        if let Some(priority) = props.get_i32("priority")? {
            config.priority = priority;
        }
        if let Some(port) = props.get_u16("port")? {
            config.port = port;
        }
        if let Some(bind) = props.get_str("bindTo") {
            config.bind_to = bind
                .parse()
                .map_err(|_| ChannelError::config("bindTo", format!("invalid address {:?}", bind)))?;
        }
        config.machine_name = props
            .get_str("machineName")
            .or_else(|| props.get_str("hostname"))
            .map(str::to_string);
        if let Some(use_ip) = props.get_bool("useIpAddress")? {
            config.use_ip_address = use_ip;
        }
        if let Some(listen) = props.get_bool("listen")? {
            config.listen = listen;
        }
        if let Some(suppress) = props.get_bool("suppressChannelData")? {
            config.suppress_channel_data = suppress;
        }
        Ok(config)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_to(mut self, addr: IpAddr) -> Self {
        self.bind_to = addr;
        self
    }

    pub fn with_listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_machine_name(mut self, name: impl Into<String>) -> Self {
        self.machine_name = Some(name.into());
        self
    }
}

/// Client side of the IPC transport.
#[derive(Debug, Clone)]
pub struct IpcClientConfig {
    pub name: String,
    pub priority: i32,
    pub connect_timeout: Duration,
    /// Directory holding pipe sockets (Unix only).
    pub pipe_dir: PathBuf,
    pub max_frame_size: usize,
}

impl Default for IpcClientConfig {
    fn default() -> Self {
        Self {
            name: TransportConfig::IPC_CHANNEL_NAME.to_string(),
            priority: TransportConfig::DEFAULT_PRIORITY,
            connect_timeout: TransportConfig::IPC_CONNECT_TIMEOUT,
            pipe_dir: default_pipe_dir(),
            max_frame_size: TransportConfig::MAX_IPC_FRAME_SIZE,
        }
    }
}

impl IpcClientConfig {
    pub fn from_properties(props: &ChannelProperties) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = props.get_str("name") {
            config.name = name.to_string();
        }
        if let Some(priority) = props.get_i32("priority")? {
            config.priority = priority;
        }
        if let Some(timeout) = props.get_duration_ms("connectionTimeout")? {
            config.connect_timeout = timeout;
        }
        if let Some(dir) = props.get_str("pipeDirectory") {
            config.pipe_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipe_dir = dir.into();
        self
    }
}

/// Server side of the IPC transport.
#[derive(Debug, Clone)]
pub struct IpcServerConfig {
    pub name: String,
    pub priority: i32,
    pub pipe_name: String,
    pub pipe_dir: PathBuf,
    pub listen: bool,
    pub impersonate: bool,
    pub suppress_channel_data: bool,
    pub max_frame_size: usize,
}

impl IpcServerConfig {
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self {
            name: TransportConfig::IPC_CHANNEL_NAME.to_string(),
            priority: TransportConfig::DEFAULT_PRIORITY,
            pipe_name: pipe_name.into(),
            pipe_dir: default_pipe_dir(),
            listen: true,
            impersonate: false,
            suppress_channel_data: false,
            max_frame_size: TransportConfig::MAX_IPC_FRAME_SIZE,
        }
    }

    pub fn from_properties(props: &ChannelProperties) -> Result<Self> {
        let pipe_name = props
            .get_str("portName")
            .ok_or_else(|| ChannelError::config("portName", "an IPC server channel needs a pipe name"))?;
        let mut config = Self::new(pipe_name);
        if let Some(name) = props.get_str("name") {
            config.name = name.to_string();
        }
        if let Some(priority) = props.get_i32("priority")? {
            config.priority = priority;
        }
        if let Some(dir) = props.get_str("pipeDirectory") {
            config.pipe_dir = PathBuf::from(dir);
        }
        if let Some(listen) = props.get_bool("listen")? {
            config.listen = listen;
        }
        if let Some(impersonate) = props.get_bool("impersonate")? {
            config.impersonate = impersonate;
        }
        if let Some(suppress) = props.get_bool("suppressChannelData")? {
            config.suppress_channel_data = suppress;
        }
        Ok(config)
    }

    pub fn with_pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipe_dir = dir.into();
        self
    }

    pub fn with_listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }
}

fn default_pipe_dir() -> PathBuf {
    std::env::temp_dir().join(TransportConfig::PIPE_DIR_NAME)
}
