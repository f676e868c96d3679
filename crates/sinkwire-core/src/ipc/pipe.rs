//! Local duplex byte streams behind one interface.
//!
//! Unix uses domain sockets at `<dir>/<name>.pipe`; Windows uses named pipes
//! at `\\.\pipe\<name>`. Both hand out boxed [`DuplexStream`]s so the rest of
//! the IPC transport never sees the platform primitive.

use crate::error::{ChannelError, Result};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected, bidirectional byte stream.
pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub type PipeStream = Box<dyn DuplexStream>;

/// Accepts connections on a named pipe.
pub struct PipeListener {
    name: String,
    inner: imp::Listener,
}

impl PipeListener {
    /// Bind `name`. `dir` is where Unix socket files live; ignored on
    /// Windows.
    pub async fn bind(name: &str, dir: &Path) -> Result<Self> {
        if !super::url::is_valid_pipe_name(name) {
            return Err(ChannelError::InvalidPipeName(name.to_string()));
        }
        let inner = imp::Listener::bind(name, dir).await?;
        Ok(Self {
            name: name.to_string(),
            inner,
        })
    }

    pub async fn accept(&mut self) -> Result<PipeStream> {
        self.inner.accept().await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Platform address of the pipe, for logs.
    pub fn endpoint(&self) -> String {
        self.inner.endpoint()
    }
}

/// Connect to the pipe `name`. A pipe that does not exist yet or is busy
/// yields a retryable error.
pub async fn connect(name: &str, dir: &Path) -> Result<PipeStream> {
    if !super::url::is_valid_pipe_name(name) {
        return Err(ChannelError::InvalidPipeName(name.to_string()));
    }
    imp::connect(name, dir).await
}

#[cfg(unix)]
mod imp {
    use super::PipeStream;
    use crate::config::TransportConfig;
    use crate::error::{ChannelError, Result};
    use std::path::{Path, PathBuf};
    use tokio::net::{UnixListener, UnixStream};
    use tracing::debug;

    fn socket_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{}{}", name, TransportConfig::PIPE_FILE_SUFFIX))
    }

    pub struct Listener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl Listener {
        pub async fn bind(name: &str, dir: &Path) -> Result<Self> {
            std::fs::create_dir_all(dir)?;
            let path = socket_path(dir, name);
            if path.exists() {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(ChannelError::Io {
                        message: format!("pipe {} is already being served", name),
                        source: Some(std::io::ErrorKind::AddrInUse.into()),
                    });
                }
                debug!("Removing stale pipe socket {}", path.display());
                std::fs::remove_file(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }

        pub async fn accept(&mut self) -> Result<PipeStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(Box::new(stream))
        }

        pub fn endpoint(&self) -> String {
            self.path.display().to_string()
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub async fn connect(name: &str, dir: &Path) -> Result<PipeStream> {
        let stream = UnixStream::connect(socket_path(dir, name)).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(windows)]
mod imp {
    use super::PipeStream;
    use crate::error::Result;
    use std::path::Path;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    const ERROR_PIPE_BUSY: i32 = 231;

    fn pipe_path(name: &str) -> String {
        format!(r"\\.\pipe\{}", name)
    }

    pub struct Listener {
        path: String,
        next: NamedPipeServer,
    }

    impl Listener {
        pub async fn bind(name: &str, _dir: &Path) -> Result<Self> {
            let path = pipe_path(name);
            let next = ServerOptions::new().first_pipe_instance(true).create(&path)?;
            Ok(Self { path, next })
        }

        pub async fn accept(&mut self) -> Result<PipeStream> {
            self.next.connect().await?;
            let fresh = ServerOptions::new().create(&self.path)?;
            let connected = std::mem::replace(&mut self.next, fresh);
            Ok(Box::new(connected))
        }

        pub fn endpoint(&self) -> String {
            self.path.clone()
        }
    }

    pub async fn connect(name: &str, _dir: &Path) -> Result<PipeStream> {
        match ClientOptions::new().open(pipe_path(name)) {
            Ok(client) => Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "pipe busy").into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_accept_connect() {
        let dir = TempDir::new().unwrap();
        let mut listener = PipeListener::bind("duplex", dir.path()).await.unwrap();
        assert_eq!(listener.name(), "duplex");

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let mut client = connect("duplex", dir.path()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_pipe_is_retryable() {
        let dir = TempDir::new().unwrap();
        let err = connect("nobody-home", dir.path()).await.err().unwrap();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_second_bind_is_rejected_while_served() {
        let dir = TempDir::new().unwrap();
        let _first = PipeListener::bind("taken", dir.path()).await.unwrap();
        assert!(PipeListener::bind("taken", dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            PipeListener::bind("a/b", dir.path()).await,
            Err(ChannelError::InvalidPipeName(_))
        ));
        assert!(matches!(
            connect("", dir.path()).await,
            Err(ChannelError::InvalidPipeName(_))
        ));
    }
}
