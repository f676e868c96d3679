//! Sinkwire host - serves an echo object over HTTP or IPC.
//!
//! Useful for poking at the transports from another process: every call is
//! answered with its own body and an `Echo: 1` header.

mod echo;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sinkwire_core::{
    ChannelRegistry, HttpServerChannel, HttpServerConfig, IpcServerChannel, IpcServerConfig,
    ServerDispatch,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Http,
    Ipc,
}

#[derive(Parser, Debug)]
#[command(name = "sinkwire-host")]
#[command(about = "Echo host for sinkwire channels")]
struct Args {
    /// Transport to serve on
    #[arg(short, long, value_enum, default_value = "http")]
    transport: Transport,

    /// HTTP port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// HTTP address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// IPC pipe name
    #[arg(long, default_value = "sinkwire")]
    pipe: String,

    /// Directory for IPC pipe sockets (Unix only)
    #[arg(long)]
    pipe_dir: Option<PathBuf>,

    /// Object URI to advertise
    #[arg(long, default_value = "Echo")]
    object: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting sinkwire host ({:?})", args.transport);

    let registry = ChannelRegistry::new();
    let dispatch: Arc<dyn ServerDispatch> = Arc::new(echo::EchoDispatch);

    match args.transport {
        Transport::Http => {
            let config = HttpServerConfig::default()
                .with_port(args.port)
                .with_bind_to(args.host);
            let channel = HttpServerChannel::new(config, dispatch)
                .await
                .context("starting HTTP server channel")?;
            registry.register(Arc::new(channel))?;
        }
        Transport::Ipc => {
            let mut config = IpcServerConfig::new(args.pipe.clone());
            if let Some(dir) = args.pipe_dir {
                config = config.with_pipe_dir(dir);
            }
            let channel = IpcServerChannel::new(config, dispatch)
                .await
                .context("starting IPC server channel")?;
            registry.register(Arc::new(channel))?;
        }
    }

    // Print URLs for the caller to read (intentional stdout)
    for url in registry.urls_for_object(&args.object) {
        println!("SINKWIRE_URL={}", url);
    }
    for channel in registry.channels() {
        if let Some(receiver) = channel.as_receiver() {
            info!(
                "Channel {:?} advertises {:?}",
                channel.channel_name(),
                receiver.channel_data().channel_uris
            );
        }
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping listeners");
    registry.shutdown().await;

    Ok(())
}
