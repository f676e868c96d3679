//! End-to-end tests: channels built from properties, registered, and called
//! through typed formatters.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sinkwire_core::formatter::invoke;
use sinkwire_core::{
    CallHandler, CallResult, ChannelError, ChannelProperties, ChannelRegistry, FormatterDispatch,
    HttpChannel, JsonFormatter, RemoteFault, ServerDispatch,
};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Add {
    a: i64,
    b: i64,
}

struct Calculator;

#[async_trait]
impl CallHandler for Calculator {
    type Request = Add;
    type Response = i64;

    async fn call(&self, object_uri: &str, request: Add) -> Result<i64, RemoteFault> {
        match object_uri {
            "Calc" => request
                .a
                .checked_add(request.b)
                .ok_or_else(|| RemoteFault::new("overflow")),
            other => Err(RemoteFault::new(format!("no object at {}", other))),
        }
    }
}

fn calculator() -> Arc<dyn ServerDispatch> {
    Arc::new(FormatterDispatch::json(Calculator))
}

async fn add(registry: &ChannelRegistry, url: &str, a: i64, b: i64) -> sinkwire_core::Result<i64> {
    let sink = registry.create_message_sink(url)?;
    invoke(
        &sink,
        &JsonFormatter::<Add>::new(),
        &JsonFormatter::<CallResult<i64>>::new(),
        &Add { a, b },
    )
    .await
}

async fn http_registry() -> ChannelRegistry {
    let registry = ChannelRegistry::new();
    let props = ChannelProperties::new()
        .with("port", "0")
        .with("timeout", "5000");
    registry
        .ensure_configured(|| async {
            let channel = HttpChannel::from_properties(&props, Some(calculator())).await?;
            registry.register(Arc::new(channel))
        })
        .await
        .unwrap();
    registry
}

#[tokio::test]
async fn test_http_call_through_registry() {
    let registry = http_registry().await;

    let urls = registry.urls_for_object("Calc");
    assert_eq!(urls.len(), 1);
    assert!(urls[0].starts_with("http://127.0.0.1:"));
    assert!(urls[0].ends_with("/Calc"));

    assert_eq!(add(&registry, &urls[0], 2, 3).await.unwrap(), 5);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_remote_fault_surfaces_as_dispatch_error() {
    let registry = http_registry().await;
    let url = registry.urls_for_object("Nothing").remove(0);

    let err = add(&registry, &url, 1, 1).await.unwrap_err();
    match err {
        ChannelError::Dispatch(message) => assert_eq!(message, "no object at Nothing"),
        other => panic!("Expected Dispatch error, got: {:?}", other),
    }
    registry.shutdown().await;
}

#[tokio::test]
async fn test_configuration_runs_once() {
    let registry = http_registry().await;
    let ran = registry
        .ensure_configured(|| async { Err(ChannelError::Other("ran twice".to_string())) })
        .await
        .unwrap();
    assert!(!ran);
    registry.shutdown().await;
}

#[tokio::test]
async fn test_unknown_scheme_has_no_channel() {
    let registry = http_registry().await;
    let err = registry.create_message_sink("ftp://host/Calc").unwrap_err();
    assert!(matches!(err, ChannelError::NoChannel(_)));
    registry.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_listeners() {
    let registry = http_registry().await;
    let url = registry.urls_for_object("Calc").remove(0);
    registry.shutdown().await;

    assert!(registry.channels().is_empty());
    assert!(registry.urls_for_object("Calc").is_empty());

    // A fresh client-only registry cannot reach the stopped server.
    let client_only = ChannelRegistry::new();
    let channel = HttpChannel::from_properties(&ChannelProperties::new(), None)
        .await
        .unwrap();
    client_only.register(Arc::new(channel)).unwrap();
    let err = add(&client_only, &url, 1, 2).await.unwrap_err();
    assert!(err.is_connect_failure(), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn test_listening_channel_needs_a_dispatcher() {
    let props = ChannelProperties::new().with("port", "0");
    let err = HttpChannel::from_properties(&props, None).await.unwrap_err();
    assert!(matches!(err, ChannelError::Config { .. }));
}

#[cfg(unix)]
mod ipc {
    use super::*;
    use sinkwire_core::IpcChannel;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_both_transports_reach_the_same_object() {
        let dir = TempDir::new().unwrap();
        let pipe_dir = dir.path().to_string_lossy().into_owned();

        let registry = ChannelRegistry::new();
        let http = HttpChannel::from_properties(
            &ChannelProperties::new().with("port", "0").with("priority", "5"),
            Some(calculator()),
        )
        .await
        .unwrap();
        let ipc = IpcChannel::from_properties(
            &ChannelProperties::new()
                .with("portName", "calc")
                .with("pipeDirectory", pipe_dir),
            Some(calculator()),
        )
        .await
        .unwrap();
        registry.register(Arc::new(ipc)).unwrap();
        registry.register(Arc::new(http)).unwrap();

        let names: Vec<String> = registry
            .channels()
            .iter()
            .map(|c| c.channel_name().to_string())
            .collect();
        assert_eq!(names, vec!["http", "ipc"]);

        let urls = registry.urls_for_object("Calc");
        assert_eq!(urls.len(), 2);
        assert!(urls.contains(&"ipc://calc/Calc".to_string()));

        for url in &urls {
            assert_eq!(add(&registry, url, 20, 22).await.unwrap(), 42, "via {}", url);
        }
        registry.shutdown().await;
    }
}
