//! Server sink for the HTTP transport.
//!
//! Every HTTP request, whatever its path or method, lands in one axum
//! fallback handler. The handler builds a header bag from the request,
//! stamps the reserved server-side keys, runs the server chain and writes
//! the reply back with an explicit `Content-Length`.
//!
//! Reserved keys stamped on each request:
//!
//! | key                     | value                                   |
//! |-------------------------|-----------------------------------------|
//! | `__RequestUri`          | path and query of the request           |
//! | `__RequestVerb`         | HTTP method                             |
//! | `__IPAddress`           | peer IP                                 |
//! | `__ConnectionId`        | per-request id from the shared counter  |
//! | `__CustomErrorsEnabled` | `true` unless the peer is loopback      |

use crate::config::TransportConfig;
use crate::connection::{ConnectionIdCounter, ConnectionInfo, TransportKind};
use crate::error::{ChannelError, Result};
use crate::headers::{is_reserved, keys, Exchange, HeaderBag};
use crate::listener::ListenerHandle;
use crate::observe::SharedObserver;
use crate::sink::{Completion, ServerSinkChain};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use hyper::ext::ReasonPhrase;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

const GENERIC_ERROR_TEXT: &str = "Internal server error";

/// Turns HTTP requests into chain calls.
pub struct HttpServerTransportSink {
    chain: Arc<ServerSinkChain>,
    ids: ConnectionIdCounter,
    observer: SharedObserver,
    max_body_size: usize,
}

impl HttpServerTransportSink {
    pub fn new(chain: Arc<ServerSinkChain>, ids: ConnectionIdCounter, observer: SharedObserver) -> Self {
        Self {
            chain,
            ids,
            observer,
            max_body_size: TransportConfig::MAX_HTTP_BODY_SIZE,
        }
    }

    pub fn chain(&self) -> &Arc<ServerSinkChain> {
        &self.chain
    }

    /// Router that sends every request to this sink.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(handle_request)
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve on `listener` in the background.
    pub fn spawn(self: &Arc<Self>, listener: TcpListener) -> Result<ListenerHandle> {
        let addr = listener.local_addr()?;
        info!("HTTP server listening on {}", addr);
        let app = self.router();

        Ok(ListenerHandle::spawn(addr.to_string(), move |shutdown_rx, _conn_shutdown_rx| async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
                info!("HTTP server on {} shutting down", addr);
            })
            .await;
            if let Err(e) = served {
                error!("HTTP server on {} failed: {}", addr, e);
            }
        }))
    }

    /// Service one HTTP request.
    pub async fn service(&self, peer: SocketAddr, request: Request) -> Response {
        let info = ConnectionInfo {
            id: self.ids.next_id(),
            transport: TransportKind::Http,
            peer: peer.to_string(),
        };
        let custom_errors = !peer.ip().is_loopback();

        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, self.max_body_size).await {
            Ok(body) => body,
            Err(e) => {
                let err = ChannelError::Other(format!("reading request body failed: {}", e));
                self.observer.servicing_failed(&info, &err);
                return plain_response(StatusCode::BAD_REQUEST, "Unreadable request body".to_string());
            }
        };

        let headers = request_headers(&parts, peer, info.id, custom_errors);
        debug!(
            "{} {} from {}",
            parts.method,
            headers.request_uri().unwrap_or_default(),
            info
        );

        match self.chain.dispatch(Exchange::new(headers, body)).await {
            Ok(Completion::Reply(Ok(response))) => reply_response(response),
            Ok(Completion::OneWay) => one_way_response(),
            Ok(Completion::Reply(Err(e))) | Err(e) => {
                self.observer.servicing_failed(&info, &e);
                let text = if custom_errors {
                    GENERIC_ERROR_TEXT.to_string()
                } else {
                    e.to_string()
                };
                plain_response(StatusCode::INTERNAL_SERVER_ERROR, text)
            }
        }
    }
}

impl std::fmt::Debug for HttpServerTransportSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerTransportSink")
            .field("chain", &self.chain)
            .finish()
    }
}

async fn handle_request(
    State(sink): State<Arc<HttpServerTransportSink>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    sink.service(peer, request).await
}

fn request_headers(parts: &Parts, peer: SocketAddr, id: u32, custom_errors: bool) -> HeaderBag {
    let mut headers = HeaderBag::new();
    for (name, value) in parts.headers.iter() {
        let Ok(value) = value.to_str() else {
            debug!("Skipping non-text request header {}", name);
            continue;
        };
        if name == header::CONTENT_TYPE {
            headers.set(keys::CONTENT_TYPE, value);
        } else if !is_reserved(name.as_str()) {
            headers.set(name.as_str(), value);
        }
    }

    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    headers.set_request_uri(request_uri);
    headers.set(keys::REQUEST_VERB, parts.method.as_str());
    headers.set(keys::IP_ADDRESS, peer.ip().to_string());
    headers.set(keys::CONNECTION_ID, id);
    headers.set(keys::CUSTOM_ERRORS_ENABLED, custom_errors);
    headers
}

fn reply_response(response: Exchange) -> Response {
    let (headers, body) = response.into_parts();
    let status = headers
        .status_code()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    let reason = headers.reason_phrase().map(str::to_string);

    let mut builder = Response::builder().status(status);
    for (key, value) in headers.public_headers() {
        let Some(value) = value.to_wire_string() else {
            continue;
        };
        if key.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str()) {
            continue;
        }
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!("Skipping response header {:?} that cannot be sent over HTTP", key),
        }
    }

    let mut response = match builder
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
    {
        Ok(response) => response,
        Err(e) => {
            error!("Failed to build HTTP response: {}", e);
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_ERROR_TEXT.to_string());
        }
    };

    if let Some(reason) = reason {
        let canonical = status.canonical_reason().unwrap_or_default();
        if reason != canonical {
            match ReasonPhrase::try_from(reason.into_bytes()) {
                Ok(phrase) => {
                    response.extensions_mut().insert(phrase);
                }
                Err(_) => debug!("Dropping reason phrase that is not valid HTTP"),
            }
        }
    }
    response
}

fn one_way_response() -> Response {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn plain_response(status: StatusCode, text: String) -> Response {
    let len = text.len();
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    response
}
