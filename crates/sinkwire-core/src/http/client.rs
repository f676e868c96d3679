//! Terminal client sink for the HTTP transport.
//!
//! Each call is one HTTP request. Header-bag entries become HTTP headers
//! (reserved `__` keys stay local), the body is sent as-is, and the response
//! headers, status and body come back as a new [`Exchange`].
//!
//! # Status triage
//!
//! A 2xx response is the reply. A 500 is also treated as a reply: remote
//! faults travel in the body and are left for the formatter to interpret.
//! Any other status is a transport failure ([`ChannelError::HttpStatus`]).

use super::url;
use crate::config::{HttpClientConfig, TransportConfig};
use crate::error::{ChannelError, Result};
use crate::headers::{keys, Exchange, HeaderBag};
use crate::sink::{CallTarget, ClientSinkStack, ClientTransportSink};
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Sends requests with a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpClientTransportSink {
    client: Client,
    timeout: Option<Duration>,
}

impl HttpClientTransportSink {
    pub fn new(config: &HttpClientConfig) -> Result<Self> {
        let mut builder = Client::builder().user_agent(config.user_agent.clone());
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some((host, port)) = &config.proxy {
            let proxy = reqwest::Proxy::all(format!("http://{}:{}", host, port)).map_err(|e| {
                ChannelError::config("proxyName", format!("invalid proxy {}:{}: {}", host, port, e))
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().map_err(|e| ChannelError::Network {
            message: format!("Failed to create HTTP client: {}", e),
            source: Some(e),
        })?;

        Ok(Self {
            client,
            timeout: config.timeout,
        })
    }

    fn build_request(&self, target: &CallTarget, request: Exchange) -> Result<(String, RequestBuilder)> {
        let (headers, body) = request.into_parts();

        let request_url = match headers.request_uri().or(target.object_uri.as_deref()) {
            Some(uri) => url::join(&target.channel_uri, uri),
            None => target.url.clone(),
        };
        let verb = headers
            .request_verb()
            .unwrap_or(TransportConfig::DEFAULT_HTTP_VERB);
        let method = Method::from_bytes(verb.as_bytes()).map_err(|_| ChannelError::InvalidUrl {
            url: request_url.clone(),
            message: format!("invalid HTTP verb {:?}", verb),
        })?;

        let builder = self
            .client
            .request(method, &request_url)
            .headers(wire_headers(&headers))
            .body(body);
        Ok((request_url, builder))
    }

    async fn execute(&self, request_url: &str, builder: RequestBuilder) -> Result<Exchange> {
        let response = builder.send().await.map_err(|e| self.send_error(request_url, e))?;
        triage(request_url, response).await
    }

    fn send_error(&self, request_url: &str, err: reqwest::Error) -> ChannelError {
        if err.is_timeout() {
            ChannelError::Timeout(self.timeout.unwrap_or_default())
        } else if err.is_connect() {
            ChannelError::Connect {
                endpoint: request_url.to_string(),
                message: err.to_string(),
            }
        } else {
            ChannelError::Network {
                message: format!("{} failed: {}", request_url, err),
                source: Some(err),
            }
        }
    }
}

/// Convert the public part of a header bag to HTTP headers.
fn wire_headers(headers: &HeaderBag) -> HeaderMap {
    let mut wire = HeaderMap::new();
    for (key, value) in headers.public_headers() {
        let Some(value) = value.to_wire_string() else {
            continue;
        };
        if key.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str()) {
            continue;
        }
        match (HeaderName::from_bytes(key.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                wire.append(name, value);
            }
            _ => debug!("Skipping header {:?} that cannot be sent over HTTP", key),
        }
    }
    wire
}

/// Turn an HTTP response into a reply, or a transport error for statuses
/// that carry no remoting payload.
async fn triage(request_url: &str, response: Response) -> Result<Exchange> {
    let status = response.status();
    let mut headers = HeaderBag::new();
    for (name, value) in response.headers() {
        let Ok(value) = value.to_str() else {
            continue;
        };
        if name == header::CONTENT_TYPE {
            headers.set(keys::CONTENT_TYPE, value);
        } else {
            headers.set(name.as_str(), value);
        }
    }
    headers.set(keys::HTTP_STATUS_CODE, status.as_u16());
    headers.set(
        keys::HTTP_REASON_PHRASE,
        status.canonical_reason().unwrap_or_default(),
    );

    let body = response.bytes().await.map_err(|e| ChannelError::Network {
        message: format!("reading response from {} failed: {}", request_url, e),
        source: Some(e),
    })?;

    if status.is_success() || status == StatusCode::INTERNAL_SERVER_ERROR {
        Ok(Exchange::new(headers, body))
    } else {
        Err(ChannelError::HttpStatus {
            status: status.as_u16(),
            url: request_url.to_string(),
            message: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}

#[async_trait]
impl ClientTransportSink for HttpClientTransportSink {
    async fn process_message(&self, target: &CallTarget, request: Exchange) -> Result<Exchange> {
        let (request_url, builder) = self.build_request(target, request)?;
        debug!("HTTP request to {}", request_url);
        self.execute(&request_url, builder).await
    }

    async fn async_process_request(
        &self,
        target: &CallTarget,
        stack: ClientSinkStack,
        request: Exchange,
    ) -> Result<()> {
        let (request_url, builder) = self.build_request(target, request)?;
        let sink = self.clone();
        tokio::spawn(async move {
            let reply = sink.execute(&request_url, builder).await;
            stack.resume(reply);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::HeaderValue as BagValue;

    fn target() -> CallTarget {
        CallTarget {
            url: "http://localhost:1/Calc".to_string(),
            channel_uri: "http://localhost:1".to_string(),
            object_uri: Some("Calc".to_string()),
        }
    }

    #[test]
    fn test_wire_headers_skip_reserved_and_invalid() {
        let bag = HeaderBag::new()
            .with(keys::REQUEST_URI, "/Calc")
            .with(keys::CONTENT_TYPE, "application/json")
            .with("X-Trace", "abc")
            .with("Bad Name", "x")
            .with("Content-Length", "999")
            .with("X-Opaque", BagValue::Opaque(std::sync::Arc::new(1u8)));

        let wire = wire_headers(&bag);
        assert_eq!(wire.get(header::CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(wire.get("x-trace").unwrap(), "abc");
        assert!(wire.get(header::CONTENT_LENGTH).is_none());
        assert!(wire.get("x-opaque").is_none());
        assert_eq!(wire.len(), 2);
    }

    #[test]
    fn test_request_uri_header_picks_the_path() {
        let sink = HttpClientTransportSink::new(&HttpClientConfig::default()).unwrap();
        let request = Exchange::new(
            HeaderBag::new().with(keys::REQUEST_URI, "/Other?x=1"),
            &b""[..],
        );
        let (request_url, _) = sink.build_request(&target(), request).unwrap();
        assert_eq!(request_url, "http://localhost:1/Other?x=1");

        let (request_url, _) = sink
            .build_request(&target(), Exchange::new(HeaderBag::new(), &b""[..]))
            .unwrap();
        assert_eq!(request_url, "http://localhost:1/Calc");
    }

    #[test]
    fn test_invalid_verb_is_rejected() {
        let sink = HttpClientTransportSink::new(&HttpClientConfig::default()).unwrap();
        let request = Exchange::new(
            HeaderBag::new().with(keys::REQUEST_VERB, "NOT A VERB"),
            &b""[..],
        );
        assert!(sink.build_request(&target(), request).is_err());
    }
}
