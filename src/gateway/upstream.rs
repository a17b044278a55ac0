//! # Upstream Client
//!
//! Sends one attempt of a forwarded request to a backend instance and buffers
//! the whole response. Retry, timeout and breaker decisions live in the
//! dispatch stage; this layer only moves bytes.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{GatewayResponse, IncomingRequest};

/// Headers that describe a single connection and must not be forwarded
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// One backend call
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Send `request` to `target`, replacing its path with `path`
    async fn send(
        &self,
        target: &Url,
        request: &IncomingRequest,
        path: &str,
    ) -> GatewayResult<GatewayResponse>;
}

/// Absolute URL for `path` (and the request query) on `base`
pub fn target_url(base: &Url, path: &str, query: Option<&str>) -> GatewayResult<Url> {
    let mut joined = base.as_str().trim_end_matches('/').to_string();
    if !path.starts_with('/') {
        joined.push('/');
    }
    joined.push_str(path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        joined.push('?');
        joined.push_str(query);
    }
    Url::parse(&joined).map_err(|e| GatewayError::internal(format!("invalid backend URL '{}': {}", joined, e)))
}

/// `reqwest`-backed upstream with a shared connection pool
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(connect_timeout: Duration) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn send(
        &self,
        target: &Url,
        request: &IncomingRequest,
        path: &str,
    ) -> GatewayResult<GatewayResponse> {
        let url = target_url(target, path, request.query())?;
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| GatewayError::internal(format!("unsupported method: {}", e)))?;

        let mut headers = reqwest::header::HeaderMap::with_capacity(request.headers.len());
        for (name, value) in request.headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        debug!(method = %request.method, url = %url, "Forwarding request");
        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .body(request.body.clone())
            .send()
            .await?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| GatewayError::internal(format!("invalid backend status: {}", e)))?;

        let mut response_headers = HeaderMap::with_capacity(response.headers().len());
        for (name, value) in response.headers().iter() {
            if is_hop_by_hop(name.as_str()) || name.as_str().eq_ignore_ascii_case("content-length") {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                response_headers.append(name, value);
            }
        }

        let body = response.bytes().await?;
        Ok(GatewayResponse::new(status, response_headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use bytes::Bytes;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_target_url() {
        let base = Url::parse("http://items:8080/").unwrap();
        assert_eq!(
            target_url(&base, "/lifepill/v1/item/1", Some("page=2")).unwrap().as_str(),
            "http://items:8080/lifepill/v1/item/1?page=2"
        );
        let base = Url::parse("http://config:8888/base").unwrap();
        assert_eq!(
            target_url(&base, "/app/default", None).unwrap().as_str(),
            "http://config:8888/base/app/default"
        );
    }

    #[tokio::test]
    async fn test_forwards_method_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(query_param("dry", "true"))
            .and(header("x-auth-user", "alice"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("x-auth-user", HeaderValue::from_static("alice"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        let request = IncomingRequest::new(
            Method::POST,
            "/api/orders?dry=true".parse().unwrap(),
            headers,
            Bytes::from_static(b"{\"qty\":1}"),
        );

        let upstream = HttpUpstream::new(Duration::from_secs(1)).unwrap();
        let base = Url::parse(&server.uri()).unwrap();
        let response = upstream.send(&base, &request, "/orders").await.unwrap();

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(response.body, Bytes::from_static(b"created"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_http_client_error() {
        let upstream = HttpUpstream::new(Duration::from_millis(200)).unwrap();
        let request = IncomingRequest::new(Method::GET, "/x".parse().unwrap(), HeaderMap::new(), Bytes::new());
        let base = Url::parse("http://127.0.0.1:1").unwrap();

        let err = upstream.send(&base, &request, "/x").await.unwrap_err();
        assert!(matches!(err, GatewayError::HttpClient { .. }));
        assert!(err.is_retryable());
    }
}
