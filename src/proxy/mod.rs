//! Reverse proxy for the novel content APIs.
//!
//! [`ProxyRouter`] is the whole policy: preflight and health short-circuits,
//! path → upstream resolution, the host allow-list, header sanitization and
//! response decoration. Outbound traffic goes through the [`Upstream`] seam;
//! [`server::ProxyServer`] hosts the router over HTTP.

pub mod route;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::json;
use tracing::{debug, error, warn};
use url::Url;

use crate::config::{ProxyConfig, CLIENT_USER_AGENT};
use route::{resolve_target, AllowedHostSet, RouteRule};

const HEALTH_PATHS: &[&str] = &["/health", "/test"];

const PROXY_NAME: &str = "tomato-desk";

/// Inbound headers never forwarded: proxy/forwarding metadata, the inbound
/// `Host`, and hop-by-hop framing.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "cf-ray",
    "cf-connecting-ip",
    "cf-visitor",
    "cf-worker",
    "x-forwarded-proto",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-real-ip",
    "forwarded",
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "upgrade",
];

/// Upstream framing headers dropped because the body is re-framed locally.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["transfer-encoding", "connection", "keep-alive"];

const CORS_HEADERS: &[(&str, &str)] = &[
    ("access-control-allow-origin", "*"),
    (
        "access-control-allow-methods",
        "GET, POST, PUT, DELETE, OPTIONS",
    ),
    (
        "access-control-allow-headers",
        "Content-Type, Authorization, X-Requested-With",
    ),
    ("access-control-max-age", "86400"),
];

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string without the leading `?`.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A request that passed routing and authorization.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Performs the actual outbound call.
pub trait Upstream: Send + Sync {
    fn forward(&self, request: OutboundRequest) -> BoxFuture<'_, Result<UpstreamResponse>>;
}

pub struct ReqwestUpstream {
    client: Client,
}

impl ReqwestUpstream {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }
}

impl Upstream for ReqwestUpstream {
    fn forward(&self, request: OutboundRequest) -> BoxFuture<'_, Result<UpstreamResponse>> {
        async move {
            let mut builder = self
                .client
                .request(request.method, request.url)
                .headers(request.headers);
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok(UpstreamResponse {
                status,
                headers,
                body,
            })
        }
        .boxed()
    }
}

pub struct ProxyRouter {
    rules: Vec<RouteRule>,
    allowed: AllowedHostSet,
    literal_scheme: String,
    user_agent: HeaderValue,
    max_body_bytes: usize,
    upstream: Arc<dyn Upstream>,
}

impl ProxyRouter {
    pub fn new(config: &ProxyConfig, upstream: Arc<dyn Upstream>) -> Self {
        let user_agent = HeaderValue::from_str(&config.client_user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static(CLIENT_USER_AGENT));
        Self {
            rules: config.routes.clone(),
            allowed: config.allowed_hosts.clone(),
            literal_scheme: config.literal_host_scheme.clone(),
            user_agent,
            max_body_bytes: config.max_body_bytes,
            upstream,
        }
    }

    /// Router backed by a real HTTP client.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let upstream = ReqwestUpstream::new(config.upstream_timeout())?;
        Ok(Self::new(config, Arc::new(upstream)))
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Reply for an inbound body over [`Self::max_body_bytes`].
    pub fn body_too_large(&self) -> ProxyResponse {
        json_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            json!({
                "error": "Request body too large",
                "message": format!("Request body exceeds {} bytes", self.max_body_bytes),
            }),
        )
    }

    pub async fn handle(&self, request: ProxyRequest) -> ProxyResponse {
        if request.method == Method::OPTIONS {
            return preflight();
        }
        if HEALTH_PATHS.contains(&request.path.as_str()) {
            return health();
        }

        let Some(target) = resolve_target(
            &request.path,
            request.query.as_deref(),
            &self.rules,
            &self.literal_scheme,
        ) else {
            debug!("no route for {}", request.path);
            return json_response(
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "Invalid request path",
                    "message": "Please provide a valid API endpoint path",
                }),
            );
        };

        let host = target.host_str().unwrap_or_default().to_string();
        if !self.allowed.permits(&host) {
            warn!("refusing to proxy {} to disallowed host {host}", request.path);
            return json_response(
                StatusCode::FORBIDDEN,
                json!({
                    "error": "Host not allowed",
                    "message": format!("Target host {host} is not in the allowed list"),
                }),
            );
        }

        let body = carries_body(&request.method).then_some(request.body);
        let outbound = OutboundRequest {
            method: request.method,
            url: target.clone(),
            headers: sanitize_headers(&request.headers, &self.user_agent),
            body,
        };

        debug!("proxy {} {}", outbound.method, target);
        match self.upstream.forward(outbound).await {
            Ok(response) => relay(response, &host),
            Err(err) => {
                error!("proxy request to {target} failed: {err:#}");
                json_response(
                    StatusCode::BAD_GATEWAY,
                    json!({
                        "error": "Proxy request failed",
                        "message": format!("{err:#}"),
                        "target": target.as_str(),
                    }),
                )
            }
        }
    }
}

fn carries_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD
}

/// Copy inbound headers minus the denylist and stamp the client identifier.
pub fn sanitize_headers(inbound: &HeaderMap, user_agent: &HeaderValue) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound {
        if !STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    headers.insert(header::USER_AGENT, user_agent.clone());
    headers
}

fn apply_cors(headers: &mut HeaderMap) {
    for &(name, value) in CORS_HEADERS {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
}

fn relay(upstream: UpstreamResponse, host: &str) -> ProxyResponse {
    let mut headers = upstream.headers;
    for name in STRIPPED_RESPONSE_HEADERS {
        headers.remove(*name);
    }
    apply_cors(&mut headers);
    headers.insert(
        HeaderName::from_static("x-proxy-by"),
        HeaderValue::from_static(PROXY_NAME),
    );
    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert(HeaderName::from_static("x-target-host"), value);
    }

    ProxyResponse {
        status: upstream.status,
        headers,
        body: upstream.body,
    }
}

fn preflight() -> ProxyResponse {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers);
    ProxyResponse {
        status: StatusCode::OK,
        headers,
        body: Bytes::new(),
    }
}

fn health() -> ProxyResponse {
    json_response(
        StatusCode::OK,
        json!({
            "status": "ok",
            "message": format!("{PROXY_NAME} proxy is running"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

fn json_response(status: StatusCode, body: serde_json::Value) -> ProxyResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    apply_cors(&mut headers);
    ProxyResponse {
        status,
        headers,
        body: Bytes::from(body.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use serde_json::Value;

    /// Records every outbound call and answers with a canned reply.
    struct RecordingUpstream {
        calls: Mutex<Vec<OutboundRequest>>,
        fail: bool,
    }

    impl RecordingUpstream {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }

        fn last_call(&self) -> OutboundRequest {
            self.calls.lock().last().cloned().unwrap()
        }
    }

    impl Upstream for RecordingUpstream {
        fn forward(&self, request: OutboundRequest) -> BoxFuture<'_, Result<UpstreamResponse>> {
            self.calls.lock().push(request);
            let fail = self.fail;
            async move {
                if fail {
                    return Err(anyhow!("connection refused"));
                }
                let mut headers = HeaderMap::new();
                headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
                headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
                Ok(UpstreamResponse {
                    status: StatusCode::CREATED,
                    headers,
                    body: Bytes::from_static(b"chapter text"),
                })
            }
            .boxed()
        }
    }

    fn router(upstream: Arc<RecordingUpstream>) -> ProxyRouter {
        ProxyRouter::new(&ProxyConfig::default(), upstream)
    }

    fn request(method: Method, path: &str, query: Option<&str>) -> ProxyRequest {
        ProxyRequest {
            method,
            path: path.to_string(),
            query: query.map(str::to_string),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"payload"),
        }
    }

    fn json_body(response: &ProxyResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn test_literal_disallowed_host_is_forbidden_without_outbound_call() {
        let upstream = RecordingUpstream::new(false);
        let router = router(upstream.clone());

        let response = router
            .handle(request(Method::GET, "/evil.example.com/x", None))
            .await;

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        let body = json_body(&response);
        assert_eq!(body["error"], "Host not allowed");
        assert!(body["message"].as_str().unwrap().contains("evil.example.com"));
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_path_is_bad_request_without_outbound_call() {
        let upstream = RecordingUpstream::new(false);
        let router = router(upstream.clone());

        let response = router.handle(request(Method::GET, "/nothing/here", None)).await;

        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&response)["error"], "Invalid request path");
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn test_preflight_returns_only_cors_headers() {
        let upstream = RecordingUpstream::new(false);
        let router = router(upstream.clone());

        for path in ["/content", "/evil.example.com/x", "/nothing/here"] {
            let response = router.handle(request(Method::OPTIONS, path, None)).await;
            assert_eq!(response.status, StatusCode::OK);
            assert!(response.body.is_empty());
            assert_eq!(response.headers.len(), CORS_HEADERS.len());
            assert_eq!(
                response.headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
                "*"
            );
        }
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn test_health_short_circuits() {
        let upstream = RecordingUpstream::new(false);
        let router = router(upstream.clone());

        for method in [Method::GET, Method::POST] {
            let response = router.handle(request(method, "/health", None)).await;
            assert_eq!(response.status, StatusCode::OK);
            let body = json_body(&response);
            assert_eq!(body["status"], "ok");
            assert!(body["timestamp"].is_string());
        }
        let response = router.handle(request(Method::GET, "/test", None)).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn test_numeric_path_forwards_to_id_template() {
        let upstream = RecordingUpstream::new(false);
        let router = router(upstream.clone());

        let response = router.handle(request(Method::GET, "/987654", None)).await;

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(upstream.call_count(), 1);
        assert_eq!(
            upstream.last_call().url.as_str(),
            "https://lsjk.zyii.xyz:3666/content?item_id=987654"
        );
    }

    #[tokio::test]
    async fn test_numeric_route_respects_allow_list() {
        let upstream = RecordingUpstream::new(false);
        let config = ProxyConfig {
            allowed_hosts: AllowedHostSet::new(["fqphp.gxom.cn"]),
            ..ProxyConfig::default()
        };
        let router = ProxyRouter::new(&config, upstream.clone());

        let response = router.handle(request(Method::GET, "/987654", None)).await;

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn test_forwarded_headers_are_sanitized() {
        let upstream = RecordingUpstream::new(false);
        let router = router(upstream.clone());

        let mut inbound = request(Method::GET, "/content", Some("item_id=1"));
        inbound
            .headers
            .insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        inbound
            .headers
            .insert("cf-ray", HeaderValue::from_static("abc"));
        inbound
            .headers
            .insert("x-custom", HeaderValue::from_static("kept"));
        inbound
            .headers
            .insert(header::USER_AGENT, HeaderValue::from_static("curl/8"));
        router.handle(inbound).await;

        let call = upstream.last_call();
        assert_eq!(call.headers["x-custom"], "kept");
        assert!(!call.headers.contains_key("x-forwarded-for"));
        assert!(!call.headers.contains_key("cf-ray"));
        assert_eq!(call.headers[header::USER_AGENT], CLIENT_USER_AGENT);
    }

    #[tokio::test]
    async fn test_body_only_forwarded_for_writing_methods() {
        let upstream = RecordingUpstream::new(false);
        let router = router(upstream.clone());

        router.handle(request(Method::GET, "/content", None)).await;
        assert!(upstream.last_call().body.is_none());

        router.handle(request(Method::POST, "/content", None)).await;
        assert_eq!(
            upstream.last_call().body.as_deref(),
            Some(&b"payload"[..])
        );
    }

    #[tokio::test]
    async fn test_relayed_response_is_decorated() {
        let upstream = RecordingUpstream::new(false);
        let router = router(upstream.clone());

        let response = router
            .handle(request(Method::GET, "/api/tomato/content.php", Some("item_id=5")))
            .await;

        assert_eq!(response.status, StatusCode::CREATED);
        assert_eq!(&response.body[..], b"chapter text");
        assert_eq!(response.headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(response.headers["x-proxy-by"], PROXY_NAME);
        assert_eq!(response.headers["x-target-host"], "api.cenguigui.cn");
        assert_eq!(response.headers[header::ACCESS_CONTROL_MAX_AGE], "86400");
        assert!(!response.headers.contains_key(header::TRANSFER_ENCODING));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_bad_gateway_with_target() {
        let upstream = RecordingUpstream::new(true);
        let router = router(upstream.clone());

        let response = router
            .handle(request(Method::GET, "/content", Some("item_id=1")))
            .await;

        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        let body = json_body(&response);
        assert_eq!(body["error"], "Proxy request failed");
        assert_eq!(body["message"], "connection refused");
        assert_eq!(body["target"], "https://fqphp.gxom.cn/content?item_id=1");
    }
}
