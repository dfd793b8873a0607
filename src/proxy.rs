//! Validating reverse proxy to per-session backends
//!
//! A request names a session by correlation id. The session's port is looked
//! up in the registry, the method and path are checked against the backend's
//! published spec, and the request is forwarded to the backend on loopback.
//! The backend's status, headers and body are relayed back unchanged.

use crate::db::Database;
use crate::error::{GatewayError, GatewayResponse};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::ratelimit::RateLimiter;
use crate::spec_cache::SpecCache;
use crate::validator;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, Request, Response};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Loopback address the backends listen on
pub const BACKEND_HOST: &str = "127.0.0.1";

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

/// Headers that describe a single connection's framing and are never relayed
const HOP_BY_HOP: [HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TE,
    header::UPGRADE,
];

/// An inbound request addressed to a session's backend
#[derive(Debug)]
pub struct ProxyRequest {
    pub correlation_id: String,
    pub method: Method,
    /// Backend sub-path, normalized before use
    pub path: String,
    /// Raw query string, forwarded as-is
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub request_id: String,
    pub client_ip: IpAddr,
}

/// Routes, validates and forwards session traffic
pub struct ProxyGateway {
    registry: Database,
    specs: Arc<SpecCache>,
    pool: ConnectionPool,
    delete_limiter: RateLimiter,
    request_timeout: Duration,
}

impl ProxyGateway {
    pub fn new(
        registry: Database,
        specs: Arc<SpecCache>,
        delete_limiter: RateLimiter,
        pool_config: PoolConfig,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            specs,
            pool: ConnectionPool::new(pool_config),
            delete_limiter,
            request_timeout,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn specs(&self) -> &Arc<SpecCache> {
        &self.specs
    }

    /// Forget clients whose DELETE quota window has elapsed
    pub fn purge_rate_limits(&self) {
        self.delete_limiter.purge_expired();
    }

    /// Forward a request to the session's backend and relay its response
    pub async fn forward(&self, req: ProxyRequest) -> Result<GatewayResponse, GatewayError> {
        if req.method == Method::DELETE {
            if let Err(retry_after) = self.delete_limiter.check(&req.client_ip.to_string()) {
                warn!(client = %req.client_ip, correlation_id = %req.correlation_id, "DELETE rate limit exceeded");
                return Err(GatewayError::rate_limited(retry_after));
            }
        }

        let port = self
            .registry
            .get(&req.correlation_id)?
            .ok_or_else(|| GatewayError::not_found("No active session"))?;

        let path = normalize_path(&req.path);
        self.check_request(port, req.method.as_str(), &path).await?;

        let uri = backend_uri(port, &path, req.query.as_deref())?;

        debug!(
            correlation_id = %req.correlation_id,
            request_id = %req.request_id,
            method = %req.method,
            %uri,
            "Forwarding request"
        );

        let mut builder = Request::builder().method(req.method.clone()).uri(&uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = outbound_headers(&req.headers, &req.request_id);
        }
        let backend_req = builder
            .body(Full::new(req.body))
            .map_err(|e| GatewayError::internal(format!("Failed to build backend request: {}", e)))?;

        let exchange = async {
            let response = self.pool.send_request(backend_req).await?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, ForwardError>((parts, body))
        };

        let (parts, body) = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(exchange)) => exchange,
            Ok(Err(e)) => {
                error!(correlation_id = %req.correlation_id, port, error = %e, "Failed to forward request");
                return Err(GatewayError::upstream(format!(
                    "Failed to reach backend on port {}: {}",
                    port, e
                )));
            }
            Err(_) => {
                warn!(
                    correlation_id = %req.correlation_id,
                    port,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Backend request timed out"
                );
                return Err(GatewayError::upstream(format!(
                    "Backend request timed out after {} seconds",
                    self.request_timeout.as_secs()
                )));
            }
        };

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = parts.status;
        *response.headers_mut() = relayed_headers(parts.headers);
        Ok(response)
    }

    /// Validate against the backend's cached spec
    async fn check_request(&self, port: u16, method: &str, path: &str) -> Result<(), GatewayError> {
        let spec = self
            .specs
            .get_spec(BACKEND_HOST, port)
            .await
            .inspect_err(|e| warn!(port, error = %e, "Backend spec unavailable"))?;

        validator::validate(&spec, method, path)
            .inspect_err(|e| debug!(port, method, path, reason = %e, "Request rejected by backend spec"))?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error(transparent)]
    Pool(#[from] crate::pool::PoolError),
    #[error("error reading backend response: {0}")]
    Body(#[from] hyper::Error),
}

/// Absolute backend URI, percent-encoding whatever the path or query needs
pub fn backend_uri(port: u16, path: &str, query: Option<&str>) -> Result<String, GatewayError> {
    let mut url = url::Url::parse(&format!("http://{}:{}", BACKEND_HOST, port))
        .map_err(|e| GatewayError::internal(format!("Invalid backend address: {}", e)))?;
    url.set_path(path);
    url.set_query(query.filter(|q| !q.is_empty()));
    Ok(url.into())
}

/// Ensure the sub-path starts with exactly one `/`
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

/// Inbound headers minus `Host` and framing, with JSON content negotiation forced
fn outbound_headers(inbound: &HeaderMap, request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + 2);
    for (name, value) in inbound {
        if name == header::HOST || name == header::CONTENT_LENGTH || HOP_BY_HOP.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    headers
}

/// Backend response headers minus per-connection framing
fn relayed_headers(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}
