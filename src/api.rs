//! HTTP surface of the gateway
//!
//! Session lifecycle (`/instances`), chat storage, the validating proxy
//! route and out-of-band process supervision (`/proc`) are all served from
//! one listener.

use crate::config::Config;
use crate::db::Database;
use crate::error::{json_response, ErrorCode, GatewayError, GatewayResponse};
use crate::pool::PoolConfig;
use crate::provision::ScriptProvisioner;
use crate::proxy::{ProxyGateway, ProxyRequest, BACKEND_HOST, X_REQUEST_ID};
use crate::ratelimit::RateLimiter;
use crate::spec_cache::SpecCache;
use crate::supervisor::ProcessSupervisor;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Package name reported by `/version`
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version reported by `/version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How often expired rate-limit windows are dropped
const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Frame reported by the caller alongside a setup request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracebackEntry {
    pub file: String,
    pub line: u32,
    pub function: String,
    pub stack_trace: String,
}

/// Body of `POST /instances`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupRequest {
    pub correlation_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub now: DateTime<Utc>,
    pub traceback: Option<TracebackEntry>,
    pub error: String,
    pub request_url: Option<String>,
    pub request_method: Option<String>,
    pub host: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize)]
struct SetupResponse<'a> {
    correlation_id: &'a str,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatEntry {
    id: i64,
    created_at: String,
    payload: String,
}

/// Gateway HTTP server
pub struct GatewayApi {
    bind_addr: SocketAddr,
    registry: Database,
    proxy: ProxyGateway,
    provisioner: ScriptProvisioner,
    supervisor: ProcessSupervisor,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayApi {
    /// Wire every component from configuration around an opened registry
    pub fn new(config: &Config, registry: Database, shutdown_rx: watch::Receiver<bool>) -> Result<Self> {
        let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
            .parse()
            .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;

        let specs = Arc::new(SpecCache::http(
            &config.backend.spec_path,
            config.backend.spec_timeout(),
            config.backend.spec_ttl(),
        ));

        let pool_config = PoolConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        };

        let proxy = ProxyGateway::new(
            registry.clone(),
            specs,
            RateLimiter::per_minute(config.server.delete_rate_limit_per_minute),
            pool_config,
            config.server.request_timeout(),
        );

        let provisioner =
            ScriptProvisioner::new(&config.provisioning).context("Invalid provisioning configuration")?;

        Ok(Self {
            bind_addr,
            registry,
            proxy,
            provisioner,
            supervisor: ProcessSupervisor::new(&config.backend),
            shutdown_rx,
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", self.bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut purge = tokio::time::interval(RATE_LIMIT_PURGE_INTERVAL);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let api = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = api.serve_connection(stream, addr).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = purge.tick() => {
                    self.proxy.purge_rate_limits();
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.proxy.pool().stats();
                        info!(
                            forwarded = stats.get_total_requests(),
                            failed = stats.get_failed_requests(),
                            "Gateway shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn serve_connection<S>(self: Arc<Self>, stream: S, addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let api = Arc::clone(&self);
            async move { api.handle_request(req, addr).await }
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

        Ok(())
    }

    async fn handle_request(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<GatewayResponse, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let request_id = request_id(&req);

        debug!(%method, %path, request_id = %request_id, "API request");

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let result = match (method.clone(), segments.as_slice()) {
            (Method::GET, ["health"]) => Ok(json_response(StatusCode::OK, r#"{"status":"healthy"}"#)),
            (Method::GET, ["version"]) => {
                let version = serde_json::json!({
                    "name": PKG_NAME,
                    "version": VERSION,
                });
                Ok(json_response(StatusCode::OK, version.to_string()))
            }

            // Sessions
            (Method::GET, ["instances"]) => self.list_instances(),
            (Method::POST, ["instances"]) => self.create_instance(req).await,
            (Method::DELETE, ["instances", id]) => self.delete_instance(&decode_segment(id)).await,

            // Chats
            (Method::POST, ["instances", id, "chat"]) => self.save_chat(&decode_segment(id), req).await,
            (Method::GET, ["instances", id, "chat"]) => self.list_chats(&decode_segment(id)),

            // Proxy
            (m, ["instances", id, "proxy"]) if is_proxy_method(&m) => {
                self.proxy_request(decode_segment(id), req, request_id.clone(), peer)
                    .await
            }

            // Process supervision
            (Method::GET, ["proc", "check_port"]) => self.check_port(req.uri().query()).await,
            (Method::GET, ["proc", "list_opencode"]) => self.list_processes().await,
            (Method::DELETE, ["proc", pid]) => self.kill_process(pid).await,

            (_, segments) if is_known_route(segments) => Err(GatewayError::new(
                ErrorCode::MethodNotAllowed,
                format!("Method {} not allowed", method),
            )),
            _ => Err(GatewayError::not_found("Not found")),
        };

        let mut response = result.unwrap_or_else(|e| {
            if e.status_code().is_server_error() {
                error!(%method, %path, request_id = %request_id, code = e.code().as_header_value(), error = %e, "Request failed");
            } else {
                debug!(%method, %path, request_id = %request_id, code = e.code().as_header_value(), error = %e, "Request rejected");
            }
            e.into_response()
        });

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        Ok(response)
    }

    // ==================== Sessions ====================

    fn list_instances(&self) -> Result<GatewayResponse, GatewayError> {
        json_ok(&self.registry.list()?)
    }

    async fn create_instance(&self, req: Request<Incoming>) -> Result<GatewayResponse, GatewayError> {
        let body = read_body(req).await?;
        let setup: SetupRequest = serde_json::from_slice(&body)
            .map_err(|e| GatewayError::bad_request(format!("Invalid setup request: {}", e)))?;

        let correlation_id = setup
            .correlation_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_correlation_id);

        info!(
            correlation_id = %correlation_id,
            host = %setup.host,
            kind = %setup.kind,
            error = %setup.error,
            "Provisioning backend"
        );

        let outcome = self.provisioner.setup(&correlation_id).await?;
        self.registry.put(&correlation_id, outcome.port)?;

        info!(correlation_id = %correlation_id, port = outcome.port, "Setup complete");
        json_ok(&SetupResponse {
            correlation_id: &correlation_id,
            status: "setup_complete",
        })
    }

    async fn delete_instance(&self, correlation_id: &str) -> Result<GatewayResponse, GatewayError> {
        let port = self.registry.get(correlation_id)?;

        self.provisioner.teardown(correlation_id).await?;
        self.registry.delete(correlation_id)?;
        if let Some(port) = port {
            self.proxy.specs().invalidate(BACKEND_HOST, port);
        }

        info!(correlation_id, "Session removed");
        Ok(json_response(StatusCode::OK, r#"{"status":"cleaned"}"#))
    }

    // ==================== Chats ====================

    async fn save_chat(&self, correlation_id: &str, req: Request<Incoming>) -> Result<GatewayResponse, GatewayError> {
        if !self.registry.exists(correlation_id)? {
            return Err(GatewayError::not_found("Instance not found"));
        }

        let body = read_body(req).await?;
        let id = self.registry.insert_chat(correlation_id, &body)?;

        debug!(correlation_id, chat_id = id, bytes = body.len(), "Chat saved");
        Ok(json_response(StatusCode::OK, r#"{"status":"chat_saved"}"#))
    }

    fn list_chats(&self, correlation_id: &str) -> Result<GatewayResponse, GatewayError> {
        if !self.registry.exists(correlation_id)? {
            return Err(GatewayError::not_found("Instance not found"));
        }

        let chats: Vec<ChatEntry> = self
            .registry
            .list_chats(correlation_id)?
            .into_iter()
            .map(|chat| ChatEntry {
                id: chat.id,
                created_at: chat.created_at,
                payload: String::from_utf8_lossy(&chat.payload).into_owned(),
            })
            .collect();
        json_ok(&chats)
    }

    // ==================== Proxy ====================

    async fn proxy_request(
        &self,
        correlation_id: String,
        req: Request<Incoming>,
        request_id: String,
        peer: SocketAddr,
    ) -> Result<GatewayResponse, GatewayError> {
        let query = req.uri().query().map(str::to_string);
        let path = query_param(query.as_deref(), "path").unwrap_or_else(|| "/".to_string());
        let method = req.method().clone();
        let headers = req.headers().clone();
        let body = read_body(req).await?;

        self.proxy
            .forward(ProxyRequest {
                correlation_id,
                method,
                path,
                query,
                headers,
                body,
                request_id,
                client_ip: peer.ip(),
            })
            .await
    }

    // ==================== Process supervision ====================

    async fn check_port(&self, query: Option<&str>) -> Result<GatewayResponse, GatewayError> {
        let port: u16 = query_param(query, "port")
            .and_then(|p| p.parse().ok())
            .filter(|p| *p != 0)
            .ok_or_else(|| GatewayError::bad_request("Missing or invalid 'port' query parameter"))?;

        let health = self
            .supervisor
            .check_health(port, self.supervisor.health_timeout())
            .await?;
        json_ok(&health)
    }

    async fn list_processes(&self) -> Result<GatewayResponse, GatewayError> {
        json_ok(&self.supervisor.list_backend_processes().await?)
    }

    async fn kill_process(&self, pid: &str) -> Result<GatewayResponse, GatewayError> {
        let pid: i32 = pid
            .parse()
            .map_err(|_| GatewayError::bad_request(format!("Invalid pid '{}'", pid)))?;

        let outcome = self.supervisor.kill_process(pid).await;
        if outcome.success {
            info!(pid, message = %outcome.message, "Process killed");
        } else {
            warn!(pid, message = %outcome.message, "Process kill failed");
        }
        json_ok(&outcome)
    }
}

/// Correlation id for setup requests that did not supply one
pub fn generate_correlation_id() -> String {
    format!("corr-{}", Utc::now().timestamp_millis())
}

/// Inbound `x-request-id`, or a fresh one
fn request_id(req: &Request<Incoming>) -> String {
    req.headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn is_proxy_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn is_known_route(segments: &[&str]) -> bool {
    matches!(
        segments,
        ["health"]
            | ["version"]
            | ["instances"]
            | ["instances", _]
            | ["instances", _, "chat" | "proxy"]
            | ["proc", _]
    )
}

fn decode_segment(segment: &str) -> String {
    urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string())
}

/// First value of a form-encoded query parameter
fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, GatewayError> {
    req.into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| GatewayError::bad_request(format!("Failed to read request body: {}", e)))
}

fn json_ok<T: Serialize + ?Sized>(value: &T) -> Result<GatewayResponse, GatewayError> {
    let body = serde_json::to_vec(value)
        .map_err(|e| GatewayError::internal(format!("Failed to serialize response: {}", e)))?;
    Ok(json_response(StatusCode::OK, body))
}
