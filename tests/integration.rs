//! Integration tests for Sessiongate

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use sessiongate::api::GatewayApi;
use sessiongate::config::Config;
use sessiongate::db::Database;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const STUB_SPEC: &str = r#"{
    "paths": {
        "/status": {"get": {}},
        "/session/{id}": {"get": {}, "delete": {}},
        "/global/health": {"get": {}},
        "/teapot": {"get": {}}
    }
}"#;

/// What the stub serves at `/doc`
#[derive(Clone, Copy)]
enum SpecMode {
    Valid,
    ServerError,
    NotJson,
}

/// A stub backend that publishes a spec and counts requests
struct StubBackend {
    port: u16,
    /// Non-spec requests
    hits: Arc<AtomicUsize>,
    /// Requests for the spec document
    doc_fetches: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct StubState {
    mode: SpecMode,
    hits: Arc<AtomicUsize>,
    doc_fetches: Arc<AtomicUsize>,
}

async fn stub_handler(
    req: Request<Incoming>,
    state: StubState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    if path == "/doc" {
        state.doc_fetches.fetch_add(1, Ordering::SeqCst);
    } else {
        state.hits.fetch_add(1, Ordering::SeqCst);
    }

    let seen_content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let (status, body) = match (req.method().clone(), path.as_str()) {
        (Method::GET, "/doc") => match state.mode {
            SpecMode::Valid => (StatusCode::OK, STUB_SPEC.to_string()),
            SpecMode::ServerError => (StatusCode::INTERNAL_SERVER_ERROR, "boom".to_string()),
            SpecMode::NotJson => (StatusCode::OK, "<html>not a spec</html>".to_string()),
        },
        (Method::GET, "/status") => (StatusCode::OK, r#"{"echo": true}"#.to_string()),
        (Method::GET, "/global/health") => {
            (StatusCode::OK, r#"{"healthy":true,"version":"1.2.3"}"#.to_string())
        }
        (Method::GET, "/teapot") => (
            StatusCode::IM_A_TEAPOT,
            format!(r#"{{"query":"{}"}}"#, query),
        ),
        (Method::GET, p) if p.starts_with("/session/") => (
            StatusCode::OK,
            format!(r#"{{"path":"{}","query":"{}"}}"#, p, query),
        ),
        (Method::DELETE, p) if p.starts_with("/session/") => {
            (StatusCode::OK, r#"{"deleted":true}"#.to_string())
        }
        _ => (StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string()),
    };

    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("x-seen-content-type", seen_content_type)
        .header("x-stub-backend", "1")
        .body(Full::new(Bytes::from(body)))
        .unwrap())
}

async fn spawn_stub_backend() -> StubBackend {
    spawn_stub_backend_with(SpecMode::Valid).await
}

async fn spawn_stub_backend_with(mode: SpecMode) -> StubBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = StubState {
        mode,
        hits: Arc::new(AtomicUsize::new(0)),
        doc_fetches: Arc::new(AtomicUsize::new(0)),
    };

    let backend = StubBackend {
        port,
        hits: Arc::clone(&state.hits),
        doc_fetches: Arc::clone(&state.doc_fetches),
    };

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| stub_handler(req, state.clone()));
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    backend
}

/// A loopback port with nothing listening on it
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    format!("sh {}", path.display())
}

/// Config whose setup command reports a backend on `backend_port`
fn test_config(dir: &Path, backend_port: u16) -> Config {
    let outcome = format!(
        r#"{{"port":{},"worktree":"/tmp/wt","prod_hash":"a1","master_hash":"b2","compare_advice":"none","matches_master":true,"pid_file":"/tmp/wt/pid","pid":4242}}"#,
        backend_port
    );

    let mut config = Config::default();
    config.provisioning.setup_command =
        write_script(dir, "setup.sh", &format!("echo \"setting up $1\"\necho '{}'", outcome));
    config.provisioning.cleanup_command = write_script(dir, "cleanup.sh", "echo \"cleaning $1\"");
    config.provisioning.setup_timeout_secs = 5;
    config.provisioning.cleanup_timeout_secs = 5;
    config.server.request_timeout_secs = 5;
    config.backend.health_timeout_ms = 500;
    config
}

struct TestGateway {
    addr: SocketAddr,
    registry: Database,
    _shutdown_tx: watch::Sender<bool>,
}

async fn start_gateway(config: Config) -> TestGateway {
    let registry = Database::open_in_memory().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api = Arc::new(GatewayApi::new(&config, registry.clone(), shutdown_rx).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(api.serve(listener));

    TestGateway {
        addr,
        registry,
        _shutdown_tx: shutdown_tx,
    }
}

struct HttpResponse {
    status: u16,
    headers: String,
    body: String,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<String> {
        self.headers.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<HttpResponse, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr).await?;

    let body = body.unwrap_or("");
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let (status_line, headers) = head.split_once("\r\n").unwrap_or((head, ""));
    let status = status_line
        .split_whitespace()
        .nth(1)
        .ok_or("missing status")?
        .parse()?;

    Ok(HttpResponse {
        status,
        headers: headers.to_string(),
        body: body.to_string(),
    })
}

async fn get(addr: SocketAddr, path: &str) -> HttpResponse {
    http_request(addr, "GET", path, None).await.unwrap()
}

#[tokio::test]
async fn test_health_and_version() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), closed_port())).await;

    let response = get(gateway.addr, "/health").await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains(r#""status":"healthy""#));
    assert!(response.header("x-request-id").is_some());

    let response = get(gateway.addr, "/version").await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains("sessiongate"));
}

#[tokio::test]
async fn test_unknown_route_and_wrong_method() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), closed_port())).await;

    let response = get(gateway.addr, "/nowhere").await;
    assert_eq!(response.status, 404);
    assert_eq!(response.header("x-gateway-error").as_deref(), Some("NOT_FOUND"));

    let response = http_request(gateway.addr, "PUT", "/instances", Some("{}"))
        .await
        .unwrap();
    assert_eq!(response.status, 405);
}

#[tokio::test]
async fn test_full_proxy_flow() {
    let backend = spawn_stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), backend.port)).await;
    gateway.registry.put("corr-1", backend.port).unwrap();

    let response = get(gateway.addr, "/instances/corr-1/proxy?path=/status").await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains(r#""echo": true"#));
    assert_eq!(
        response.header("x-seen-content-type").as_deref(),
        Some("application/json")
    );
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);

    let response = get(gateway.addr, "/instances/corr-2/proxy?path=/status").await;
    assert_eq!(response.status, 404);
    assert!(response.body.contains("No active session"));
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_proxy_encodes_decoded_path() {
    let backend = spawn_stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), backend.port)).await;
    gateway.registry.put("corr-1", backend.port).unwrap();

    let response = get(gateway.addr, "/instances/corr-1/proxy?path=/session/a%20b").await;
    assert_eq!(response.status, 200);
    assert!(response.header("x-gateway-error").is_none());
    assert!(response.body.contains(r#""path":"/session/a%20b""#));
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_proxy_relays_non_success_status_and_headers() {
    let backend = spawn_stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), backend.port)).await;
    gateway.registry.put("corr-1", backend.port).unwrap();

    let response = get(gateway.addr, "/instances/corr-1/proxy?path=/teapot&x=1").await;
    assert_eq!(response.status, 418);
    assert!(response.header("x-gateway-error").is_none());
    assert_eq!(response.header("x-stub-backend").as_deref(), Some("1"));
    assert!(response.body.contains(r#""query":"path=/teapot&x=1""#));
    assert_eq!(backend.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_proxy_spec_fetch_failures_are_not_cached() {
    for mode in [SpecMode::ServerError, SpecMode::NotJson] {
        let backend = spawn_stub_backend_with(mode).await;
        let dir = tempfile::tempdir().unwrap();
        let gateway = start_gateway(test_config(dir.path(), backend.port)).await;
        gateway.registry.put("corr-1", backend.port).unwrap();

        for attempt in 1..=2 {
            let response = get(gateway.addr, "/instances/corr-1/proxy?path=/status").await;
            assert_eq!(response.status, 502);
            assert_eq!(
                response.header("x-gateway-error").as_deref(),
                Some("UPSTREAM_UNAVAILABLE")
            );
            assert_eq!(backend.doc_fetches.load(Ordering::SeqCst), attempt);
        }
        assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_proxy_path_without_leading_slash() {
    let backend = spawn_stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), backend.port)).await;
    gateway.registry.put("corr-1", backend.port).unwrap();

    let response = get(gateway.addr, "/instances/corr-1/proxy?path=status").await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains("echo"));
}

#[tokio::test]
async fn test_proxy_rejects_undeclared_requests() {
    let backend = spawn_stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), backend.port)).await;
    gateway.registry.put("corr-1", backend.port).unwrap();

    let response = get(gateway.addr, "/instances/corr-1/proxy?path=/admin").await;
    assert_eq!(response.status, 422);
    assert!(response.body.contains("not found in spec"));
    assert_eq!(
        response.header("x-gateway-error").as_deref(),
        Some("VALIDATION_REJECTED")
    );

    let response = http_request(
        gateway.addr,
        "POST",
        "/instances/corr-1/proxy?path=/status",
        Some(r#"{"x":1}"#),
    )
    .await
    .unwrap();
    assert_eq!(response.status, 422);
    assert!(response.body.contains("not allowed"));

    // Rejected requests never reach the backend
    assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_proxy_backend_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let port = closed_port();
    let gateway = start_gateway(test_config(dir.path(), port)).await;
    gateway.registry.put("corr-dead", port).unwrap();

    let response = get(gateway.addr, "/instances/corr-dead/proxy?path=/status").await;
    assert_eq!(response.status, 502);
    assert_eq!(
        response.header("x-gateway-error").as_deref(),
        Some("UPSTREAM_UNAVAILABLE")
    );
}

#[tokio::test]
async fn test_proxy_delete_rate_limit() {
    let backend = spawn_stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), backend.port)).await;
    gateway.registry.put("corr-1", backend.port).unwrap();

    for i in 0..5 {
        let response = http_request(
            gateway.addr,
            "DELETE",
            &format!("/instances/corr-1/proxy?path=/session/{}", i),
            None,
        )
        .await
        .unwrap();
        assert_eq!(response.status, 200, "request {} should pass", i);
    }

    let response = http_request(
        gateway.addr,
        "DELETE",
        "/instances/corr-1/proxy?path=/session/6",
        None,
    )
    .await
    .unwrap();
    assert_eq!(response.status, 429);
    assert!(response.header("retry-after").is_some());
    assert_eq!(backend.hits.load(Ordering::SeqCst), 5);

    // Other methods are not limited
    let response = get(gateway.addr, "/instances/corr-1/proxy?path=/status").await;
    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_instance_lifecycle() {
    let backend = spawn_stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), backend.port)).await;

    let setup = r#"{"correlation_id":"corr-life","error":"boom","host":"api.internal","type":"exception"}"#;
    let response = http_request(gateway.addr, "POST", "/instances", Some(setup))
        .await
        .unwrap();
    assert_eq!(response.status, 200, "{}", response.body);
    assert!(response.body.contains(r#""correlation_id":"corr-life""#));
    assert!(response.body.contains(r#""status":"setup_complete""#));
    assert_eq!(gateway.registry.get("corr-life").unwrap(), Some(backend.port));

    let response = get(gateway.addr, "/instances").await;
    assert_eq!(response.status, 200);
    assert!(response
        .body
        .contains(&format!(r#""corr-life":{}"#, backend.port)));

    let response = get(gateway.addr, "/instances/corr-life/proxy?path=/status").await;
    assert_eq!(response.status, 200);

    let response = http_request(
        gateway.addr,
        "POST",
        "/instances/corr-life/chat",
        Some(r#"{"messages":["hi"]}"#),
    )
    .await
    .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.contains("chat_saved"));

    let response = get(gateway.addr, "/instances/corr-life/chat").await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains("messages"));

    let response = http_request(gateway.addr, "DELETE", "/instances/corr-life", None)
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.contains(r#""status":"cleaned""#));
    assert_eq!(gateway.registry.get("corr-life").unwrap(), None);

    let response = get(gateway.addr, "/instances/corr-life/proxy?path=/status").await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_setup_generates_correlation_id() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), 4100)).await;

    let setup = r#"{"error":"boom","host":"api.internal","type":"exception"}"#;
    let response = http_request(gateway.addr, "POST", "/instances", Some(setup))
        .await
        .unwrap();
    assert_eq!(response.status, 200, "{}", response.body);
    assert!(response.body.contains(r#""correlation_id":"corr-"#));
    assert_eq!(gateway.registry.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_setup_failure_returns_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 4100);
    config.provisioning.setup_command =
        write_script(dir.path(), "failing.sh", "echo 'no free port' >&2\nexit 2");
    let gateway = start_gateway(config).await;

    let setup = r#"{"correlation_id":"corr-x","error":"boom","host":"h","type":"t"}"#;
    let response = http_request(gateway.addr, "POST", "/instances", Some(setup))
        .await
        .unwrap();
    assert_eq!(response.status, 500);
    assert!(response.body.contains("no free port"));
    assert_eq!(gateway.registry.get("corr-x").unwrap(), None);
}

#[tokio::test]
async fn test_setup_malformed_body() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), 4100)).await;

    let response = http_request(gateway.addr, "POST", "/instances", Some("{not json"))
        .await
        .unwrap();
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn test_teardown_failure_keeps_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), 4100);
    config.provisioning.cleanup_command = write_script(dir.path(), "cleanup-fail.sh", "exit 1");
    let gateway = start_gateway(config).await;
    gateway.registry.put("corr-keep", 4100).unwrap();

    let response = http_request(gateway.addr, "DELETE", "/instances/corr-keep", None)
        .await
        .unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(gateway.registry.get("corr-keep").unwrap(), Some(4100));
}

#[tokio::test]
async fn test_chat_for_unknown_instance() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), 4100)).await;

    let response = http_request(gateway.addr, "POST", "/instances/ghost/chat", Some("{}"))
        .await
        .unwrap();
    assert_eq!(response.status, 404);

    let response = get(gateway.addr, "/instances/ghost/chat").await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_check_port() {
    let backend = spawn_stub_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), backend.port)).await;

    let response = get(gateway.addr, &format!("/proc/check_port?port={}", backend.port)).await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains(r#""healthy":true"#));
    assert!(response.body.contains("1.2.3"));

    let response = get(gateway.addr, &format!("/proc/check_port?port={}", closed_port())).await;
    assert_eq!(response.status, 502);

    let response = get(gateway.addr, "/proc/check_port?port=abc").await;
    assert_eq!(response.status, 400);
}

#[tokio::test]
async fn test_kill_rejects_non_backend_pid() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), 4100)).await;

    let own_pid = std::process::id();
    let response = http_request(gateway.addr, "DELETE", &format!("/proc/{}", own_pid), None)
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.contains(r#""success":false"#));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_list_backend_processes() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = start_gateway(test_config(dir.path(), 4100)).await;

    let mut child = std::process::Command::new("sh")
        .args(["-c", "sleep 30; true", "opencode", "serve", "--port", "4999"])
        .spawn()
        .unwrap();

    let response = get(gateway.addr, "/proc/list_opencode").await;
    assert_eq!(response.status, 200);
    assert!(response.body.contains(&format!(r#""pid":{}"#, child.id())));
    assert!(response.body.contains(r#""port":4999"#));

    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn test_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state/instances.db");

    {
        let registry = Database::open(&db_path).unwrap();
        registry.put("corr-persist", 4321).unwrap();
    }

    let registry = Database::open(&db_path).unwrap();
    assert_eq!(registry.get("corr-persist").unwrap(), Some(4321));
}
