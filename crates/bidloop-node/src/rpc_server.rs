//! JSON-RPC server
//!
//! Plain HTTP/1.1 with a JSON-RPC 2.0 body:
//! - `cycle_status`, `cycle_purchase`, `ledger_balance`, `user_register`
//! - operator methods `cycle_reopenClosed`, `cycle_diagnose`, `ledger_deposit`
//! - per-IP rate limiting

use crate::api::{ApiError, ApiHandlers};
use crate::config::RpcConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

/// Largest request body accepted
const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Tracked clients above which expired rate-limit windows are swept
const SWEEP_THRESHOLD: usize = 256;

const PARSE_ERROR: i64 = -32700;
const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const OPERATOR_DISABLED: i64 = -32001;

/// RPC Server
pub struct RpcServer {
    /// Configuration
    config: RpcConfig,

    /// Rate limiter
    rate_limiter: Arc<RateLimiter>,

    /// Request handlers
    handlers: Arc<RpcHandlers>,

    /// Metrics
    metrics: Arc<RwLock<RpcMetrics>>,
}

/// Fixed one-second window per client IP
pub struct RateLimiter {
    /// Requests per second per IP
    requests_per_second: u32,

    /// Burst allowance
    burst: u32,

    /// Request counts by IP
    request_counts: RwLock<HashMap<String, RequestCounter>>,
}

/// Request counter for rate limiting
#[derive(Clone, Default)]
struct RequestCounter {
    count: u32,
    window_start: i64,
}

/// RPC metrics
#[derive(Clone, Debug, Default, Serialize)]
pub struct RpcMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rate_limited_requests: u64,
    pub avg_response_time_ms: f64,
    pub active_connections: u32,
}

/// Method dispatch over [`ApiHandlers`]
pub struct RpcHandlers {
    api: ApiHandlers,
    operator_methods: bool,
    node_name: String,
}

impl RpcServer {
    pub fn new(config: &RpcConfig, node_name: &str, api: ApiHandlers) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.requests_per_second, config.burst));
        let handlers = Arc::new(RpcHandlers::new(api, config.operator_methods, node_name));

        Self {
            config: config.clone(),
            rate_limiter,
            handlers,
            metrics: Arc::new(RwLock::new(RpcMetrics::default())),
        }
    }

    /// Run the RPC server
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr: SocketAddr = self.config.listen_addr.parse()?;
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            "RPC server listening on {} (operator methods: {})",
            addr,
            self.config.operator_methods
        );

        loop {
            let (mut stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    continue;
                }
            };

            let handlers = self.handlers.clone();
            let rate_limiter = self.rate_limiter.clone();
            let metrics = self.metrics.clone();

            {
                let mut m = metrics.write().await;
                m.active_connections += 1;
            }

            tokio::spawn(async move {
                let peer_ip = peer_addr.ip().to_string();

                if rate_limiter.check(&peer_ip).await {
                    if let Err(e) = handle_connection(&mut stream, handlers, metrics.clone()).await {
                        tracing::debug!("Connection error from {}: {}", peer_addr, e);
                    }
                } else {
                    metrics.write().await.rate_limited_requests += 1;
                    let _ = stream
                        .write_all(b"HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\n\r\n")
                        .await;
                }

                let mut m = metrics.write().await;
                m.active_connections = m.active_connections.saturating_sub(1);
            });
        }
    }

    /// Get current metrics
    pub async fn metrics(&self) -> RpcMetrics {
        self.metrics.read().await.clone()
    }
}

impl RateLimiter {
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        Self {
            requests_per_second,
            burst,
            request_counts: RwLock::new(HashMap::new()),
        }
    }

    /// Check if request is allowed
    async fn check(&self, ip: &str) -> bool {
        self.check_at(ip, chrono::Utc::now().timestamp()).await
    }

    async fn check_at(&self, ip: &str, now: i64) -> bool {
        let mut counts = self.request_counts.write().await;
        if counts.len() >= SWEEP_THRESHOLD {
            counts.retain(|_, c| now - c.window_start < 1);
        }

        let counter = counts.entry(ip.to_string()).or_default();

        if now - counter.window_start >= 1 {
            counter.count = 0;
            counter.window_start = now;
        }

        if counter.count >= self.requests_per_second + self.burst {
            return false;
        }

        counter.count += 1;
        true
    }

    async fn tracked_clients(&self) -> usize {
        self.request_counts.read().await.len()
    }
}

/// Read one HTTP request: headers, then as much body as `Content-Length` says
async fn read_request(stream: &mut tokio::net::TcpStream) -> anyhow::Result<Option<String>> {
    let mut data = Vec::with_capacity(4096);
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            anyhow::bail!("request larger than {} bytes", MAX_REQUEST_BYTES);
        }

        let text = String::from_utf8_lossy(&data);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let wanted = content_length(&text[..header_end]).unwrap_or(0);
            if data.len() >= header_end + 4 + wanted {
                break;
            }
        }
    }

    if data.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&data).into_owned()))
}

fn content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Whether a JSON-RPC response carries a top-level `error` member
fn is_error_response(body: &str) -> bool {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(envelope)) => envelope.contains_key("error"),
        _ => true,
    }
}

/// Handle a single connection
async fn handle_connection(
    stream: &mut tokio::net::TcpStream,
    handlers: Arc<RpcHandlers>,
    metrics: Arc<RwLock<RpcMetrics>>,
) -> anyhow::Result<()> {
    let start = std::time::Instant::now();
    let Some(request) = read_request(stream).await? else {
        return Ok(());
    };

    metrics.write().await.total_requests += 1;

    let (response, ok) = if request.starts_with("POST") || request.starts_with("GET /") {
        let body_start = request.find("\r\n\r\n").map(|i| i + 4).unwrap_or(request.len());
        let body = &request[body_start..];

        let json_response = handlers.handle_json_rpc(body).await;
        let ok = !is_error_response(&json_response);

        let response = format!(
            "HTTP/1.1 200 OK\r\n\
            Content-Type: application/json\r\n\
            Content-Length: {}\r\n\r\n{}",
            json_response.len(),
            json_response
        );
        (response, ok)
    } else {
        ("HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string(), false)
    };

    stream.write_all(response.as_bytes()).await?;

    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
    let mut m = metrics.write().await;
    if ok {
        m.successful_requests += 1;
    } else {
        m.failed_requests += 1;
    }
    let served = (m.successful_requests + m.failed_requests) as f64;
    m.avg_response_time_ms = (m.avg_response_time_ms * (served - 1.0) + elapsed) / served;

    Ok(())
}

/// `params` may be an object or a one-element array holding the object
fn parse_params<T: DeserializeOwned>(params: Option<&Value>) -> Result<T, ApiError> {
    let value = match params {
        Some(Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    serde_json::from_value(value).map_err(|e| ApiError::invalid_params(e.to_string()))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError {
        code: -32603,
        message: e.to_string(),
        client_error: false,
    })
}

fn error_envelope(id: Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message
        },
        "id": id
    })
    .to_string()
}

impl RpcHandlers {
    pub fn new(api: ApiHandlers, operator_methods: bool, node_name: &str) -> Self {
        Self {
            api,
            operator_methods,
            node_name: node_name.to_string(),
        }
    }

    fn is_operator_method(method: &str) -> bool {
        matches!(method, "cycle_reopenClosed" | "cycle_diagnose" | "ledger_deposit")
    }

    /// Handle JSON-RPC request
    async fn handle_json_rpc(&self, body: &str) -> String {
        if body.trim().is_empty() {
            return self.node_info();
        }

        let request: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => return error_envelope(Value::Null, PARSE_ERROR, &format!("Parse error: {e}")),
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
            return error_envelope(id, INVALID_REQUEST, "Missing method");
        };
        let params = request.get("params");

        if Self::is_operator_method(method) && !self.operator_methods {
            return error_envelope(id, OPERATOR_DISABLED, "Operator methods are disabled");
        }

        let result = match method {
            "cycle_status" => self.api.status().and_then(to_value),
            "cycle_purchase" => parse_params(params)
                .and_then(|req| self.api.purchase(req))
                .and_then(to_value),
            "cycle_reopenClosed" => self.api.reopen_closed().and_then(to_value),
            "cycle_diagnose" => to_value(self.api.diagnose()),
            "ledger_deposit" => parse_params(params)
                .and_then(|req| self.api.deposit(req))
                .and_then(to_value),
            "ledger_balance" => parse_params(params)
                .and_then(|req| self.api.balance(req))
                .and_then(to_value),
            "user_register" => parse_params(params)
                .and_then(|req| self.api.register(req))
                .and_then(to_value),
            _ => {
                return error_envelope(id, METHOD_NOT_FOUND, &format!("Method not found: {method}"));
            }
        };

        match result {
            Ok(value) => json!({
                "jsonrpc": "2.0",
                "result": value,
                "id": id
            })
            .to_string(),
            Err(e) => {
                if e.client_error {
                    tracing::debug!(method, code = e.code, "RPC call rejected: {}", e.message);
                } else {
                    tracing::warn!(method, code = e.code, "RPC call failed: {}", e.message);
                }
                json!({
                    "jsonrpc": "2.0",
                    "error": e,
                    "id": id
                })
                .to_string()
            }
        }
    }

    /// Answer for requests without a JSON-RPC body
    fn node_info(&self) -> String {
        let services = self.api.services();
        json!({
            "jsonrpc": "2.0",
            "result": {
                "name": self.node_name,
                "version": env!("CARGO_PKG_VERSION"),
                "gateway": services.transport.gateway_name(),
                "unitPrice": services.purchases.unit_price(),
                "operatorMethods": self.operator_methods
            },
            "id": Value::Null
        })
        .to_string()
    }
}
