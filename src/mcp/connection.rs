//! 单个 MCP Server 连接封装
//!
//! 走 Streamable HTTP 传输：所有请求都是对 server URL 的 JSON-RPC POST，
//! 响应可能是普通 JSON，也可能是 SSE（逐行 data: 帧）。
//! 状态机：Disconnected -> Connecting -> Ready；任何失败进入 Error。
//! Error 是粘性状态，只有重新 connect 才能离开。
//!
//! 工具调用永远不抛错误：所有失败都折叠为 ToolOutcome { success: false, error }，
//! 上层（Executor / Router）只看这一个扁平形状。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::core::AgentError;

/// 握手与健康检查的固定超时
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// SSE 流式读取预算（长耗时工具）
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(300);
/// 连续健康检查失败阈值，达到后连接进入 Error
const MAX_HEALTH_FAILURES: u32 = 3;

const PROTOCOL_VERSION: &str = "2025-03-26";

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Error,
}

/// 远端工具的描述（tools/list 返回的条目）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// 工具调用的归一化结果：成功携带 result，失败携带 error，二者互斥
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// 单个 MCP Server 的连接：内部可变，方法都取 &self，便于放进 Arc 共享
pub struct ServerConnection {
    pub server_id: String,
    url: String,
    call_timeout: Duration,
    headers: HashMap<String, String>,
    http: reqwest::Client,
    state: RwLock<ConnectionState>,
    session_id: RwLock<Option<String>>,
    request_seq: AtomicU64,
    health_failures: AtomicU32,
}

impl ServerConnection {
    pub fn new(cfg: &ServerConfig) -> Result<Self, AgentError> {
        if !cfg.url.starts_with("http://") && !cfg.url.starts_with("https://") {
            return Err(AgentError::Config(format!(
                "invalid server url for {}: {}",
                cfg.id, cfg.url
            )));
        }

        // 总预算取流式读取上限，单次请求再按操作各自收紧
        let http = reqwest::Client::builder()
            .timeout(STREAM_READ_TIMEOUT)
            .build()
            .map_err(|e| AgentError::connection(&cfg.id, e.to_string()))?;

        Ok(Self {
            server_id: cfg.id.clone(),
            url: cfg.url.clone(),
            call_timeout: Duration::from_secs(cfg.timeout),
            headers: cfg.headers.clone(),
            http,
            state: RwLock::new(ConnectionState::Disconnected),
            session_id: RwLock::new(None),
            request_seq: AtomicU64::new(0),
            health_failures: AtomicU32::new(0),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn health_failures(&self) -> u32 {
        self.health_failures.load(Ordering::Relaxed)
    }

    async fn set_state(&self, next: ConnectionState) {
        *self.state.write().await = next;
    }

    /// 建立连接：initialize 握手（10s 超时）+ initialized 通知
    pub async fn connect(&self) -> Result<(), AgentError> {
        info!(server_id = %self.server_id, url = %self.url, "connecting to mcp server");
        self.set_state(ConnectionState::Connecting).await;
        *self.session_id.write().await = None;

        match self.do_handshake().await {
            Ok(()) => {
                self.set_state(ConnectionState::Ready).await;
                self.health_failures.store(0, Ordering::Relaxed);
                info!(server_id = %self.server_id, "connected");
                Ok(())
            }
            Err(e) => {
                warn!(server_id = %self.server_id, error = %e, "connection failed");
                self.set_state(ConnectionState::Error).await;
                Err(e)
            }
        }
    }

    async fn do_handshake(&self) -> Result<(), AgentError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": "nest", "version": env!("CARGO_PKG_VERSION") },
        });
        let body = self.request_body("initialize", params);

        let response = self.post_json(&body, CONNECT_TIMEOUT).await?;

        if let Some(session) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(session.to_string());
        }

        let result = Self::parse_rpc_response(&self.server_id, response).await?;
        debug!(
            server_id = %self.server_id,
            server_info = %result.pointer("/serverInfo/name").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "handshake completed"
        );

        // initialized 通知没有 id，服务端以 202 应答
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
        });
        self.post_json(&notification, CONNECT_TIMEOUT).await?;
        Ok(())
    }

    /// 关闭连接：通知服务端销毁会话（尽力而为），回到 Disconnected
    pub async fn close(&self) {
        let session = self.session_id.write().await.take();
        if let Some(session) = session {
            let _ = self
                .http
                .delete(&self.url)
                .header("Mcp-Session-Id", session)
                .timeout(CONNECT_TIMEOUT)
                .send()
                .await;
        }
        self.set_state(ConnectionState::Disconnected).await;
        self.health_failures.store(0, Ordering::Relaxed);
        info!(server_id = %self.server_id, "connection closed");
    }

    /// 断开后重建会话
    pub async fn reconnect(&self) -> Result<(), AgentError> {
        info!(server_id = %self.server_id, "reconnecting");
        self.close().await;
        self.connect().await
    }

    /// 健康检查：用 tools/list 探活（5s 超时）
    ///
    /// 非 Ready 状态直接返回 false 且不计失败；
    /// 连续失败 MAX_HEALTH_FAILURES 次后进入 Error。
    pub async fn health_check(&self) -> bool {
        if self.state().await != ConnectionState::Ready {
            return false;
        }

        match self.rpc("tools/list", json!({}), HEALTH_CHECK_TIMEOUT).await {
            Ok(_) => {
                self.health_failures.store(0, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let failures = self.health_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    server_id = %self.server_id,
                    failures,
                    max = MAX_HEALTH_FAILURES,
                    error = %e,
                    "health check failed"
                );
                if failures >= MAX_HEALTH_FAILURES {
                    warn!(server_id = %self.server_id, "max health failures reached, marking connection error");
                    self.set_state(ConnectionState::Error).await;
                }
                false
            }
        }
    }

    /// 列出远端工具
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, AgentError> {
        if self.state().await != ConnectionState::Ready {
            return Err(AgentError::connection(
                &self.server_id,
                "connection not ready",
            ));
        }

        let result = self
            .rpc("tools/list", json!({}), HEALTH_CHECK_TIMEOUT)
            .await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|e| AgentError::JsonParse(e.to_string()))
    }

    /// 调用工具，失败折叠为 ToolOutcome 而不是错误
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> ToolOutcome {
        let state = self.state().await;
        if state != ConnectionState::Ready {
            return ToolOutcome::fail(format!("connection not ready (state: {:?})", state));
        }

        debug!(server_id = %self.server_id, tool = tool_name, "calling tool");
        let params = json!({ "name": tool_name, "arguments": arguments });

        match self.rpc("tools/call", params, self.call_timeout).await {
            Ok(result) => ToolOutcome::ok(Self::normalize_call_result(result)),
            Err(e) => {
                warn!(server_id = %self.server_id, tool = tool_name, error = %e, "tool call failed");
                ToolOutcome::fail(e.to_string())
            }
        }
    }

    /// 统一 CallToolResult 形状：保证 content 与 isError 两个键存在
    fn normalize_call_result(result: Value) -> Value {
        match result {
            Value::Object(mut map) => {
                map.entry("content").or_insert(Value::Null);
                map.entry("isError").or_insert(Value::Bool(false));
                Value::Object(map)
            }
            other => json!({ "content": other.to_string(), "isError": false }),
        }
    }

    fn request_body(&self, method: &str, params: Value) -> Value {
        let id = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
    }

    async fn rpc(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, AgentError> {
        let body = self.request_body(method, params);
        let response = self.post_json(&body, timeout).await?;
        Self::parse_rpc_response(&self.server_id, response).await
    }

    async fn post_json(
        &self,
        body: &Value,
        timeout: Duration,
    ) -> Result<reqwest::Response, AgentError> {
        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .timeout(timeout)
            .json(body);

        for (k, v) in &self.headers {
            request = request.header(k, v);
        }
        if let Some(session) = self.session_id.read().await.as_ref() {
            request = request.header("Mcp-Session-Id", session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::connection(&self.server_id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::connection(
                &self.server_id,
                format!("server returned {}", status),
            ));
        }
        Ok(response)
    }

    /// 解析 JSON-RPC 响应体，兼容纯 JSON 与 SSE 两种内容类型
    async fn parse_rpc_response(
        server_id: &str,
        response: reqwest::Response,
    ) -> Result<Value, AgentError> {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let text = response
            .text()
            .await
            .map_err(|e| AgentError::connection(server_id, e.to_string()))?;

        // 通知的 202 应答没有响应体
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }

        let payload: Value = if content_type.starts_with("text/event-stream") {
            Self::parse_sse_payload(&text)
                .ok_or_else(|| AgentError::JsonParse("no data frame in sse response".to_string()))?
        } else {
            serde_json::from_str(&text).map_err(|e| AgentError::JsonParse(e.to_string()))?
        };

        if let Some(err) = payload.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown rpc error");
            return Err(AgentError::connection(server_id, message.to_string()));
        }

        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    /// 取 SSE 流中最后一个能解析出 JSON-RPC 响应的 data 帧
    fn parse_sse_payload(text: &str) -> Option<Value> {
        text.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
            .filter(|v| v.get("result").is_some() || v.get("error").is_some())
            .last()
    }

    #[cfg(test)]
    pub(crate) async fn force_state(&self, state: ConnectionState) {
        self.set_state(state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(url: &str) -> ServerConfig {
        serde_json::from_value(json!({ "id": "test-server", "url": url })).unwrap()
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let conn = ServerConnection::new(&test_config("http://127.0.0.1:9/mcp")).unwrap();
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(ServerConnection::new(&test_config("ftp://nope")).is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_enters_error_state() {
        // 端口 9（discard）没有服务监听，连接立即被拒
        let conn = ServerConnection::new(&test_config("http://127.0.0.1:9/mcp")).unwrap();
        assert!(conn.connect().await.is_err());
        assert_eq!(conn.state().await, ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_health_check_requires_ready() {
        let conn = ServerConnection::new(&test_config("http://127.0.0.1:9/mcp")).unwrap();
        assert!(!conn.health_check().await);
        assert_eq!(conn.health_failures(), 0);
    }

    #[tokio::test]
    async fn test_three_health_failures_mark_error_sticky() {
        let conn = ServerConnection::new(&test_config("http://127.0.0.1:9/mcp")).unwrap();
        conn.force_state(ConnectionState::Ready).await;

        for expected in 1..=3u32 {
            assert!(!conn.health_check().await);
            assert_eq!(conn.health_failures(), expected);
        }
        assert_eq!(conn.state().await, ConnectionState::Error);

        // Error 是粘性的：再检查不会复位计数，也不会离开 Error
        assert!(!conn.health_check().await);
        assert_eq!(conn.state().await, ConnectionState::Error);
        assert_eq!(conn.health_failures(), 3);
    }

    #[tokio::test]
    async fn test_call_tool_not_ready_is_flat_failure() {
        let conn = ServerConnection::new(&test_config("http://127.0.0.1:9/mcp")).unwrap();
        let outcome = conn.call_tool("turn_on", json!({})).await;
        assert!(!outcome.success);
        assert!(outcome.error.as_deref().unwrap().contains("not ready"));
        assert!(outcome.result.is_none());
    }

    #[test]
    fn test_sse_payload_takes_last_response_frame() {
        let text = "event: message\ndata: {\"jsonrpc\":\"2.0\"}\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n";
        let payload = ServerConnection::parse_sse_payload(text).unwrap();
        assert_eq!(payload["result"]["ok"], true);
    }

    #[test]
    fn test_normalize_call_result_fills_defaults() {
        let v = ServerConnection::normalize_call_result(json!({"content": [{"type": "text", "text": "on"}]}));
        assert_eq!(v["isError"], false);

        let v = ServerConnection::normalize_call_result(json!("plain"));
        assert_eq!(v["isError"], false);
        assert!(v["content"].is_string());
    }
}
