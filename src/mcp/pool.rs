//! 连接池：server_id 到 ServerConnection 的注册表
//!
//! 连接失败的 Server 也保留在池里（状态为 Error），后台健康扫描与
//! reconnect 才有对象可操作；对外调用落在非 Ready 连接上时得到扁平失败。

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::core::AgentError;
use crate::mcp::connection::{ConnectionState, ServerConnection, ToolDescriptor, ToolOutcome};

/// MCP 连接池
#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, Arc<ServerConnection>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按配置建立全部连接，返回每个 server 的连接结果
    ///
    /// 失败的连接同样入池（Error 状态），便于后续 reconnect。
    pub async fn connect_all(&self, configs: &[ServerConfig]) -> HashMap<String, bool> {
        let mut results = HashMap::new();

        for cfg in configs {
            let conn = match ServerConnection::new(cfg) {
                Ok(conn) => Arc::new(conn),
                Err(e) => {
                    warn!(server_id = %cfg.id, error = %e, "invalid server config, skipped");
                    results.insert(cfg.id.clone(), false);
                    continue;
                }
            };

            let connected = conn.connect().await.is_ok();
            results.insert(cfg.id.clone(), connected);
            self.connections.write().await.insert(cfg.id.clone(), conn);
        }

        let ok = results.values().filter(|v| **v).count();
        if ok == 0 && !configs.is_empty() {
            warn!("no mcp server connected, tool index will rely on cache");
        } else {
            info!(connected = ok, total = configs.len(), "mcp servers connected");
        }
        results
    }

    pub async fn get(&self, server_id: &str) -> Result<Arc<ServerConnection>, AgentError> {
        self.connections
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| AgentError::ServerNotFound(server_id.to_string()))
    }

    /// 调用指定 server 上的工具；server 不存在同样折叠为扁平失败
    pub async fn call_tool(&self, server_id: &str, tool_name: &str, arguments: Value) -> ToolOutcome {
        match self.get(server_id).await {
            Ok(conn) => conn.call_tool(tool_name, arguments).await,
            Err(e) => ToolOutcome::fail(e.to_string()),
        }
    }

    /// 当前处于 Ready 状态的连接
    pub async fn ready_connections(&self) -> Vec<Arc<ServerConnection>> {
        let conns: Vec<_> = self.connections.read().await.values().cloned().collect();
        let mut ready = Vec::new();
        for conn in conns {
            if conn.state().await == ConnectionState::Ready {
                ready.push(conn);
            }
        }
        ready
    }

    pub async fn ready_count(&self) -> usize {
        self.ready_connections().await.len()
    }

    /// 拉取所有 Ready 连接的工具目录，单个 server 失败不影响其它
    pub async fn catalogues(&self) -> Vec<(String, Vec<ToolDescriptor>)> {
        let mut out = Vec::new();
        for conn in self.ready_connections().await {
            match conn.list_tools().await {
                Ok(tools) => out.push((conn.server_id.clone(), tools)),
                Err(e) => {
                    warn!(server_id = %conn.server_id, error = %e, "list_tools failed during sync");
                }
            }
        }
        out
    }

    /// 对所有 Ready 连接做一轮健康检查
    pub async fn health_sweep(&self) {
        for conn in self.ready_connections().await {
            conn.health_check().await;
        }
    }

    /// 关闭全部连接（尽力而为）
    pub async fn close_all(&self) {
        let conns: Vec<_> = self.connections.read().await.values().cloned().collect();
        for conn in conns {
            conn.close().await;
        }
        info!("all mcp connections closed");
    }

    #[cfg(test)]
    pub(crate) async fn insert(&self, conn: Arc<ServerConnection>) {
        self.connections
            .write()
            .await
            .insert(conn.server_id.clone(), conn);
    }
}
