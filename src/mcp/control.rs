//! MCP 控制平面门面
//!
//! 组合连接池、工具索引与路由器，对外提供统一入口：
//! initialize 负责建连、加载缓存、按需同步并启动后台健康扫描；
//! close 停掉后台任务并断开所有连接。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::McpSection;
use crate::llm::LlmClient;
use crate::mcp::connection::ToolOutcome;
use crate::mcp::index::ToolIndex;
use crate::mcp::pool::ConnectionPool;
use crate::mcp::router::{McpRouter, RouterContext, RouterDecision};

const DEFAULT_CACHE_PATH: &str = "mcp_tool_index.json";

/// MCP 子系统门面
pub struct McpControl {
    pool: Arc<ConnectionPool>,
    index: Arc<ToolIndex>,
    router: McpRouter,
    cancel: CancellationToken,
}

impl McpControl {
    /// 初始化控制平面：建连、加载缓存，缓存失效或强制刷新时重拉工具目录
    pub async fn initialize(cfg: &McpSection, llm: Arc<dyn LlmClient>) -> Self {
        info!("initializing mcp control plane");

        let pool = Arc::new(ConnectionPool::new());
        pool.connect_all(&cfg.servers).await;

        let cache_path = cfg
            .cache_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH));
        let index = Arc::new(ToolIndex::new(
            cache_path,
            cfg.cache_ttl_seconds,
            cfg.tag_rules.clone(),
        ));

        index.load_from_file().await;
        if index.should_sync(cfg.force_refresh_on_init).await {
            index.sync_from_pool(&pool).await;
        } else {
            info!(tools = index.len().await, "using cached tool index");
        }

        if index.is_empty().await {
            warn!("tool index is empty, router will not be able to select tools");
        }

        let router = McpRouter::new(llm, index.clone());
        let cancel = CancellationToken::new();

        if cfg.health_check_interval_secs > 0 {
            Self::spawn_health_sweep(
                pool.clone(),
                Duration::from_secs(cfg.health_check_interval_secs),
                cancel.clone(),
            );
        }

        info!("mcp control plane ready");
        Self {
            pool,
            index,
            router,
            cancel,
        }
    }

    fn spawn_health_sweep(pool: Arc<ConnectionPool>, interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("health sweep stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        pool.health_sweep().await;
                    }
                }
            }
        });
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    pub fn index(&self) -> Arc<ToolIndex> {
        self.index.clone()
    }

    /// 一次路由决策
    pub async fn route(&self, context: &RouterContext) -> RouterDecision {
        self.router.route(context).await
    }

    /// 调用指定 server 上的工具
    pub async fn call_tool(&self, server_id: &str, tool_name: &str, arguments: Value) -> ToolOutcome {
        self.pool.call_tool(server_id, tool_name, arguments).await
    }

    /// 手动触发索引刷新（force 时忽略缓存有效期）
    pub async fn refresh_index(&self, force: bool) {
        if self.index.should_sync(force).await {
            self.index.sync_from_pool(&self.pool).await;
        }
    }

    /// 停止后台任务并关闭全部连接
    pub async fn close(&self) {
        self.cancel.cancel();
        self.pool.close_all().await;
        info!("mcp control plane closed");
    }
}
