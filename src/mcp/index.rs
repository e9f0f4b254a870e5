//! 工具能力索引
//!
//! 维护所有 MCP Server 工具的只读快照，为 Router 提供稳定视图。
//! 快照整体替换（RwLock<Arc<...>>），读方拿到的永远是一致的一份；
//! 同步失败时回退到磁盘缓存（可能过期，标记 degraded）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::TagRule;
use crate::core::AgentError;
use crate::mcp::connection::ToolDescriptor;
use crate::mcp::pool::ConnectionPool;

const CACHE_VERSION: &str = "1.0.0";

/// 索引条目：一个工具的全部元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolIndexEntry {
    pub server_id: String,
    pub tool_name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default = "default_cost_estimate")]
    pub cost_estimate: String,
}

fn default_cost_estimate() -> String {
    "medium".to_string()
}

/// 缓存文件布局（版本化 JSON，按 server 分组）
#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: String,
    last_sync: Option<String>,
    servers: Vec<CacheServer>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheServer {
    server_id: String,
    tools: Vec<CacheTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheTool {
    tool_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    input_schema: Value,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    blocking: bool,
    #[serde(default = "default_cost_estimate")]
    cost_estimate: String,
}

/// 一致的索引快照，整体替换
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    pub tools: HashMap<String, ToolIndexEntry>,
    pub last_sync: Option<DateTime<Utc>>,
    /// 所有 server 都不可达、依赖过期缓存时为 true
    pub degraded: bool,
}

/// 工具索引管理器
pub struct ToolIndex {
    snapshot: RwLock<Arc<IndexSnapshot>>,
    cache_path: PathBuf,
    cache_ttl_seconds: u64,
    tag_rules: Vec<TagRule>,
}

impl ToolIndex {
    pub fn new(cache_path: PathBuf, cache_ttl_seconds: u64, tag_rules: Vec<TagRule>) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(IndexSnapshot::default())),
            cache_path,
            cache_ttl_seconds,
            tag_rules,
        }
    }

    /// 当前快照（廉价 clone，读方持有期间不受后续替换影响）
    pub async fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.snapshot.read().await.clone()
    }

    async fn swap(&self, next: IndexSnapshot) {
        *self.snapshot.write().await = Arc::new(next);
    }

    /// 从缓存文件加载快照，文件缺失或损坏时保持现状
    pub async fn load_from_file(&self) {
        let text = match tokio::fs::read_to_string(&self.cache_path).await {
            Ok(text) => text,
            Err(_) => {
                debug!(path = %self.cache_path.display(), "no tool index cache");
                return;
            }
        };

        let cache: CacheFile = match serde_json::from_str(&text) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(path = %self.cache_path.display(), error = %e, "tool index cache corrupted, ignored");
                return;
            }
        };

        // 未知的缓存版本直接丢弃，不做猜测性迁移
        if cache.version != CACHE_VERSION {
            warn!(
                path = %self.cache_path.display(),
                version = %cache.version,
                expected = CACHE_VERSION,
                "unknown tool index cache version, ignored"
            );
            return;
        }

        let last_sync = cache
            .last_sync
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));

        let mut tools = HashMap::new();
        for server in cache.servers {
            for tool in server.tools {
                tools.insert(
                    tool.tool_name.clone(),
                    ToolIndexEntry {
                        server_id: server.server_id.clone(),
                        tool_name: tool.tool_name,
                        description: tool.description,
                        input_schema: tool.input_schema,
                        tags: tool.tags,
                        blocking: tool.blocking,
                        cost_estimate: tool.cost_estimate,
                    },
                );
            }
        }

        info!(tools = tools.len(), path = %self.cache_path.display(), "tool index loaded from cache");
        self.swap(IndexSnapshot {
            tools,
            last_sync,
            degraded: false,
        })
        .await;
    }

    /// 将当前快照写入缓存文件
    pub async fn save_to_file(&self) -> Result<(), AgentError> {
        let snapshot = self.snapshot().await;

        let mut by_server: HashMap<String, Vec<CacheTool>> = HashMap::new();
        for entry in snapshot.tools.values() {
            by_server
                .entry(entry.server_id.clone())
                .or_default()
                .push(CacheTool {
                    tool_name: entry.tool_name.clone(),
                    description: entry.description.clone(),
                    input_schema: entry.input_schema.clone(),
                    tags: entry.tags.clone(),
                    blocking: entry.blocking,
                    cost_estimate: entry.cost_estimate.clone(),
                });
        }

        let cache = CacheFile {
            version: CACHE_VERSION.to_string(),
            last_sync: snapshot.last_sync.map(|t| t.to_rfc3339()),
            servers: by_server
                .into_iter()
                .map(|(server_id, tools)| CacheServer { server_id, tools })
                .collect(),
        };

        if let Some(parent) = self.cache_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::Cache(e.to_string()))?;
        }
        let text =
            serde_json::to_string_pretty(&cache).map_err(|e| AgentError::Cache(e.to_string()))?;
        tokio::fs::write(&self.cache_path, text)
            .await
            .map_err(|e| AgentError::Cache(e.to_string()))?;

        debug!(path = %self.cache_path.display(), "tool index cache saved");
        Ok(())
    }

    /// 缓存是否仍在有效期内
    ///
    /// 无 last_sync 或无工具视为无效；TTL 为 0 表示永久有效。
    pub async fn is_cache_valid(&self) -> bool {
        let snapshot = self.snapshot().await;
        let Some(last_sync) = snapshot.last_sync else {
            return false;
        };
        if snapshot.tools.is_empty() {
            return false;
        }
        if self.cache_ttl_seconds == 0 {
            return true;
        }

        let age = (Utc::now() - last_sync).num_seconds();
        age >= 0 && (age as u64) < self.cache_ttl_seconds
    }

    /// 是否需要从 server 重新同步：强制刷新、缓存文件缺失或缓存失效都触发
    pub async fn should_sync(&self, force_refresh: bool) -> bool {
        if force_refresh {
            info!("force refresh enabled, will sync");
            return true;
        }
        if !self.cache_path.exists() {
            info!("tool index cache file not found, will sync");
            return true;
        }
        if !self.is_cache_valid().await {
            info!("tool index cache invalid or expired, will sync");
            return true;
        }
        debug!("tool index cache valid, skip sync");
        false
    }

    /// 用拉到的目录构建新快照并整体替换
    ///
    /// 从当前快照出发逐工具覆盖，某个 server 本轮拉取失败时
    /// 它上次的条目得以保留。同名工具后同步的 server 覆盖先前的。
    pub async fn apply_catalogues(&self, catalogues: &[(String, Vec<ToolDescriptor>)]) {
        let current = self.snapshot().await;
        let mut tools = current.tools.clone();
        let mut synced = 0usize;

        for (server_id, descriptors) in catalogues {
            for descriptor in descriptors {
                let entry = ToolIndexEntry {
                    server_id: server_id.clone(),
                    tool_name: descriptor.name.clone(),
                    description: descriptor.description.clone(),
                    input_schema: descriptor.input_schema.clone(),
                    tags: self.derive_tags(&descriptor.description),
                    blocking: false,
                    cost_estimate: default_cost_estimate(),
                };
                if let Some(prev) = tools.get(&descriptor.name) {
                    if prev.server_id != *server_id {
                        warn!(
                            tool = %descriptor.name,
                            old_server = %prev.server_id,
                            new_server = %server_id,
                            "duplicate tool name, later sync wins"
                        );
                    }
                }
                tools.insert(descriptor.name.clone(), entry);
                synced += 1;
            }
        }

        info!(servers = catalogues.len(), tools = synced, "tool index synced");
        self.swap(IndexSnapshot {
            tools,
            last_sync: Some(Utc::now()),
            degraded: false,
        })
        .await;
    }

    /// 全量同步入口：拉目录、替换快照、落盘；拉不到任何目录时回退缓存
    ///
    /// 无 Ready 连接，或连接虽 Ready 但所有 tools/list 都失败，处理相同：
    /// 保留现有快照（含原 last_sync）并标记降级，不落盘，
    /// 避免把过期索引伪装成刚同步过的。
    pub async fn sync_from_pool(&self, pool: &ConnectionPool) {
        if pool.ready_count().await == 0 {
            self.fall_back_to_cache("no server reachable").await;
            return;
        }

        let catalogues = pool.catalogues().await;
        if catalogues.is_empty() {
            self.fall_back_to_cache("all tool catalogue fetches failed").await;
            return;
        }

        self.apply_catalogues(&catalogues).await;
        if let Err(e) = self.save_to_file().await {
            warn!(error = %e, "failed to save tool index cache");
        }
    }

    async fn fall_back_to_cache(&self, reason: &str) {
        let snapshot = self.snapshot().await;
        if snapshot.tools.is_empty() {
            warn!(reason, "sync failed and no cache, tool index is empty");
        } else {
            warn!(
                reason,
                tools = snapshot.tools.len(),
                "sync failed, falling back to stale cache"
            );
            self.swap(IndexSnapshot {
                tools: snapshot.tools.clone(),
                last_sync: snapshot.last_sync,
                degraded: true,
            })
            .await;
        }
    }

    /// 描述命中关键词即打上对应标签（大小写不敏感）
    fn derive_tags(&self, description: &str) -> Vec<String> {
        let desc = description.to_lowercase();
        self.tag_rules
            .iter()
            .filter(|rule| {
                rule.keywords
                    .iter()
                    .any(|kw| desc.contains(&kw.to_lowercase()))
            })
            .map(|rule| rule.tag.clone())
            .collect()
    }

    pub async fn all_tools(&self) -> Vec<ToolIndexEntry> {
        self.snapshot().await.tools.values().cloned().collect()
    }

    pub async fn tools_by_tag(&self, tag: &str) -> Vec<ToolIndexEntry> {
        self.snapshot()
            .await
            .tools
            .values()
            .filter(|e| e.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    pub async fn server_for_tool(&self, tool_name: &str) -> Option<String> {
        self.snapshot()
            .await
            .tools
            .get(tool_name)
            .map(|e| e.server_id.clone())
    }

    pub async fn entry(&self, tool_name: &str) -> Option<ToolIndexEntry> {
        self.snapshot().await.tools.get(tool_name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.tools.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot().await.tools.is_empty()
    }

    pub async fn is_degraded(&self) -> bool {
        self.snapshot().await.degraded
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.snapshot().await.last_sync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpSection;
    use serde_json::json;

    fn descriptor(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: json!({"type": "object"}),
        }
    }

    fn new_index(dir: &std::path::Path, ttl: u64) -> ToolIndex {
        ToolIndex::new(
            dir.join("mcp_tool_index.json"),
            ttl,
            McpSection::default().tag_rules,
        )
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path(), 3600);

        index
            .apply_catalogues(&[(
                "hass".to_string(),
                vec![descriptor("turn_on", "Turn on a light or switch")],
            )])
            .await;
        index.save_to_file().await.unwrap();

        let reloaded = new_index(dir.path(), 3600);
        reloaded.load_from_file().await;
        assert_eq!(reloaded.len().await, 1);
        let entry = reloaded.entry("turn_on").await.unwrap();
        assert_eq!(entry.server_id, "hass");
        assert_eq!(entry.cost_estimate, "medium");
        assert!(reloaded.is_cache_valid().await);
    }

    #[tokio::test]
    async fn test_cache_invalid_without_last_sync_or_tools() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path(), 3600);
        // 空快照，无 last_sync
        assert!(!index.is_cache_valid().await);

        // 有 last_sync 但无工具也无效
        index.apply_catalogues(&[]).await;
        assert!(!index.is_cache_valid().await);
    }

    #[tokio::test]
    async fn test_ttl_zero_means_forever() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path(), 0);
        index
            .apply_catalogues(&[("s".to_string(), vec![descriptor("t", "")])])
            .await;
        assert!(index.is_cache_valid().await);
    }

    #[tokio::test]
    async fn test_force_refresh_overrides_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path(), 3600);
        index
            .apply_catalogues(&[("s".to_string(), vec![descriptor("t", "")])])
            .await;
        index.save_to_file().await.unwrap();

        assert!(!index.should_sync(false).await);
        assert!(index.should_sync(true).await);
    }

    #[tokio::test]
    async fn test_stale_cache_fallback_marks_degraded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_tool_index.json");

        // TTL 的两倍之前同步的缓存，含 tool_a
        let stale = (Utc::now() - chrono::Duration::seconds(7200)).to_rfc3339();
        let cache = json!({
            "version": "1.0.0",
            "last_sync": stale,
            "servers": [{
                "server_id": "hass",
                "tools": [{ "tool_name": "tool_a", "description": "", "input_schema": {} }]
            }]
        });
        std::fs::write(&path, cache.to_string()).unwrap();

        let index = ToolIndex::new(path, 3600, Vec::new());
        index.load_from_file().await;
        assert!(!index.is_cache_valid().await);
        assert!(index.should_sync(false).await);

        // 没有任何 server 可达，回退过期缓存并标记降级
        let pool = ConnectionPool::new();
        index.sync_from_pool(&pool).await;
        assert!(index.is_degraded().await);
        assert!(index.entry("tool_a").await.is_some());
    }

    #[tokio::test]
    async fn test_all_catalogue_fetches_failing_keeps_stale_cache_degraded() {
        use crate::config::ServerConfig;
        use crate::mcp::connection::{ConnectionState, ServerConnection};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_tool_index.json");
        let stale = (Utc::now() - chrono::Duration::seconds(7200)).to_rfc3339();
        let cache = json!({
            "version": "1.0.0",
            "last_sync": stale,
            "servers": [{
                "server_id": "hass",
                "tools": [{ "tool_name": "tool_a", "description": "", "input_schema": {} }]
            }]
        });
        std::fs::write(&path, cache.to_string()).unwrap();

        let index = ToolIndex::new(path.clone(), 3600, Vec::new());
        index.load_from_file().await;
        let before = index.last_sync().await;
        let file_before = std::fs::read_to_string(&path).unwrap();

        // 连接是 Ready 的，但端点不可达，tools/list 全部失败
        let cfg: ServerConfig =
            serde_json::from_value(json!({ "id": "hass", "url": "http://127.0.0.1:9/mcp" }))
                .unwrap();
        let conn = ServerConnection::new(&cfg).unwrap();
        conn.force_state(ConnectionState::Ready).await;
        let pool = ConnectionPool::new();
        pool.insert(Arc::new(conn)).await;
        assert_eq!(pool.ready_count().await, 1);

        index.sync_from_pool(&pool).await;

        // 回退过期缓存：降级标记、last_sync 不被改写、缓存文件不被覆盖
        assert!(index.is_degraded().await);
        assert_eq!(index.last_sync().await, before);
        assert!(index.entry("tool_a").await.is_some());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), file_before);
    }

    #[tokio::test]
    async fn test_unknown_cache_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_tool_index.json");
        let cache = json!({
            "version": "2.0.0",
            "last_sync": Utc::now().to_rfc3339(),
            "servers": [{
                "server_id": "hass",
                "tools": [{ "tool_name": "tool_a", "description": "", "input_schema": {} }]
            }]
        });
        std::fs::write(&path, cache.to_string()).unwrap();

        let index = ToolIndex::new(path, 3600, Vec::new());
        index.load_from_file().await;
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path(), 3600);
        let catalogues = vec![(
            "hass".to_string(),
            vec![descriptor("turn_on", ""), descriptor("turn_off", "")],
        )];

        index.apply_catalogues(&catalogues).await;
        index.apply_catalogues(&catalogues).await;
        assert_eq!(index.len().await, 2);
    }

    #[tokio::test]
    async fn test_duplicate_tool_name_last_sync_wins() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path(), 3600);

        index
            .apply_catalogues(&[("a".to_string(), vec![descriptor("shared", "")])])
            .await;
        index
            .apply_catalogues(&[("b".to_string(), vec![descriptor("shared", "")])])
            .await;
        assert_eq!(index.server_for_tool("shared").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_tag_derivation_zh_and_en() {
        let dir = tempfile::tempdir().unwrap();
        let index = new_index(dir.path(), 3600);
        index
            .apply_catalogues(&[(
                "s".to_string(),
                vec![
                    descriptor("send_mail", "Send an Email to the owner"),
                    descriptor("snapshot", "读取摄像头画面"),
                    descriptor("noop", "does nothing interesting"),
                ],
            )])
            .await;

        assert_eq!(
            index.entry("send_mail").await.unwrap().tags,
            vec!["notification"]
        );
        assert_eq!(
            index.entry("snapshot").await.unwrap().tags,
            vec!["perception"]
        );
        assert!(index.entry("noop").await.unwrap().tags.is_empty());
        assert_eq!(index.tools_by_tag("perception").await.len(), 1);
    }
}
