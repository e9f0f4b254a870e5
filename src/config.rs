//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `NEST__*` 覆盖（双下划线表示嵌套，
//! 如 `NEST__TASK__MAX_CONCURRENT_TASKS=8`）。

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub mcp: McpSection,
    #[serde(default)]
    pub task: TaskSection,
    #[serde(default)]
    pub llm: LlmSection,
}

/// 单个 MCP Server 的注册信息
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 唯一 server_id
    pub id: String,
    /// HTTP(S) 端点
    pub url: String,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_call_timeout_secs")]
    pub timeout: u64,
    /// 自定义请求头（如 Bearer 凭证）
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_call_timeout_secs() -> u64 {
    60
}

/// 标签推导规则：描述中命中任一关键词即打上 tag
#[derive(Debug, Clone, Deserialize)]
pub struct TagRule {
    pub tag: String,
    pub keywords: Vec<String>,
}

/// [mcp] 段：Server 注册表、缓存策略、标签关键词表
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSection {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    /// 工具索引缓存有效期（秒），0 表示永久有效
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_seconds: u64,
    /// 启动时是否强制重新同步（忽略缓存）
    #[serde(default)]
    pub force_refresh_on_init: bool,
    /// 索引缓存文件路径，未设置时用 ./mcp_tool_index.json
    pub cache_path: Option<PathBuf>,
    /// 后台健康检查间隔（秒），0 表示关闭
    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,
    /// 标签推导关键词表，可在配置中扩展而无需改代码
    #[serde(default = "default_tag_rules")]
    pub tag_rules: Vec<TagRule>,
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_tag_rules() -> Vec<TagRule> {
    let rule = |tag: &str, keywords: &[&str]| TagRule {
        tag: tag.to_string(),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
    };
    vec![
        rule("notification", &["email", "邮件", "notify", "通知"]),
        rule("emergency", &["emergency", "紧急", "alarm", "报警"]),
        rule("navigation", &["navigate", "导航", "route", "路径"]),
        rule("perception", &["camera", "摄像头", "拍照", "sensor", "传感器"]),
    ]
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            cache_ttl_seconds: default_cache_ttl_secs(),
            force_refresh_on_init: false,
            cache_path: None,
            health_check_interval_secs: default_health_interval_secs(),
            tag_rules: default_tag_rules(),
        }
    }
}

/// [task] 段：并发上限、循环间隔、重试与计划限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TaskSection {
    /// 同时运行的任务数上限（Scheduler 准入门槛）
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// TaskLoop 安全网唤醒间隔（秒）；正常情况下由入队信号唤醒
    #[serde(default = "default_loop_interval_secs")]
    pub loop_interval_secs: u64,
    /// 终态任务清理间隔（秒）
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// 单个任务的执行超时（秒）
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// 单任务最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 计划最大步骤数
    #[serde(default = "default_max_plan_steps")]
    pub max_plan_steps: usize,
    /// 计划最大修订次数
    #[serde(default = "default_max_plan_revisions")]
    pub max_plan_revisions: u32,
    /// 目标驱动模式的最大步数
    #[serde(default = "default_max_goal_steps")]
    pub max_goal_steps: usize,
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_loop_interval_secs() -> u64 {
    1
}

fn default_cleanup_interval_secs() -> u64 {
    10
}

fn default_task_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_plan_steps() -> usize {
    20
}

fn default_max_plan_revisions() -> u32 {
    3
}

fn default_max_goal_steps() -> usize {
    10
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            loop_interval_secs: default_loop_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            max_retries: default_max_retries(),
            max_plan_steps: default_max_plan_steps(),
            max_plan_revisions: default_max_plan_revisions(),
            max_goal_steps: default_max_goal_steps(),
        }
    }
}

/// [llm] 段：决策后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mcp: McpSection::default(),
            task: TaskSection::default(),
            llm: LlmSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 NEST__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 NEST__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("NEST")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.mcp.cache_ttl_seconds, 3600);
        assert!(!cfg.mcp.force_refresh_on_init);
        assert_eq!(cfg.task.max_concurrent_tasks, 5);
        assert_eq!(cfg.task.max_retries, 2);
        // 四个内置标签类别
        let tags: Vec<_> = cfg.mcp.tag_rules.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(
            tags,
            vec!["notification", "emergency", "navigation", "perception"]
        );
    }

    #[test]
    fn test_server_config_defaults() {
        let s: ServerConfig =
            serde_json::from_str(r#"{"id": "hass", "url": "http://127.0.0.1:8123/mcp"}"#).unwrap();
        assert_eq!(s.timeout, 60);
        assert!(s.headers.is_empty());
    }
}
