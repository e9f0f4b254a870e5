//! Nest - 统一任务队列 + MCP 工具控制平面
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 公共错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **mcp**: MCP 控制平面（连接池、工具索引、路由决策、门面）
//! - **task**: 任务编排（统一任务模型、FIFO 队列、执行器、调度器、触发器）

pub mod config;
pub mod core;
pub mod llm;
pub mod mcp;
pub mod task;
