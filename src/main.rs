//! Nest - 统一任务队列 + MCP 工具控制平面
//!
//! 入口：初始化日志与配置，建立 MCP 控制平面，启动任务循环，
//! Ctrl-C 时按顺序停循环、断连接。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nest::config::load_config;
use nest::llm::OpenAiClient;
use nest::mcp::McpControl;
use nest::mcp::McpRouter;
use nest::task::{GoalExecutor, PlanExecutor, Scheduler, TaskKind, TaskLoop, TaskQueue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).context("Failed to load config")?;

    // API key 从环境变量 OPENAI_API_KEY 读取
    let llm = Arc::new(
        OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            None,
            Duration::from_secs(cfg.llm.request_timeout_secs),
        )
        .context("Failed to create LLM client")?,
    );

    // MCP 控制平面：建连、同步工具索引、启动健康扫描
    let control = Arc::new(McpControl::initialize(&cfg.mcp, llm.clone()).await);

    // 任务编排：队列 + 两类执行器 + 调度器 + 消费循环
    let queue = Arc::new(TaskQueue::new());
    let router = Arc::new(McpRouter::new(llm.clone(), control.index()));
    let pool = control.pool();

    let mut scheduler = Scheduler::new(cfg.task.max_concurrent_tasks, queue.clone());
    scheduler.register(
        TaskKind::ToolCall,
        Arc::new(PlanExecutor::new(
            router.clone(),
            pool.clone(),
            llm.clone(),
            control.index(),
            queue.clone(),
            cfg.task.clone(),
        )),
    );
    scheduler.register(
        TaskKind::Generic,
        Arc::new(GoalExecutor::new(
            router,
            pool,
            queue.clone(),
            cfg.task.clone(),
        )),
    );

    let task_loop = TaskLoop::new(queue.clone(), Arc::new(scheduler), &cfg.task);
    let cancel = CancellationToken::new();
    let loop_cancel = cancel.clone();
    let loop_handle = tokio::spawn(async move { task_loop.run(loop_cancel).await });

    info!("nest is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("shutting down");
    cancel.cancel();
    let _ = loop_handle.await;
    control.close().await;

    Ok(())
}
