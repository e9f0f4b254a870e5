//! 路由决策引擎
//!
//! 纯决策函数：给定上下文（目标、步骤、历史、环境）与工具索引快照，
//! 通过 LLM function calling 选出至多一个工具。本模块不调用工具、
//! 不修改任务状态，失败也不抛错误，全部折叠进 RouterDecision 的置信度。
//!
//! 置信度约定：0.8 表示 LLM 选中了索引内的工具；0.3 表示 LLM 认为
//! 无需动作（文本回复）；0.0 表示决策失败（后端错误、索引为空、
//! 选中的工具不在索引内）。

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::llm::{LlmClient, Message, ToolDef, ToolSelection};
use crate::mcp::index::ToolIndex;

const ROUTER_SYSTEM_PROMPT: &str = r#"You are a routing engine that selects the most appropriate tool for a given task.

Your task is to analyze the task goal and environment, then call exactly ONE tool from the available tool list.

Rules:
- ALWAYS use the function calling mechanism to invoke a tool.
- Only select tools from the provided tool list.
- Do NOT invent tools or arguments.
- If no suitable tool is available or the task is already complete, explain why in a text response instead of calling a tool.

**Parameter Mapping**:
- When calling a tool, you MUST map parameters from the Environment section to the tool's input schema.
- The Environment contains all available data for this task (e.g., "to", "content", "subject", etc.).
- Use these values directly as tool arguments. Do NOT ignore or omit them.

**Home Automation Device Mapping** (for Home Assistant tools):
- The Environment may contain a list of available devices with their entity_ids, friendly names, areas, and current states.
- You MUST map user-friendly device names (e.g., "客厅主灯") to actual entity_ids (e.g., "light.living_room_main").
- When multiple devices match, prefer area/location match, then friendly name similarity, then current state.
- Always use entity_id as the parameter value, not friendly names.
- For cover devices (curtains, blinds, shades): position value ranges from 0-100, where 100 means fully open and 0 means fully closed.

**Important**:
- Use the function calling feature to invoke the selected tool.
- Do not output JSON text manually - let the tool calling mechanism handle it."#;

/// 路由上下文
#[derive(Debug, Clone, Default)]
pub struct RouterContext {
    pub goal: String,
    pub current_step: Option<u32>,
    pub history: Vec<HistoryEntry>,
    /// 任务可用的环境数据（参数来源、设备清单等）
    pub environment: Value,
}

/// 历史动作摘要（提示词里只带最近 3 条）
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub tool: String,
    pub success: bool,
}

/// 路由决策结果
#[derive(Debug, Clone)]
pub struct RouterDecision {
    pub server_id: Option<String>,
    pub tool: Option<String>,
    pub arguments: Value,
    pub confidence: f32,
    pub reasoning: String,
}

impl RouterDecision {
    fn no_action(confidence: f32, reasoning: impl Into<String>) -> Self {
        Self {
            server_id: None,
            tool: None,
            arguments: json!({}),
            confidence,
            reasoning: reasoning.into(),
        }
    }

    /// 是否是可执行的工具决策
    pub fn is_actionable(&self) -> bool {
        self.tool.is_some() && self.server_id.is_some()
    }
}

/// 路由器：只依赖 LlmClient 与工具索引
pub struct McpRouter {
    llm: Arc<dyn LlmClient>,
    tool_index: Arc<ToolIndex>,
}

impl McpRouter {
    pub fn new(llm: Arc<dyn LlmClient>, tool_index: Arc<ToolIndex>) -> Self {
        Self { llm, tool_index }
    }

    /// 执行一次路由决策
    pub async fn route(&self, context: &RouterContext) -> RouterDecision {
        debug!(goal = %context.goal, "routing");

        let all_tools = self.tool_index.all_tools().await;
        if all_tools.is_empty() {
            warn!("no tools available in index");
            return RouterDecision::no_action(0.0, "No tools available");
        }

        let tool_defs: Vec<ToolDef> = all_tools
            .iter()
            .map(|t| ToolDef {
                name: t.tool_name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            })
            .collect();

        let messages = vec![
            Message::system(ROUTER_SYSTEM_PROMPT),
            Message::user(self.build_context_prompt(context)),
        ];

        let selection = match self.llm.select_tool(&messages, &tool_defs).await {
            Ok(selection) => selection,
            Err(e) => {
                warn!(error = %e, "routing failed");
                return RouterDecision::no_action(0.0, format!("Routing error: {}", e));
            }
        };

        match selection {
            ToolSelection::Text(text) => {
                let reasoning = if text.is_empty() {
                    "LLM did not select any tool".to_string()
                } else {
                    text
                };
                debug!(reasoning = %reasoning, "no tool selected");
                RouterDecision::no_action(0.3, reasoning)
            }
            ToolSelection::Call { name, arguments } => {
                let Some(server_id) = self.tool_index.server_for_tool(&name).await else {
                    warn!(tool = %name, "selected tool not in index");
                    return RouterDecision::no_action(0.0, format!("Tool {} not in index", name));
                };

                let arguments = Self::post_process_arguments(arguments, &context.environment);
                info!(tool = %name, server_id = %server_id, "routing decision");
                RouterDecision {
                    reasoning: format!("Selected {} from {}", name, server_id),
                    server_id: Some(server_id),
                    tool: Some(name),
                    arguments,
                    confidence: 0.8,
                }
            }
        }
    }

    fn build_context_prompt(&self, context: &RouterContext) -> String {
        let mut parts = vec![format!("Task goal: {}", context.goal)];

        if let Some(step) = context.current_step {
            parts.push(format!("Current step: {}", step));
        }

        if !context.history.is_empty() {
            let mut s = String::from("Previous actions:\n");
            let skip = context.history.len().saturating_sub(3);
            for entry in &context.history[skip..] {
                s.push_str(&format!("- {}: {}\n", entry.tool, entry.success));
            }
            parts.push(s);
        }

        if let Value::Object(env) = &context.environment {
            if !env.is_empty() {
                let mut s = String::from("Environment (available data for tool parameters):\n");
                for (key, value) in env {
                    match value {
                        Value::String(v) => s.push_str(&format!("  - {}: \"{}\"\n", key, v)),
                        other => s.push_str(&format!("  - {}: {}\n", key, other)),
                    }
                }
                parts.push(s);
            }
        }

        parts.join("\n")
    }

    /// 决策后处理：设备友好名映射为 entity_id，cover 位置钳到 0-100
    ///
    /// LLM 偶尔会把友好名原样塞进 entity_id，这里按环境里的设备清单
    /// 做一次确定性兜底修正。
    fn post_process_arguments(mut arguments: Value, environment: &Value) -> Value {
        let Value::Object(ref mut map) = arguments else {
            return arguments;
        };

        if let Some(devices) = environment.get("devices").and_then(Value::as_array) {
            Self::map_friendly_entity_id(map, devices);
        }

        if let Some(position) = map.get("position").and_then(Value::as_i64) {
            let clamped = position.clamp(0, 100);
            if clamped != position {
                warn!(position, clamped, "cover position out of range, clamped");
                map.insert("position".to_string(), json!(clamped));
            }
        }

        arguments
    }

    fn map_friendly_entity_id(map: &mut Map<String, Value>, devices: &[Value]) {
        let Some(requested) = map.get("entity_id").and_then(Value::as_str) else {
            return;
        };

        // 已经是清单里的 entity_id 就不动
        if devices
            .iter()
            .any(|d| d.get("entity_id").and_then(Value::as_str) == Some(requested))
        {
            return;
        }

        let resolved = devices.iter().find_map(|d| {
            let friendly = d.get("friendly_name").and_then(Value::as_str)?;
            if friendly == requested {
                d.get("entity_id").and_then(Value::as_str)
            } else {
                None
            }
        });

        if let Some(entity_id) = resolved {
            debug!(friendly = requested, entity_id, "mapped friendly name to entity_id");
            map.insert("entity_id".to_string(), json!(entity_id));
        }
    }
}
