//! LLM 抽象层：统一接口 + OpenAI 兼容实现 + Mock

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::MockLlmClient;
pub use openai::OpenAiClient;
pub use traits::{LlmClient, Message, Role, ToolDef, ToolSelection};
