//! MCP 控制平面：连接、能力索引、路由决策与门面

pub mod connection;
pub mod control;
pub mod index;
pub mod pool;
pub mod router;

pub use connection::{ConnectionState, ServerConnection, ToolDescriptor, ToolOutcome};
pub use control::McpControl;
pub use index::{ToolIndex, ToolIndexEntry};
pub use pool::ConnectionPool;
pub use router::{HistoryEntry, McpRouter, RouterContext, RouterDecision};
