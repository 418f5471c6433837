//! External tool protocol client (JSON-RPC 2.0 over stdio or HTTP).

pub mod adapter;
pub mod client;
pub mod protocol;
pub mod transport;

pub use adapter::{discover_tools, McpTool};
pub use client::McpClient;
pub use protocol::{InitializeResult, McpContent, McpToolDef, ToolCallResult};
pub use transport::{HttpTransport, McpTransport, StdioTransport};
