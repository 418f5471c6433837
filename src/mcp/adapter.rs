//! Bridges server-side tools into the local [`Tool`] catalog.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::TychoError;
use crate::mcp::client::McpClient;
use crate::mcp::protocol::McpToolDef;
use crate::tools::{PermissionSet, Tool};

/// A remote tool exposed through a connected [`McpClient`].
///
/// Remote tools always carry the network permission on top of any local
/// effect they have, so permission modes that stop at read/write deny them.
#[derive(Debug)]
pub struct McpTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
    client: Arc<McpClient>,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, def: McpToolDef) -> Self {
        let description = def
            .description
            .unwrap_or_else(|| format!("tool '{}' on server '{}'", def.name, client.name()));
        Self {
            name: def.name,
            description,
            input_schema: def.input_schema,
            client,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> serde_json::Value {
        self.input_schema.clone()
    }

    fn permissions(&self) -> PermissionSet {
        PermissionSet::NETWORK
    }

    async fn execute(&self, input: serde_json::Value) -> Result<serde_json::Value, TychoError> {
        let result = self.client.call_tool(&self.name, input).await?;
        let flattened = result.flattened();
        if result.is_error {
            return Err(TychoError::ToolExecution {
                tool_name: self.name.clone(),
                message: flattened,
            });
        }
        Ok(serde_json::Value::String(flattened))
    }
}

/// Discover a connected server's catalog as local tools.
pub async fn discover_tools(client: Arc<McpClient>) -> Result<Vec<Arc<dyn Tool>>, TychoError> {
    let defs = client.list_tools().await?;
    Ok(defs
        .into_iter()
        .map(|def| Arc::new(McpTool::new(client.clone(), def)) as Arc<dyn Tool>)
        .collect())
}
