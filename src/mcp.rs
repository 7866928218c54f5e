//! MCP JSON-RPC protocol bridge.
//!
//! Exposes the [`ToolRegistry`] as MCP tools over the Streamable HTTP
//! transport. Calls go through [`invoke_tool`], the same dispatcher as the
//! REST surface, so validation, routing and audit logging are identical.
//!
//! Each MCP session gets its own [`McpBridge`] with a fresh v4 UUID, which
//! becomes the `session_id` of its AI session log records.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use rmcp::{ErrorData as McpError, ServerHandler};

use crate::backend::Backends;
use crate::dispatch::{invoke_tool, Caller};
use crate::traits::ToolRegistry;

#[derive(Clone)]
pub struct McpBridge {
    tools: Arc<ToolRegistry>,
    backends: Backends,
    session_id: String,
}

impl McpBridge {
    pub fn new(tools: Arc<ToolRegistry>, backends: Backends) -> Self {
        Self {
            tools,
            backends,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn to_mcp_tool(tool: &dyn crate::traits::Tool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> =
            match tool.parameters_schema() {
                serde_json::Value::Object(map) => Arc::new(map),
                _ => Arc::new(serde_json::Map::new()),
            };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

/// Streamable HTTP service for mounting under `/mcp`.
pub fn mcp_service(
    tools: Arc<ToolRegistry>,
    backends: Backends,
) -> StreamableHttpService<McpBridge, LocalSessionManager> {
    StreamableHttpService::new(
        move || Ok(McpBridge::new(tools.clone(), backends.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    )
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "radquery".to_string(),
                title: Some("radquery".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Radiation measurement queries. Use query_radiation or search_area for \
                 readings near a place, list_tracks and get_track for drives, \
                 list_sensors and sensor_current for fixed stations, and db_info to see \
                 which backends are up. Every result carries a source field."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if self.tools.find(&request.name).is_none() {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            ));
        }

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        let caller = Caller::new("mcp").with_session(Some(self.session_id.clone()));
        match invoke_tool(&self.tools, &self.backends, &request.name, params, &caller).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(failure) => Ok(CallToolResult::error(vec![Content::text(
                failure.body().to_string(),
            )])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_sessions_get_distinct_ids() {
        let tools = Arc::new(ToolRegistry::with_builtins());
        let backends = Backends::empty(Arc::new(Config::minimal()));
        let a = McpBridge::new(tools.clone(), backends.clone());
        let b = McpBridge::new(tools, backends);
        assert_ne!(a.session_id(), b.session_id());
        assert_eq!(a.session_id().len(), 36);
    }

    #[test]
    fn test_tool_descriptors_are_read_only() {
        let registry = ToolRegistry::with_builtins();
        let tool = registry.find("search_area").unwrap();
        let t = McpBridge::to_mcp_tool(tool);
        assert_eq!(t.name, "search_area");
        assert!(t.input_schema.contains_key("properties"));
        assert_eq!(t.annotations.and_then(|a| a.read_only_hint), Some(true));
    }
}
