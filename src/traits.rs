//! Tool extension trait and registry.
//!
//! Every operation a client can call is a [`Tool`]: the thirteen
//! built-in query tools and any compiled extension registered alongside
//! them. The HTTP server, the MCP bridge and `radq call` all dispatch
//! through the same [`ToolRegistry`] via [`crate::dispatch::invoke_tool`].
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 ToolRegistry                 │
//! │ ┌──────────┐ ┌──────────┐ ┌────────────────┐ │
//! │ │radiation │ │ tracks   │ │ stats/usage    │ │
//! │ │sensors   │ │ spectra  │ │ db_info        │ │
//! │ └──────────┘ └──────────┘ └────────────────┘ │
//! └──────────────────────┬───────────────────────┘
//!                        ▼
//!        invoke_tool() → REST / MCP / CLI
//! ```
//!
//! # Usage
//!
//! ```rust
//! use radquery::traits::ToolRegistry;
//!
//! let mut tools = ToolRegistry::with_builtins();
//! // tools.register(Box::new(MyTool));
//! assert_eq!(tools.len(), 13);
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use crate::analytics::AnalyticsEngine;
use crate::backend::{Backends, MeasurementSource, QueryContext};
use crate::config::Config;
use crate::error::QueryResult;
use crate::router::{RouteRequest, Source};

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A tool that agents can discover and call.
///
/// Tools are registered at startup and exposed via `GET /tools/list`,
/// the MCP `tools/list` method and `radq tools`.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use serde_json::{json, Value};
/// use radquery::traits::{Tool, ToolContext};
///
/// pub struct BackendCountTool;
///
/// #[async_trait]
/// impl Tool for BackendCountTool {
///     fn name(&self) -> &str { "backend_count" }
///     fn description(&self) -> &str { "Count live backends" }
///
///     fn parameters_schema(&self) -> Value {
///         json!({ "type": "object", "properties": {} })
///     }
///
///     async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
///         let a = ctx.backends().availability();
///         Ok(json!({ "count": a.database as i64 + a.api as i64 }))
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier, used as the route path (`POST /tools/{name}`).
    fn name(&self) -> &str;

    /// One-line description for agent discovery.
    fn description(&self) -> &str;

    /// Whether this is one of the built-in query tools.
    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema for the parameters (`type: "object"`).
    ///
    /// The dispatcher validates calls against it and injects defaults
    /// before [`execute`](Tool::execute) runs; REST query strings are
    /// coerced with it too.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool with validated parameters.
    ///
    /// Errors that are a [`crate::error::QueryError`] keep their code and
    /// HTTP status through the dispatcher; anything else becomes a
    /// `tool_error`.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Tool descriptor returned by `GET /tools/list` and `radq tools`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub parameters: Value,
}

impl ToolInfo {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            builtin: tool.is_builtin(),
            parameters: tool.parameters_schema(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Per-invocation view of the backends.
///
/// Created by the dispatcher for each call. The [`QueryContext`] carries
/// the call's deadline and captures the last statement for the session log.
pub struct ToolContext {
    backends: Backends,
    query: QueryContext,
}

impl ToolContext {
    pub fn new(backends: Backends, query: QueryContext) -> Self {
        Self { backends, query }
    }

    pub fn config(&self) -> &Config {
        &self.backends.config
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn query(&self) -> &QueryContext {
        &self.query
    }

    /// Route a request to a backend.
    pub fn select(
        &self,
        req: &RouteRequest<'_>,
    ) -> QueryResult<(Source, Arc<dyn MeasurementSource>)> {
        self.backends.select(req)
    }

    pub fn analytics(&self) -> QueryResult<&AnalyticsEngine> {
        self.backends.analytics()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Registry for built-in and custom tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Create a registry with every built-in query tool.
    pub fn with_builtins() -> Self {
        use crate::radiation::{QueryRadiationTool, SearchAreaTool};
        use crate::sensors::{ListSensorsTool, SensorCurrentTool, SensorHistoryTool};
        use crate::spectra::{GetSpectrumTool, ListSpectraTool};
        use crate::stats::{DbInfoTool, ExtremeReadingsTool, QueryUsageTool, RadiationStatsTool};
        use crate::tracks::{GetTrackTool, ListTracksTool};

        let mut registry = Self::new();
        registry.register(Box::new(QueryRadiationTool));
        registry.register(Box::new(SearchAreaTool));
        registry.register(Box::new(ListTracksTool));
        registry.register(Box::new(GetTrackTool));
        registry.register(Box::new(ListSensorsTool));
        registry.register(Box::new(SensorCurrentTool));
        registry.register(Box::new(SensorHistoryTool));
        registry.register(Box::new(ListSpectraTool));
        registry.register(Box::new(GetSpectrumTool));
        registry.register(Box::new(RadiationStatsTool));
        registry.register(Box::new(ExtremeReadingsTool));
        registry.register(Box::new(QueryUsageTool));
        registry.register(Box::new(DbInfoTool));
        registry
    }

    /// Register a tool. A later registration with the same name is
    /// shadowed by the earlier one in [`find`](Self::find).
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| ToolInfo::of(t.as_ref())).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_names_unique() {
        let registry = ToolRegistry::with_builtins();
        let names: HashSet<&str> = registry.tools().iter().map(|t| t.name()).collect();
        assert_eq!(names.len(), registry.len());
        assert!(registry.find("query_radiation").is_some());
        assert!(registry.find("db_info").is_some());
        assert!(registry.find("search").is_none());
    }

    #[test]
    fn test_builtin_schemas_are_objects() {
        for info in ToolRegistry::with_builtins().infos() {
            assert!(info.builtin, "{}", info.name);
            assert_eq!(info.parameters["type"], "object", "{}", info.name);
            assert!(info.parameters["properties"].is_object(), "{}", info.name);
        }
    }
}
