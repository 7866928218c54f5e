//! Single entry point for tool calls.
//!
//! REST, `POST /tools/{name}`, MCP and `radq call` all go through
//! [`invoke_tool`]: parameter validation, execution under the request
//! deadline, error classification and the telemetry record happen here
//! and nowhere else.

use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Instant;

use crate::backend::Backends;
use crate::error::QueryError;
use crate::params::validate_params;
use crate::telemetry::Invocation;
use crate::traits::{ToolContext, ToolRegistry};

/// Who is calling, for the audit and session logs.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub client_info: String,
    pub session_id: Option<String>,
}

impl Caller {
    pub fn new(client_info: impl Into<String>) -> Self {
        Self {
            client_info: client_info.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id.filter(|s| !s.trim().is_empty());
        self
    }
}

/// A failed tool call with its machine-readable code and HTTP status.
#[derive(Debug, Clone, Serialize)]
pub struct ToolFailure {
    #[serde(skip)]
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl ToolFailure {
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(404, "not_found", format!("no tool registered with name: {}", name))
    }

    /// Map an execution error to a failure. Typed query errors keep their
    /// own code and status; anything else is a 500 `tool_error`.
    pub fn classify(tool_name: &str, err: &anyhow::Error) -> Self {
        match err.downcast_ref::<QueryError>() {
            Some(q) => Self::new(q.http_status(), q.code(), q.to_string()),
            None => Self::new(500, "tool_error", format!("{}: {:#}", tool_name, err)),
        }
    }

    /// `{"error": {"code", "message"}}`
    pub fn body(&self) -> Value {
        json!({ "error": self })
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl std::error::Error for ToolFailure {}

fn result_count(result: &Value) -> i64 {
    result.get("count").and_then(|c| c.as_i64()).unwrap_or(0)
}

/// Validate, execute and record one tool call.
///
/// The telemetry record is dispatched before returning and never delays
/// or fails the call.
pub async fn invoke_tool(
    tools: &ToolRegistry,
    backends: &Backends,
    name: &str,
    params: Value,
    caller: &Caller,
) -> Result<Value, ToolFailure> {
    let tool = tools
        .find(name)
        .ok_or_else(|| ToolFailure::unknown_tool(name))?;

    let started = Instant::now();
    let query = backends.query_context();
    let outcome = match validate_params(&tool.parameters_schema(), &params) {
        Ok(validated) => {
            let ctx = ToolContext::new(backends.clone(), query.clone());
            tool.execute(validated, &ctx)
                .await
                .map_err(|e| ToolFailure::classify(name, &e))
        }
        Err(e) => Err(ToolFailure::new(e.http_status(), e.code(), e.to_string())),
    };
    let duration_ms = started.elapsed().as_millis() as i64;

    let count = outcome.as_ref().map(result_count).unwrap_or(0);
    match &outcome {
        Ok(_) => tracing::info!(tool = name, duration_ms, count, "tool call"),
        Err(f) if f.status >= 500 => {
            tracing::warn!(tool = name, duration_ms, code = %f.code, error = %f.message, "tool call failed")
        }
        Err(f) => tracing::debug!(tool = name, code = %f.code, error = %f.message, "tool call rejected"),
    }

    let statement = query
        .last_query()
        .unwrap_or_else(|| format!("{} {}", name, params));
    backends.telemetry.record(Invocation {
        tool_name: name.to_string(),
        params,
        result_count: count,
        duration_ms,
        client_info: caller.client_info.clone(),
        session_id: caller.session_id.clone(),
        query: statement,
        error: outcome.as_ref().err().map(|f| f.message.clone()),
    });

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TelemetryConfig};
    use crate::models::{AiSessionLog, QueryLogEntry};
    use crate::telemetry::{Telemetry, TelemetrySink};
    use crate::traits::Tool;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CaptureSink {
        queries: Mutex<Vec<QueryLogEntry>>,
        sessions: Mutex<Vec<AiSessionLog>>,
    }

    #[async_trait]
    impl TelemetrySink for CaptureSink {
        fn name(&self) -> &str {
            "capture"
        }
        async fn write_query_log(&self, entry: &QueryLogEntry) -> anyhow::Result<()> {
            self.queries.lock().unwrap().push(entry.clone());
            Ok(())
        }
        async fn write_session_log(&self, entry: &AiSessionLog) -> anyhow::Result<()> {
            self.sessions.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    struct PlainFailure;

    #[async_trait]
    impl Tool for PlainFailure {
        fn name(&self) -> &str {
            "plain_failure"
        }
        fn description(&self) -> &str {
            "fails without a typed error"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
            anyhow::bail!("something broke")
        }
    }

    fn backends_with(sink: Arc<CaptureSink>) -> Backends {
        let mut config = Config::minimal();
        config.api.enabled = false;
        Backends::empty(Arc::new(config))
            .with_telemetry(Telemetry::new(vec![sink], &TelemetryConfig::default()))
    }

    async fn settle() {
        // Telemetry tasks are spawned; give them a chance to run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_unknown_tool_is_404() {
        let tools = ToolRegistry::with_builtins();
        let backends = Backends::empty(Arc::new(Config::minimal()));
        let err = invoke_tool(&tools, &backends, "nope", json!({}), &Caller::new("test"))
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(err.body()["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_validation_error_is_400_and_logged() {
        let sink = Arc::new(CaptureSink::default());
        let backends = backends_with(sink.clone());
        let tools = ToolRegistry::with_builtins();
        let err = invoke_tool(
            &tools,
            &backends,
            "query_radiation",
            json!({"lat": 35.0}),
            &Caller::new("test"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, 400);
        assert_eq!(err.code, "bad_request");
        settle().await;
        assert_eq!(sink.queries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_db_only_tool_without_database_is_503() {
        let sink = Arc::new(CaptureSink::default());
        let backends = backends_with(sink.clone());
        let tools = ToolRegistry::with_builtins();
        let caller = Caller::new("test").with_session(Some("sess-1".into()));
        let err = invoke_tool(
            &tools,
            &backends,
            "get_spectrum",
            json!({"measurement_id": 7}),
            &caller,
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, 503);
        assert!(err.message.starts_with("database connection required"));

        settle().await;
        let sessions = sink.sessions.lock().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "sess-1");
        assert!(sessions[0].sanitized_query.starts_with("get_spectrum"));
        assert!(sessions[0].error.is_some());
    }

    #[tokio::test]
    async fn test_session_log_hides_string_params() {
        let sink = Arc::new(CaptureSink::default());
        let backends = backends_with(sink.clone());
        let tools = ToolRegistry::with_builtins();
        let caller = Caller::new("test").with_session(Some("sess-2".into()));
        let _ = invoke_tool(
            &tools,
            &backends,
            "list_tracks",
            json!({"uploader": "alice@example.org", "year": 2020}),
            &caller,
        )
        .await;

        settle().await;
        let sessions = sink.sessions.lock().unwrap();
        assert_eq!(sessions.len(), 1);
        let logged = &sessions[0].sanitized_query;
        assert!(logged.starts_with("list_tracks"));
        assert!(logged.contains(r#""uploader":"?""#));
        assert!(!logged.contains("alice"));
    }

    #[tokio::test]
    async fn test_untyped_error_is_tool_error() {
        let mut tools = ToolRegistry::new();
        tools.register(Box::new(PlainFailure));
        let backends = Backends::empty(Arc::new(Config::minimal()));
        let err = invoke_tool(&tools, &backends, "plain_failure", json!({}), &Caller::new("t"))
            .await
            .unwrap_err();
        assert_eq!(err.status, 500);
        assert_eq!(err.code, "tool_error");
        assert!(err.message.contains("something broke"));
    }

    #[tokio::test]
    async fn test_db_info_needs_no_backend() {
        let backends = Backends::empty(Arc::new(Config::minimal()));
        let tools = ToolRegistry::with_builtins();
        let v = invoke_tool(&tools, &backends, "db_info", json!({}), &Caller::new("t"))
            .await
            .unwrap();
        assert_eq!(v["count"], 3);
        assert_eq!(v["backends"][0]["name"], "database");
    }

    #[test]
    fn test_blank_session_ignored() {
        assert!(Caller::new("x").with_session(Some(" ".into())).session_id.is_none());
    }
}
