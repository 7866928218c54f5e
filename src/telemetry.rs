//! Fire-and-forget invocation logging.
//!
//! [`Telemetry::record`] spawns one task per invocation and returns at
//! once. The task writes a [`QueryLogEntry`] to every sink and, when the
//! caller has a session identity, an [`AiSessionLog`] as well. Sink
//! failures and timeouts are logged with `tracing::warn!` and dropped.
//! In-flight tasks are bounded by a semaphore; once the bound is reached
//! new records are dropped instead of queued.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::TelemetryConfig;
use crate::models::{AiSessionLog, QueryLogEntry};

/// Destination for invocation records.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &str;

    async fn write_query_log(&self, entry: &QueryLogEntry) -> Result<()>;

    async fn write_session_log(&self, entry: &AiSessionLog) -> Result<()>;
}

/// Everything the dispatcher knows about one finished invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool_name: String,
    pub params: Value,
    pub result_count: i64,
    pub duration_ms: i64,
    pub client_info: String,
    pub session_id: Option<String>,
    /// Last statement executed, or the tool call itself for API-routed calls.
    pub query: String,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct Telemetry {
    sinks: Arc<Vec<Arc<dyn TelemetrySink>>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    timeout: Duration,
    query_max_len: usize,
    commit_hash: String,
}

impl Telemetry {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>, config: &TelemetryConfig) -> Self {
        Self {
            sinks: Arc::new(sinks),
            permits: Arc::new(Semaphore::new(config.max_inflight)),
            capacity: config.max_inflight,
            timeout: Duration::from_millis(config.timeout_ms),
            query_max_len: config.query_max_len,
            commit_hash: config
                .commit_hash
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    /// Telemetry with no sinks; `record` is a no-op.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), &TelemetryConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        !self.sinks.is_empty()
    }

    /// Dispatch one record. Returns the task handle, or `None` when there
    /// are no sinks or the in-flight bound is reached.
    pub fn record(&self, inv: Invocation) -> Option<JoinHandle<()>> {
        if self.sinks.is_empty() {
            return None;
        }
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(tool = %inv.tool_name, "telemetry backlog full, record dropped");
                return None;
            }
        };

        let now = Utc::now();
        let entry = QueryLogEntry {
            tool_name: inv.tool_name.clone(),
            params: inv.params,
            result_count: inv.result_count,
            duration_ms: inv.duration_ms,
            client_info: inv.client_info,
            created_at: now,
        };
        let session = inv.session_id.map(|session_id| AiSessionLog {
            session_id,
            tool_name: inv.tool_name,
            sanitized_query: sanitize_query(&inv.query, self.query_max_len),
            duration_ms: inv.duration_ms,
            commit_hash: self.commit_hash.clone(),
            error: inv.error,
            created_at: now,
        });

        let sinks = self.sinks.clone();
        let timeout = self.timeout;
        Some(tokio::spawn(async move {
            let _permit = permit;
            for sink in sinks.iter() {
                report(
                    sink.name(),
                    "query_log",
                    tokio::time::timeout(timeout, sink.write_query_log(&entry)).await,
                );
                if let Some(s) = &session {
                    report(
                        sink.name(),
                        "session_log",
                        tokio::time::timeout(timeout, sink.write_session_log(s)).await,
                    );
                }
            }
        }))
    }

    /// Wait up to `wait` for in-flight records to finish. Used by one-shot
    /// CLI commands before the runtime shuts down.
    pub async fn drain(&self, wait: Duration) {
        let all = u32::try_from(self.capacity).unwrap_or(u32::MAX);
        match tokio::time::timeout(wait, self.permits.acquire_many(all)).await {
            Ok(Ok(_permits)) => {}
            _ => tracing::warn!("telemetry still in flight at shutdown"),
        }
    }
}

fn report(sink: &str, kind: &str, outcome: Result<Result<()>, tokio::time::error::Elapsed>) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(sink, kind, error = %e, "telemetry write failed"),
        Err(_) => tracing::warn!(sink, kind, "telemetry write timed out"),
    }
}

/// Collapse whitespace, mask literals, and cut to `max_len` characters.
///
/// Single-quoted SQL literals become `'?'`. Double-quoted strings become
/// `"?"` unless they are JSON object keys, so the tool-call form
/// `list_tracks {"uploader":"alice"}` keeps its parameter names only.
pub fn sanitize_query(query: &str, max_len: usize) -> String {
    let mut masked = String::with_capacity(query.len());
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                // '' is an escaped quote.
                loop {
                    match chars.next() {
                        Some('\'') if chars.peek() == Some(&'\'') => {
                            chars.next();
                        }
                        Some('\'') | None => break,
                        Some(_) => {}
                    }
                }
                masked.push_str("'?'");
            }
            '"' => {
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => {
                            literal.push('\\');
                            if let Some(escaped) = chars.next() {
                                literal.push(escaped);
                            }
                        }
                        Some('"') | None => break,
                        Some(other) => literal.push(other),
                    }
                }
                let is_key = chars.clone().find(|c| !c.is_whitespace()) == Some(':');
                if is_key {
                    masked.push('"');
                    masked.push_str(&literal);
                    masked.push('"');
                } else {
                    masked.push_str("\"?\"");
                }
            }
            _ => masked.push(c),
        }
    }

    let collapsed = masked.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_len).collect()
}

/// Forwards session logs to an HTTP collector as JSON.
pub struct HttpLogSink {
    client: reqwest::Client,
    url: String,
}

impl HttpLogSink {
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build telemetry HTTP client")?;
        Ok(Self { client, url })
    }

    async fn post(&self, body: Value) -> Result<()> {
        let resp = self.client.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("collector returned HTTP {}", resp.status());
        }
        Ok(())
    }
}

#[async_trait]
impl TelemetrySink for HttpLogSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn write_query_log(&self, _entry: &QueryLogEntry) -> Result<()> {
        // The audit trail stays local; only session logs are forwarded.
        Ok(())
    }

    async fn write_session_log(&self, entry: &AiSessionLog) -> Result<()> {
        self.post(json!({ "kind": "ai_session_log", "record": entry })).await
    }
}
