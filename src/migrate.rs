use anyhow::Result;
use sqlx::SqlitePool;

use crate::analytics::AnalyticsEngine;
use crate::config::Config;

/// `radq init`: create the analytics store and its tables.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let engine = AnalyticsEngine::open(&config.analytics).await?;
    engine.pool().close().await;
    Ok(())
}

/// Create the audit tables. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS query_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tool_name TEXT NOT NULL,
            params_json TEXT NOT NULL DEFAULT '{}',
            result_count INTEGER NOT NULL DEFAULT 0,
            duration_ms INTEGER NOT NULL DEFAULT 0,
            client_info TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ai_session_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            query TEXT NOT NULL DEFAULT '',
            duration_ms INTEGER NOT NULL DEFAULT 0,
            commit_hash TEXT NOT NULL DEFAULT '',
            error TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_query_logs_created_at ON query_logs(created_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_query_logs_tool ON query_logs(tool_name)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ai_session_logs_session ON ai_session_logs(session_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
