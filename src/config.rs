use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Primary PostGIS database. Without a URL the database is unavailable
/// and the router sends everything it can to the REST API.
#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_max_connections() -> u32 {
    8
}
fn default_connect_timeout_secs() -> u64 {
    5
}

/// SQLite analytics store: audit logs plus an attached measurement replica.
#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub attach_path: Option<PathBuf>,
    #[serde(default = "default_attach_schema")]
    pub attach_schema: String,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            path: None,
            attach_path: None,
            attach_schema: default_attach_schema(),
        }
    }
}

fn default_attach_schema() -> String {
    "radiation".to_string()
}

/// Upstream REST API.
#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_timeout_secs")]
    pub timeout_secs: u64,
    /// Cap on the covering radius used to approximate box searches.
    #[serde(default = "default_max_radius_m")]
    pub max_radius_m: f64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            enabled: true,
            timeout_secs: default_api_timeout_secs(),
            max_radius_m: default_max_radius_m(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.safecast.org".to_string()
}
fn default_true() -> bool {
    true
}
fn default_api_timeout_secs() -> u64 {
    20
}
fn default_max_radius_m() -> f64 {
    50_000.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Per-request deadline carried by every `QueryContext`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8088".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelemetryConfig {
    /// Optional HTTP collector that receives AI session logs as JSON.
    #[serde(default)]
    pub forward_url: Option<String>,
    #[serde(default = "default_telemetry_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "default_query_max_len")]
    pub query_max_len: usize,
    /// Build identifier recorded with every session log.
    #[serde(default)]
    pub commit_hash: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            forward_url: None,
            timeout_ms: default_telemetry_timeout_ms(),
            max_inflight: default_max_inflight(),
            query_max_len: default_query_max_len(),
            commit_hash: None,
        }
    }
}

fn default_telemetry_timeout_ms() -> u64 {
    2_000
}
fn default_max_inflight() -> usize {
    256
}
fn default_query_max_len() -> usize {
    500
}

impl Config {
    /// Defaults with the REST API enabled and no database or analytics store.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Apply `DATABASE_URL`, `ANALYTICS_DB_PATH`, `RADQ_API_URL` and
    /// `RADQ_API_ENABLED` from `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").filter(|s| !s.is_empty()) {
            self.db.url = Some(url);
        }
        if let Some(path) = lookup("ANALYTICS_DB_PATH").filter(|s| !s.is_empty()) {
            self.analytics.path = Some(PathBuf::from(path));
        }
        if let Some(url) = lookup("RADQ_API_URL").filter(|s| !s.is_empty()) {
            self.api.base_url = url;
        }
        if let Some(flag) = lookup("RADQ_API_ENABLED") {
            self.api.enabled = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => anyhow::bail!("RADQ_API_ENABLED must be a boolean, got '{}'", other),
            };
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            anyhow::bail!("db.max_connections must be > 0");
        }
        if self.api.timeout_secs == 0 {
            anyhow::bail!("api.timeout_secs must be > 0");
        }
        if !self.api.max_radius_m.is_finite() || self.api.max_radius_m <= 0.0 {
            anyhow::bail!("api.max_radius_m must be a positive number");
        }
        if self.server.request_timeout_secs == 0 {
            anyhow::bail!("server.request_timeout_secs must be > 0");
        }
        if self.telemetry.max_inflight == 0 {
            anyhow::bail!("telemetry.max_inflight must be > 0");
        }
        if self.telemetry.query_max_len < 8 {
            anyhow::bail!("telemetry.query_max_len must be >= 8");
        }
        let schema = &self.analytics.attach_schema;
        if schema.is_empty()
            || !schema.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            || schema.starts_with(|c: char| c.is_ascii_digit())
        {
            anyhow::bail!(
                "analytics.attach_schema must be a plain identifier, got '{}'",
                schema
            );
        }
        Ok(())
    }
}

/// Parse a TOML config string and validate it. Environment overrides are
/// not applied.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config = parse_config(&content)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
