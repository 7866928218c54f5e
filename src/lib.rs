//! # radquery
//!
//! A dual-source query gateway over a radiation-measurement dataset.
//!
//! Each tool call is routed either to a PostGIS database or to the upstream
//! REST API, and results from both come back in one canonical shape with a
//! `source` field saying which one answered.
//!
//! ## Architecture
//!
//! ```text
//!  REST /api/*   POST /tools/{name}   MCP /mcp   radq call
//!        └──────────────┬─────────────────┘          │
//!                       ▼                            │
//!                 invoke_tool() ◀────────────────────┘
//!                       │ validate → execute → telemetry (spawned)
//!                       ▼
//!                 SourceRouter ── capability + recency rules
//!                  │         │
//!                  ▼         ▼
//!            PgStore        ApiStore ── client-side box/window filters
//!          (SelectBuilder)  (ApiClient)
//!                  └────┬────┘
//!                       ▼
//!                 ResultNormalizer ── Measurement / Track / Sensor / Spectrum
//!
//!  AnalyticsEngine (SQLite + attached replica): stats, extremes, audit logs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`error`] | Query error taxonomy with codes and HTTP statuses |
//! | [`geo`] | Points, boxes, haversine |
//! | [`filters`] | Validated query inputs (`Limit`, `TimeWindow`, queries) |
//! | [`router`] | Backend selection |
//! | [`sql`] | Parameterized statement builder |
//! | [`normalize`] | Raw rows and JSON to canonical models |
//! | [`models`] | Canonical models and result envelopes |
//! | [`db`] | PostgreSQL pool and row decoding |
//! | [`pg_store`] | Database backend |
//! | [`api`] | Upstream REST client |
//! | [`api_store`] | REST backend |
//! | [`backend`] | Backend trait, deadlines and shared handles |
//! | [`analytics`] | SQLite analytics store |
//! | [`telemetry`] | Fire-and-forget audit and session logging |
//! | [`params`] | Schema validation and query-string coercion |
//! | [`traits`] | Tool trait and registry |
//! | [`dispatch`] | The single tool-call path |
//! | [`server`] | REST, `/tools` and MCP over HTTP |
//! | [`mcp`] | MCP bridge |
//! | [`migrate`] | Analytics schema |

pub mod analytics;
pub mod api;
pub mod api_store;
pub mod backend;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod filters;
pub mod geo;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod params;
pub mod pg_store;
pub mod radiation;
pub mod router;
pub mod sensors;
pub mod server;
pub mod spectra;
pub mod sql;
pub mod stats;
pub mod telemetry;
pub mod tracks;
pub mod traits;
