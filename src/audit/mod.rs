//! Request journaling
//!
//! Every handled request above the latency threshold gets one append-only
//! row in `api_requests`. Writes happen off the response path; a failed
//! insert is logged and dropped, never surfaced to the caller.

use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::warn;

/// Requests faster than this are logged but not journaled
pub const AUDIT_THRESHOLD: Duration = Duration::from_millis(100);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS api_requests (
    request_id      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    route_name      TEXT NOT NULL,
    processing_time REAL NOT NULL,
    username        TEXT NOT NULL,
    user_id         TEXT,
    args            TEXT,
    path_args       TEXT,
    body            TEXT,
    failed          INTEGER NOT NULL DEFAULT 0,
    error           TEXT,
    ip              TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    pub route_name: String,
    pub processing_time: f64,
    pub username: String,
    pub user_id: Option<String>,
    /// Query args as JSON, with `user_id` already removed
    pub args: Option<String>,
    pub path_args: Option<String>,
    pub body: Option<String>,
    pub failed: bool,
    pub error: Option<String>,
    pub ip: String,
}

/// Append-only journal over the audit database
#[derive(Debug, Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("creating api_requests table")?;
        Ok(Self { pool })
    }

    /// Queue a row without blocking the caller
    pub fn record(&self, record: RequestRecord) {
        let journal = self.clone();
        tokio::spawn(async move {
            if let Err(e) = journal.insert(&record).await {
                warn!("audit insert failed for {}: {e:#}", record.request_id);
            }
        });
    }

    pub async fn insert(&self, record: &RequestRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_requests \
             (request_id, created_at, route_name, processing_time, username, \
              user_id, args, path_args, body, failed, error, ip) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.request_id)
        .bind(record.created_at.to_rfc3339())
        .bind(&record.route_name)
        .bind(record.processing_time)
        .bind(&record.username)
        .bind(&record.user_id)
        .bind(&record.args)
        .bind(&record.path_args)
        .bind(&record.body)
        .bind(record.failed)
        .bind(&record.error)
        .bind(&record.ip)
        .execute(&self.pool)
        .await
        .context("inserting audit row")?;
        Ok(())
    }
}

/// Caller address as the access proxy saw it
pub fn client_ip(headers: &HeaderMap) -> String {
    for name in ["Cf-Connecting-Ip", "X-Forwarded-For"] {
        if let Some(ip) = headers.get(name).and_then(|v| v.to_str().ok()) {
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }
    "unknown".to_string()
}
