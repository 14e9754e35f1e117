use std::path::Path;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;
use turso::{Builder, Connection, Database, Row};

use crate::error::GateError;

/// Global database instance
static DATABASE: OnceCell<Arc<Database>> = OnceCell::const_new();

/// Read an i64 column as u64, defaulting to 0
pub fn get_u64(row: &Row, idx: usize) -> u64 {
    row.get::<i64>(idx).map(|v| v as u64).unwrap_or(0)
}

/// Read a nullable i64 column as Option<u64>
pub fn opt_u64(row: &Row, idx: usize) -> Option<u64> {
    row.get::<Option<i64>>(idx).ok().flatten().map(|v| v as u64)
}

/// Initialize the database and create all tables
pub async fn init_db(path: &Path) -> Result<(), GateError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GateError::DatabaseError(format!("Failed to create DB directory: {e}")))?;
    }

    let path_str = path.to_str().unwrap_or("gate.db");
    let db = Builder::new_local(path_str)
        .build()
        .await
        .map_err(|e| GateError::DatabaseError(format!("Failed to open database: {e}")))?;

    let conn = db
        .connect()
        .map_err(|e| GateError::DatabaseError(format!("Failed to connect: {e}")))?;

    create_tables(&conn).await?;

    DATABASE
        .set(Arc::new(db))
        .map_err(|_| GateError::DatabaseError("Database already initialized".into()))?;

    info!("Database initialized at {}", path_str);
    Ok(())
}

/// Get a database connection
pub fn get_conn() -> Result<Connection, GateError> {
    let db = DATABASE
        .get()
        .ok_or_else(|| GateError::DatabaseError("Database not initialized".into()))?;
    db.connect()
        .map_err(|e| GateError::DatabaseError(format!("Failed to get connection: {e}")))
}

async fn create_tables(conn: &Connection) -> Result<(), GateError> {
    // Plan catalog
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS plans (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            price_cents INTEGER NOT NULL DEFAULT 0,
            monthly_request_limit INTEGER,
            concurrent_limit INTEGER NOT NULL DEFAULT 10,
            rate_limit_per_minute INTEGER NOT NULL DEFAULT 100,
            features TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GateError::DatabaseError(format!("Failed to create plans table: {e}")))?;

    // Account subscriptions; plan delete is restricted while referenced
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            plan_id TEXT NOT NULL REFERENCES plans(id) ON DELETE RESTRICT,
            status TEXT NOT NULL DEFAULT 'active',
            started_at INTEGER NOT NULL,
            expires_at INTEGER,
            amount_paid_cents INTEGER NOT NULL DEFAULT 0,
            cycle_usage INTEGER NOT NULL DEFAULT 0,
            last_reset_at INTEGER NOT NULL DEFAULT 0
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GateError::DatabaseError(format!("Failed to create subscriptions table: {e}")))?;

    // At most one active subscription per account
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_one_active \
         ON subscriptions(account_id) WHERE status = 'active'",
        (),
    )
    .await
    .map_err(|e| GateError::DatabaseError(format!("Failed to create subscription index: {e}")))?;

    // API credentials; only the sha256 of the secret is stored
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            key_id TEXT NOT NULL UNIQUE,
            secret_hash TEXT NOT NULL,
            account_id TEXT NOT NULL,
            name TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            expires_at INTEGER,
            last_used_at INTEGER,
            usage_count INTEGER NOT NULL DEFAULT 0,
            rate_limit_per_minute INTEGER,
            rate_limit_per_day INTEGER,
            allowed_origins TEXT
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GateError::DatabaseError(format!("Failed to create api_keys table: {e}")))?;

    // Append-only record of admitted API calls
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS usage_events (
            id TEXT PRIMARY KEY,
            key_id TEXT NOT NULL,
            account_id TEXT NOT NULL,
            endpoint TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            cost INTEGER NOT NULL DEFAULT 1,
            success INTEGER,
            status_code INTEGER,
            latency_ms INTEGER
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GateError::DatabaseError(format!("Failed to create usage_events table: {e}")))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_usage_events_created ON usage_events(created_at)",
        (),
    )
    .await
    .map_err(|e| GateError::DatabaseError(format!("Failed to create usage_events index: {e}")))?;

    // Durable per-day rate-limit counters (survive restarts)
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS day_counters (
            key_id TEXT NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
            day INTEGER NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (key_id, day)
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GateError::DatabaseError(format!("Failed to create day_counters table: {e}")))?;

    // Durable usage rollups
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS daily_summaries (
            key_id TEXT NOT NULL,
            day INTEGER NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 0,
            total_cost INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (key_id, day)
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GateError::DatabaseError(format!("Failed to create daily_summaries table: {e}")))?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS monthly_summaries (
            account_id TEXT NOT NULL,
            year INTEGER NOT NULL,
            month INTEGER NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 0,
            total_cost INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, year, month)
        )
        "#,
        (),
    )
    .await
    .map_err(|e| {
        GateError::DatabaseError(format!("Failed to create monthly_summaries table: {e}"))
    })?;

    // High-water marks for the aggregation job, one row per scope
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS aggregation_state (
            scope TEXT PRIMARY KEY,
            high_water_ms INTEGER NOT NULL DEFAULT 0
        )
        "#,
        (),
    )
    .await
    .map_err(|e| {
        GateError::DatabaseError(format!("Failed to create aggregation_state table: {e}"))
    })?;

    // One-shot CAPTCHA challenge tokens
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS challenge_tokens (
            token_id TEXT PRIMARY KEY,
            key_id TEXT NOT NULL REFERENCES api_keys(id) ON DELETE CASCADE,
            account_id TEXT NOT NULL,
            challenge_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            used_at INTEGER
        )
        "#,
        (),
    )
    .await
    .map_err(|e| {
        GateError::DatabaseError(format!("Failed to create challenge_tokens table: {e}"))
    })?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_challenge_tokens_expires ON challenge_tokens(expires_at)",
        (),
    )
    .await
    .map_err(|e| {
        GateError::DatabaseError(format!("Failed to create challenge_tokens index: {e}"))
    })?;

    Ok(())
}

#[cfg(test)]
pub(crate) async fn init_test_db() {
    let path = std::env::temp_dir().join(format!("captcha-gate-test-{}.db", std::process::id()));
    // First caller wins; later calls hit "already initialized" which is fine
    let _ = init_db(&path).await;
}
