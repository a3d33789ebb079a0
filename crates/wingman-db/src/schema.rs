// Database schema definitions for the Wingman job store

use super::{current_timestamp_millis, db_error, RecoveryReport};
use rusqlite::{params, Connection};

const CREATE_DOWNLOAD_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS download_items (
    model_repo TEXT NOT NULL,
    file_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'idle',
    total_bytes INTEGER NOT NULL DEFAULT 0,
    downloaded_bytes INTEGER NOT NULL DEFAULT 0,
    download_speed TEXT NOT NULL DEFAULT '',
    progress REAL NOT NULL DEFAULT 0,
    error TEXT,
    created INTEGER NOT NULL,
    updated INTEGER NOT NULL,
    PRIMARY KEY (model_repo, file_path)
)
"#;

const CREATE_DOWNLOAD_ITEMS_STATUS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_download_items_status
ON download_items(status, created)
"#;

// At most one row may be transferring at any time.
const CREATE_DOWNLOAD_ITEMS_SINGLE_ACTIVE_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_download_items_single_active
ON download_items(status) WHERE status = 'downloading'
"#;

const CREATE_WINGMAN_ITEMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS wingman_items (
    alias TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'queued',
    model_repo TEXT NOT NULL,
    file_path TEXT NOT NULL,
    address TEXT NOT NULL DEFAULT '127.0.0.1',
    port INTEGER NOT NULL DEFAULT 0,
    metrics_port INTEGER NOT NULL DEFAULT 0,
    context_size INTEGER NOT NULL DEFAULT 0,
    gpu_layers INTEGER NOT NULL DEFAULT -1,
    force INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created INTEGER NOT NULL,
    updated INTEGER NOT NULL
)
"#;

const CREATE_SERVICE_STATUS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS service_status (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    created INTEGER NOT NULL,
    updated INTEGER NOT NULL
)
"#;

/// Initialize the database schema (create all tables and indexes)
pub fn initialize(conn: &Connection) -> Result<(), String> {
    let statements = [
        ("download_items", CREATE_DOWNLOAD_ITEMS_TABLE),
        ("download_items_status_index", CREATE_DOWNLOAD_ITEMS_STATUS_INDEX),
        (
            "download_items_single_active_index",
            CREATE_DOWNLOAD_ITEMS_SINGLE_ACTIVE_INDEX,
        ),
        ("wingman_items", CREATE_WINGMAN_ITEMS_TABLE),
        ("service_status", CREATE_SERVICE_STATUS_TABLE),
    ];

    for (name, sql) in statements.iter() {
        conn.execute(sql, [])
            .map_err(db_error(&format!("create {name}")))?;
    }

    Ok(())
}

/// Bring rows left by a crashed or killed run back to a consistent state.
///
/// A transfer that was in flight goes back to the queue so the worker picks
/// it up again. Inference processes do not survive us, so their rows are
/// meaningless and are dropped.
pub fn recover_interrupted_jobs(conn: &Connection) -> Result<RecoveryReport, String> {
    let requeued_downloads = conn
        .execute(
            "UPDATE download_items SET status = 'queued', download_speed = '', updated = ?1 WHERE status = 'downloading'",
            params![current_timestamp_millis()],
        )
        .map_err(db_error("requeue interrupted downloads"))?;

    let cleared_inference = conn
        .execute("DELETE FROM wingman_items", [])
        .map_err(db_error("clear inference items"))?;

    Ok(RecoveryReport {
        requeued_downloads,
        cleared_inference,
    })
}

/// Drop all tables (for testing/reset)
#[cfg(test)]
pub fn drop_all_tables(conn: &Connection) -> Result<(), String> {
    for table in ["download_items", "wingman_items", "service_status"] {
        conn.execute(&format!("DROP TABLE IF EXISTS {table}"), [])
            .map_err(db_error(&format!("drop {table}")))?;
    }
    Ok(())
}
