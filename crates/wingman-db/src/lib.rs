// SQLite-backed job store for Wingman.
// Download jobs, inference jobs and service heartbeats live here. Every write
// is also published on the status feed so websocket clients see it live.

pub mod download_items;
pub mod feed;
pub mod schema;
pub mod service_status;
pub mod wingman_items;

use rusqlite::Connection;
use std::sync::{Arc, Mutex, MutexGuard};
use wingman_types::{sys_info, StatusMessage};

pub use feed::{StatusFeed, DEFAULT_FEED_CAPACITY};

/// Main database wrapper: one connection behind a mutex plus the status feed.
pub struct Database {
    conn: Mutex<Connection>,
    feed: StatusFeed,
    recovery: RecoveryReport,
}

/// Shared database type for passing across async boundaries
pub type SharedDatabase = Arc<Database>;

/// What startup normalization changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Downloads that were mid-transfer and went back to the queue.
    pub requeued_downloads: usize,
    /// Inference rows dropped because their processes died with us.
    pub cleared_inference: usize,
}

/// Helper function to create standardized database error messages
///
/// Usage: `.map_err(db_error("claim next download"))?`
pub fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> String + '_ {
    move |e| format!("Failed to {context}: {e}")
}

impl Database {
    /// Open (or create) the store at `db_path` with a default-sized feed.
    /// `":memory:"` gives a private in-memory store.
    pub fn new(db_path: &str) -> Result<Self, String> {
        Self::with_feed(db_path, StatusFeed::default())
    }

    /// Open the store, initialize the schema and normalize rows left behind
    /// by a previous run.
    pub fn with_feed(db_path: &str, feed: StatusFeed) -> Result<Self, String> {
        let conn = Connection::open(db_path).map_err(db_error("open database"))?;

        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_error("set busy timeout"))?;

        schema::initialize(&conn)?;
        let recovery = schema::recover_interrupted_jobs(&conn)?;
        if recovery != RecoveryReport::default() {
            sys_info!(
                "[DB] Recovered store: {} download(s) requeued, {} inference row(s) cleared",
                recovery.requeued_downloads,
                recovery.cleared_inference
            );
        }

        Ok(Self {
            conn: Mutex::new(conn),
            feed,
            recovery,
        })
    }

    /// Get a reference to the connection (locked)
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Result of the normalization performed when the store was opened.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    pub fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    /// Publish a message on the feed. Having no subscribers is not an error.
    pub fn publish(&self, message: StatusMessage) {
        self.feed.publish(message);
    }
}

/// Get current timestamp in milliseconds since Unix epoch
pub fn current_timestamp_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
