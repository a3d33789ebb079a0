// Database methods for download jobs

use super::{current_timestamp_millis, db_error, Database};
use rusqlite::{params, Connection, OptionalExtension, Row};
use wingman_types::{DownloadItem, DownloadStatus, StatusMessage};

const DOWNLOAD_COLUMNS: &str = "model_repo, file_path, status, total_bytes, downloaded_bytes, download_speed, progress, error, created, updated";

fn download_from_row(row: &Row) -> rusqlite::Result<DownloadItem> {
    let status: String = row.get(2)?;
    let total: i64 = row.get(3)?;
    let downloaded: i64 = row.get(4)?;
    Ok(DownloadItem {
        model_repo: row.get(0)?,
        file_path: row.get(1)?,
        status: DownloadStatus::from_db(&status),
        total_bytes: total.max(0) as u64,
        downloaded_bytes: downloaded.max(0) as u64,
        download_speed: row.get(5)?,
        progress: row.get(6)?,
        error: row.get(7)?,
        created: row.get(8)?,
        updated: row.get(9)?,
    })
}

fn select_download(
    conn: &Connection,
    model_repo: &str,
    file_path: &str,
) -> Result<Option<DownloadItem>, String> {
    conn.query_row(
        &format!("SELECT {DOWNLOAD_COLUMNS} FROM download_items WHERE model_repo = ?1 AND file_path = ?2"),
        params![model_repo, file_path],
        download_from_row,
    )
    .optional()
    .map_err(db_error("get download item"))
}

fn write_download(conn: &Connection, item: &DownloadItem, now: i64) -> Result<(), String> {
    conn.execute(
        "INSERT INTO download_items (model_repo, file_path, status, total_bytes, downloaded_bytes, download_speed, progress, error, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(model_repo, file_path) DO UPDATE SET
            status = excluded.status,
            total_bytes = excluded.total_bytes,
            downloaded_bytes = excluded.downloaded_bytes,
            download_speed = excluded.download_speed,
            progress = excluded.progress,
            error = excluded.error,
            updated = excluded.updated",
        params![
            item.model_repo,
            item.file_path,
            item.status.as_str(),
            item.total_bytes as i64,
            item.downloaded_bytes as i64,
            item.download_speed,
            item.progress,
            item.error,
            item.created,
            now,
        ],
    )
    .map_err(db_error("save download item"))?;
    Ok(())
}

impl Database {
    /// Insert or update a download row. `created` is kept from the first
    /// insert; `updated` is stamped now. Returns the stored row.
    pub fn upsert_download_item(&self, item: &DownloadItem) -> Result<DownloadItem, String> {
        let stored = {
            let conn = self.connection();
            write_download(&conn, item, current_timestamp_millis())?;
            select_download(&conn, &item.model_repo, &item.file_path)?
                .ok_or_else(|| "Failed to save download item: row vanished".to_string())?
        };
        self.publish(StatusMessage::DownloadItem(stored.clone()));
        Ok(stored)
    }

    pub fn get_download_item(
        &self,
        model_repo: &str,
        file_path: &str,
    ) -> Result<Option<DownloadItem>, String> {
        let conn = self.connection();
        select_download(&conn, model_repo, file_path)
    }

    /// All download rows, oldest first.
    pub fn list_download_items(&self) -> Result<Vec<DownloadItem>, String> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DOWNLOAD_COLUMNS} FROM download_items ORDER BY created ASC, rowid ASC"
            ))
            .map_err(db_error("prepare list download items"))?;

        let items = stmt
            .query_map([], download_from_row)
            .map_err(db_error("list download items"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error("read download item"))?;
        Ok(items)
    }

    pub fn list_download_items_with_status(
        &self,
        status: DownloadStatus,
    ) -> Result<Vec<DownloadItem>, String> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DOWNLOAD_COLUMNS} FROM download_items WHERE status = ?1 ORDER BY created ASC, rowid ASC"
            ))
            .map_err(db_error("prepare list download items"))?;

        let items = stmt
            .query_map(params![status.as_str()], download_from_row)
            .map_err(db_error("list download items"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error("read download item"))?;
        Ok(items)
    }

    /// Remove a row. Subscribers see the key fall back to `idle`.
    pub fn delete_download_item(&self, model_repo: &str, file_path: &str) -> Result<bool, String> {
        let removed = {
            let conn = self.connection();
            conn.execute(
                "DELETE FROM download_items WHERE model_repo = ?1 AND file_path = ?2",
                params![model_repo, file_path],
            )
            .map_err(db_error("delete download item"))?
        };
        if removed > 0 {
            self.publish(StatusMessage::DownloadItem(DownloadItem::new(
                model_repo,
                file_path,
                current_timestamp_millis(),
            )));
        }
        Ok(removed > 0)
    }

    /// Queue a fresh row for the key in one transaction.
    ///
    /// An active row, or a `complete` one when `file_present`, is kept and
    /// returned as `Err`. Any other row is replaced, with `on_replace`
    /// running first while the store is still locked, so counters and
    /// `created` start over.
    pub fn enqueue_download_item<F>(
        &self,
        model_repo: &str,
        file_path: &str,
        file_present: bool,
        on_replace: F,
    ) -> Result<Result<DownloadItem, DownloadItem>, String>
    where
        F: FnOnce() -> Result<(), String>,
    {
        let queued = {
            let mut conn = self.connection();
            let tx = conn
                .transaction()
                .map_err(db_error("begin enqueue transaction"))?;

            if let Some(existing) = select_download(&tx, model_repo, file_path)? {
                let keep = existing.status.is_active()
                    || (existing.status == DownloadStatus::Complete && file_present);
                if keep {
                    return Ok(Err(existing));
                }
                on_replace()?;
                tx.execute(
                    "DELETE FROM download_items WHERE model_repo = ?1 AND file_path = ?2",
                    params![model_repo, file_path],
                )
                .map_err(db_error("replace download item"))?;
            }

            let now = current_timestamp_millis();
            let mut item = DownloadItem::new(model_repo, file_path, now);
            item.status = DownloadStatus::Queued;
            write_download(&tx, &item, now)?;
            tx.commit().map_err(db_error("commit enqueue transaction"))?;
            item
        };
        self.publish(StatusMessage::DownloadItem(queued.clone()));
        Ok(Ok(queued))
    }

    /// Atomically pick the next job for the worker.
    ///
    /// Returns `None` when a row is already `downloading` or nothing is
    /// queued. Otherwise the oldest queued row is flipped to `downloading`
    /// and returned.
    pub fn claim_next_download(&self) -> Result<Option<DownloadItem>, String> {
        let claimed = {
            let mut conn = self.connection();
            let tx = conn
                .transaction()
                .map_err(db_error("begin claim transaction"))?;

            let busy: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM download_items WHERE status = 'downloading'",
                    [],
                    |row| row.get(0),
                )
                .map_err(db_error("count active downloads"))?;
            if busy > 0 {
                return Ok(None);
            }

            let next = tx
                .query_row(
                    &format!(
                        "SELECT {DOWNLOAD_COLUMNS} FROM download_items WHERE status = 'queued' ORDER BY created ASC, rowid ASC LIMIT 1"
                    ),
                    [],
                    download_from_row,
                )
                .optional()
                .map_err(db_error("select next queued download"))?;
            let Some(mut item) = next else {
                return Ok(None);
            };

            item.status = DownloadStatus::Downloading;
            item.error = None;
            item.download_speed = String::new();
            let now = current_timestamp_millis();
            write_download(&tx, &item, now)?;
            tx.commit().map_err(db_error("commit claim transaction"))?;
            item.updated = now;
            item
        };
        self.publish(StatusMessage::DownloadItem(claimed.clone()));
        Ok(Some(claimed))
    }

    /// Compare-and-set status change. Only applies when the current status
    /// is one of `only_from`; returns the new row, or `None` when the row is
    /// missing or in another state.
    pub fn transition_download_item(
        &self,
        model_repo: &str,
        file_path: &str,
        to: DownloadStatus,
        only_from: &[DownloadStatus],
        error: Option<&str>,
    ) -> Result<Option<DownloadItem>, String> {
        let updated = {
            let conn = self.connection();
            let Some(mut item) = select_download(&conn, model_repo, file_path)? else {
                return Ok(None);
            };
            if !only_from.contains(&item.status) {
                return Ok(None);
            }
            item.status = to;
            item.error = error.map(str::to_string);
            if to != DownloadStatus::Downloading {
                item.download_speed = String::new();
            }
            let now = current_timestamp_millis();
            write_download(&conn, &item, now)?;
            item.updated = now;
            item
        };
        self.publish(StatusMessage::DownloadItem(updated.clone()));
        Ok(Some(updated))
    }

    /// Write every field of `item` if the stored row is currently in one of
    /// `only_from`. This is how the worker persists progress and final
    /// results without clobbering a concurrent cancel.
    pub fn update_download_item_if(
        &self,
        item: &DownloadItem,
        only_from: &[DownloadStatus],
    ) -> Result<Option<DownloadItem>, String> {
        let updated = {
            let conn = self.connection();
            let Some(current) = select_download(&conn, &item.model_repo, &item.file_path)? else {
                return Ok(None);
            };
            if !only_from.contains(&current.status) {
                return Ok(None);
            }
            let now = current_timestamp_millis();
            write_download(&conn, item, now)?;
            let mut stored = item.clone();
            stored.created = current.created;
            stored.updated = now;
            stored
        };
        self.publish(StatusMessage::DownloadItem(updated.clone()));
        Ok(Some(updated))
    }

    /// Progress write from the worker: only lands while the row is still
    /// `downloading`.
    pub fn update_download_progress(
        &self,
        item: &DownloadItem,
    ) -> Result<Option<DownloadItem>, String> {
        self.update_download_item_if(item, &[DownloadStatus::Downloading])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn queued(db: &Database, file: &str, created: i64) -> DownloadItem {
        let mut item = DownloadItem::new("org/model", file, created);
        item.status = DownloadStatus::Queued;
        db.upsert_download_item(&item).unwrap()
    }

    #[test]
    fn test_upsert_keeps_created() {
        let db = Database::new(":memory:").unwrap();
        let first = queued(&db, "a.gguf", 10);
        assert_eq!(first.created, 10);

        let mut changed = first.clone();
        changed.created = 99;
        changed.total_bytes = 1000;
        let stored = db.upsert_download_item(&changed).unwrap();
        assert_eq!(stored.created, 10);
        assert_eq!(stored.total_bytes, 1000);
        assert!(stored.updated >= first.updated);
    }

    #[test]
    fn test_claim_takes_oldest_queued() {
        let db = Database::new(":memory:").unwrap();
        queued(&db, "late.gguf", 20);
        queued(&db, "early.gguf", 10);

        let claimed = db.claim_next_download().unwrap().unwrap();
        assert_eq!(claimed.file_path, "early.gguf");
        assert_eq!(claimed.status, DownloadStatus::Downloading);

        // One transfer at a time.
        assert!(db.claim_next_download().unwrap().is_none());
    }

    #[test]
    fn test_enqueue_keeps_live_rows() {
        let db = Database::new(":memory:").unwrap();
        let first = db
            .enqueue_download_item("org/model", "a.gguf", false, || Ok(()))
            .unwrap()
            .unwrap();
        assert_eq!(first.status, DownloadStatus::Queued);

        let claimed = db.claim_next_download().unwrap().unwrap();
        let kept = db
            .enqueue_download_item("org/model", "a.gguf", false, || {
                panic!("live row must not be replaced")
            })
            .unwrap()
            .unwrap_err();
        assert_eq!(kept.status, DownloadStatus::Downloading);
        assert_eq!(kept.created, claimed.created);
    }

    #[test]
    fn test_enqueue_replaces_finished_row() {
        let db = Database::new(":memory:").unwrap();
        let mut cancelled = DownloadItem::new("org/model", "a.gguf", 1);
        cancelled.status = DownloadStatus::Cancelled;
        cancelled.downloaded_bytes = 400;
        db.upsert_download_item(&cancelled).unwrap();

        let mut replaced = false;
        let queued = db
            .enqueue_download_item("org/model", "a.gguf", false, || {
                replaced = true;
                Ok(())
            })
            .unwrap()
            .unwrap();
        assert!(replaced);
        assert_eq!(queued.downloaded_bytes, 0);
        assert!(queued.created > 1);

        let mut complete = queued.clone();
        complete.status = DownloadStatus::Complete;
        db.upsert_download_item(&complete).unwrap();
        assert!(db
            .enqueue_download_item("org/model", "a.gguf", true, || Ok(()))
            .unwrap()
            .is_err());
        assert!(db
            .enqueue_download_item("org/model", "a.gguf", false, || Ok(()))
            .unwrap()
            .is_ok());
    }

    #[test]
    fn test_failed_replace_leaves_row() {
        let db = Database::new(":memory:").unwrap();
        let mut failed = DownloadItem::new("org/model", "a.gguf", 1);
        failed.status = DownloadStatus::Error;
        db.upsert_download_item(&failed).unwrap();

        let result =
            db.enqueue_download_item("org/model", "a.gguf", false, || Err("disk".to_string()));
        assert_eq!(result.unwrap_err(), "disk");
        let stored = db.get_download_item("org/model", "a.gguf").unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Error);
    }

    #[test]
    fn test_claim_with_empty_queue() {
        let db = Database::new(":memory:").unwrap();
        assert!(db.claim_next_download().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_claims_yield_one_job() {
        let db = Arc::new(Database::new(":memory:").unwrap());
        for n in 0..4 {
            queued(&db, &format!("{n}.gguf"), n);
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                std::thread::spawn(move || db.claim_next_download().unwrap())
            })
            .collect();
        let claimed = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(claimed, 1);
        assert_eq!(
            db.list_download_items_with_status(DownloadStatus::Downloading)
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let db = Database::new(":memory:").unwrap();
        queued(&db, "a.gguf", 1);

        let missed = db
            .transition_download_item(
                "org/model",
                "a.gguf",
                DownloadStatus::Complete,
                &[DownloadStatus::Downloading],
                None,
            )
            .unwrap();
        assert!(missed.is_none());

        let cancelled = db
            .transition_download_item(
                "org/model",
                "a.gguf",
                DownloadStatus::Cancelled,
                &[DownloadStatus::Queued, DownloadStatus::Downloading],
                None,
            )
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, DownloadStatus::Cancelled);
    }

    #[test]
    fn test_progress_not_written_after_cancel() {
        let db = Database::new(":memory:").unwrap();
        queued(&db, "a.gguf", 1);
        let mut running = db.claim_next_download().unwrap().unwrap();

        db.transition_download_item(
            "org/model",
            "a.gguf",
            DownloadStatus::Cancelled,
            &[DownloadStatus::Downloading],
            None,
        )
        .unwrap();

        running.downloaded_bytes = 500;
        assert!(db.update_download_progress(&running).unwrap().is_none());
        let stored = db.get_download_item("org/model", "a.gguf").unwrap().unwrap();
        assert_eq!(stored.status, DownloadStatus::Cancelled);
        assert_eq!(stored.downloaded_bytes, 0);
    }

    #[test]
    fn test_writes_are_published() {
        let db = Database::new(":memory:").unwrap();
        let mut rx = db.feed().subscribe();
        queued(&db, "a.gguf", 1);
        db.delete_download_item("org/model", "a.gguf").unwrap();

        match rx.try_recv().unwrap() {
            StatusMessage::DownloadItem(item) => assert_eq!(item.status, DownloadStatus::Queued),
            other => panic!("unexpected message {other:?}"),
        }
        match rx.try_recv().unwrap() {
            StatusMessage::DownloadItem(item) => assert_eq!(item.status, DownloadStatus::Idle),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_unknown_status_survives_read() {
        let db = Database::new(":memory:").unwrap();
        db.connection()
            .execute(
                "INSERT INTO download_items (model_repo, file_path, status, created, updated) VALUES ('org/model', 'x.gguf', 'bogus', 1, 1)",
                [],
            )
            .unwrap();
        let item = db.get_download_item("org/model", "x.gguf").unwrap().unwrap();
        assert_eq!(item.status, DownloadStatus::Unknown);
    }
}
