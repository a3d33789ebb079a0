// Database methods for inference jobs, one row per alias

use super::{current_timestamp_millis, db_error, Database};
use rusqlite::{params, Connection, OptionalExtension, Row};
use wingman_types::{StatusMessage, WingmanItem, WingmanStatus};

const WINGMAN_COLUMNS: &str = "alias, status, model_repo, file_path, address, port, metrics_port, context_size, gpu_layers, force, error, created, updated";

fn wingman_from_row(row: &Row) -> rusqlite::Result<WingmanItem> {
    let status: String = row.get(1)?;
    let port: i64 = row.get(5)?;
    let metrics_port: i64 = row.get(6)?;
    let context_size: i64 = row.get(7)?;
    Ok(WingmanItem {
        alias: row.get(0)?,
        status: WingmanStatus::from_db(&status),
        model_repo: row.get(2)?,
        file_path: row.get(3)?,
        address: row.get(4)?,
        port: u16::try_from(port).unwrap_or(0),
        metrics_port: u16::try_from(metrics_port).unwrap_or(0),
        context_size: u32::try_from(context_size).unwrap_or(0),
        gpu_layers: row.get(8)?,
        force: row.get(9)?,
        error: row.get(10)?,
        created: row.get(11)?,
        updated: row.get(12)?,
    })
}

fn select_wingman(conn: &Connection, alias: &str) -> Result<Option<WingmanItem>, String> {
    conn.query_row(
        &format!("SELECT {WINGMAN_COLUMNS} FROM wingman_items WHERE alias = ?1"),
        params![alias],
        wingman_from_row,
    )
    .optional()
    .map_err(db_error("get wingman item"))
}

fn write_wingman(conn: &Connection, item: &WingmanItem, now: i64) -> Result<(), String> {
    conn.execute(
        "INSERT INTO wingman_items (alias, status, model_repo, file_path, address, port, metrics_port, context_size, gpu_layers, force, error, created, updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(alias) DO UPDATE SET
            status = excluded.status,
            model_repo = excluded.model_repo,
            file_path = excluded.file_path,
            address = excluded.address,
            port = excluded.port,
            metrics_port = excluded.metrics_port,
            context_size = excluded.context_size,
            gpu_layers = excluded.gpu_layers,
            force = excluded.force,
            error = excluded.error,
            updated = excluded.updated",
        params![
            item.alias,
            item.status.as_str(),
            item.model_repo,
            item.file_path,
            item.address,
            item.port as i64,
            item.metrics_port as i64,
            item.context_size as i64,
            item.gpu_layers,
            item.force,
            item.error,
            item.created,
            now,
        ],
    )
    .map_err(db_error("save wingman item"))?;
    Ok(())
}

impl Database {
    /// Insert or update an inference row and return what was stored.
    pub fn upsert_wingman_item(&self, item: &WingmanItem) -> Result<WingmanItem, String> {
        let stored = {
            let conn = self.connection();
            write_wingman(&conn, item, current_timestamp_millis())?;
            select_wingman(&conn, &item.alias)?
                .ok_or_else(|| "Failed to save wingman item: row vanished".to_string())?
        };
        self.publish(StatusMessage::WingmanItem(stored.clone()));
        Ok(stored)
    }

    /// Insert `item` unless its alias already has a non-terminal row.
    ///
    /// Returns `Ok(Err(existing))` when the alias is taken, so a start
    /// request can never produce two live rows for one alias.
    pub fn reserve_wingman_item(
        &self,
        item: &WingmanItem,
    ) -> Result<Result<WingmanItem, WingmanItem>, String> {
        let stored = {
            let conn = self.connection();
            if let Some(existing) = select_wingman(&conn, &item.alias)? {
                if existing.status.is_active() {
                    return Ok(Err(existing));
                }
                conn.execute(
                    "DELETE FROM wingman_items WHERE alias = ?1",
                    params![item.alias],
                )
                .map_err(db_error("replace wingman item"))?;
            }
            write_wingman(&conn, item, current_timestamp_millis())?;
            select_wingman(&conn, &item.alias)?
                .ok_or_else(|| "Failed to save wingman item: row vanished".to_string())?
        };
        self.publish(StatusMessage::WingmanItem(stored.clone()));
        Ok(Ok(stored))
    }

    pub fn get_wingman_item(&self, alias: &str) -> Result<Option<WingmanItem>, String> {
        let conn = self.connection();
        select_wingman(&conn, alias)
    }

    /// All inference rows, oldest first.
    pub fn list_wingman_items(&self) -> Result<Vec<WingmanItem>, String> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {WINGMAN_COLUMNS} FROM wingman_items ORDER BY created ASC"
            ))
            .map_err(db_error("prepare list wingman items"))?;

        let items = stmt
            .query_map([], wingman_from_row)
            .map_err(db_error("list wingman items"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error("read wingman item"))?;
        Ok(items)
    }

    pub fn list_wingman_items_with_status(
        &self,
        status: WingmanStatus,
    ) -> Result<Vec<WingmanItem>, String> {
        Ok(self
            .list_wingman_items()?
            .into_iter()
            .filter(|item| item.status == status)
            .collect())
    }

    /// Remove a row. Subscribers get the alias back with status `unknown`.
    pub fn delete_wingman_item(&self, alias: &str) -> Result<bool, String> {
        let removed = {
            let conn = self.connection();
            let existing = select_wingman(&conn, alias)?;
            conn.execute("DELETE FROM wingman_items WHERE alias = ?1", params![alias])
                .map_err(db_error("delete wingman item"))?;
            existing
        };
        let Some(existing) = removed else {
            return Ok(false);
        };
        let mut gone = WingmanItem::new(
            alias,
            &existing.model_repo,
            &existing.file_path,
            current_timestamp_millis(),
        );
        gone.status = WingmanStatus::Unknown;
        self.publish(StatusMessage::WingmanItem(gone));
        Ok(true)
    }

    /// Write every field of `item` if the stored row is currently in one of
    /// `only_from`.
    pub fn update_wingman_item_if(
        &self,
        item: &WingmanItem,
        only_from: &[WingmanStatus],
    ) -> Result<Option<WingmanItem>, String> {
        let updated = {
            let conn = self.connection();
            let Some(current) = select_wingman(&conn, &item.alias)? else {
                return Ok(None);
            };
            if !only_from.contains(&current.status) {
                return Ok(None);
            }
            let now = current_timestamp_millis();
            write_wingman(&conn, item, now)?;
            let mut stored = item.clone();
            stored.created = current.created;
            stored.updated = now;
            stored
        };
        self.publish(StatusMessage::WingmanItem(updated.clone()));
        Ok(Some(updated))
    }

    /// Compare-and-set status change for an alias. `None` when the row is
    /// missing or not in one of `only_from`.
    pub fn transition_wingman_item(
        &self,
        alias: &str,
        to: WingmanStatus,
        only_from: &[WingmanStatus],
        error: Option<&str>,
    ) -> Result<Option<WingmanItem>, String> {
        let updated = {
            let conn = self.connection();
            let Some(mut item) = select_wingman(&conn, alias)? else {
                return Ok(None);
            };
            if !only_from.contains(&item.status) {
                return Ok(None);
            }
            item.status = to;
            if error.is_some() || to != WingmanStatus::Error {
                item.error = error.map(str::to_string);
            }
            let now = current_timestamp_millis();
            write_wingman(&conn, &item, now)?;
            item.updated = now;
            item
        };
        self.publish(StatusMessage::WingmanItem(updated.clone()));
        Ok(Some(updated))
    }
}
