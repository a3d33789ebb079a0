// Database methods for service heartbeats (DownloadService, WingmanService)

use super::{current_timestamp_millis, db_error, Database};
use rusqlite::{params, Connection, OptionalExtension};
use wingman_types::{ServiceState, ServiceStatus, StatusMessage};

fn decode(value: &str, created: i64, updated: i64) -> Result<ServiceStatus, String> {
    let mut status: ServiceStatus = serde_json::from_str(value)
        .map_err(|e| format!("Failed to decode service status: {e}"))?;
    status.created = created;
    status.updated = updated;
    Ok(status)
}

fn select_service(conn: &Connection, name: &str) -> Result<Option<ServiceStatus>, String> {
    let row = conn
        .query_row(
            "SELECT value, created, updated FROM service_status WHERE name = ?1",
            params![name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )
        .optional()
        .map_err(db_error("get service status"))?;
    row.map(|(value, created, updated)| decode(&value, created, updated))
        .transpose()
}

impl Database {
    /// Store the status of a service and publish it on the feed.
    pub fn set_service_status(&self, status: &ServiceStatus) -> Result<ServiceStatus, String> {
        let value = serde_json::to_string(status)
            .map_err(|e| format!("Failed to encode service status: {e}"))?;
        let stored = {
            let conn = self.connection();
            conn.execute(
                "INSERT INTO service_status (name, value, created, updated) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated = excluded.updated",
                params![status.name, value, status.created, current_timestamp_millis()],
            )
            .map_err(db_error("save service status"))?;
            select_service(&conn, &status.name)?
                .ok_or_else(|| "Failed to save service status: row vanished".to_string())?
        };
        self.publish(StatusMessage::service(stored.clone()));
        Ok(stored)
    }

    /// Shorthand for the common "state plus optional current job" update.
    pub fn update_service_state(
        &self,
        name: &str,
        state: ServiceState,
        current: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<ServiceStatus, String> {
        let mut status = ServiceStatus::new(name, state, current_timestamp_millis());
        status.current = current;
        status.error = error;
        self.set_service_status(&status)
    }

    pub fn get_service_status(&self, name: &str) -> Result<Option<ServiceStatus>, String> {
        let conn = self.connection();
        select_service(&conn, name)
    }

    pub fn list_service_statuses(&self) -> Result<Vec<ServiceStatus>, String> {
        let conn = self.connection();
        let mut stmt = conn
            .prepare("SELECT value, created, updated FROM service_status ORDER BY name ASC")
            .map_err(db_error("prepare list service status"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })
            .map_err(db_error("list service status"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error("read service status"))?;

        rows.iter()
            .map(|(value, created, updated)| decode(value, *created, *updated))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wingman_types::{DownloadItem, DOWNLOAD_SERVICE, WINGMAN_SERVICE};

    #[test]
    fn test_set_and_get_service_status() {
        let db = Database::new(":memory:").unwrap();
        let job = DownloadItem::new("org/model", "a.gguf", 1);
        let status = ServiceStatus::new(DOWNLOAD_SERVICE, ServiceState::Downloading, 7)
            .with_current(&job);
        db.set_service_status(&status).unwrap();

        let stored = db.get_service_status(DOWNLOAD_SERVICE).unwrap().unwrap();
        assert_eq!(stored.status, ServiceState::Downloading);
        assert_eq!(stored.created, 7);
        assert_eq!(stored.current.unwrap()["filePath"], "a.gguf");
    }

    #[test]
    fn test_created_survives_updates() {
        let db = Database::new(":memory:").unwrap();
        db.set_service_status(&ServiceStatus::new(WINGMAN_SERVICE, ServiceState::Starting, 3))
            .unwrap();
        let later = db
            .update_service_state(WINGMAN_SERVICE, ServiceState::Error, None, Some("boom".into()))
            .unwrap();
        assert_eq!(later.created, 3);
        assert_eq!(later.error.as_deref(), Some("boom"));
        assert_eq!(db.list_service_statuses().unwrap().len(), 1);
    }

    #[test]
    fn test_publishes_service_variant() {
        let db = Database::new(":memory:").unwrap();
        let mut rx = db.feed().subscribe();
        db.update_service_state(DOWNLOAD_SERVICE, ServiceState::Ready, None, None)
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().kind(), "DownloadServiceAppItem");
    }

    #[test]
    fn test_missing_service() {
        let db = Database::new(":memory:").unwrap();
        assert!(db.get_service_status("Nope").unwrap().is_none());
    }
}
