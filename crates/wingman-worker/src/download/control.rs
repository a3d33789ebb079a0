// Request-side download operations used by the HTTP surface: enqueue,
// cancel, reset, verify and the on-disk model listing.

use serde::Serialize;
use std::path::{Path, PathBuf};
use wingman_db::Database;
use wingman_types::model_file::DOWNLOAD_SUFFIX;
use wingman_types::{
    format_model_file_name, parse_model_file_name, sys_info, validate_model_key, DownloadItem,
    DownloadStatus,
};

/// Final location of a downloaded model.
pub fn model_path(models_dir: &Path, model_repo: &str, file_path: &str) -> PathBuf {
    models_dir.join(format_model_file_name(model_repo, file_path))
}

/// Temp file a transfer streams into.
pub fn partial_path(models_dir: &Path, model_repo: &str, file_path: &str) -> PathBuf {
    models_dir.join(format!(
        "{}{DOWNLOAD_SUFFIX}",
        format_model_file_name(model_repo, file_path)
    ))
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Queued(DownloadItem),
    /// The key is already queued, downloading or complete on disk.
    AlreadyPresent(DownloadItem),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Cancelled(DownloadItem),
    NotActive(DownloadItem),
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedModel {
    pub model_repo: String,
    pub file_path: String,
    pub file_name: String,
    pub size_bytes: u64,
}

/// Queue `(model_repo, file_path)` for download.
///
/// A finished, failed or cancelled row is replaced and its partial file
/// removed, so counters start from zero. A `complete` row whose file has
/// vanished is treated the same way. The decision and the insert happen in
/// one store transaction.
pub fn enqueue_download(
    db: &Database,
    models_dir: &Path,
    model_repo: &str,
    file_path: &str,
) -> Result<EnqueueOutcome, String> {
    validate_model_key(model_repo, file_path)?;

    let on_disk = model_path(models_dir, model_repo, file_path).exists();
    let partial = partial_path(models_dir, model_repo, file_path);
    match db.enqueue_download_item(model_repo, file_path, on_disk, || remove_partial(&partial))? {
        Ok(stored) => {
            sys_info!("[DOWNLOAD] Queued {}/{}", model_repo, file_path);
            Ok(EnqueueOutcome::Queued(stored))
        }
        Err(existing) => Ok(EnqueueOutcome::AlreadyPresent(existing)),
    }
}

fn remove_partial(partial: &Path) -> Result<(), String> {
    match std::fs::remove_file(partial) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(format!("Failed to remove {}: {e}", partial.display())),
    }
}

/// Flag a queued or running download as cancelled. The worker notices at
/// its next progress checkpoint.
pub fn cancel_download(
    db: &Database,
    model_repo: &str,
    file_path: &str,
) -> Result<CancelOutcome, String> {
    let Some(existing) = db.get_download_item(model_repo, file_path)? else {
        return Ok(CancelOutcome::NotFound);
    };
    if !existing.status.is_active() {
        return Ok(CancelOutcome::NotActive(existing));
    }

    match db.transition_download_item(
        model_repo,
        file_path,
        DownloadStatus::Cancelled,
        &[DownloadStatus::Queued, DownloadStatus::Downloading],
        None,
    )? {
        Some(item) => {
            sys_info!("[DOWNLOAD] Cancel requested for {}/{}", model_repo, file_path);
            Ok(CancelOutcome::Cancelled(item))
        }
        // Finished between the read and the write.
        None => match db.get_download_item(model_repo, file_path)? {
            Some(item) => Ok(CancelOutcome::NotActive(item)),
            None => Ok(CancelOutcome::NotFound),
        },
    }
}

/// Delete the row and any partial file. Returns whether a row existed.
pub fn reset_download(
    db: &Database,
    models_dir: &Path,
    model_repo: &str,
    file_path: &str,
) -> Result<bool, String> {
    let removed = db.delete_download_item(model_repo, file_path)?;
    remove_partial(&partial_path(models_dir, model_repo, file_path))?;
    Ok(removed)
}

/// Drop `complete` rows whose model file is gone; return the rest.
pub fn verify_downloads(db: &Database, models_dir: &Path) -> Result<Vec<DownloadItem>, String> {
    let mut valid = Vec::new();
    for item in db.list_download_items()? {
        let missing = item.status == DownloadStatus::Complete
            && !model_path(models_dir, &item.model_repo, &item.file_path).exists();
        if missing {
            sys_info!(
                "[DOWNLOAD] {}/{} no longer on disk, removing record",
                item.model_repo,
                item.file_path
            );
            db.delete_download_item(&item.model_repo, &item.file_path)?;
        } else {
            valid.push(item);
        }
    }
    Ok(valid)
}

/// Model files in `models_dir`, decoded back into their keys. Partial
/// downloads and foreign files are skipped.
pub fn list_downloaded_models(models_dir: &Path) -> Result<Vec<DownloadedModel>, String> {
    if !models_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(models_dir)
        .map_err(|e| format!("Failed to read {}: {e}", models_dir.display()))?;

    let mut models: Vec<DownloadedModel> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let (model_repo, file_path) = parse_model_file_name(&file_name)?;
            Some(DownloadedModel {
                model_repo,
                file_path,
                file_name,
                size_bytes: metadata.len(),
            })
        })
        .collect();
    models.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, tempfile::TempDir) {
        (
            Database::new(":memory:").unwrap(),
            tempfile::tempdir().unwrap(),
        )
    }

    #[test]
    fn test_enqueue_creates_queued_row() {
        let (db, dir) = setup();
        match enqueue_download(&db, dir.path(), "org/model", "a.gguf").unwrap() {
            EnqueueOutcome::Queued(item) => {
                assert_eq!(item.status, DownloadStatus::Queued);
                assert_eq!(item.downloaded_bytes, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_enqueue_twice_reports_existing() {
        let (db, dir) = setup();
        enqueue_download(&db, dir.path(), "org/model", "a.gguf").unwrap();
        assert!(matches!(
            enqueue_download(&db, dir.path(), "org/model", "a.gguf").unwrap(),
            EnqueueOutcome::AlreadyPresent(_)
        ));
        assert_eq!(db.list_download_items().unwrap().len(), 1);
    }

    #[test]
    fn test_enqueue_rejects_bad_key() {
        let (db, dir) = setup();
        assert!(enqueue_download(&db, dir.path(), "nope", "a.gguf").is_err());
        assert!(enqueue_download(&db, dir.path(), "org/model", "../x").is_err());
    }

    #[test]
    fn test_reenqueue_after_cancel_starts_from_zero() {
        let (db, dir) = setup();
        enqueue_download(&db, dir.path(), "org/model", "a.gguf").unwrap();
        let mut running = db.claim_next_download().unwrap().unwrap();
        running.downloaded_bytes = 400;
        running.total_bytes = 1000;
        running.progress = 40.0;
        db.update_download_progress(&running).unwrap();
        std::fs::write(partial_path(dir.path(), "org/model", "a.gguf"), [0u8; 400]).unwrap();

        assert!(matches!(
            cancel_download(&db, "org/model", "a.gguf").unwrap(),
            CancelOutcome::Cancelled(_)
        ));
        let cancelled = db.get_download_item("org/model", "a.gguf").unwrap().unwrap();
        assert_eq!(cancelled.downloaded_bytes, 400);

        match enqueue_download(&db, dir.path(), "org/model", "a.gguf").unwrap() {
            EnqueueOutcome::Queued(item) => {
                assert_eq!(item.downloaded_bytes, 0);
                assert_eq!(item.progress, 0.0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!partial_path(dir.path(), "org/model", "a.gguf").exists());
    }

    #[test]
    fn test_concurrent_enqueues_queue_once() {
        let dir = tempfile::tempdir().unwrap();
        for round in 0..20 {
            let db = std::sync::Arc::new(Database::new(":memory:").unwrap());
            let file = format!("{round}.gguf");
            let mut cancelled = DownloadItem::new("org/model", &file, 1);
            cancelled.status = DownloadStatus::Cancelled;
            db.upsert_download_item(&cancelled).unwrap();

            let barrier = std::sync::Arc::new(std::sync::Barrier::new(3));
            let enqueuers: Vec<_> = (0..2)
                .map(|_| {
                    let (db, barrier, file) = (db.clone(), barrier.clone(), file.clone());
                    let models_dir = dir.path().to_path_buf();
                    std::thread::spawn(move || {
                        barrier.wait();
                        enqueue_download(&db, &models_dir, "org/model", &file).unwrap()
                    })
                })
                .collect();
            let claimer = {
                let (db, barrier) = (db.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    db.claim_next_download().unwrap()
                })
            };

            let queued = enqueuers
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|outcome| matches!(outcome, EnqueueOutcome::Queued(_)))
                .count();
            assert_eq!(queued, 1);

            let claimed = claimer.join().unwrap();
            let row = db.get_download_item("org/model", &file).unwrap().unwrap();
            match claimed {
                Some(_) => assert_eq!(row.status, DownloadStatus::Downloading),
                None => assert!(row.status.is_active()),
            }
            assert_eq!(db.list_download_items().unwrap().len(), 1);
        }
    }

    #[test]
    fn test_complete_with_missing_file_is_requeued() {
        let (db, dir) = setup();
        let mut done = DownloadItem::new("org/model", "a.gguf", 1);
        done.status = DownloadStatus::Complete;
        db.upsert_download_item(&done).unwrap();

        assert!(matches!(
            enqueue_download(&db, dir.path(), "org/model", "a.gguf").unwrap(),
            EnqueueOutcome::Queued(_)
        ));

        let mut done = DownloadItem::new("org/model", "b.gguf", 2);
        done.status = DownloadStatus::Complete;
        db.upsert_download_item(&done).unwrap();
        std::fs::write(model_path(dir.path(), "org/model", "b.gguf"), b"gguf").unwrap();
        assert!(matches!(
            enqueue_download(&db, dir.path(), "org/model", "b.gguf").unwrap(),
            EnqueueOutcome::AlreadyPresent(_)
        ));
    }

    #[test]
    fn test_cancel_outcomes() {
        let (db, _dir) = setup();
        assert_eq!(
            cancel_download(&db, "org/model", "a.gguf").unwrap(),
            CancelOutcome::NotFound
        );
        let mut failed = DownloadItem::new("org/model", "a.gguf", 1);
        failed.status = DownloadStatus::Error;
        db.upsert_download_item(&failed).unwrap();
        assert!(matches!(
            cancel_download(&db, "org/model", "a.gguf").unwrap(),
            CancelOutcome::NotActive(_)
        ));
    }

    #[test]
    fn test_verify_prunes_missing_files() {
        let (db, dir) = setup();
        for (file, on_disk) in [("kept.gguf", true), ("gone.gguf", false)] {
            let mut item = DownloadItem::new("org/model", file, 1);
            item.status = DownloadStatus::Complete;
            db.upsert_download_item(&item).unwrap();
            if on_disk {
                std::fs::write(model_path(dir.path(), "org/model", file), b"x").unwrap();
            }
        }
        let valid = verify_downloads(&db, dir.path()).unwrap();
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].file_path, "kept.gguf");
        assert!(db.get_download_item("org/model", "gone.gguf").unwrap().is_none());
    }

    #[test]
    fn test_list_downloaded_models() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(model_path(dir.path(), "org/model", "a.gguf"), b"12345").unwrap();
        std::fs::write(partial_path(dir.path(), "org/model", "b.gguf"), b"1").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hi").unwrap();

        let models = list_downloaded_models(dir.path()).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].model_repo, "org/model");
        assert_eq!(models[0].file_path, "a.gguf");
        assert_eq!(models[0].size_bytes, 5);
    }
}
