// Backup vault: quarantine, commit and restore of original files
//
// Layout: <uploads>/migrator-backup/<YYYYMMDD-HHMMSS>/item-<id>/<basename>
// The per-item record is stored as JSON under `migrator:backup_dir`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::constants::{BACKUP_FOLDER, BACKUP_TIMESTAMP_FORMAT, META_BACKUP, TIMESTAMP_FORMAT};
use crate::error::{MigratorError, Result};
use crate::logger::Logger;
use crate::store::{ContentStore, MediaId, UploadDir};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupFile {
    /// Original path relative to the upload root.
    pub original: String,
    /// File name inside the backup directory.
    pub stored_as: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Backup directory relative to the upload root.
    pub dir: String,
    pub timestamp: String,
    pub files: Vec<BackupFile>,
}

impl BackupRecord {
    pub fn load(store: &dyn ContentStore, item_id: MediaId) -> Result<Option<Self>> {
        match store.get_item_meta(item_id, META_BACKUP)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn save(&self, store: &dyn ContentStore, item_id: MediaId) -> Result<()> {
        store.set_item_meta(item_id, META_BACKUP, &serde_json::to_string(self)?)
    }
}

pub struct BackupVault<'a> {
    uploads: &'a UploadDir,
    store: &'a dyn ContentStore,
    logger: &'a Logger,
}

impl<'a> BackupVault<'a> {
    pub fn new(uploads: &'a UploadDir, store: &'a dyn ContentStore, logger: &'a Logger) -> Self {
        Self { uploads, store, logger }
    }

    /// Move the listed files (relative paths) into a fresh backup directory.
    /// Files that do not exist are skipped. On failure, files already moved
    /// are put back.
    pub fn quarantine(&self, item_id: MediaId, files: &[String]) -> Result<BackupRecord> {
        let now = Utc::now();
        let stamp = now.format(BACKUP_TIMESTAMP_FORMAT).to_string();
        let dir_rel = format!("{}/{}/item-{}", BACKUP_FOLDER, stamp, item_id);
        let dir = self.uploads.resolve(&dir_rel)?;

        fs::create_dir_all(&dir)
            .map_err(|e| MigratorError::QuarantineFailed(format!("cannot create {}: {}", dir.display(), e)))?;

        let mut record = BackupRecord {
            dir: dir_rel,
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            files: Vec::new(),
        };

        for rel in files {
            if record.files.iter().any(|f| f.original == *rel) {
                continue;
            }
            let source = self.uploads.resolve(rel)?;
            if !source.is_file() {
                continue;
            }

            let result = unique_path(&dir.join(basename(rel))).and_then(|dest| {
                move_file(&source, &dest)?;
                Ok(dest)
            });
            match result {
                Ok(dest) => record.files.push(BackupFile {
                    original: rel.clone(),
                    stored_as: basename_of(&dest),
                }),
                Err(e) => {
                    self.restore_files(&dir, &record.files);
                    let _ = fs::remove_dir(&dir);
                    return Err(MigratorError::QuarantineFailed(format!("{}: {}", rel, e)));
                }
            }
        }

        if let Err(e) = record.save(self.store, item_id) {
            self.restore_files(&dir, &record.files);
            let _ = fs::remove_dir(&dir);
            return Err(MigratorError::QuarantineFailed(format!("cannot record backup: {}", e)));
        }

        self.logger.info(
            "quarantine",
            Some(item_id),
            format!("{} files moved to {}", record.files.len(), record.dir),
        );
        Ok(record)
    }

    /// Delete the backup directory and the record. Idempotent; a directory
    /// that cannot be removed is logged and left behind.
    pub fn commit(&self, item_id: MediaId) -> Result<()> {
        self.remove_backup(item_id, "commit")
    }

    /// Drop the backup once `restore` has put every file back.
    pub fn discard(&self, item_id: MediaId) -> Result<()> {
        self.remove_backup(item_id, "backup_discarded")
    }

    fn remove_backup(&self, item_id: MediaId, event: &str) -> Result<()> {
        let Some(record) = BackupRecord::load(self.store, item_id)? else {
            return Ok(());
        };

        let dir = self.uploads.resolve(&record.dir)?;
        if dir.exists() {
            if let Err(e) = fs::remove_dir_all(&dir) {
                self.logger.warn(
                    "backup_cleanup_failed",
                    Some(item_id),
                    format!("could not delete {}: {}", dir.display(), e),
                );
            }
        }
        remove_if_empty(dir.parent());

        self.store.delete_item_meta(item_id, META_BACKUP)?;
        self.logger.info(event, Some(item_id), format!("backup {} deleted", record.dir));
        Ok(())
    }

    /// Move every backed-up file to its original location. The directory and
    /// the record stay until `discard`, so an interrupted restore can be run
    /// again; files already back in place are skipped.
    pub fn restore(&self, item_id: MediaId) -> Result<BackupRecord> {
        let record = BackupRecord::load(self.store, item_id)?.ok_or(MigratorError::NotQuarantined(item_id))?;
        let dir = self.uploads.resolve(&record.dir)?;

        for file in &record.files {
            let stored = dir.join(&file.stored_as);
            let original = self.uploads.resolve(&file.original)?;
            if !stored.exists() && original.exists() {
                continue;
            }
            if original.exists() {
                return Err(MigratorError::RollbackFailed(format!(
                    "{} already exists; refusing to overwrite",
                    file.original
                )));
            }
            move_file(&stored, &original)
                .map_err(|e| MigratorError::RollbackFailed(format!("{}: {}", file.original, e)))?;
        }

        self.logger.info("restore_files", Some(item_id), format!("{} files restored", record.files.len()));
        Ok(record)
    }

    /// Whether some backed-up file has already left the backup directory.
    pub fn is_partially_restored(&self, record: &BackupRecord) -> Result<bool> {
        let dir = self.uploads.resolve(&record.dir)?;
        Ok(record.files.iter().any(|f| !dir.join(&f.stored_as).exists()))
    }

    fn restore_files(&self, dir: &Path, files: &[BackupFile]) {
        for file in files {
            let restored = self
                .uploads
                .resolve(&file.original)
                .and_then(|original| move_file(&dir.join(&file.stored_as), &original));
            if let Err(e) = restored {
                log::warn!("Could not restore {} from quarantine: {}", file.original, e);
            }
        }
    }
}

fn basename(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

fn basename_of(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

/// Append `_1`, `_2`... before the extension until the path is free.
fn unique_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }
    let parent = path.parent().unwrap_or(Path::new("."));
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    for i in 1..1000 {
        let name = if ext.is_empty() {
            format!("{}_{}", stem, i)
        } else {
            format!("{}_{}.{}", stem, i, ext)
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(MigratorError::Other("Could not generate unique filename".to_string()))
}

/// Rename, falling back to copy + verify + delete when the rename fails
/// (different filesystems).
pub fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    copy_with_verify(source, dest)?;
    fs::remove_file(source)?;
    Ok(())
}

fn copy_with_verify(source: &Path, dest: &Path) -> Result<()> {
    fs::copy(source, dest)?;

    let source_size = fs::metadata(source)?.len();
    let dest_size = fs::metadata(dest)?.len();
    if source_size != dest_size {
        let _ = fs::remove_file(dest);
        return Err(MigratorError::Other(format!(
            "Verification failed: size mismatch ({} vs {})",
            source_size, dest_size
        )));
    }

    if let Ok(modified) = fs::metadata(source).and_then(|m| m.modified()) {
        let _ = filetime::set_file_mtime(dest, filetime::FileTime::from_system_time(modified));
    }
    Ok(())
}

fn remove_if_empty(dir: Option<&Path>) {
    if let Some(dir) = dir {
        if fs::read_dir(dir).map(|mut d| d.next().is_none()).unwrap_or(false) {
            let _ = fs::remove_dir(dir);
        }
    }
}
