// Per-item migration state machine
//
// pending -> converted -> relinked -> quarantined | committed
// with convert_failed, skipped_animated, rewrite_failed and metadata_failed
// as exits along the way. quarantined items are later committed or rolled
// back by the operator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::META_STATUS;
use crate::context::Context;
use crate::encoder::{self, EncodeError};
use crate::error::{MigratorError, Result};
use crate::report::{DiffReport, RowError};
use crate::rewriter::StoreRewriter;
use crate::store::{ContentStore, MediaId, MediaItem, MediaMeta, UploadDir};
use crate::urlmap::{self, UrlMap};
use crate::vault::{BackupRecord, BackupVault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Converted,
    Relinked,
    Quarantined,
    Committed,
    SkippedAnimated,
    ConvertFailed,
    MetadataFailed,
    RewriteFailed,
    RolledBack,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 10] = [
        ItemStatus::Pending,
        ItemStatus::Converted,
        ItemStatus::Relinked,
        ItemStatus::Quarantined,
        ItemStatus::Committed,
        ItemStatus::SkippedAnimated,
        ItemStatus::ConvertFailed,
        ItemStatus::MetadataFailed,
        ItemStatus::RewriteFailed,
        ItemStatus::RolledBack,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Converted => "converted",
            ItemStatus::Relinked => "relinked",
            ItemStatus::Quarantined => "quarantined",
            ItemStatus::Committed => "committed",
            ItemStatus::SkippedAnimated => "skipped_animated",
            ItemStatus::ConvertFailed => "convert_failed",
            ItemStatus::MetadataFailed => "metadata_failed",
            ItemStatus::RewriteFailed => "rewrite_failed",
            ItemStatus::RolledBack => "rolled_back",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Committed | ItemStatus::RolledBack | ItemStatus::SkippedAnimated)
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            ItemStatus::ConvertFailed | ItemStatus::MetadataFailed | ItemStatus::RewriteFailed
        )
    }

    pub fn load(store: &dyn ContentStore, item_id: MediaId) -> Result<Option<Self>> {
        match store.get_item_meta(item_id, META_STATUS)? {
            Some(raw) => raw.parse().map(Some),
            None => Ok(None),
        }
    }

    pub fn save(self, store: &dyn ContentStore, item_id: MediaId) -> Result<()> {
        store.set_item_meta(item_id, META_STATUS, self.as_str())
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = MigratorError;

    fn from_str(s: &str) -> Result<Self> {
        ItemStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| MigratorError::Other(format!("unknown item status '{}'", s)))
    }
}

/// Where one item ended up after `process_item`.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub item_id: MediaId,
    pub status: ItemStatus,
    pub error: Option<String>,
}

impl ItemOutcome {
    fn new(item_id: MediaId, status: ItemStatus) -> Self {
        Self { item_id, status, error: None }
    }

    fn failed(item_id: MediaId, status: ItemStatus, error: impl fmt::Display) -> Self {
        Self { item_id, status, error: Some(error.to_string()) }
    }

    pub fn is_failure(&self) -> bool {
        self.status.is_failed()
    }
}

/// Report rows naming the step that parked an item.
const MAP_ERROR_ROW: &str = "map";
const QUARANTINE_ERROR_ROW: &str = "quarantine";

fn has_error_row(store: &dyn ContentStore, item_id: MediaId, row: &str) -> Result<bool> {
    Ok(DiffReport::load(store, item_id)?.map_or(false, |r| r.errors.iter().any(|e| e.row == row)))
}

/// Whether the pipeline may pick the item up: never touched, sent back by a
/// retry, or left `converted`/`relinked` by an interrupted run. Items parked
/// by a failed map build or quarantine wait for the operator.
pub fn is_runnable(store: &dyn ContentStore, item_id: MediaId) -> Result<bool> {
    Ok(match ItemStatus::load(store, item_id)? {
        None | Some(ItemStatus::Pending) => true,
        Some(ItemStatus::Converted) => !has_error_row(store, item_id, MAP_ERROR_ROW)?,
        Some(ItemStatus::Relinked) => !has_error_row(store, item_id, QUARANTINE_ERROR_ROW)?,
        Some(_) => false,
    })
}

/// Store failures abort the run; everything else is an item failure.
fn is_fatal(err: &MigratorError) -> bool {
    matches!(err, MigratorError::Database(_))
}

fn record_failure(
    ctx: &Context,
    item_id: MediaId,
    status: ItemStatus,
    event: &str,
    mut report: DiffReport,
    row: &str,
    err: &MigratorError,
) -> Result<ItemOutcome> {
    ctx.logger.error(event, Some(item_id), err.to_string());
    report.errors.push(RowError { row: row.to_string(), error: err.to_string() });
    report.save(ctx.store)?;
    status.save(ctx.store, item_id)?;
    Ok(ItemOutcome::failed(item_id, status, err))
}

/// Carry over rows an earlier failed attempt already rewrote, so rollback
/// still sees them.
fn absorb_previous(report: &mut DiffReport, previous: DiffReport) {
    for post in previous.posts {
        if !report.posts.iter().any(|p| p.id == post.id) {
            report.posts.push(post);
        }
    }
    for meta in previous.meta {
        if !report.meta.iter().any(|m| m.id == meta.id) {
            report.meta.push(meta);
        }
    }
    for option in previous.options {
        if !report.options.iter().any(|o| o.name == option.name) {
            report.options.push(option);
        }
    }
    for (old, new) in previous.map {
        if !report.map.iter().any(|(o, _)| *o == old) {
            report.map.push((old, new));
        }
    }
}

/// Delete the files `meta` references, keeping anything `keep` still points at.
pub fn remove_item_files(uploads: &UploadDir, meta: &MediaMeta, keep: Option<&MediaMeta>) -> Vec<String> {
    let keep = keep.map(MediaMeta::all_paths).unwrap_or_default();
    let mut deleted = Vec::new();
    for rel in meta.all_paths() {
        if keep.contains(&rel) {
            continue;
        }
        let Ok(path) = uploads.resolve(&rel) else {
            continue;
        };
        if !path.is_file() {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => deleted.push(rel),
            Err(e) => log::warn!("Could not delete {}: {}", path.display(), e),
        }
    }
    deleted
}

/// Drive one item from `pending` to the furthest state it can reach.
///
/// Item-level failures are recorded as status and returned as an outcome;
/// only store failures come back as `Err`. An item a crashed run left
/// `converted` is converted again from its originals; one left `relinked`
/// only has its originals handled.
pub fn process_item(ctx: &Context, item: &MediaItem) -> Result<ItemOutcome> {
    let item_id = item.id;
    let status = ItemStatus::load(ctx.store, item_id)?;
    if !is_runnable(ctx.store, item_id)? {
        let status = status.unwrap_or(ItemStatus::Pending);
        ctx.logger.debug("item_skipped", Some(item_id), format!("already {}", status));
        return Ok(ItemOutcome::new(item_id, status));
    }
    match status {
        None => ItemStatus::Pending.save(ctx.store, item_id)?,
        Some(ItemStatus::Converted) => {
            ctx.logger.info("resume", Some(item_id), "resuming an interrupted conversion");
        }
        Some(ItemStatus::Relinked) => return resume_relinked(ctx, item_id),
        Some(_) => {}
    }

    let previous = DiffReport::load(ctx.store, item_id)?;
    // An interrupted attempt may already have written the new metadata; the
    // report keeps what the item looked like before.
    let old_meta = previous
        .as_ref()
        .and_then(|r| r.previous_meta.clone())
        .unwrap_or_else(|| item.meta.clone());
    let old_mime = previous
        .as_ref()
        .and_then(|r| r.previous_mime.clone())
        .unwrap_or_else(|| item.mime.clone());
    let options = ctx.encode_options();

    // encode
    let artifact = match encoder::convert_item(ctx.encoder, ctx.uploads, &old_meta, &options) {
        Ok(artifact) => artifact,
        Err(MigratorError::Encode(EncodeError::AnimatedRefused(path))) => {
            ctx.logger.info("skipped_animated", Some(item_id), format!("{} is animated", path));
            ItemStatus::SkippedAnimated.save(ctx.store, item_id)?;
            return Ok(ItemOutcome::new(item_id, ItemStatus::SkippedAnimated));
        }
        Err(e) if is_fatal(&e) => return Err(e),
        Err(e) => {
            let report = previous.unwrap_or_else(|| DiffReport::new(item_id, &UrlMap::new()));
            return record_failure(ctx, item_id, ItemStatus::ConvertFailed, "convert_failed", report, "encode", &e);
        }
    };
    ItemStatus::Converted.save(ctx.store, item_id)?;
    ctx.logger.log(
        crate::logger::LogLevel::Info,
        "converted",
        Some(item_id),
        format!("{} -> {}", old_meta.file, artifact.new_meta.file),
        serde_json::json!({
            "original_bytes": artifact.total_original_bytes,
            "new_bytes": artifact.total_new_bytes,
            "files": artifact.written.len(),
        }),
    );

    // build map: a failure parks the item as `converted`
    let map = match urlmap::build(ctx.uploads, &old_meta, &artifact.new_meta) {
        Ok(map) => map,
        Err(e) => {
            let mut report = previous.unwrap_or_else(|| DiffReport::new(item_id, &UrlMap::new()));
            report.previous_mime = Some(old_mime);
            report.previous_meta = Some(old_meta);
            report.new_meta = Some(artifact.new_meta);
            return record_failure(ctx, item_id, ItemStatus::Converted, "map_build_failed", report, MAP_ERROR_ROW, &e);
        }
    };

    // rewrite
    let mut report = StoreRewriter::new(ctx.store, ctx.logger).apply(item_id, &map)?;
    if let Some(previous) = previous {
        absorb_previous(&mut report, previous);
    }
    report.previous_mime = Some(old_mime);
    report.previous_meta = Some(old_meta.clone());
    report.new_meta = Some(artifact.new_meta.clone());
    report.encode = Some(artifact.master_stats.clone());
    report.statistics.original_bytes = artifact.total_original_bytes;
    report.statistics.new_bytes = artifact.total_new_bytes;
    report.statistics.compression_ratio =
        encoder::compression_ratio(artifact.total_original_bytes, artifact.total_new_bytes);
    report.statistics.resized = artifact.master_stats.resized;
    report.statistics.files_converted = artifact.written.len();
    report.statistics.rows_changed = report.rows_changed();
    report.statistics.replacements = report.replacements();

    if report.has_errors() {
        let summary = format!("{} rows failed", report.errors.len());
        ctx.logger.error("rewrite_failed", Some(item_id), summary.clone());
        report.save(ctx.store)?;
        ItemStatus::RewriteFailed.save(ctx.store, item_id)?;
        return Ok(ItemOutcome::failed(item_id, ItemStatus::RewriteFailed, summary));
    }
    report.save(ctx.store)?;

    // metadata; `relinked` is only recorded once it is written
    let target_mime = ctx.settings.target_format.mime();
    let meta_result = ctx
        .store
        .write_media_meta(item_id, &artifact.new_meta)
        .and_then(|_| ctx.store.set_media_mime(item_id, target_mime));
    if let Err(e) = meta_result {
        let err = MigratorError::MetadataWriteFailed(e.to_string());
        return record_failure(ctx, item_id, ItemStatus::MetadataFailed, "metadata_failed", report, "metadata", &err);
    }
    ItemStatus::Relinked.save(ctx.store, item_id)?;

    handle_originals(ctx, item_id, report)
}

fn resume_relinked(ctx: &Context, item_id: MediaId) -> Result<ItemOutcome> {
    let Some(report) = DiffReport::load(ctx.store, item_id)? else {
        ctx.logger.warn("resume_skipped", Some(item_id), "relinked item has no report");
        return Ok(ItemOutcome::new(item_id, ItemStatus::Relinked));
    };
    ctx.logger.info("resume", Some(item_id), "resuming after relink");
    handle_originals(ctx, item_id, report)
}

/// Last step for a `relinked` item: delete the originals right away, or
/// quarantine them until the operator commits or rolls back.
fn handle_originals(ctx: &Context, item_id: MediaId, mut report: DiffReport) -> Result<ItemOutcome> {
    let (Some(old_meta), Some(new_meta)) = (report.previous_meta.clone(), report.new_meta.clone()) else {
        let err = MigratorError::Other("report lacks item metadata".to_string());
        ctx.logger.error("originals_skipped", Some(item_id), err.to_string());
        return Ok(ItemOutcome::failed(item_id, ItemStatus::Relinked, err));
    };

    let two_phase = ctx.settings.validate && !ctx.settings.auto_commit;
    if !two_phase {
        let deleted = remove_item_files(ctx.uploads, &old_meta, Some(&new_meta));
        ItemStatus::Committed.save(ctx.store, item_id)?;
        ctx.logger.info("committed", Some(item_id), format!("{} originals deleted", deleted.len()));
        return Ok(ItemOutcome::new(item_id, ItemStatus::Committed));
    }

    let vault = BackupVault::new(ctx.uploads, ctx.store, ctx.logger);
    match vault.quarantine(item_id, &old_meta.all_paths()) {
        Ok(_) => {
            ItemStatus::Quarantined.save(ctx.store, item_id)?;
            Ok(ItemOutcome::new(item_id, ItemStatus::Quarantined))
        }
        Err(e) => {
            // Originals are back in place; the item stays relinked and can
            // still be committed.
            ctx.logger.error("quarantine_failed", Some(item_id), e.to_string());
            report.errors.push(RowError { row: QUARANTINE_ERROR_ROW.to_string(), error: e.to_string() });
            report.save(ctx.store)?;
            Ok(ItemOutcome::failed(item_id, ItemStatus::Relinked, e))
        }
    }
}

/// quarantined -> committed. Committing a committed item is a no-op; an
/// item left `relinked` by a failed quarantine has its originals deleted.
/// A quarantined item whose rollback was interrupted is refused.
pub fn commit_item(ctx: &Context, item_id: MediaId) -> Result<ItemStatus> {
    match ItemStatus::load(ctx.store, item_id)? {
        Some(ItemStatus::Committed) => Ok(ItemStatus::Committed),
        Some(ItemStatus::Quarantined) => {
            let vault = BackupVault::new(ctx.uploads, ctx.store, ctx.logger);
            if let Some(record) = BackupRecord::load(ctx.store, item_id)? {
                if vault.is_partially_restored(&record)? {
                    return Err(MigratorError::CommitFailed(format!(
                        "item {} was partly rolled back; finish the rollback instead",
                        item_id
                    )));
                }
            }
            vault
                .commit(item_id)
                .map_err(|e| MigratorError::CommitFailed(e.to_string()))?;
            ItemStatus::Committed.save(ctx.store, item_id)?;
            Ok(ItemStatus::Committed)
        }
        Some(ItemStatus::Relinked) => {
            let report = DiffReport::load(ctx.store, item_id)?
                .ok_or_else(|| MigratorError::CommitFailed(format!("item {} has no report", item_id)))?;
            let old = report
                .previous_meta
                .as_ref()
                .ok_or_else(|| MigratorError::CommitFailed(format!("item {} has no previous metadata", item_id)))?;
            let written = ctx.store.read_media_meta(item_id)?.map(|m| m.file);
            if written.is_none() || written != report.new_meta.as_ref().map(|m| m.file.clone()) {
                return Err(MigratorError::CommitFailed(format!(
                    "item {} does not reference its converted files yet",
                    item_id
                )));
            }
            let deleted = remove_item_files(ctx.uploads, old, report.new_meta.as_ref());
            ItemStatus::Committed.save(ctx.store, item_id)?;
            ctx.logger.info("committed", Some(item_id), format!("{} originals deleted", deleted.len()));
            Ok(ItemStatus::Committed)
        }
        _ => Err(MigratorError::NotQuarantined(item_id)),
    }
}

/// quarantined -> rolled_back: restore files, revert rewritten rows, restore
/// metadata and MIME, remove the converted files, then drop the backup.
///
/// Every step can be repeated, and the backup record goes last, so a failed
/// rollback leaves the item `quarantined` and the operator can run it again.
pub fn rollback_item(ctx: &Context, item_id: MediaId) -> Result<ItemStatus> {
    if ItemStatus::load(ctx.store, item_id)? != Some(ItemStatus::Quarantined) {
        return Err(MigratorError::NotQuarantined(item_id));
    }
    let report = DiffReport::load(ctx.store, item_id)?
        .ok_or_else(|| MigratorError::RollbackFailed(format!("item {} has no report", item_id)))?;
    let previous_meta = report
        .previous_meta
        .clone()
        .ok_or_else(|| MigratorError::RollbackFailed(format!("item {} has no previous metadata", item_id)))?;
    let previous_mime = report
        .previous_mime
        .clone()
        .ok_or_else(|| MigratorError::RollbackFailed(format!("item {} has no previous MIME", item_id)))?;

    let vault = BackupVault::new(ctx.uploads, ctx.store, ctx.logger);
    let record = vault.restore(item_id)?;

    let reverted = StoreRewriter::new(ctx.store, ctx.logger).revert(&report)?;
    if reverted.has_errors() {
        let rows: Vec<&str> = reverted.errors.iter().map(|e| e.row.as_str()).collect();
        return Err(MigratorError::RollbackFailed(format!("rows not reverted: {}", rows.join(", "))));
    }

    ctx.store
        .write_media_meta(item_id, &previous_meta)
        .and_then(|_| ctx.store.set_media_mime(item_id, &previous_mime))
        .map_err(|e| MigratorError::RollbackFailed(format!("metadata not restored: {}", e)))?;

    if let Some(new_meta) = &report.new_meta {
        let removed = remove_item_files(ctx.uploads, new_meta, Some(&previous_meta));
        ctx.logger.debug("rollback_cleanup", Some(item_id), format!("{} converted files removed", removed.len()));
    }

    vault.discard(item_id)?;
    ItemStatus::RolledBack.save(ctx.store, item_id)?;
    ctx.logger.info(
        "rolled_back",
        Some(item_id),
        format!("{} files restored, {} rows reverted", record.files.len(), reverted.rows_changed()),
    );
    Ok(ItemStatus::RolledBack)
}

/// *_failed (or `converted` parked by a map failure) -> pending
pub fn retry_item(ctx: &Context, item_id: MediaId) -> Result<ItemStatus> {
    let status = ItemStatus::load(ctx.store, item_id)?;
    let parked = status == Some(ItemStatus::Converted) && has_error_row(ctx.store, item_id, MAP_ERROR_ROW)?;
    match status {
        Some(status) if status.is_failed() || parked => {
            if parked {
                if let Some(mut report) = DiffReport::load(ctx.store, item_id)? {
                    report.errors.retain(|e| e.row != MAP_ERROR_ROW);
                    report.save(ctx.store)?;
                }
            }
            ItemStatus::Pending.save(ctx.store, item_id)?;
            ctx.logger.info("retry", Some(item_id), format!("{} -> pending", status));
            Ok(ItemStatus::Pending)
        }
        _ => Err(MigratorError::NotRetryable(item_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_roundtrip() {
        for status in ItemStatus::ALL {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(ItemStatus::Committed.is_terminal());
        assert!(ItemStatus::SkippedAnimated.is_terminal());
        assert!(!ItemStatus::Quarantined.is_terminal());
        assert!(ItemStatus::RewriteFailed.is_failed());
        assert!(!ItemStatus::RolledBack.is_failed());
    }
}
