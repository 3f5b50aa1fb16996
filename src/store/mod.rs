// Content store contract
//
// The engine never talks to a database directly. Everything it reads or
// writes goes through `ContentStore`: the media registry, the post-like
// content table, the per-item metadata table and the global options table
// (which doubles as the key-value surface for settings, batch state and the
// single-writer lock). `crate::db::SqliteStore` is the bundled adapter.

pub mod uploads;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use uploads::UploadDir;

pub type MediaId = i64;

/// One derived size of a media item. `file` is a basename that lives in the
/// same directory as the master file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeVariant {
    pub file: String,
    pub width: u32,
    pub height: u32,
}

/// Attachment metadata as the host stores it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaMeta {
    /// Master file, relative to the upload root (e.g. `2024/01/pic.jpg`).
    pub file: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub sizes: BTreeMap<String, SizeVariant>,
}

impl MediaMeta {
    /// Directory part of `file` with a trailing `/`, or empty for root-level files.
    pub fn dir_prefix(&self) -> String {
        match self.file.rfind('/') {
            Some(idx) => self.file[..=idx].to_string(),
            None => String::new(),
        }
    }

    /// Relative path of a size variant.
    pub fn variant_path(&self, variant: &SizeVariant) -> String {
        format!("{}{}", self.dir_prefix(), variant.file)
    }

    /// Relative paths of the master and every variant, master first, deduplicated.
    pub fn all_paths(&self) -> Vec<String> {
        let mut paths = vec![self.file.clone()];
        for variant in self.sizes.values() {
            let path = self.variant_path(variant);
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
        paths
    }
}

/// A registered media asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: MediaId,
    pub mime: String,
    pub meta: MediaMeta,
}

/// Selection filter for `ContentStore::list_media`.
#[derive(Debug, Clone, Default)]
pub struct MediaFilter {
    /// Only MIME types starting with this prefix are listed (e.g. `image/`).
    pub mime_prefix: Option<String>,
    pub mime_not_in: Vec<String>,
    /// Folder names; an item whose path contains one as a directory segment is excluded.
    pub path_excludes: Vec<String>,
    /// Only ids strictly greater than this.
    pub after_id: Option<MediaId>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostRow {
    pub id: i64,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRow {
    /// Row identity in the metadata table.
    pub id: i64,
    /// Item that owns the row.
    pub item_id: i64,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionRow {
    pub name: String,
    pub value: String,
}

/// Everything the migration engine needs from its host.
///
/// Row iteration is paged: callers pass the last seen id (or name) and a page
/// size, and get back rows in ascending order whose value contains at least
/// one of `needles` as a plain substring.
pub trait ContentStore {
    // ----- Media registry -----

    fn list_media(&self, filter: &MediaFilter) -> Result<Vec<MediaItem>>;
    fn get_media(&self, id: MediaId) -> Result<Option<MediaItem>>;
    fn read_media_meta(&self, id: MediaId) -> Result<Option<MediaMeta>>;
    fn write_media_meta(&self, id: MediaId, meta: &MediaMeta) -> Result<()>;
    fn set_media_mime(&self, id: MediaId, mime: &str) -> Result<()>;

    // ----- Post content -----

    fn iter_post_bodies(&self, needles: &[String], after_id: i64, limit: usize) -> Result<Vec<PostRow>>;
    fn update_post_body(&self, id: i64, body: &str) -> Result<()>;
    fn get_post_body(&self, id: i64) -> Result<Option<String>>;

    // ----- Per-item metadata -----

    fn iter_item_meta(&self, needles: &[String], after_id: i64, limit: usize) -> Result<Vec<MetaRow>>;
    fn update_item_meta(&self, row_id: i64, value: &str) -> Result<()>;
    fn get_meta_row(&self, row_id: i64) -> Result<Option<MetaRow>>;
    fn get_item_meta(&self, item_id: MediaId, key: &str) -> Result<Option<String>>;
    fn set_item_meta(&self, item_id: MediaId, key: &str, value: &str) -> Result<()>;
    fn delete_item_meta(&self, item_id: MediaId, key: &str) -> Result<()>;
    /// All (item, value) pairs stored under `key`, ordered by item id.
    fn list_item_meta_by_key(&self, key: &str) -> Result<Vec<(MediaId, String)>>;

    // ----- Options -----

    fn iter_options(&self, needles: &[String], after_name: &str, limit: usize) -> Result<Vec<OptionRow>>;
    fn update_option(&self, name: &str, value: &str) -> Result<()>;

    // ----- Key-value surface (options table) -----

    fn kv_get(&self, key: &str) -> Result<Option<String>>;
    fn kv_set(&self, key: &str, value: &str) -> Result<()>;
    fn kv_del(&self, key: &str) -> Result<()>;
    /// Write `value` only if the key currently holds `expected` (`None`:
    /// key absent). Returns whether the write happened.
    fn kv_swap(&self, key: &str, expected: Option<&str>, value: &str) -> Result<bool>;
    /// Delete the key only if it still holds `expected`.
    fn kv_del_if(&self, key: &str, expected: &str) -> Result<bool>;
}
