// Media scanner: picks the next items eligible for conversion

use crate::constants::META_STATUS;
use crate::error::Result;
use crate::fsm::{self, ItemStatus};
use crate::settings::Settings;
use crate::store::{ContentStore, MediaFilter, MediaId, MediaItem};

pub struct MediaScanner<'a> {
    store: &'a dyn ContentStore,
    settings: &'a Settings,
}

impl<'a> MediaScanner<'a> {
    pub fn new(store: &'a dyn ContentStore, settings: &'a Settings) -> Self {
        Self { store, settings }
    }

    fn filter(&self, after_id: Option<MediaId>, limit: usize) -> MediaFilter {
        let mut mime_not_in: Vec<String> = vec![self.settings.target_format.mime().to_string()];
        mime_not_in.extend(self.settings.skip_mimes.iter().cloned());
        MediaFilter {
            mime_prefix: Some("image/".to_string()),
            mime_not_in,
            path_excludes: self.settings.skip_folders.iter().map(|f| f.trim_matches('/').to_string()).collect(),
            after_id,
            limit,
        }
    }

    /// Whether an item may enter the pipeline: never touched, sent back to
    /// `pending` by a retry, or interrupted mid-pipeline.
    pub fn is_eligible(&self, item: &MediaItem) -> Result<bool> {
        if item.meta.file.is_empty() {
            return Ok(false);
        }
        fsm::is_runnable(self.store, item.id)
    }

    /// Unfinished items the media filter no longer returns because a crashed
    /// run had already switched them to the target MIME.
    fn interrupted(&self, after_id: Option<MediaId>) -> Result<Vec<MediaItem>> {
        let target = self.settings.target_format.mime();
        let mut out = Vec::new();
        for (id, raw) in self.store.list_item_meta_by_key(META_STATUS)? {
            if after_id.map_or(false, |after| id <= after) {
                continue;
            }
            let unfinished = matches!(
                raw.parse::<ItemStatus>(),
                Ok(ItemStatus::Pending | ItemStatus::Converted | ItemStatus::Relinked)
            );
            if !unfinished {
                continue;
            }
            let Some(item) = self.store.get_media(id)? else {
                continue;
            };
            if item.mime == target && self.is_eligible(&item)? {
                out.push(item);
            }
        }
        Ok(out)
    }

    /// Up to `limit` eligible items with ids greater than `after_id`, ascending.
    pub fn next_batch(&self, after_id: Option<MediaId>, limit: usize) -> Result<Vec<MediaItem>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut out = self.interrupted(after_id)?;
        out.truncate(limit);
        let mut cursor = after_id;
        let mut found = 0;
        loop {
            let page = self.store.list_media(&self.filter(cursor, limit))?;
            let page_len = page.len();
            for item in page {
                cursor = Some(item.id);
                if self.is_eligible(&item)? {
                    out.push(item);
                    found += 1;
                    if found == limit {
                        break;
                    }
                }
            }
            if found == limit || page_len < limit {
                break;
            }
        }
        out.sort_by_key(|item| item.id);
        out.dedup_by_key(|item| item.id);
        out.truncate(limit);
        Ok(out)
    }

    /// Number of eligible items after `after_id`.
    pub fn count_eligible(&self, after_id: Option<MediaId>) -> Result<usize> {
        const PAGE: usize = 500;
        let mut count = 0;
        let mut cursor = after_id;
        loop {
            let page = self.store.list_media(&self.filter(cursor, PAGE))?;
            for item in &page {
                cursor = Some(item.id);
                if self.is_eligible(item)? {
                    count += 1;
                }
            }
            if page.len() < PAGE {
                return Ok(count + self.interrupted(after_id)?.len());
            }
        }
    }
}
