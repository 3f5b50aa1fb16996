// Per-item diff report
// Stored as JSON under `migrator:report` in the item's metadata.

use serde::{Deserialize, Serialize};

use crate::constants::{META_REPORT, TIMESTAMP_FORMAT};
use crate::encoder::EncodeStats;
use crate::error::Result;
use crate::store::{ContentStore, MediaId, MediaMeta};
use crate::urlmap::UrlMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostChange {
    pub id: i64,
    pub old_len: usize,
    pub new_len: usize,
    pub count: usize,
    /// Body as written.
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaChange {
    pub id: i64,
    pub item_id: i64,
    pub key: String,
    pub old_len: usize,
    pub new_len: usize,
    pub count: usize,
    pub paths: Vec<String>,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionChange {
    pub name: String,
    pub old_len: usize,
    pub new_len: usize,
    pub count: usize,
    pub paths: Vec<String>,
    pub after: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// `post:<id>`, `meta:<id>` or `option:<name>`
    pub row: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub original_bytes: u64,
    pub new_bytes: u64,
    pub compression_ratio: f64,
    pub resized: bool,
    pub files_converted: usize,
    pub rows_changed: usize,
    pub replacements: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiffReport {
    pub item_id: MediaId,
    pub timestamp: String,
    pub posts: Vec<PostChange>,
    pub meta: Vec<MetaChange>,
    pub options: Vec<OptionChange>,
    pub errors: Vec<RowError>,
    /// Old → new pairs the rewrite used.
    pub map: Vec<(String, String)>,
    pub previous_mime: Option<String>,
    pub previous_meta: Option<MediaMeta>,
    pub new_meta: Option<MediaMeta>,
    pub encode: Option<EncodeStats>,
    pub statistics: Statistics,
}

impl DiffReport {
    pub fn new(item_id: MediaId, map: &UrlMap) -> Self {
        Self {
            item_id,
            timestamp: chrono::Utc::now().format(TIMESTAMP_FORMAT).to_string(),
            map: map.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            ..Default::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn rows_changed(&self) -> usize {
        self.posts.len() + self.meta.len() + self.options.len()
    }

    pub fn replacements(&self) -> usize {
        self.posts.iter().map(|p| p.count).sum::<usize>()
            + self.meta.iter().map(|m| m.count).sum::<usize>()
            + self.options.iter().map(|o| o.count).sum::<usize>()
    }

    /// Rebuild the map recorded at rewrite time.
    pub fn url_map(&self) -> Result<UrlMap> {
        let mut map = UrlMap::new();
        for (old, new) in &self.map {
            map.insert(old.clone(), new.clone())?;
        }
        Ok(map)
    }

    pub fn save(&self, store: &dyn ContentStore) -> Result<()> {
        let json = serde_json::to_string(self)?;
        store.set_item_meta(self.item_id, META_REPORT, &json)
    }

    pub fn load(store: &dyn ContentStore, item_id: MediaId) -> Result<Option<Self>> {
        match store.get_item_meta(item_id, META_REPORT)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
