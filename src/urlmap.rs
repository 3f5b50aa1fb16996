// URL map: old → new URLs and filesystem paths for one media item

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MigratorError, Result};
use crate::store::{MediaMeta, UploadDir};

/// Exact-string bijection from old references to new ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlMap {
    entries: BTreeMap<String, String>,
}

impl UrlMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Re-adding an identical pair is a no-op; anything that
    /// would break the bijection is refused.
    pub fn insert(&mut self, old: impl Into<String>, new: impl Into<String>) -> Result<()> {
        let old = old.into();
        let new = new.into();

        if old.is_empty() || new.is_empty() {
            return Err(MigratorError::MapBuildFailed("empty map entry".to_string()));
        }
        if old == new {
            return Err(MigratorError::MapBuildFailed(format!("'{}' maps to itself", old)));
        }
        if let Some(existing) = self.entries.get(&old) {
            if *existing == new {
                return Ok(());
            }
            return Err(MigratorError::MapBuildFailed(format!(
                "'{}' maps to both '{}' and '{}'",
                old, existing, new
            )));
        }
        if let Some((other, _)) = self.entries.iter().find(|(_, v)| **v == new) {
            return Err(MigratorError::MapBuildFailed(format!(
                "'{}' and '{}' both map to '{}'",
                other, old, new
            )));
        }
        if self.entries.contains_key(&new) {
            return Err(MigratorError::MapBuildFailed(format!("'{}' is both a source and a target", new)));
        }
        if self.entries.values().any(|v| *v == old) {
            return Err(MigratorError::MapBuildFailed(format!("'{}' is both a source and a target", old)));
        }

        self.entries.insert(old, new);
        Ok(())
    }

    pub fn get(&self, old: &str) -> Option<&str> {
        self.entries.get(old).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Old strings, for store pre-filters.
    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Keys ordered longest first; ties broken lexically so the order is stable.
    pub fn keys_longest_first(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        keys
    }

    /// The same map pointing backwards.
    pub fn inverse(&self) -> UrlMap {
        UrlMap {
            entries: self.entries.iter().map(|(k, v)| (v.clone(), k.clone())).collect(),
        }
    }
}

/// Build the map for one item from its metadata before and after conversion.
///
/// Covers the master and every size name present on both sides, each as a
/// public URL and as an absolute filesystem path.
pub fn build(uploads: &UploadDir, old: &MediaMeta, new: &MediaMeta) -> Result<UrlMap> {
    if old.file.is_empty() || new.file.is_empty() {
        return Err(MigratorError::MapBuildFailed("metadata has no file".to_string()));
    }

    let mut map = UrlMap::new();
    let mut add = |old_rel: &str, new_rel: &str| -> Result<()> {
        map.insert(uploads.url_for(old_rel), uploads.url_for(new_rel))?;
        map.insert(uploads.fs_path_for(old_rel), uploads.fs_path_for(new_rel))
    };

    add(&old.file, &new.file)?;

    for (name, old_variant) in &old.sizes {
        let Some(new_variant) = new.sizes.get(name) else {
            continue;
        };
        add(&old.variant_path(old_variant), &new.variant_path(new_variant))?;
    }

    Ok(map)
}
