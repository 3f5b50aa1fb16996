// Migration settings
// Persisted as JSON under `migrator:settings` in the options table.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_BATCH_SIZE, DEFAULT_QUALITY, DEFAULT_TICK_BUDGET_SECONDS, MAX_BATCH_SIZE, SETTINGS_KEY};
use crate::error::{MigratorError, Result};
use crate::store::ContentStore;

/// Output format of the conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    #[default]
    Webp,
    Avif,
}

impl TargetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Webp => "webp",
            TargetFormat::Avif => "avif",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            TargetFormat::Webp => "image/webp",
            TargetFormat::Avif => "image/avif",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "webp" => Some(TargetFormat::Webp),
            "avif" => Some(TargetFormat::Avif),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub quality: u8,
    pub batch_size: usize,
    /// Two-phase mode: quarantine originals until an explicit commit.
    pub validate: bool,
    /// With `validate`, commit each item as soon as it succeeds.
    pub auto_commit: bool,
    pub skip_folders: Vec<String>,
    pub skip_mimes: BTreeSet<String>,
    pub skip_animated: bool,
    pub preserve_dimensions: bool,
    /// 0 = unlimited
    pub max_width: u32,
    /// 0 = unlimited
    pub max_height: u32,
    pub target_format: TargetFormat,
    /// Wall-time budget per tick in seconds; 0 disables pacing.
    pub tick_budget_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            quality: DEFAULT_QUALITY,
            batch_size: DEFAULT_BATCH_SIZE,
            validate: true,
            auto_commit: false,
            skip_folders: Vec::new(),
            skip_mimes: BTreeSet::new(),
            skip_animated: true,
            preserve_dimensions: true,
            max_width: 0,
            max_height: 0,
            target_format: TargetFormat::Webp,
            tick_budget_secs: DEFAULT_TICK_BUDGET_SECONDS,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.quality) {
            return Err(MigratorError::InvalidSettings(format!(
                "quality must be 1..100, got {}",
                self.quality
            )));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(MigratorError::InvalidSettings(format!(
                "batch_size must be 1..{}, got {}",
                MAX_BATCH_SIZE, self.batch_size
            )));
        }
        if self.skip_folders.iter().any(|f| f.trim_matches('/').is_empty()) {
            return Err(MigratorError::InvalidSettings(
                "skip_folders entries must not be empty".to_string(),
            ));
        }
        if let Some(bad) = self.skip_mimes.iter().find(|m| !m.contains('/')) {
            return Err(MigratorError::InvalidSettings(format!("'{}' is not a MIME type", bad)));
        }
        Ok(())
    }

    /// Load settings from the store, falling back to defaults when unset.
    pub fn load(store: &dyn ContentStore) -> Result<Self> {
        match store.kv_get(SETTINGS_KEY)? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| MigratorError::InvalidSettings(format!("stored settings unreadable: {}", e))),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, store: &dyn ContentStore) -> Result<()> {
        self.validate()?;
        store.kv_set(SETTINGS_KEY, &serde_json::to_string(self)?)
    }
}

/// Per-run overrides applied on top of the stored settings by `start`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsOverride {
    pub quality: Option<u8>,
    pub batch_size: Option<usize>,
    pub validate: Option<bool>,
    pub auto_commit: Option<bool>,
    pub skip_animated: Option<bool>,
    pub preserve_dimensions: Option<bool>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub target_format: Option<TargetFormat>,
}

impl SettingsOverride {
    pub fn apply(&self, base: &Settings) -> Settings {
        let mut s = base.clone();
        if let Some(v) = self.quality {
            s.quality = v;
        }
        if let Some(v) = self.batch_size {
            s.batch_size = v;
        }
        if let Some(v) = self.validate {
            s.validate = v;
        }
        if let Some(v) = self.auto_commit {
            s.auto_commit = v;
        }
        if let Some(v) = self.skip_animated {
            s.skip_animated = v;
        }
        if let Some(v) = self.preserve_dimensions {
            s.preserve_dimensions = v;
        }
        if let Some(v) = self.max_width {
            s.max_width = v;
        }
        if let Some(v) = self.max_height {
            s.max_height = v;
        }
        if let Some(v) = self.target_format {
            s.target_format = v;
        }
        s
    }
}
