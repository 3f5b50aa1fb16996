// Media Migrator - Library Entry Point
//
// Converts a content store's raster images to WebP/AVIF, relinks every
// reference (plain text and nested serialized payloads), and keeps the
// originals in quarantine until the operator commits or rolls back.

pub mod constants;
pub mod error;
pub mod db;
pub mod store;
pub mod logger;
pub mod settings;
pub mod encoder;
pub mod urlmap;
pub mod replace;
pub mod report;
pub mod rewriter;
pub mod vault;
pub mod scanner;
pub mod context;
pub mod fsm;
pub mod lock;
pub mod scheduler;
pub mod controller;

#[cfg(test)]
mod testutil;

pub use context::Context;
pub use controller::{CommitSummary, Controller, StatusReport};
pub use error::{MigratorError, Result};
pub use fsm::{ItemOutcome, ItemStatus};
pub use scheduler::{BatchScheduler, BatchState, MigrationObserver, RunStatus};
pub use settings::{Settings, SettingsOverride, TargetFormat};
pub use store::{ContentStore, MediaId, MediaItem, MediaMeta, UploadDir};
