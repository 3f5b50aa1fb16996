// Media Migrator Constants
// Key names and on-disk layout are persisted; changing them orphans existing state.

// Options (global kv) keys
pub const KEY_PREFIX: &str = "migrator:";
pub const SETTINGS_KEY: &str = "migrator:settings";
pub const BATCH_STATE_KEY: &str = "migrator:batch_state";
pub const LOCK_KEY: &str = "migrator:lock";
pub const LOG_KEY: &str = "migrator:log";

// Per-item metadata keys
pub const META_STATUS: &str = "migrator:status";
pub const META_BACKUP: &str = "migrator:backup_dir";
pub const META_REPORT: &str = "migrator:report";

// Upload directory layout
pub const BACKUP_FOLDER: &str = "migrator-backup";
pub const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
pub const TEMP_FILE_PREFIX: &str = ".migrator_tmp_";

// Settings defaults and bounds
pub const DEFAULT_QUALITY: u8 = 75;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const MAX_BATCH_SIZE: usize = 500;

// Scheduler
pub const LOCK_LEASE_SECONDS: i64 = 300; // 5 minutes
pub const DEFAULT_TICK_BUDGET_SECONDS: u64 = 0; // 0 = no budget

// Rewriter
pub const REWRITE_PAGE_SIZE: usize = 200;
/// Deepest container or payload nesting decoded; deeper values stay plain strings.
pub const MAX_PAYLOAD_DEPTH: usize = 128; // serde_json's own recursion limit

// Logger
pub const LOG_RING_CAPACITY: usize = 500;
pub const LOG_KV_PERSIST_LIMIT: usize = 200;

// Timestamps stored in state
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

