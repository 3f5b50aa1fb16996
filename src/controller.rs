// Controller: the operations the CLI (or any host UI) calls
//
// Owns the store, encoder, upload directory and logger, and builds a
// `Context` for each call. Holds the lock token between ticks of a run it
// started itself.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::constants::{META_STATUS, SETTINGS_KEY};
use crate::context::Context;
use crate::encoder::Encoder;
use crate::error::{MigratorError, Result};
use crate::fsm::{self, ItemStatus};
use crate::lock::{self, LockToken};
use crate::logger::{LogRecord, Logger};
use crate::report::DiffReport;
use crate::scanner::MediaScanner;
use crate::scheduler::{BatchScheduler, BatchState, MigrationObserver, RunStatus, TickSummary};
use crate::settings::{Settings, SettingsOverride};
use crate::store::{ContentStore, MediaId, UploadDir};

const STATUS_LOG_TAIL: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: BatchState,
    /// Item count per status name.
    pub counts: BTreeMap<String, usize>,
    /// Eligible items the scanner has not reached yet.
    pub remaining: usize,
    pub lock: Option<LockToken>,
    pub recent_log: Vec<LogRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitSummary {
    pub committed: Vec<MediaId>,
    pub failed: Vec<(MediaId, String)>,
}

pub struct Controller {
    store: Box<dyn ContentStore>,
    encoder: Box<dyn Encoder>,
    uploads: UploadDir,
    logger: Logger,
    observers: Vec<Box<dyn MigrationObserver>>,
    token: Option<LockToken>,
}

impl Controller {
    pub fn new(store: Box<dyn ContentStore>, encoder: Box<dyn Encoder>, uploads: UploadDir, logger: Logger) -> Self {
        Self {
            store,
            encoder,
            uploads,
            logger,
            observers: Vec::new(),
            token: None,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn MigrationObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn store(&self) -> &dyn ContentStore {
        self.store.as_ref()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn uploads(&self) -> &UploadDir {
        &self.uploads
    }

    fn context(&self, settings: Settings) -> Context<'_> {
        Context::new(self.store.as_ref(), self.encoder.as_ref(), &self.uploads, &self.logger, settings)
    }

    /// Refuse operations that must not interleave with another process's run.
    fn ensure_not_running(&self) -> Result<()> {
        if let Some(holder) = lock::live_holder(self.store())? {
            let ours = self.token.as_ref().map(|t| t.run_token.as_str());
            if ours != Some(holder.run_token.as_str()) {
                return Err(MigratorError::Running);
            }
        }
        Ok(())
    }

    /// Create default settings if none are stored yet.
    pub fn init(&self) -> Result<Settings> {
        if self.store.kv_get(SETTINGS_KEY)?.is_none() {
            Settings::default().save(self.store())?;
            self.logger.info("init", None, "default settings written");
        }
        self.settings()
    }

    pub fn settings(&self) -> Result<Settings> {
        Settings::load(self.store())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        settings.save(self.store())
    }

    /// Start (or resume) a batch with the stored settings plus `overrides`.
    pub fn start(&mut self, overrides: Option<&SettingsOverride>) -> Result<BatchState> {
        let base = self.settings()?;
        let settings = overrides.map(|o| o.apply(&base)).unwrap_or(base);
        let token = {
            let scheduler = BatchScheduler::start(self.context(settings), &self.observers)?;
            scheduler.token().clone()
        };
        self.token = Some(token);
        BatchState::load(self.store())
    }

    /// Advance the running batch by one tick. Without a lock of our own the
    /// lock is taken here, so ticks can come from a fresh process.
    pub fn tick(&mut self) -> Result<TickSummary> {
        let state = BatchState::load(self.store())?;
        let token = match self.token.take() {
            Some(token) => token,
            None if state.status.is_active() => lock::acquire(self.store())?,
            None => return Ok(TickSummary { outcomes: Vec::new(), state }),
        };

        let (result, token) = {
            let mut scheduler = BatchScheduler::attach(self.context(state.options.clone()), &self.observers, token);
            let result = scheduler.tick();
            (result, scheduler.token().clone())
        };

        match &result {
            Ok(summary) if summary.state.status.is_active() => self.token = Some(token),
            Ok(_) => {}
            Err(_) => {
                let _ = lock::release(self.store(), &token);
            }
        }
        result
    }

    /// Tick until the batch is stopped or complete.
    pub fn run_to_completion(&mut self) -> Result<BatchState> {
        loop {
            let summary = self.tick()?;
            if !summary.state.status.is_active() {
                return Ok(summary.state);
            }
        }
    }

    pub fn stop(&self) -> Result<BatchState> {
        let state = BatchState::request_stop(self.store())?;
        self.logger.info("stop_requested", None, format!("batch is {}", state.status.as_str()));
        Ok(state)
    }

    pub fn status(&self) -> Result<StatusReport> {
        let state = BatchState::load(self.store())?;

        let mut counts = BTreeMap::new();
        for (_, raw) in self.store.list_item_meta_by_key(META_STATUS)? {
            *counts.entry(raw).or_insert(0) += 1;
        }

        let settings = if state.status.is_active() { state.options.clone() } else { self.settings()? };
        let remaining = MediaScanner::new(self.store(), &settings).count_eligible(state.cursor)?;

        let mut recent_log = Logger::load_persisted(self.store())?;
        let skip = recent_log.len().saturating_sub(STATUS_LOG_TAIL);
        recent_log.drain(..skip);

        Ok(StatusReport {
            state,
            counts,
            remaining,
            lock: lock::current(self.store())?,
            recent_log,
        })
    }

    pub fn item_status(&self, item_id: MediaId) -> Result<ItemStatus> {
        Ok(ItemStatus::load(self.store(), item_id)?.unwrap_or(ItemStatus::Pending))
    }

    pub fn report(&self, item_id: MediaId) -> Result<Option<DiffReport>> {
        DiffReport::load(self.store(), item_id)
    }

    pub fn commit(&self, item_id: MediaId) -> Result<ItemStatus> {
        let status = fsm::commit_item(&self.context(self.settings()?), item_id)?;
        self.flush_log();
        Ok(status)
    }

    /// Commit every quarantined item. Failures are collected, not fatal.
    pub fn commit_all(&self) -> Result<CommitSummary> {
        let ctx = self.context(self.settings()?);
        let mut summary = CommitSummary::default();
        for (item_id, raw) in self.store.list_item_meta_by_key(META_STATUS)? {
            if raw != ItemStatus::Quarantined.as_str() {
                continue;
            }
            match fsm::commit_item(&ctx, item_id) {
                Ok(_) => summary.committed.push(item_id),
                Err(MigratorError::Database(e)) => return Err(MigratorError::Database(e)),
                Err(e) => summary.failed.push((item_id, e.to_string())),
            }
        }
        self.logger.info(
            "commit_all",
            None,
            format!("{} committed, {} failed", summary.committed.len(), summary.failed.len()),
        );
        self.flush_log();
        Ok(summary)
    }

    pub fn rollback(&self, item_id: MediaId) -> Result<ItemStatus> {
        self.ensure_not_running()?;
        let result = fsm::rollback_item(&self.context(self.settings()?), item_id);
        if let Err(e) = &result {
            self.logger.error("rollback_failed", Some(item_id), e.to_string());
        }
        self.flush_log();
        result
    }

    /// Send a failed item back to `pending` and queue it for the next tick.
    pub fn retry(&self, item_id: MediaId) -> Result<BatchState> {
        self.ensure_not_running()?;
        fsm::retry_item(&self.context(self.settings()?), item_id)?;
        let mut state = BatchState::load(self.store())?;
        if !state.requeued.contains(&item_id) {
            state.requeued.push(item_id);
        }
        state.failed.retain(|f| *f != item_id);
        state.save(self.store())?;
        self.flush_log();
        Ok(state)
    }

    /// Forget the batch: state, cursor and any stale lock. Item statuses,
    /// reports and backups are kept. A batch still marked running must be
    /// stopped first; a crashed run is cleared with `stop` then `clear`.
    pub fn clear(&mut self) -> Result<()> {
        if self.token.is_some() || BatchState::load(self.store())?.status == RunStatus::Running {
            return Err(MigratorError::Running);
        }
        self.ensure_not_running()?;
        BatchState::clear(self.store())?;
        if let Some(stale) = lock::current(self.store())? {
            lock::release(self.store(), &stale)?;
        }
        self.logger.info("clear", None, "batch state cleared");
        self.flush_log();
        Ok(())
    }

    fn flush_log(&self) {
        if let Err(e) = self.logger.flush_to_store(self.store()) {
            log::warn!("Could not persist migration log: {}", e);
        }
    }
}
