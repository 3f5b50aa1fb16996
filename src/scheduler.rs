// Batch scheduler
//
// Cooperative, resumable driver. Each tick advances up to `batch_size`
// items, persisting the batch state after every item so a crash loses at
// most the item in flight. Stop requests are read back from the store at
// each item boundary, so `migrator stop` from another process is honoured.

use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::constants::{BATCH_STATE_KEY, TIMESTAMP_FORMAT};
use crate::context::Context;
use crate::error::Result;
use crate::fsm::{self, ItemOutcome};
use crate::lock::{self, LockToken};
use crate::scanner::MediaScanner;
use crate::settings::Settings;
use crate::store::{ContentStore, MediaId, MediaItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    StopRequested,
    Stopped,
    Completed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::StopRequested => "stop_requested",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
        }
    }

    /// A run that has been started and not yet finished.
    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::StopRequested)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchState {
    /// Highest item id handed out by the scanner. Never decreases.
    pub cursor: Option<MediaId>,
    pub total: usize,
    pub processed: Vec<MediaId>,
    pub failed: Vec<MediaId>,
    pub status: RunStatus,
    pub started_at: Option<String>,
    pub options: Settings,
    /// Items sent back by `retry`, handled before the scanner moves on.
    pub requeued: Vec<MediaId>,
    pub finished_at: Option<String>,
    pub last_tick_at: Option<String>,
    pub ticks: u64,
}

impl BatchState {
    pub fn load(store: &dyn ContentStore) -> Result<Self> {
        match store.kv_get(BATCH_STATE_KEY)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, store: &dyn ContentStore) -> Result<()> {
        store.kv_set(BATCH_STATE_KEY, &serde_json::to_string(self)?)
    }

    pub fn clear(store: &dyn ContentStore) -> Result<()> {
        store.kv_del(BATCH_STATE_KEY)
    }

    /// Ask a running batch to stop at the next item boundary.
    pub fn request_stop(store: &dyn ContentStore) -> Result<Self> {
        loop {
            let current = store.kv_get(BATCH_STATE_KEY)?;
            let mut state: Self = match &current {
                Some(raw) => serde_json::from_str(raw)?,
                None => Self::default(),
            };
            if state.status != RunStatus::Running {
                return Ok(state);
            }
            state.status = RunStatus::StopRequested;
            if store.kv_swap(BATCH_STATE_KEY, current.as_deref(), &serde_json::to_string(&state)?)? {
                return Ok(state);
            }
        }
    }

    /// Save over whatever is stored, unless a stop request landed since it
    /// was read: then the request is merged in and the write retried.
    pub fn save_keeping_stop(&mut self, store: &dyn ContentStore) -> Result<()> {
        loop {
            let current = store.kv_get(BATCH_STATE_KEY)?;
            if self.status == RunStatus::Running {
                if let Some(raw) = &current {
                    let stored: Self = serde_json::from_str(raw)?;
                    if stored.status == RunStatus::StopRequested {
                        self.status = RunStatus::StopRequested;
                    }
                }
            }
            if store.kv_swap(BATCH_STATE_KEY, current.as_deref(), &serde_json::to_string(self)?)? {
                return Ok(());
            }
        }
    }

    fn stop_requested_in(store: &dyn ContentStore) -> Result<bool> {
        Ok(Self::load(store)?.status == RunStatus::StopRequested)
    }

    fn record(&mut self, outcome: &ItemOutcome) {
        let id = outcome.item_id;
        if !self.processed.contains(&id) {
            self.processed.push(id);
        }
        if outcome.error.is_some() {
            if !self.failed.contains(&id) {
                self.failed.push(id);
            }
        } else {
            self.failed.retain(|f| *f != id);
        }
    }
}

/// Callbacks around item processing, invoked synchronously in this order:
/// `on_item_start`, item processing, batch state persisted, `on_item_end`,
/// `on_progress`.
pub trait MigrationObserver {
    fn on_item_start(&self, _item: &MediaItem) {}
    fn on_item_end(&self, _item: &MediaItem, _outcome: &ItemOutcome) {}
    fn on_progress(&self, _state: &BatchState) {}
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickSummary {
    pub outcomes: Vec<ItemOutcome>,
    pub state: BatchState,
}

fn init_state(ctx: &Context) -> Result<BatchState> {
    let mut state = BatchState::load(ctx.store)?;
    let now = Utc::now().format(TIMESTAMP_FORMAT).to_string();
    if state.status == RunStatus::Idle {
        state = BatchState { started_at: Some(now), ..BatchState::default() };
    } else if state.started_at.is_none() {
        state.started_at = Some(now);
    }
    state.status = RunStatus::Running;
    state.finished_at = None;
    state.options = ctx.settings.clone();

    let scanner = MediaScanner::new(ctx.store, &ctx.settings);
    let requeued_new = state.requeued.iter().filter(|id| !state.processed.contains(id)).count();
    state.total = state.processed.len() + requeued_new + scanner.count_eligible(state.cursor)?;
    state.save(ctx.store)?;
    Ok(state)
}

pub struct BatchScheduler<'a> {
    ctx: Context<'a>,
    observers: &'a [Box<dyn MigrationObserver>],
    token: LockToken,
}

impl<'a> BatchScheduler<'a> {
    /// Take the single-writer lock and mark the batch running. A batch that
    /// was stopped, completed or interrupted resumes from its cursor; only an
    /// idle (never started or cleared) batch starts from the beginning.
    pub fn start(ctx: Context<'a>, observers: &'a [Box<dyn MigrationObserver>]) -> Result<Self> {
        ctx.settings.validate()?;
        let token = lock::acquire(ctx.store)?;

        match init_state(&ctx) {
            Ok(state) => {
                ctx.logger.info(
                    "batch_start",
                    None,
                    format!("run {} started by {} ({} items)", token.run_token, token.owner, state.total),
                );
                Ok(Self { ctx, observers, token })
            }
            Err(e) => {
                let _ = lock::release(ctx.store, &token);
                Err(e)
            }
        }
    }

    /// Continue a running batch with a lock taken elsewhere (e.g. by
    /// `start` in an earlier call on the same controller).
    pub fn attach(ctx: Context<'a>, observers: &'a [Box<dyn MigrationObserver>], token: LockToken) -> Self {
        Self { ctx, observers, token }
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    fn next_item(&self, state: &mut BatchState) -> Result<Option<(MediaItem, bool)>> {
        while !state.requeued.is_empty() {
            let id = state.requeued.remove(0);
            match self.ctx.store.get_media(id)? {
                Some(item) => return Ok(Some((item, true))),
                None => self.ctx.logger.warn("requeued_missing", Some(id), "requeued item no longer exists"),
            }
        }
        let scanner = MediaScanner::new(self.ctx.store, &self.ctx.settings);
        Ok(scanner.next_batch(state.cursor, 1)?.into_iter().next().map(|item| (item, false)))
    }

    fn persist(&self, state: &mut BatchState) -> Result<()> {
        state.last_tick_at = Some(Utc::now().format(TIMESTAMP_FORMAT).to_string());
        state.save_keeping_stop(self.ctx.store)
    }

    fn finish(&self, state: &mut BatchState, status: RunStatus) {
        state.status = status;
        state.finished_at = Some(Utc::now().format(TIMESTAMP_FORMAT).to_string());
        self.ctx.logger.info(
            "batch_end",
            None,
            format!(
                "batch {} ({} processed, {} failed)",
                status.as_str(),
                state.processed.len(),
                state.failed.len()
            ),
        );
    }

    /// Advance up to `batch_size` items. Releases the lock once the batch is
    /// no longer running.
    pub fn tick(&mut self) -> Result<TickSummary> {
        lock::renew(self.ctx.store, &mut self.token)?;
        let mut state = BatchState::load(self.ctx.store)?;
        let mut outcomes = Vec::new();

        if state.status == RunStatus::Running {
            let started = Instant::now();
            let budget = match self.ctx.settings.tick_budget_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            };

            while outcomes.len() < self.ctx.settings.batch_size {
                if BatchState::stop_requested_in(self.ctx.store)? {
                    state.status = RunStatus::StopRequested;
                    break;
                }
                if budget.map_or(false, |b| !outcomes.is_empty() && started.elapsed() >= b) {
                    self.ctx.logger.debug("tick_budget", None, "tick budget exhausted");
                    break;
                }

                let Some((item, requeued)) = self.next_item(&mut state)? else {
                    self.finish(&mut state, RunStatus::Completed);
                    break;
                };

                for observer in self.observers {
                    observer.on_item_start(&item);
                }
                let outcome = match fsm::process_item(&self.ctx, &item) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // Store failure: keep the cursor where it was and surface it
                        if requeued {
                            state.requeued.insert(0, item.id);
                        }
                        self.ctx.logger.error("batch_error", Some(item.id), e.to_string());
                        let _ = self.persist(&mut state);
                        let _ = self.ctx.logger.flush_to_store(self.ctx.store);
                        return Err(e);
                    }
                };

                if !requeued {
                    state.cursor = Some(state.cursor.map_or(item.id, |c| c.max(item.id)));
                }
                state.record(&outcome);
                self.persist(&mut state)?;
                lock::renew(self.ctx.store, &mut self.token)?;

                for observer in self.observers {
                    observer.on_item_end(&item, &outcome);
                }
                for observer in self.observers {
                    observer.on_progress(&state);
                }
                outcomes.push(outcome);

                if state.status != RunStatus::Running {
                    break;
                }
            }
        }

        if state.status == RunStatus::StopRequested {
            self.finish(&mut state, RunStatus::Stopped);
        }
        state.ticks += 1;
        self.persist(&mut state)?;
        if state.status == RunStatus::StopRequested {
            // Stop arrived while persisting
            self.finish(&mut state, RunStatus::Stopped);
            state.save(self.ctx.store)?;
        }
        if !state.status.is_active() {
            lock::release(self.ctx.store, &self.token)?;
        }
        if let Err(e) = self.ctx.logger.flush_to_store(self.ctx.store) {
            log::warn!("Could not persist migration log: {}", e);
        }

        Ok(TickSummary { outcomes, state })
    }

    /// Tick until the batch stops or completes.
    pub fn run_to_completion(mut self) -> Result<BatchState> {
        loop {
            let summary = self.tick()?;
            if !summary.state.status.is_active() {
                return Ok(summary.state);
            }
        }
    }

    /// Give up the lock without touching the batch state.
    pub fn release(self) -> Result<()> {
        lock::release(self.ctx.store, &self.token)
    }
}

#[cfg(test)]
mod tests;
