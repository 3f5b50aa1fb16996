// Scheduler tests: batching, stop, resume, single-writer

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use super::*;
use crate::constants::LOCK_KEY;
use crate::db::SqliteStore;
use crate::error::MigratorError;
use crate::fsm::ItemStatus;
use crate::logger::Logger;
use crate::testutil::{FakeEncoder, Faults, FaultyStore, Fixture, StopAt};

struct Harness {
    fx: Fixture,
    store: SqliteStore,
    encoder: FakeEncoder,
    logger: Logger,
}

impl Harness {
    fn new() -> Self {
        let fx = Fixture::new();
        let store = fx.store();
        Self { fx, store, encoder: FakeEncoder::default(), logger: Logger::default() }
    }

    fn ctx(&self, settings: Settings) -> Context<'_> {
        Context::new(&self.store, &self.encoder, &self.fx.uploads, &self.logger, settings)
    }

    fn add_images(&self, n: usize) -> Vec<MediaId> {
        (0..n)
            .map(|i| self.fx.add_image(&format!("2024/01/pic{}.jpg", i), 800, 600, &[]))
            .collect()
    }

    fn status(&self, id: MediaId) -> Option<ItemStatus> {
        ItemStatus::load(&self.store, id).unwrap()
    }
}

fn settings(batch_size: usize) -> Settings {
    Settings { batch_size, ..Settings::default() }
}

fn no_observers() -> Vec<Box<dyn MigrationObserver>> {
    Vec::new()
}

/// Records callback order and what the store held at `on_item_end`.
struct Recorder {
    db_path: PathBuf,
    events: Rc<RefCell<Vec<String>>>,
}

impl MigrationObserver for Recorder {
    fn on_item_start(&self, item: &MediaItem) {
        self.events.borrow_mut().push(format!("start:{}", item.id));
    }

    fn on_item_end(&self, item: &MediaItem, outcome: &ItemOutcome) {
        let other = SqliteStore::open(&self.db_path).unwrap();
        let persisted = BatchState::load(&other).unwrap().processed.contains(&item.id);
        self.events
            .borrow_mut()
            .push(format!("end:{}:{}:{}", item.id, outcome.status, persisted));
    }

    fn on_progress(&self, state: &BatchState) {
        self.events.borrow_mut().push(format!("progress:{}", state.processed.len()));
    }
}

#[test]
fn test_tick_respects_batch_size() {
    let h = Harness::new();
    let ids = h.add_images(5);
    let observers = no_observers();

    let mut scheduler = BatchScheduler::start(h.ctx(settings(2)), &observers).unwrap();
    let summary = scheduler.tick().unwrap();
    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(summary.state.status, RunStatus::Running);
    assert_eq!(summary.state.cursor, Some(ids[1]));
    assert_eq!(summary.state.total, 5);
    assert_eq!(h.status(ids[2]), None);

    let state = scheduler.run_to_completion().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.processed, ids);
    assert!(state.failed.is_empty());
    assert!(state.finished_at.is_some());
    for id in ids {
        assert_eq!(h.status(id), Some(ItemStatus::Quarantined));
    }
    // Lock is given back once the batch is done
    assert!(lock::current(&h.store).unwrap().is_none());
}

#[test]
fn test_observer_order() {
    let h = Harness::new();
    let ids = h.add_images(2);
    let events = Rc::new(RefCell::new(Vec::new()));
    let observers: Vec<Box<dyn MigrationObserver>> =
        vec![Box::new(Recorder { db_path: h.fx.db_path.clone(), events: events.clone() })];

    BatchScheduler::start(h.ctx(settings(5)), &observers)
        .unwrap()
        .run_to_completion()
        .unwrap();

    let expected = vec![
        format!("start:{}", ids[0]),
        format!("end:{}:quarantined:true", ids[0]),
        "progress:1".to_string(),
        format!("start:{}", ids[1]),
        format!("end:{}:quarantined:true", ids[1]),
        "progress:2".to_string(),
    ];
    assert_eq!(*events.borrow(), expected);
}

#[test]
fn test_second_start_is_refused() {
    let h = Harness::new();
    h.add_images(2);
    let observers = no_observers();

    let mut first = BatchScheduler::start(h.ctx(settings(1)), &observers).unwrap();
    let second = BatchScheduler::start(h.ctx(settings(1)), &observers);
    assert!(matches!(second, Err(MigratorError::ConcurrentActivation(_))));

    // The first run is unaffected
    let summary = first.tick().unwrap();
    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(summary.state.status, RunStatus::Running);
    first.release().unwrap();
}

#[test]
fn test_stop_finishes_in_flight_item_then_resumes() {
    let h = Harness::new();
    let ids = h.add_images(3);
    let stopper: Vec<Box<dyn MigrationObserver>> =
        vec![Box::new(StopAt { db_path: h.fx.db_path.clone(), item: ids[1] })];

    let mut scheduler = BatchScheduler::start(h.ctx(settings(3)), &stopper).unwrap();
    let summary = scheduler.tick().unwrap();

    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(summary.state.status, RunStatus::Stopped);
    assert_eq!(h.status(ids[0]), Some(ItemStatus::Quarantined));
    assert_eq!(h.status(ids[1]), Some(ItemStatus::Quarantined));
    assert_eq!(h.status(ids[2]), None);
    assert!(lock::current(&h.store).unwrap().is_none());

    let observers = no_observers();
    let mut resumed = BatchScheduler::start(h.ctx(settings(3)), &observers).unwrap();
    let summary = resumed.tick().unwrap();
    let handled: Vec<MediaId> = summary.outcomes.iter().map(|o| o.item_id).collect();
    assert_eq!(handled, vec![ids[2]]);
    assert_eq!(summary.state.status, RunStatus::Completed);
    assert_eq!(summary.state.processed, ids);
}

#[test]
fn test_stop_before_tick_processes_nothing() {
    let h = Harness::new();
    let ids = h.add_images(2);
    let observers = no_observers();

    let mut scheduler = BatchScheduler::start(h.ctx(settings(5)), &observers).unwrap();
    BatchState::request_stop(&h.fx.store()).unwrap();
    let summary = scheduler.tick().unwrap();

    assert!(summary.outcomes.is_empty());
    assert_eq!(summary.state.status, RunStatus::Stopped);
    assert_eq!(h.status(ids[0]), None);
}

#[test]
fn test_crashed_run_resumes_after_lease_expiry() {
    let h = Harness::new();
    let ids = h.add_images(3);
    let observers = no_observers();

    {
        let mut crashed = BatchScheduler::start(h.ctx(settings(1)), &observers).unwrap();
        crashed.tick().unwrap();
        // Dropped without release: the lock stays behind
    }
    assert!(matches!(
        BatchScheduler::start(h.ctx(settings(1)), &observers),
        Err(MigratorError::ConcurrentActivation(_))
    ));

    let mut stale = lock::current(&h.store).unwrap().unwrap();
    stale.lease_expires_at = "2000-01-01T00:00:00Z".to_string();
    h.store.kv_set(LOCK_KEY, &serde_json::to_string(&stale).unwrap()).unwrap();

    let state = BatchScheduler::start(h.ctx(settings(5)), &observers)
        .unwrap()
        .run_to_completion()
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.processed, ids);
    // The first item was not processed twice
    assert_eq!(h.logger.records_for(ids[0]).iter().filter(|r| r.event == "converted").count(), 1);
}

#[test]
fn test_failed_items_are_recorded_and_batch_continues() {
    let fx = Fixture::new();
    let store = fx.store();
    let encoder = FakeEncoder::failing_on("pic1.jpg");
    let logger = Logger::default();
    let ids: Vec<MediaId> = (0..3)
        .map(|i| fx.add_image(&format!("2024/01/pic{}.jpg", i), 800, 600, &[]))
        .collect();
    let observers = no_observers();

    let ctx = Context::new(&store, &encoder, &fx.uploads, &logger, settings(5));
    let state = BatchScheduler::start(ctx, &observers).unwrap().run_to_completion().unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.failed, vec![ids[1]]);
    assert_eq!(ItemStatus::load(&store, ids[1]).unwrap(), Some(ItemStatus::ConvertFailed));
    assert_eq!(ItemStatus::load(&store, ids[2]).unwrap(), Some(ItemStatus::Quarantined));
}

#[test]
fn test_tick_budget_stops_early() {
    struct Slow;
    impl MigrationObserver for Slow {
        fn on_item_end(&self, _item: &MediaItem, _outcome: &ItemOutcome) {
            std::thread::sleep(Duration::from_millis(1100));
        }
    }

    let h = Harness::new();
    h.add_images(3);
    let observers: Vec<Box<dyn MigrationObserver>> = vec![Box::new(Slow)];
    let budgeted = Settings { tick_budget_secs: 1, ..settings(3) };

    let mut scheduler = BatchScheduler::start(h.ctx(budgeted), &observers).unwrap();
    let summary = scheduler.tick().unwrap();
    assert_eq!(summary.outcomes.len(), 1);
    assert_eq!(summary.state.status, RunStatus::Running);
    scheduler.release().unwrap();
}

#[test]
fn test_cleared_state_starts_over() {
    let h = Harness::new();
    h.add_images(1);
    let observers = no_observers();

    let state = BatchScheduler::start(h.ctx(settings(5)), &observers)
        .unwrap()
        .run_to_completion()
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);

    BatchState::clear(&h.store).unwrap();
    let fresh = BatchState::load(&h.store).unwrap();
    assert_eq!(fresh.status, RunStatus::Idle);
    assert_eq!(fresh.cursor, None);
}

#[test]
fn test_invalid_settings_take_no_lock() {
    let h = Harness::new();
    let observers = no_observers();
    let bad = Settings { quality: 0, ..Settings::default() };
    assert!(matches!(
        BatchScheduler::start(h.ctx(bad), &observers),
        Err(MigratorError::InvalidSettings(_))
    ));
    assert!(lock::current(&h.store).unwrap().is_none());
}

#[test]
fn test_item_interrupted_mid_pipeline_is_finished_on_resume() {
    let h = Harness::new();
    let ids = h.add_images(3);
    let observers = no_observers();

    {
        let mut crashed = BatchScheduler::start(h.ctx(settings(1)), &observers).unwrap();
        crashed.tick().unwrap();
    }
    // Died right after converting the second item
    ItemStatus::Converted.save(&h.store, ids[1]).unwrap();
    let mut stale = lock::current(&h.store).unwrap().unwrap();
    stale.lease_expires_at = "2000-01-01T00:00:00Z".to_string();
    h.store.kv_set(LOCK_KEY, &serde_json::to_string(&stale).unwrap()).unwrap();

    let state = BatchScheduler::start(h.ctx(settings(5)), &observers)
        .unwrap()
        .run_to_completion()
        .unwrap();
    assert_eq!(state.processed, ids);
    assert!(state.failed.is_empty());
    for id in &ids {
        assert_eq!(h.status(*id), Some(ItemStatus::Quarantined));
    }
    assert!(h.logger.records_for(ids[1]).iter().any(|r| r.event == "resume"));
}

#[test]
fn test_stop_written_during_save_is_kept() {
    let faults = Faults::default();
    let store = FaultyStore { inner: SqliteStore::open_in_memory().unwrap(), faults: faults.clone() };
    let mut state = BatchState { status: RunStatus::Running, ..Default::default() };
    state.save(&store).unwrap();

    faults.before_next_swap(|other| {
        BatchState::request_stop(other).unwrap();
    });
    state.cursor = Some(3);
    state.save_keeping_stop(&store).unwrap();

    let stored = BatchState::load(&store).unwrap();
    assert_eq!(stored.status, RunStatus::StopRequested);
    assert_eq!(stored.cursor, Some(3));
    assert_eq!(state.status, RunStatus::StopRequested);
}
