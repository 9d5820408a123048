//! Cycle state machine
//!
//! ```text
//!   pending ──open_if_due──► open ──close_if_filled──► closed
//!                              ▲                          │
//!                              └───── open_next ◄─────────┘
//! ```
//!
//! At most one cycle is open at any time. The store refuses any transition
//! that would open a second one; callers here check first so the refusal
//! only surfaces when two transitions race.

use crate::settings::CycleSettings;
use bidloop_core::prelude::*;
use bidloop_economics::UnitProgressionTable;
use bidloop_storage::Store;
use chrono::NaiveTime;
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

/// Work triggered when a cycle fills and closes
pub trait FillHook: Send + Sync {
    fn run_for_filled_cycle(&self, cycle: &Cycle);
}

/// A closed cycle and the cycle opened after it
#[derive(Clone, Debug, PartialEq)]
pub struct Rollover {
    pub closed: Cycle,
    pub next: Option<Cycle>,
}

pub struct CycleManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    progression: UnitProgressionTable,
    settings: CycleSettings,
    schedule: LocalSchedule,
    open_time: NaiveTime,
    /// Serializes cycle creation so two callers never both create one
    creation: Mutex<()>,
    fill_hook: RwLock<Option<Weak<dyn FillHook>>>,
}

impl CycleManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, settings: CycleSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            store,
            clock,
            progression: settings.progression(),
            schedule: settings.schedule(),
            open_time: settings.parsed_open_time()?,
            settings,
            creation: Mutex::new(()),
            fill_hook: RwLock::new(None),
        })
    }

    /// Register the pipeline run when a cycle fills
    pub fn set_fill_hook(&self, hook: Weak<dyn FillHook>) {
        *self.fill_hook.write() = Some(hook);
    }

    pub fn progression(&self) -> &UnitProgressionTable {
        &self.progression
    }

    pub fn schedule(&self) -> LocalSchedule {
        self.schedule
    }

    /// Open cycle, else the latest pending one. Never creates.
    pub fn current_cycle(&self) -> Option<Cycle> {
        self.store.open_cycle().or_else(|| self.store.latest_pending())
    }

    /// Open cycle, else the waiting pending cycle, else a new pending cycle
    pub fn get_or_create_current_cycle(&self) -> Result<Cycle> {
        if let Some(open) = self.store.open_cycle() {
            return Ok(open);
        }
        let _guard = self.creation.lock();
        if let Some(open) = self.store.open_cycle() {
            return Ok(open);
        }
        if let Some(pending) = self.store.latest_pending() {
            return Ok(pending);
        }

        let now = self.clock.now();
        let date = self.schedule.local_date(now);
        let cycle = self.new_cycle(CycleStatus::Pending, self.schedule.at(date, self.open_time));
        let cycle = self.store.insert_cycle(cycle)?;
        info!(
            cycle_id = %cycle.id,
            index = cycle.index,
            capacity = cycle.capacity,
            open_time = %cycle.open_time,
            "Created pending cycle"
        );
        self.store.append_event(SystemEvent::info(
            now,
            EventKind::CycleCreated,
            cycle.id,
            format!("pending cycle #{} with {} units", cycle.index, cycle.capacity),
        ));
        Ok(cycle)
    }

    /// pending → open once the open time has passed
    ///
    /// Returns the opened cycle, or `None` when nothing changed.
    pub fn open_if_due(&self, cycle_id: &CycleId) -> Result<Option<Cycle>> {
        let cycle = self.store.cycle(cycle_id)?;
        let now = self.clock.now();
        if cycle.status != CycleStatus::Pending || now < cycle.open_time {
            return Ok(None);
        }
        if let Some(open) = self.store.open_cycle() {
            debug!(
                cycle_id = %cycle.id,
                open_cycle = %open.id,
                "Pending cycle waits for the open cycle to fill"
            );
            return Ok(None);
        }

        match self.store.open_pending(cycle_id, now) {
            Ok(Some(opened)) => {
                info!(cycle_id = %opened.id, capacity = opened.capacity, "Cycle opened");
                self.store.append_event(SystemEvent::info(
                    now,
                    EventKind::CycleOpened,
                    opened.id,
                    format!("cycle #{} opened on schedule", opened.index),
                ));
                Ok(Some(opened))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(self.violation(cycle_id, e)),
        }
    }

    /// open ∧ filled ≥ capacity → closed, then run the pipeline and roll over
    pub fn close_if_filled(&self, cycle_id: &CycleId) -> Result<Option<Rollover>> {
        let cycle = self.store.cycle(cycle_id)?;
        if !cycle.growth.auto_close_when_filled {
            return Ok(None);
        }
        let now = self.clock.now();
        let Some(closed) = self.store.close_if_filled(cycle_id, now)? else {
            return Ok(None);
        };

        info!(
            cycle_id = %closed.id,
            filled = closed.filled,
            capacity = closed.capacity,
            "Cycle filled and closed"
        );
        self.store.append_event(SystemEvent::info(
            now,
            EventKind::CycleClosed,
            closed.id,
            format!("cycle #{} closed at {}/{}", closed.index, closed.filled, closed.capacity),
        ));

        let hook = self.fill_hook.read().as_ref().and_then(Weak::upgrade);
        match hook {
            Some(hook) => hook.run_for_filled_cycle(&closed),
            None => warn!(cycle_id = %closed.id, "No distribution pipeline registered"),
        }

        let next = match self.open_next() {
            Ok(next) => Some(next),
            Err(e) => {
                error!(cycle_id = %closed.id, error = %e, "Rollover failed");
                None
            }
        };
        Ok(Some(Rollover { closed, next }))
    }

    /// Open the next cycle right away
    ///
    /// No-op returning the open cycle if one exists. A waiting pending cycle
    /// is promoted; otherwise a new cycle at the next index is created open.
    pub fn open_next(&self) -> Result<Cycle> {
        let _guard = self.creation.lock();
        if let Some(open) = self.store.open_cycle() {
            return Ok(open);
        }
        let now = self.clock.now();

        if let Some(pending) = self.store.latest_pending() {
            if let Some(opened) = self
                .store
                .open_pending(&pending.id, now)
                .map_err(|e| self.violation(&pending.id, e))?
            {
                self.record_open(&opened, "promoted on rollover");
                return Ok(opened);
            }
        }

        let cycle = self.new_cycle(CycleStatus::Open, now);
        let cycle = self
            .store
            .insert_cycle(cycle)
            .map_err(|e| self.violation(&CycleId::new(), e))?;
        self.record_open(&cycle, "opened on rollover");
        Ok(cycle)
    }

    /// Reopen the most recent closed cycle that still had room
    ///
    /// Refused while another cycle is open, which is the normal state after a
    /// rollover: the open cycle has to fill first.
    pub fn recover_improperly_closed_cycles(&self) -> Result<Cycle> {
        let target = self
            .store
            .cycles()
            .into_iter()
            .filter(Cycle::is_improperly_closed)
            .last()
            .ok_or(BidError::NothingToRecover)?;

        if let Some(open) = self.store.open_cycle().filter(|c| c.id != target.id) {
            info!(
                cycle_id = %target.id,
                open_cycle_id = %open.id,
                "Reopen refused while another cycle is open"
            );
            return Err(BidError::ConsistencyViolation(format!(
                "cycle #{} is open with {} units remaining; cycle #{} can only be reopened once no cycle is open",
                open.index,
                open.remaining(),
                target.index
            )));
        }

        let reopened = self.store.reopen(&target.id)?;
        warn!(
            cycle_id = %reopened.id,
            filled = reopened.filled,
            capacity = reopened.capacity,
            "Improperly closed cycle reopened"
        );
        self.store.append_event(SystemEvent::warning(
            self.clock.now(),
            EventKind::CycleReopened,
            reopened.id,
            format!(
                "cycle #{} reopened with {} units remaining",
                reopened.index,
                reopened.remaining()
            ),
        ));
        Ok(reopened)
    }

    /// Scheduler entry point: ensure a cycle exists, open it when due, and
    /// close it if it is somehow full but still open
    pub fn tick(&self) -> Result<Cycle> {
        let cycle = self.get_or_create_current_cycle()?;
        if let Some(opened) = self.open_if_due(&cycle.id)? {
            return Ok(opened);
        }
        if cycle.is_open() && cycle.is_full() {
            if let Some(rollover) = self.close_if_filled(&cycle.id)? {
                if let Some(next) = rollover.next {
                    return Ok(next);
                }
            }
        }
        self.store.cycle(&cycle.id)
    }

    /// Progression index for the next cycle
    ///
    /// Whole cycle groups elapsed since the first cycle, but never behind the
    /// latest existing cycle.
    pub fn next_index(&self) -> u32 {
        let Some(first) = self.store.first_cycle() else {
            return 0;
        };
        let days = self
            .schedule
            .days_between(first.created_at, self.clock.now())
            .max(0);
        let elapsed = u32::try_from(days / self.settings.group_days).unwrap_or(u32::MAX);
        let after_latest = self
            .store
            .latest_cycle()
            .map(|c| c.index.saturating_add(1))
            .unwrap_or(0);
        elapsed.max(after_latest)
    }

    fn new_cycle(&self, status: CycleStatus, open_time: chrono::DateTime<chrono::Utc>) -> Cycle {
        let now = self.clock.now();
        let index = self.next_index();
        Cycle {
            id: CycleId::new(),
            index,
            date: self.schedule.local_date(now),
            capacity: self.progression.lookup(index),
            filled: 0,
            status,
            open_time,
            close_time: None,
            growth: self.settings.growth_config(),
            created_at: now,
        }
    }

    fn record_open(&self, cycle: &Cycle, how: &str) {
        info!(
            cycle_id = %cycle.id,
            index = cycle.index,
            capacity = cycle.capacity,
            "Cycle {how}"
        );
        self.store.append_event(SystemEvent::info(
            self.clock.now(),
            EventKind::CycleOpened,
            cycle.id,
            format!("cycle #{} with {} units {how}", cycle.index, cycle.capacity),
        ));
    }

    /// Surface a refused open transition in the event log
    fn violation(&self, cycle_id: &CycleId, e: BidError) -> BidError {
        if let BidError::ConsistencyViolation(msg) = &e {
            error!(cycle_id = %cycle_id, "{msg}");
            self.store.append_event(SystemEvent::error(
                self.clock.now(),
                EventKind::ConsistencyViolation,
                cycle_id,
                msg.clone(),
            ));
        }
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidloop_storage::{CycleRepository, EventRepository, MemoryStore};
    use chrono::{Duration, TimeZone, Utc};

    fn manager_at(
        y: i32,
        m: u32,
        d: u32,
        h: u32,
        min: u32,
    ) -> (Arc<MemoryStore>, Arc<ManualClock>, CycleManager) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap(),
        ));
        let settings = CycleSettings {
            utc_offset_minutes: 0,
            open_time: "08:00:00".into(),
            ..Default::default()
        };
        let manager = CycleManager::new(store.clone(), clock.clone(), settings).unwrap();
        (store, clock, manager)
    }

    #[test]
    fn test_first_cycle_is_pending_with_base_units() {
        let (_, _, manager) = manager_at(2026, 6, 1, 6, 0);
        let cycle = manager.get_or_create_current_cycle().unwrap();
        assert_eq!(cycle.status, CycleStatus::Pending);
        assert_eq!(cycle.index, 0);
        assert_eq!(cycle.capacity, 5);
        assert_eq!(cycle.open_time, Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap());

        // same pending cycle comes back
        let again = manager.get_or_create_current_cycle().unwrap();
        assert_eq!(again.id, cycle.id);
    }

    #[test]
    fn test_open_if_due_waits_for_open_time() {
        let (_, clock, manager) = manager_at(2026, 6, 1, 6, 0);
        let cycle = manager.get_or_create_current_cycle().unwrap();
        assert!(manager.open_if_due(&cycle.id).unwrap().is_none());

        clock.advance(Duration::hours(2));
        let opened = manager.open_if_due(&cycle.id).unwrap().unwrap();
        assert_eq!(opened.status, CycleStatus::Open);
        // idempotent
        assert!(manager.open_if_due(&cycle.id).unwrap().is_none());
        assert_eq!(manager.store.cycle_counts().open, 1);
    }

    #[test]
    fn test_close_without_fill_is_noop() {
        let (store, _, manager) = manager_at(2026, 6, 1, 9, 0);
        let cycle = manager.tick().unwrap();
        assert!(cycle.is_open());
        assert!(manager.close_if_filled(&cycle.id).unwrap().is_none());
        assert_eq!(store.cycle(&cycle.id).unwrap().status, CycleStatus::Open);
    }

    #[test]
    fn test_open_next_is_noop_when_open() {
        let (store, _, manager) = manager_at(2026, 6, 1, 9, 0);
        let open = manager.tick().unwrap();
        let next = manager.open_next().unwrap();
        assert_eq!(next.id, open.id);
        assert_eq!(store.cycle_counts().total, 1);
    }

    #[test]
    fn test_next_index_tracks_elapsed_groups() {
        let (store, clock, manager) = manager_at(2026, 6, 1, 9, 0);
        let first = manager.tick().unwrap();
        assert_eq!(first.index, 0);

        // force-close the first cycle as if it had filled
        let mut full = store.cycle(&first.id).unwrap();
        full.filled = full.capacity;
        full.status = CycleStatus::Closed;
        store.insert_cycle(full).unwrap();

        clock.advance(Duration::days(11));
        assert_eq!(manager.next_index(), 2);
        let next = manager.open_next().unwrap();
        assert_eq!(next.index, 2);
        assert_eq!(next.capacity, 7);
    }

    #[test]
    fn test_recover_reopens_latest_partial_cycle() {
        let (store, _, manager) = manager_at(2026, 6, 1, 9, 0);
        assert_eq!(
            manager.recover_improperly_closed_cycles().unwrap_err(),
            BidError::NothingToRecover
        );

        let cycle = manager.tick().unwrap();
        let mut broken = store.cycle(&cycle.id).unwrap();
        broken.filled = 2;
        broken.status = CycleStatus::Closed;
        broken.close_time = Some(Utc::now());
        store.insert_cycle(broken).unwrap();

        let reopened = manager.recover_improperly_closed_cycles().unwrap();
        assert_eq!(reopened.id, cycle.id);
        assert_eq!(reopened.status, CycleStatus::Open);
        assert!(reopened.close_time.is_none());
        assert_eq!(
            store.recent_events(Severity::Warning, 5)[0].kind,
            EventKind::CycleReopened
        );
    }

    #[test]
    fn test_recover_refused_while_rollover_cycle_open() {
        let (store, _, manager) = manager_at(2026, 6, 1, 9, 0);
        let cycle = manager.tick().unwrap();
        let mut broken = store.cycle(&cycle.id).unwrap();
        broken.filled = 2;
        broken.status = CycleStatus::Closed;
        broken.close_time = Some(Utc::now());
        store.insert_cycle(broken).unwrap();
        let rollover = manager.open_next().unwrap();

        let err = manager.recover_improperly_closed_cycles().unwrap_err();
        assert!(matches!(err, BidError::ConsistencyViolation(_)));
        let message = err.to_string();
        assert!(message.contains(&format!("cycle #{} is open", rollover.index)));
        assert!(message.contains(&format!("cycle #{} can only be reopened", cycle.index)));

        // nothing changed
        assert_eq!(store.cycle(&cycle.id).unwrap().status, CycleStatus::Closed);
        assert_eq!(store.open_cycles().len(), 1);
    }
}
