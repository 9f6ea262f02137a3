//! Timer slots
//!
//! Timers live in an index-reused slot array; numeric ids are 1-based slot
//! positions. A stopped timer leaves its slot *retired* rather than free:
//! the slot is handed out again only once no fire job for the old entry is
//! still queued on the executor.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::runtime::{Job, JobSender, RuleRuntime};

/// Numeric timer id, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(usize);

impl TimerId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn get(self) -> usize {
        self.0
    }

    fn index(self) -> Option<usize> {
        self.0.checked_sub(1)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback of an anonymous timer
pub type TimerFn = Box<dyn FnMut(&mut RuleRuntime) + Send>;

/// State shared between a timer entry, its task and its queued fire jobs
pub(crate) struct TimerShared {
    active: Mutex<bool>,
    in_flight: AtomicUsize,
}

impl TimerShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(true),
            in_flight: AtomicUsize::new(0),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().map(|a| *a).unwrap_or(false)
    }

    fn deactivate(&self) {
        if let Ok(mut active) = self.active.lock() {
            *active = false;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn begin_fire(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_fire(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct TimerEntry {
    pub name: Option<String>,
    pub periodic: bool,
    pub interval: Duration,
    pub callback: Option<TimerFn>,
    /// Cleanup scope active when the timer was started
    pub scope: Option<String>,
    pub shared: Arc<TimerShared>,
    quit: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TimerEntry {
    pub fn new(
        name: Option<String>,
        callback: Option<TimerFn>,
        interval: Duration,
        periodic: bool,
        scope: Option<String>,
    ) -> Self {
        Self {
            name,
            periodic,
            interval,
            callback,
            scope,
            shared: TimerShared::new(),
            quit: None,
            task: None,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// Start the timer task; fire jobs are sent to `jobs`
    pub fn arm(&mut self, id: TimerId, jobs: &JobSender) {
        if self.is_armed() || !self.shared.is_active() {
            return;
        }
        let (quit_tx, quit_rx) = oneshot::channel();
        self.quit = Some(quit_tx);
        self.task = Some(spawn_timer_task(
            id,
            self.interval,
            self.periodic,
            self.shared.clone(),
            quit_rx,
            jobs.clone(),
        ));
    }

    /// Mark inactive and signal the task to quit
    ///
    /// A fire job that was already queued still runs but finds the entry
    /// gone or inactive.
    pub fn stop(&mut self) {
        self.shared.deactivate();
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
        self.task = None;
    }
}

fn fire_job(id: TimerId, shared: Arc<TimerShared>) -> Job {
    Box::new(move |rt: &mut RuleRuntime| {
        rt.fire_timer(id, &shared);
        shared.end_fire();
    })
}

fn spawn_timer_task(
    id: TimerId,
    interval: Duration,
    periodic: bool,
    shared: Arc<TimerShared>,
    mut quit: oneshot::Receiver<()>,
    jobs: JobSender,
) -> JoinHandle<()> {
    // tokio intervals reject a zero period
    let interval = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = &mut quit => break,
                _ = ticker.tick() => {
                    if !shared.is_active() {
                        break;
                    }
                    shared.begin_fire();
                    if jobs.send(fire_job(id, shared.clone())).is_err() {
                        shared.end_fire();
                        break;
                    }
                    if !periodic {
                        break;
                    }
                }
            }
        }
        trace!(timer_id = %id, "Timer task finished");
    })
}

enum Slot {
    Free,
    Live(TimerEntry),
    Retired(Arc<TimerShared>),
}

impl Slot {
    fn is_reusable(&self) -> bool {
        match self {
            Slot::Free => true,
            Slot::Live(_) => false,
            Slot::Retired(shared) => shared.in_flight() == 0,
        }
    }
}

#[derive(Default)]
pub(crate) struct TimerTable {
    slots: Vec<Slot>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `entry` in the first reusable slot, or append
    pub fn allocate(&mut self, entry: TimerEntry) -> TimerId {
        if let Some(index) = self.slots.iter().position(Slot::is_reusable) {
            self.slots[index] = Slot::Live(entry);
            return TimerId(index + 1);
        }
        self.slots.push(Slot::Live(entry));
        TimerId(self.slots.len())
    }

    #[cfg(test)]
    pub fn get(&self, id: TimerId) -> Option<&TimerEntry> {
        match self.slots.get(id.index()?)? {
            Slot::Live(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: TimerId) -> Option<&mut TimerEntry> {
        match self.slots.get_mut(id.index()?)? {
            Slot::Live(entry) => Some(entry),
            _ => None,
        }
    }

    /// The live entry at `id` if it is the one `shared` belongs to
    pub fn current_mut(&mut self, id: TimerId, shared: &Arc<TimerShared>) -> Option<&mut TimerEntry> {
        self.get_mut(id)
            .filter(|entry| Arc::ptr_eq(&entry.shared, shared))
    }

    pub fn find_by_name(&self, name: &str) -> Option<TimerId> {
        self.slots.iter().enumerate().find_map(|(index, slot)| match slot {
            Slot::Live(entry) if entry.name.as_deref() == Some(name) => Some(TimerId(index + 1)),
            _ => None,
        })
    }

    /// Stop the timer at `id` and retire its slot
    ///
    /// Returns the stopped entry so its callback is dropped by the caller.
    pub fn remove(&mut self, id: TimerId) -> Option<TimerEntry> {
        let slot = self.slots.get_mut(id.index()?)?;
        if !matches!(slot, Slot::Live(_)) {
            return None;
        }
        let Slot::Live(mut entry) = std::mem::replace(slot, Slot::Free) else {
            return None;
        };
        entry.stop();
        *slot = Slot::Retired(entry.shared.clone());
        Some(entry)
    }

    /// Stop every live timer
    pub fn remove_all(&mut self) -> Vec<TimerEntry> {
        (1..=self.slots.len())
            .filter_map(|id| self.remove(TimerId(id)))
            .collect()
    }

    /// Ids of live timers that are not running yet
    pub fn unarmed(&self) -> Vec<TimerId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Live(entry) if !entry.is_armed() => Some(TimerId(index + 1)),
                _ => None,
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: Option<&str>) -> TimerEntry {
        TimerEntry::new(
            name.map(str::to_string),
            None,
            Duration::from_millis(100),
            false,
            None,
        )
    }

    #[test]
    fn test_ids_are_one_based_and_ascending() {
        let mut table = TimerTable::new();
        assert_eq!(table.allocate(entry(None)), TimerId(1));
        assert_eq!(table.allocate(entry(None)), TimerId(2));
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn test_retired_slot_is_reused_when_idle() {
        let mut table = TimerTable::new();
        let id = table.allocate(entry(None));
        assert!(table.remove(id).is_some());
        assert!(table.get(id).is_none());
        assert_eq!(table.allocate(entry(None)), id);
    }

    #[test]
    fn test_retired_slot_is_not_reused_while_in_flight() {
        let mut table = TimerTable::new();
        let id = table.allocate(entry(None));
        let shared = table.get(id).unwrap().shared.clone();
        shared.begin_fire();
        table.remove(id);

        let second = table.allocate(entry(None));
        assert_eq!(second, TimerId(2));

        shared.end_fire();
        assert_eq!(table.allocate(entry(None)), TimerId(1));
    }

    #[test]
    fn test_stale_entry_is_not_current() {
        let mut table = TimerTable::new();
        let id = table.allocate(entry(None));
        let old = table.get(id).unwrap().shared.clone();
        table.remove(id);
        table.allocate(entry(None));

        assert!(table.current_mut(id, &old).is_none());
        assert!(!old.is_active());
    }

    #[test]
    fn test_find_by_name() {
        let mut table = TimerTable::new();
        table.allocate(entry(None));
        let id = table.allocate(entry(Some("blink")));
        assert_eq!(table.find_by_name("blink"), Some(id));
        table.remove(id);
        assert_eq!(table.find_by_name("blink"), None);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut table = TimerTable::new();
        let id = table.allocate(entry(None));
        assert!(table.remove(id).is_some());
        assert!(table.remove(id).is_none());
        assert!(table.remove(TimerId(0)).is_none());
        assert!(table.remove(TimerId(42)).is_none());
    }

    #[test]
    fn test_unarmed_and_remove_all() {
        let mut table = TimerTable::new();
        table.allocate(entry(None));
        table.allocate(entry(Some("t")));
        assert_eq!(table.unarmed(), vec![TimerId(1), TimerId(2)]);
        assert_eq!(table.remove_all().len(), 2);
        assert_eq!(table.live_count(), 0);
    }
}
