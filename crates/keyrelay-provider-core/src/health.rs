use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HealthStatus {
    /// Never probed.
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_probe(ok: bool) -> Self {
        if ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    pub fn from_flag(flag: Option<bool>) -> Self {
        flag.map(Self::from_probe).unwrap_or_default()
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            HealthStatus::Unknown => None,
            HealthStatus::Healthy => Some(true),
            HealthStatus::Unhealthy => Some(false),
        }
    }

    /// Unknown keys are eligible for selection.
    pub fn is_usable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    status: HealthStatus,
    /// Quota marks lapse back to `Unknown` at this point.
    expires: Option<Instant>,
}

impl Entry {
    fn fixed(status: HealthStatus) -> Self {
        Self {
            status,
            expires: None,
        }
    }

    fn current(&self, now: Instant) -> HealthStatus {
        match self.expires {
            Some(at) if at <= now => HealthStatus::Unknown,
            _ => self.status,
        }
    }
}

/// Health of every key name seen by this process, plus sweep scheduling.
///
/// Readers get a consistent snapshot; a sweep publishes all of its results at once.
#[derive(Debug)]
pub struct HealthBoard {
    statuses: ArcSwap<HashMap<String, Entry>>,
    interval: Duration,
    last_sweep: Mutex<Option<Instant>>,
    sweeping: AtomicBool,
}

impl HealthBoard {
    pub fn new(interval: Duration) -> Self {
        Self {
            statuses: ArcSwap::from_pointee(HashMap::new()),
            interval,
            last_sweep: Mutex::new(None),
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn status(&self, name: &str) -> HealthStatus {
        let now = Instant::now();
        self.statuses
            .load()
            .get(name)
            .map(|entry| entry.current(now))
            .unwrap_or_default()
    }

    pub fn statuses<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Vec<HealthStatus> {
        let now = Instant::now();
        let snapshot = self.statuses.load();
        names
            .into_iter()
            .map(|name| {
                snapshot
                    .get(name)
                    .map(|entry| entry.current(now))
                    .unwrap_or_default()
            })
            .collect()
    }

    /// Records `status` only for names the board has not seen yet.
    pub fn seed(&self, name: &str, status: HealthStatus) {
        if status == HealthStatus::Unknown || self.statuses.load().contains_key(name) {
            return;
        }
        self.statuses.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.entry(name.to_string()).or_insert(Entry::fixed(status));
            next
        });
    }

    pub fn mark(&self, name: &str, status: HealthStatus) {
        self.insert(name, Entry::fixed(status));
    }

    /// Marks a key unhealthy after a quota failure. The mark lapses after `cooldown`
    /// so the key returns to rotation even when periodic sweeps are off.
    pub fn mark_exhausted(&self, name: &str, cooldown: Duration) {
        self.insert(
            name,
            Entry {
                status: HealthStatus::Unhealthy,
                expires: Instant::now().checked_add(cooldown),
            },
        );
    }

    fn insert(&self, name: &str, entry: Entry) {
        self.statuses.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(name.to_string(), entry);
            next
        });
    }

    pub fn forget(&self, name: &str) {
        self.statuses.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(name);
            next
        });
    }

    pub fn is_due(&self) -> bool {
        let last = *self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
        match last {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        }
    }

    /// Claims the single sweep slot. Returns `None` when a sweep is already running,
    /// or when `force` is false and the interval has not elapsed.
    pub fn try_begin_sweep(&self, force: bool) -> Option<SweepGuard<'_>> {
        if !force && !self.is_due() {
            return None;
        }
        self.sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(SweepGuard { board: self })
    }
}

/// Held while a sweep runs; dropping it without publishing releases the slot.
#[derive(Debug)]
pub struct SweepGuard<'a> {
    board: &'a HealthBoard,
}

impl SweepGuard<'_> {
    pub fn publish(self, results: Vec<(String, HealthStatus)>) {
        self.board.statuses.rcu(|current| {
            let mut next = HashMap::clone(current);
            for (name, status) in results.iter() {
                next.insert(name.clone(), Entry::fixed(*status));
            }
            next
        });
        *self
            .board
            .last_sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.board.sweeping.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_board_is_due_and_unknown() {
        let board = HealthBoard::new(Duration::from_secs(300));
        assert!(board.is_due());
        assert_eq!(board.status("a"), HealthStatus::Unknown);
    }

    #[test]
    fn sweep_is_single_flight() {
        let board = HealthBoard::new(Duration::from_secs(300));
        let first = board.try_begin_sweep(false).expect("first sweep");
        assert!(board.try_begin_sweep(true).is_none());
        first.publish(vec![("a".to_string(), HealthStatus::Healthy)]);
        assert!(!board.is_due());
        assert!(board.try_begin_sweep(false).is_none());
        assert!(board.try_begin_sweep(true).is_some());
    }

    #[test]
    fn quota_mark_lapses_after_cooldown() {
        let board = HealthBoard::new(Duration::ZERO);
        board.mark_exhausted("spent", Duration::ZERO);
        assert_eq!(board.status("spent"), HealthStatus::Unknown);

        board.mark_exhausted("spent", Duration::from_secs(3600));
        assert_eq!(board.status("spent"), HealthStatus::Unhealthy);
        assert_eq!(
            board.statuses(["spent", "other"]),
            vec![HealthStatus::Unhealthy, HealthStatus::Unknown]
        );
    }

    #[test]
    fn sweep_result_replaces_quota_mark() {
        let board = HealthBoard::new(Duration::ZERO);
        board.mark_exhausted("spent", Duration::from_secs(3600));
        let guard = board.try_begin_sweep(true).unwrap();
        guard.publish(vec![("spent".to_string(), HealthStatus::Healthy)]);
        assert_eq!(board.status("spent"), HealthStatus::Healthy);
    }

    #[test]
    fn dropped_guard_releases_without_publishing() {
        let board = HealthBoard::new(Duration::from_secs(300));
        drop(board.try_begin_sweep(false));
        assert!(board.is_due());
        assert!(board.try_begin_sweep(false).is_some());
    }

    #[test]
    fn publish_keeps_entries_outside_the_batch() {
        let board = HealthBoard::new(Duration::ZERO);
        board.mark("added-during-sweep", HealthStatus::Healthy);
        let guard = board.try_begin_sweep(false).unwrap();
        guard.publish(vec![("a".to_string(), HealthStatus::Unhealthy)]);
        assert_eq!(board.status("a"), HealthStatus::Unhealthy);
        assert_eq!(board.status("added-during-sweep"), HealthStatus::Healthy);
    }

    #[test]
    fn seed_does_not_override_known_status() {
        let board = HealthBoard::new(Duration::ZERO);
        board.mark("a", HealthStatus::Unhealthy);
        board.seed("a", HealthStatus::Healthy);
        board.seed("b", HealthStatus::Healthy);
        assert_eq!(
            board.statuses(["a", "b", "c"]),
            vec![
                HealthStatus::Unhealthy,
                HealthStatus::Healthy,
                HealthStatus::Unknown
            ]
        );
    }
}
