//! Deadline-ordered timers run by the owning thread.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use super::Callback;

/// Handle of a scheduled timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Timers keyed by deadline, ties broken by scheduling order.
pub struct Scheduler<S> {
    entries: BTreeMap<(Instant, u64), Callback<S>>,
    deadlines: HashMap<u64, Instant>,
    next_seq: u64,
}

impl<S> Default for Scheduler<S> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            deadlines: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<S> Scheduler<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs `callback` once `deadline` has passed.
    pub fn wait_until(
        &mut self,
        deadline: Instant,
        callback: impl FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    ) -> TimerId {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries.insert((deadline, seq), Box::new(callback));
        self.deadlines.insert(seq, deadline);
        TimerId(seq)
    }

    /// Runs `callback` after `delay`.
    pub fn wait_for(
        &mut self,
        delay: Duration,
        callback: impl FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    ) -> TimerId {
        self.wait_until(Instant::now() + delay, callback)
    }

    /// Cancels a timer. Returns false if it already ran or was erased.
    pub fn erase(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id.0) {
            Some(deadline) => self.entries.remove(&(deadline, id.0)).is_some(),
            None => false,
        }
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id.0)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Time until the earliest timer is due, zero if it is overdue.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Runs every timer due at `now` in deadline order.
    ///
    /// Timers scheduled by these callbacks wait for the next call, even
    /// when already due. Returns the number of timers run.
    pub fn perform(&mut self, now: Instant, host: &mut S) -> usize {
        let due: Vec<_> = self
            .entries
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        let mut performed = 0;
        for key in due {
            // An earlier callback may have erased this one
            let Some(callback) = self.entries.remove(&key) else {
                continue;
            };
            self.deadlines.remove(&key.1);

            callback(host, self);
            performed += 1;
        }
        performed
    }
}

impl<S> fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("len", &self.entries.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perform_runs_due_timers_in_deadline_order() {
        let mut scheduler: Scheduler<Vec<&str>> = Scheduler::new();
        let now = Instant::now();

        scheduler.wait_until(now + Duration::from_millis(20), |log, _| log.push("late"));
        scheduler.wait_until(now, |log, _| log.push("first"));
        scheduler.wait_until(now, |log, _| log.push("second"));
        scheduler.wait_until(now + Duration::from_secs(60), |log, _| log.push("future"));

        let mut log = Vec::new();
        assert_eq!(scheduler.perform(now + Duration::from_millis(20), &mut log), 3);

        assert_eq!(log, vec!["first", "second", "late"]);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_erase_cancels_timer() {
        let mut scheduler: Scheduler<u32> = Scheduler::new();
        let now = Instant::now();

        let id = scheduler.wait_until(now, |count, _| *count += 1);
        assert!(scheduler.is_scheduled(id));
        assert!(scheduler.erase(id));
        assert!(!scheduler.erase(id));

        let mut count = 0;
        scheduler.perform(now, &mut count);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_rescheduled_timer_waits_for_next_perform() {
        let mut scheduler: Scheduler<u32> = Scheduler::new();
        let now = Instant::now();

        scheduler.wait_until(now, move |count, scheduler| {
            *count += 1;
            scheduler.wait_until(now, |count, _| *count += 10);
        });

        let mut count = 0;
        assert_eq!(scheduler.perform(now, &mut count), 1);
        assert_eq!(count, 1);
        assert_eq!(scheduler.perform(now, &mut count), 1);
        assert_eq!(count, 11);
    }

    #[test]
    fn test_next_timeout_saturates() {
        let mut scheduler: Scheduler<()> = Scheduler::new();
        let now = Instant::now();
        assert_eq!(scheduler.next_timeout(now), None);

        scheduler.wait_until(now, |_, _| {});
        assert_eq!(
            scheduler.next_timeout(now + Duration::from_secs(1)),
            Some(Duration::ZERO)
        );
    }
}
