//! Polling counters per event thread kind.

use std::sync::atomic::{AtomicU64, Ordering};

/// Event thread kind a polling counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingSlot {
    Main,
    Disk,
    Net,
    Others,
}

impl PollingSlot {
    const COUNT: usize = 4;

    fn index(self) -> usize {
        match self {
            PollingSlot::Main => 0,
            PollingSlot::Disk => 1,
            PollingSlot::Net => 2,
            PollingSlot::Others => 3,
        }
    }
}

/// Wait and wake-up counts, totals plus one counter per slot.
#[derive(Debug, Default)]
pub struct PollingStats {
    polls: AtomicU64,
    events: AtomicU64,
    slot_polls: [AtomicU64; PollingSlot::COUNT],
    slot_events: [AtomicU64; PollingSlot::COUNT],
}

impl PollingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that a thread is about to wait.
    pub fn record_poll(&self, slot: PollingSlot) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.slot_polls[slot.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Records the events a wait returned with.
    pub fn record_events(&self, slot: PollingSlot, count: u64) {
        self.events.fetch_add(count, Ordering::Relaxed);
        self.slot_events[slot.index()].fetch_add(count, Ordering::Relaxed);
    }

    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }

    pub fn slot_polls(&self, slot: PollingSlot) -> u64 {
        self.slot_polls[slot.index()].load(Ordering::Relaxed)
    }

    pub fn slot_events(&self, slot: PollingSlot) -> u64 {
        self.slot_events[slot.index()].load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_counters_roll_up_into_totals() {
        let stats = PollingStats::new();

        stats.record_poll(PollingSlot::Net);
        stats.record_poll(PollingSlot::Disk);
        stats.record_events(PollingSlot::Net, 3);

        assert_eq!(stats.polls(), 2);
        assert_eq!(stats.events(), 3);
        assert_eq!(stats.slot_polls(PollingSlot::Net), 1);
        assert_eq!(stats.slot_events(PollingSlot::Net), 3);
        assert_eq!(stats.slot_events(PollingSlot::Disk), 0);
    }
}
