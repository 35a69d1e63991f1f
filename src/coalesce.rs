// coalesce.rs - restartable single-shot timer for backend change events
//
// A burst of `ChangeEvent`s (a UI saving ten layouts, a file watcher seeing
// write+rename) collapses into one refresh. Every event pushes the deadline
// out by `interval`; the accumulated set fires once nothing has arrived for
// that long. The state here is clock-agnostic; `service` drives it from a
// calloop timer.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::assignment::LayoutId;
use crate::persistence::ChangeEvent;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(50);

/// Union of everything that changed since the last refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub layouts: BTreeSet<LayoutId>,
    pub layout_list: bool,
    pub assignments: bool,
    pub quick_slots: bool,
}

impl ChangeSet {
    pub fn add(&mut self, event: ChangeEvent) {
        match event {
            ChangeEvent::LayoutChanged(id) => {
                self.layouts.insert(id);
            }
            ChangeEvent::LayoutListChanged => self.layout_list = true,
            ChangeEvent::AssignmentChanged => self.assignments = true,
            ChangeEvent::QuickSlotsChanged => self.quick_slots = true,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty() && !self.layout_list && !self.assignments && !self.quick_slots
    }

    /// Everything, for a full refresh.
    pub fn all() -> Self {
        Self {
            layouts: BTreeSet::new(),
            layout_list: true,
            assignments: true,
            quick_slots: true,
        }
    }
}

#[derive(Debug)]
pub struct Coalescer {
    interval: Duration,
    deadline: Option<Instant>,
    pending: ChangeSet,
}

impl Coalescer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            pending: ChangeSet::default(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Record `event` and restart the countdown. Returns the new deadline.
    pub fn poke(&mut self, now: Instant, event: ChangeEvent) -> Instant {
        self.pending.add(event);
        let deadline = now + self.interval;
        self.deadline = Some(deadline);
        deadline
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The accumulated set if the deadline has passed. Disarms the timer.
    pub fn fire_if_due(&mut self, now: Instant) -> Option<ChangeSet> {
        match self.deadline {
            Some(d) if now >= d => {
                self.deadline = None;
                Some(std::mem::take(&mut self.pending))
            }
            _ => None,
        }
    }
}

impl Default for Coalescer {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}
