// pending.rs - staged edits, committed or discarded as a unit
//
// Every edit the settings UI makes lands here first. Reads go
// staged-upsert → staged-clear → persisted, so the UI sees its own edits
// immediately. A commit runs in three steps so the persistence round trip can
// happen off the event loop:
//
//   begin_commit   snapshot the staged delta, mark a commit in flight
//   apply          push the snapshot through the backend (any thread)
//   finish_commit  drop staged entries that were written successfully
//
// Only one commit may be in flight. Entries that failed stay staged for a
// retry, and edits staged while the commit was running are kept unless they
// match what was just written.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::assignment::{AssignmentKey, AssignmentSource, AssignmentStore, LayoutId, QuickSlot};
use crate::error::{CommitError, PersistenceError};
use crate::layout::LayoutFlagKey;
use crate::persistence::BoundedBackend;

// ── staged map ────────────────────────────────────────────────────────────────

/// What the buffer knows about a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staged<'a, V> {
    Pending(&'a V),
    Cleared,
    Untouched,
}

impl<'a, V> Staged<'a, V> {
    /// Effective value given what is persisted.
    pub fn or_persisted(self, persisted: Option<&'a V>) -> Option<&'a V> {
        match self {
            Self::Pending(v) => Some(v),
            Self::Cleared => None,
            Self::Untouched => persisted,
        }
    }
}

/// Upserts and clears for one kind of key. A key is in at most one of the two
/// sets.
#[derive(Debug, Clone)]
pub struct StagedMap<K, V> {
    pending: BTreeMap<K, V>,
    cleared: BTreeSet<K>,
}

impl<K, V> Default for StagedMap<K, V> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            cleared: BTreeSet::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> StagedMap<K, V> {
    pub fn stage(&mut self, key: K, value: Option<V>) {
        match value {
            Some(v) => {
                self.cleared.remove(&key);
                self.pending.insert(key, v);
            }
            None => {
                self.pending.remove(&key);
                self.cleared.insert(key);
            }
        }
    }

    pub fn get(&self, key: &K) -> Staged<'_, V> {
        if let Some(v) = self.pending.get(key) {
            Staged::Pending(v)
        } else if self.cleared.contains(key) {
            Staged::Cleared
        } else {
            Staged::Untouched
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.cleared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.cleared.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.cleared.clear();
    }

    /// Staged state as a write batch: `Some` upserts, `None` clears.
    pub fn delta(&self) -> BTreeMap<K, Option<V>> {
        self.pending
            .iter()
            .map(|(k, v)| (k.clone(), Some(v.clone())))
            .chain(self.cleared.iter().map(|k| (k.clone(), None)))
            .collect()
    }

    /// persisted ∪ pending − cleared
    pub fn merged(&self, persisted: &BTreeMap<K, V>) -> BTreeMap<K, V> {
        let mut out = persisted.clone();
        for k in &self.cleared {
            out.remove(k);
        }
        for (k, v) in &self.pending {
            out.insert(k.clone(), v.clone());
        }
        out
    }

    /// Drop staged upserts whose value matches `f`.
    fn drop_pending_where(&mut self, mut f: impl FnMut(&V) -> bool) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, v| !f(v));
        before - self.pending.len()
    }

    /// Drop every staged entry, upsert or clear, whose key matches `f`.
    fn drop_keys_where(&mut self, mut f: impl FnMut(&K) -> bool) -> usize {
        let before = self.len();
        self.pending.retain(|k, _| !f(k));
        self.cleared.retain(|k| !f(k));
        before - self.len()
    }

    /// Forget the staged entry for `key` if it still says `committed`.
    fn settle(&mut self, key: &K, committed: Option<&V>) {
        let same = match (self.get(key), committed) {
            (Staged::Pending(now), Some(c)) => now == c,
            (Staged::Cleared, None) => true,
            _ => false,
        };
        if same {
            self.pending.remove(key);
            self.cleared.remove(key);
        }
    }
}

// ── commit report ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedTarget {
    Assignment(AssignmentKey),
    QuickSlot(QuickSlot),
    LayoutFlag(LayoutFlagKey),
}

impl fmt::Display for StagedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assignment(key) => write!(f, "assignment {key}"),
            Self::QuickSlot(slot) => write!(f, "quick {slot}"),
            Self::LayoutFlag(k) => write!(f, "layout {} flag {:?}", k.layout, k.flag),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub target: StagedTarget,
    pub result: Result<(), PersistenceError>,
}

/// One outcome per staged operation. A failed key never hides the others.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub outcomes: Vec<CommitOutcome>,
}

impl CommitReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &CommitOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &StagedTarget> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| &o.target)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

// ── commit batch ──────────────────────────────────────────────────────────────

/// Snapshot of staged state taken by `begin_commit`.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub assignments: BTreeMap<AssignmentKey, Option<LayoutId>>,
    /// Staged slot edits; empty means the slot table is left alone.
    pub quick_slot_delta: BTreeMap<QuickSlot, Option<LayoutId>>,
    /// Full slot table to write when `quick_slot_delta` is not empty.
    pub quick_slots: BTreeMap<QuickSlot, LayoutId>,
    /// Cleared flags are written back as `None` and stored as `false`.
    pub layout_flags: BTreeMap<LayoutFlagKey, Option<bool>>,
}

impl CommitBatch {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.quick_slot_delta.is_empty() && self.layout_flags.is_empty()
    }

    /// Push the batch through `backend`: at most one call per kind of edit.
    pub fn apply(&self, backend: &BoundedBackend) -> CommitReport {
        let mut outcomes = Vec::new();

        if !self.assignments.is_empty() {
            let results = backend.set_assignments(self.assignments.clone());
            outcomes.extend(results.into_iter().map(|(key, result)| CommitOutcome {
                target: StagedTarget::Assignment(key),
                result,
            }));
        }

        if !self.quick_slot_delta.is_empty() {
            let result = backend.set_quick_slots(self.quick_slots.clone());
            outcomes.extend(self.quick_slot_delta.keys().map(|slot| CommitOutcome {
                target: StagedTarget::QuickSlot(*slot),
                result: result.clone(),
            }));
        }

        if !self.layout_flags.is_empty() {
            let batch = self
                .layout_flags
                .iter()
                .map(|(k, v)| (k.clone(), v.unwrap_or(false)))
                .collect();
            let results = backend.set_layout_flags(batch);
            outcomes.extend(results.into_iter().map(|(key, result)| CommitOutcome {
                target: StagedTarget::LayoutFlag(key),
                result,
            }));
        }

        for o in &outcomes {
            match &o.result {
                Ok(()) => tracing::info!("Committed {}", o.target),
                Err(e) => tracing::warn!("Commit of {} failed: {e}", o.target),
            }
        }
        CommitReport { outcomes }
    }
}

// ── buffer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct PendingChangeBuffer {
    assignments: StagedMap<AssignmentKey, LayoutId>,
    quick_slots: StagedMap<QuickSlot, LayoutId>,
    layout_flags: StagedMap<LayoutFlagKey, bool>,
    committing: bool,
}

impl PendingChangeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // ── staging ───────────────────────────────────────────────────────────────

    pub fn stage_assignment(&mut self, key: AssignmentKey, layout: Option<LayoutId>) {
        self.assignments.stage(key, layout);
    }

    pub fn stage_quick_slot(&mut self, slot: QuickSlot, layout: Option<LayoutId>) {
        self.quick_slots.stage(slot, layout);
    }

    pub fn stage_layout_flag(&mut self, key: LayoutFlagKey, value: Option<bool>) {
        self.layout_flags.stage(key, value);
    }

    // ── reads ─────────────────────────────────────────────────────────────────

    pub fn assignment(&self, key: &AssignmentKey) -> Staged<'_, LayoutId> {
        self.assignments.get(key)
    }

    pub fn quick_slot(&self, slot: QuickSlot) -> Staged<'_, LayoutId> {
        self.quick_slots.get(&slot)
    }

    pub fn layout_flag(&self, key: &LayoutFlagKey) -> Staged<'_, bool> {
        self.layout_flags.get(key)
    }

    /// Staged assignments layered over `store`.
    pub fn overlay<'a>(&'a self, store: &'a AssignmentStore) -> Overlay<'a> {
        Overlay {
            staged: &self.assignments,
            store,
        }
    }

    pub fn len(&self) -> usize {
        self.assignments.len() + self.quick_slots.len() + self.layout_flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.quick_slots.is_empty() && self.layout_flags.is_empty()
    }

    pub fn is_committing(&self) -> bool {
        self.committing
    }

    /// Drop staged edits that would point at `layout` once committed: upserts
    /// of assignments and quick slots to it, and any flag edit on it. Staged
    /// clears stay. Returns how many entries were dropped.
    pub fn forget_layout(&mut self, layout: &LayoutId) -> usize {
        let dropped = self.assignments.drop_pending_where(|l| l == layout)
            + self.quick_slots.drop_pending_where(|l| l == layout)
            + self.layout_flags.drop_keys_where(|k| &k.layout == layout);
        if dropped > 0 {
            tracing::debug!("Dropped {dropped} staged edit(s) referencing {layout}");
        }
        dropped
    }

    // ── discard / commit ──────────────────────────────────────────────────────

    /// Drop every staged edit. Returns how many were dropped.
    pub fn discard(&mut self) -> usize {
        let n = self.len();
        self.assignments.clear();
        self.quick_slots.clear();
        self.layout_flags.clear();
        n
    }

    pub fn begin_commit(
        &mut self,
        persisted_slots: &BTreeMap<QuickSlot, LayoutId>,
    ) -> Result<CommitBatch, CommitError> {
        if self.committing {
            tracing::warn!("Commit rejected: another commit is still in flight");
            return Err(CommitError::Busy);
        }
        let batch = CommitBatch {
            assignments: self.assignments.delta(),
            quick_slot_delta: self.quick_slots.delta(),
            quick_slots: self.quick_slots.merged(persisted_slots),
            layout_flags: self.layout_flags.delta(),
        };
        self.committing = true;
        Ok(batch)
    }

    pub fn finish_commit(&mut self, batch: &CommitBatch, report: &CommitReport) {
        for target in report.succeeded() {
            match target {
                StagedTarget::Assignment(key) => {
                    let committed = batch.assignments.get(key).and_then(Option::as_ref);
                    self.assignments.settle(key, committed);
                }
                StagedTarget::QuickSlot(slot) => {
                    let committed = batch.quick_slot_delta.get(slot).and_then(Option::as_ref);
                    self.quick_slots.settle(slot, committed);
                }
                StagedTarget::LayoutFlag(key) => {
                    let committed = batch.layout_flags.get(key).and_then(Option::as_ref);
                    self.layout_flags.settle(key, committed);
                }
            }
        }
        self.committing = false;
    }
}

/// Read view: staged assignments first, then the persisted snapshot.
pub struct Overlay<'a> {
    staged: &'a StagedMap<AssignmentKey, LayoutId>,
    store: &'a AssignmentStore,
}

impl AssignmentSource for Overlay<'_> {
    fn explicit(&self, key: &AssignmentKey) -> Option<&LayoutId> {
        self.staged.get(key).or_persisted(self.store.get(key))
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::assignment::{resolve_in, ScreenId};
    use crate::layout::LayoutFlag;
    use crate::persistence::PersistenceBackend;
    use crate::testing::MemoryBackend;

    fn id(s: &str) -> LayoutId {
        LayoutId::new(s)
    }

    fn slot(n: u8) -> QuickSlot {
        QuickSlot::new(n).unwrap()
    }

    fn backend(mem: &Arc<MemoryBackend>) -> BoundedBackend {
        BoundedBackend::new(mem.clone(), Duration::from_secs(2))
    }

    #[test]
    fn upsert_and_clear_are_exclusive() {
        let mut m: StagedMap<u8, &str> = StagedMap::default();
        m.stage(1, Some("a"));
        m.stage(1, None);
        assert_eq!(m.get(&1), Staged::Cleared);
        assert_eq!(m.len(), 1);
        m.stage(1, Some("b"));
        assert_eq!(m.get(&1), Staged::Pending(&"b"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn merged_is_persisted_plus_pending_minus_cleared() {
        let mut persisted = BTreeMap::new();
        persisted.insert(1u8, "keep");
        persisted.insert(2u8, "drop");
        persisted.insert(3u8, "old");
        let mut m = StagedMap::default();
        m.stage(2, None);
        m.stage(3, Some("new"));
        m.stage(4, Some("added"));
        let merged = m.merged(&persisted);
        assert_eq!(merged.get(&1), Some(&"keep"));
        assert_eq!(merged.get(&2), None);
        assert_eq!(merged.get(&3), Some(&"new"));
        assert_eq!(merged.get(&4), Some(&"added"));
    }

    #[test]
    fn staged_clear_reads_unset_and_discard_restores() {
        let mut store = AssignmentStore::new();
        let key = AssignmentKey::screen_default("S1");
        store.set(key.clone(), Some(id("persisted")));

        let mut buf = PendingChangeBuffer::new();
        buf.stage_assignment(key.clone(), None);
        assert_eq!(buf.assignment(&key), Staged::Cleared);
        assert_eq!(buf.overlay(&store).explicit(&key), None);

        assert_eq!(buf.discard(), 1);
        assert_eq!(buf.overlay(&store).explicit(&key), Some(&id("persisted")));
    }

    #[test]
    fn quick_slot_visible_before_commit() {
        let mut buf = PendingChangeBuffer::new();
        buf.stage_quick_slot(slot(5), Some(id("L9")));
        assert_eq!(buf.quick_slot(slot(5)).or_persisted(None), Some(&id("L9")));
    }

    #[test]
    fn overlay_resolution_prefers_staged_desktop_entry() {
        let mut store = AssignmentStore::new();
        store.set(AssignmentKey::screen_default("S1"), Some(id("screen")));
        let mut buf = PendingChangeBuffer::new();
        buf.stage_assignment(AssignmentKey::new("S1", 2, None), Some(id("desk")));

        let r = resolve_in(&buf.overlay(&store), &ScreenId::new("S1"), 2, None, Some(&id("G")));
        assert_eq!(r.map(|r| r.layout), Some(id("desk")));
    }

    #[test]
    fn second_begin_is_busy_until_finish() {
        let mut buf = PendingChangeBuffer::new();
        buf.stage_quick_slot(slot(1), Some(id("a")));
        let batch = buf.begin_commit(&BTreeMap::new()).unwrap();
        assert!(buf.is_committing());
        assert_eq!(buf.begin_commit(&BTreeMap::new()).unwrap_err(), CommitError::Busy);

        buf.finish_commit(&batch, &CommitReport::default());
        assert!(!buf.is_committing());
        assert!(buf.begin_commit(&BTreeMap::new()).is_ok());
    }

    #[test]
    fn commit_sends_merged_slot_table() {
        let mem = Arc::new(MemoryBackend::new());
        let mut persisted = BTreeMap::new();
        persisted.insert(slot(1), id("one"));
        persisted.insert(slot(2), id("two"));

        let mut buf = PendingChangeBuffer::new();
        buf.stage_quick_slot(slot(2), None);
        buf.stage_quick_slot(slot(5), Some(id("L9")));
        let batch = buf.begin_commit(&persisted).unwrap();
        let report = batch.apply(&backend(&mem));
        buf.finish_commit(&batch, &report);

        assert!(report.is_success());
        assert_eq!(report.len(), 2);
        let stored = mem.get_quick_slots_now();
        assert_eq!(stored.get(&slot(1)), Some(&id("one")));
        assert_eq!(stored.get(&slot(2)), None);
        assert_eq!(stored.get(&slot(5)), Some(&id("L9")));
        assert!(buf.is_empty());
    }

    #[test]
    fn failed_key_stays_staged_others_commit() {
        let mem = Arc::new(MemoryBackend::new());
        let bad = AssignmentKey::screen_default("BAD");
        let good = AssignmentKey::screen_default("S1");
        mem.fail_key(bad.clone());

        let mut buf = PendingChangeBuffer::new();
        buf.stage_assignment(bad.clone(), Some(id("x")));
        buf.stage_assignment(good.clone(), Some(id("y")));
        buf.stage_layout_flag(
            LayoutFlagKey {
                layout: id("y"),
                flag: LayoutFlag::AutoAssign,
            },
            Some(true),
        );

        let batch = buf.begin_commit(&BTreeMap::new()).unwrap();
        let report = batch.apply(&backend(&mem));
        buf.finish_commit(&batch, &report);

        assert!(!report.is_success());
        assert_eq!(report.failures().count(), 1);
        assert_eq!(
            report.failures().next().map(|o| &o.target),
            Some(&StagedTarget::Assignment(bad.clone()))
        );
        assert_eq!(buf.assignment(&bad), Staged::Pending(&id("x")));
        assert_eq!(buf.assignment(&good), Staged::Untouched);
        assert_eq!(buf.len(), 1);
        assert_eq!(mem.get_assignment(&good), Ok(Some(id("y"))));
    }

    #[test]
    fn edit_during_flight_survives_finish() {
        let mem = Arc::new(MemoryBackend::new());
        let key = AssignmentKey::screen_default("S1");
        let mut buf = PendingChangeBuffer::new();
        buf.stage_assignment(key.clone(), Some(id("first")));

        let batch = buf.begin_commit(&BTreeMap::new()).unwrap();
        buf.stage_assignment(key.clone(), Some(id("second")));
        let report = batch.apply(&backend(&mem));
        buf.finish_commit(&batch, &report);

        assert!(report.is_success());
        assert_eq!(buf.assignment(&key), Staged::Pending(&id("second")));
    }

    #[test]
    fn timeout_keeps_everything_staged() {
        let mem = Arc::new(MemoryBackend::new());
        mem.set_delay(Some(Duration::from_millis(300)));
        let slow = BoundedBackend::new(mem.clone(), Duration::from_millis(20));

        let mut buf = PendingChangeBuffer::new();
        buf.stage_assignment(AssignmentKey::screen_default("S1"), Some(id("a")));
        buf.stage_quick_slot(slot(3), Some(id("b")));
        let batch = buf.begin_commit(&BTreeMap::new()).unwrap();
        let report = batch.apply(&slow);
        buf.finish_commit(&batch, &report);

        assert_eq!(report.failures().count(), 2);
        assert_eq!(buf.len(), 2);
        assert!(!buf.is_committing());
    }

    #[test]
    fn forget_layout_drops_only_its_references() {
        let mut buf = PendingChangeBuffer::new();
        let s1 = AssignmentKey::screen_default("S1");
        let s2 = AssignmentKey::screen_default("S2");
        let s3 = AssignmentKey::screen_default("S3");
        buf.stage_assignment(s1.clone(), Some(id("gone")));
        buf.stage_assignment(s2.clone(), Some(id("kept")));
        buf.stage_assignment(s3.clone(), None);
        buf.stage_quick_slot(slot(3), Some(id("gone")));
        buf.stage_layout_flag(
            LayoutFlagKey {
                layout: id("gone"),
                flag: LayoutFlag::HiddenFromSelector,
            },
            Some(true),
        );

        assert_eq!(buf.forget_layout(&id("gone")), 3);
        assert_eq!(buf.assignment(&s1), Staged::Untouched);
        assert_eq!(buf.assignment(&s2), Staged::Pending(&id("kept")));
        assert_eq!(buf.assignment(&s3), Staged::Cleared);
        assert_eq!(buf.quick_slot(slot(3)), Staged::Untouched);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn empty_commit_makes_no_calls() {
        let mem = Arc::new(MemoryBackend::new());
        let mut buf = PendingChangeBuffer::new();
        let batch = buf.begin_commit(&BTreeMap::new()).unwrap();
        assert!(batch.is_empty());
        let report = batch.apply(&backend(&mem));
        buf.finish_commit(&batch, &report);
        assert!(report.is_empty());
        assert_eq!(mem.write_calls(), 0);
    }
}
