// persistence.rs - the backend seam and timeout-bounded calls into it
//
// The engine never talks to storage directly. It goes through a
// `PersistenceBackend` (JSON directory, D-Bus daemon, in-memory test double)
// wrapped in a `BoundedBackend`, which runs every call on a worker thread and
// gives up after a timeout (5 s unless configured otherwise). A call that
// times out keeps running in the background; its result is discarded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::assignment::{AssignmentKey, LayoutId, QuickSlot};
use crate::error::PersistenceError;
use crate::layout::{LayoutFlagKey, LayoutRecord};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// ── change events ─────────────────────────────────────────────────────────────

/// Something changed in persisted state behind our back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    LayoutChanged(LayoutId),
    LayoutListChanged,
    AssignmentChanged,
    QuickSlotsChanged,
}

pub type EventSink = Box<dyn Fn(ChangeEvent) + Send + Sync + 'static>;

// ── backend ───────────────────────────────────────────────────────────────────

pub type SetResults<K> = BTreeMap<K, Result<(), PersistenceError>>;

pub trait PersistenceBackend: Send + Sync {
    fn get_assignment(&self, key: &AssignmentKey) -> Result<Option<LayoutId>, PersistenceError>;

    fn list_assignments(&self) -> Result<Vec<(AssignmentKey, LayoutId)>, PersistenceError>;

    /// Apply a batch; `None` removes the entry. One result per key.
    fn set_assignments(&self, batch: BTreeMap<AssignmentKey, Option<LayoutId>>) -> SetResults<AssignmentKey>;

    fn get_quick_slots(&self) -> Result<BTreeMap<QuickSlot, LayoutId>, PersistenceError>;

    /// Replace the whole slot table.
    fn set_quick_slots(&self, slots: BTreeMap<QuickSlot, LayoutId>) -> Result<(), PersistenceError>;

    fn get_layout(&self, id: &LayoutId) -> Result<LayoutRecord, PersistenceError>;

    fn list_layouts(&self) -> Result<Vec<LayoutRecord>, PersistenceError>;

    fn set_layout_flags(&self, batch: BTreeMap<LayoutFlagKey, bool>) -> SetResults<LayoutFlagKey>;

    fn create_layout(&self, record: LayoutRecord) -> Result<LayoutId, PersistenceError>;

    fn duplicate_layout(&self, id: &LayoutId) -> Result<LayoutId, PersistenceError>;

    fn delete_layout(&self, id: &LayoutId) -> Result<(), PersistenceError>;

    fn import_layout(&self, path: &Path) -> Result<LayoutId, PersistenceError>;

    fn export_layout(&self, id: &LayoutId, path: &Path) -> Result<(), PersistenceError>;

    /// Deliver change events to `sink` from now on. Called once.
    fn subscribe(&self, sink: EventSink);
}

pub type SharedBackend = Arc<dyn PersistenceBackend>;

// ── bounded calls ─────────────────────────────────────────────────────────────

/// Run `f` on a worker thread and wait at most `timeout` for its result.
pub fn bounded<T, F>(timeout: Duration, op: &'static str, f: F) -> Result<T, PersistenceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PersistenceError> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let spawned = std::thread::Builder::new()
        .name(format!("persist-{op}"))
        .spawn(move || {
            // Receiver may be gone after a timeout.
            let _ = tx.send(f());
        });
    if let Err(e) = spawned {
        return Err(PersistenceError::Unavailable(format!(
            "cannot start worker for `{op}`: {e}"
        )));
    }

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!("Persistence call `{op}` timed out after {timeout:?}");
            Err(PersistenceError::Timeout { op, after: timeout })
        }
        Err(RecvTimeoutError::Disconnected) => Err(PersistenceError::Unavailable(format!(
            "worker for `{op}` exited without a result"
        ))),
    }
}

/// A backend plus the timeout applied to every call made through it.
#[derive(Clone)]
pub struct BoundedBackend {
    inner: SharedBackend,
    timeout: Duration,
}

impl BoundedBackend {
    pub fn new(inner: SharedBackend, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn inner(&self) -> &SharedBackend {
        &self.inner
    }

    fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, PersistenceError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PersistenceBackend) -> Result<T, PersistenceError> + Send + 'static,
    {
        let backend = Arc::clone(&self.inner);
        bounded(self.timeout, op, move || f(backend.as_ref()))
    }

    pub fn get_assignment(&self, key: &AssignmentKey) -> Result<Option<LayoutId>, PersistenceError> {
        let key = key.clone();
        self.call("get_assignment", move |b| b.get_assignment(&key))
    }

    pub fn list_assignments(&self) -> Result<Vec<(AssignmentKey, LayoutId)>, PersistenceError> {
        self.call("list_assignments", |b| b.list_assignments())
    }

    /// Per-key results. A timeout or transport failure fails every key of
    /// the batch with the same error.
    pub fn set_assignments(&self, batch: BTreeMap<AssignmentKey, Option<LayoutId>>) -> SetResults<AssignmentKey> {
        let keys: Vec<AssignmentKey> = batch.keys().cloned().collect();
        let outcome = self.call("set_assignments", move |b| Ok(b.set_assignments(batch)));
        spread(keys, outcome)
    }

    pub fn get_quick_slots(&self) -> Result<BTreeMap<QuickSlot, LayoutId>, PersistenceError> {
        self.call("get_quick_slots", |b| b.get_quick_slots())
    }

    pub fn set_quick_slots(&self, slots: BTreeMap<QuickSlot, LayoutId>) -> Result<(), PersistenceError> {
        self.call("set_quick_slots", move |b| b.set_quick_slots(slots))
    }

    pub fn get_layout(&self, id: &LayoutId) -> Result<LayoutRecord, PersistenceError> {
        let id = id.clone();
        self.call("get_layout", move |b| b.get_layout(&id))
    }

    pub fn list_layouts(&self) -> Result<Vec<LayoutRecord>, PersistenceError> {
        self.call("list_layouts", |b| b.list_layouts())
    }

    pub fn set_layout_flags(&self, batch: BTreeMap<LayoutFlagKey, bool>) -> SetResults<LayoutFlagKey> {
        let keys: Vec<LayoutFlagKey> = batch.keys().cloned().collect();
        let outcome = self.call("set_layout_flags", move |b| Ok(b.set_layout_flags(batch)));
        spread(keys, outcome)
    }

    pub fn create_layout(&self, record: LayoutRecord) -> Result<LayoutId, PersistenceError> {
        self.call("create_layout", move |b| b.create_layout(record))
    }

    pub fn duplicate_layout(&self, id: &LayoutId) -> Result<LayoutId, PersistenceError> {
        let id = id.clone();
        self.call("duplicate_layout", move |b| b.duplicate_layout(&id))
    }

    pub fn delete_layout(&self, id: &LayoutId) -> Result<(), PersistenceError> {
        let id = id.clone();
        self.call("delete_layout", move |b| b.delete_layout(&id))
    }

    pub fn import_layout(&self, path: &Path) -> Result<LayoutId, PersistenceError> {
        let path = PathBuf::from(path);
        self.call("import_layout", move |b| b.import_layout(&path))
    }

    pub fn export_layout(&self, id: &LayoutId, path: &Path) -> Result<(), PersistenceError> {
        let id = id.clone();
        let path = PathBuf::from(path);
        self.call("export_layout", move |b| b.export_layout(&id, &path))
    }
}

/// Expand a whole-batch outcome into one result per key. Keys the backend
/// forgot to answer for count as rejected.
fn spread<K: Ord>(
    keys: Vec<K>,
    outcome: Result<SetResults<K>, PersistenceError>,
) -> SetResults<K> {
    match outcome {
        Ok(mut results) => keys
            .into_iter()
            .map(|k| {
                let r = results.remove(&k).unwrap_or_else(|| {
                    Err(PersistenceError::Rejected("backend returned no result".into()))
                });
                (k, r)
            })
            .collect(),
        Err(e) => keys.into_iter().map(|k| (k, Err(e.clone()))).collect(),
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;

    #[test]
    fn bounded_returns_value() {
        let r = bounded(Duration::from_secs(1), "value", || Ok(41 + 1));
        assert_eq!(r, Ok(42));
    }

    #[test]
    fn bounded_times_out() {
        let r: Result<(), _> = bounded(Duration::from_millis(20), "slow", || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        assert_eq!(
            r,
            Err(PersistenceError::Timeout {
                op: "slow",
                after: Duration::from_millis(20)
            })
        );
    }

    #[test]
    fn bounded_reports_panicking_worker_as_unavailable() {
        let r: Result<(), _> = bounded(Duration::from_secs(1), "boom", || panic!("worker died"));
        assert!(matches!(r, Err(PersistenceError::Unavailable(_))));
    }

    #[test]
    fn batch_timeout_fails_every_key() {
        let mem = Arc::new(MemoryBackend::new());
        mem.set_delay(Some(Duration::from_millis(300)));
        let backend = BoundedBackend::new(mem, Duration::from_millis(20));

        let mut batch = BTreeMap::new();
        batch.insert(AssignmentKey::screen_default("S1"), Some(LayoutId::new("a")));
        batch.insert(AssignmentKey::screen_default("S2"), None);
        let results = backend.set_assignments(batch);
        assert_eq!(results.len(), 2);
        assert!(results
            .values()
            .all(|r| matches!(r, Err(PersistenceError::Timeout { .. }))));
    }

    #[test]
    fn missing_result_counts_as_rejected() {
        let keys = vec![1, 2];
        let mut partial = SetResults::new();
        partial.insert(1, Ok(()));
        let out = spread(keys, Ok(partial));
        assert_eq!(out[&1], Ok(()));
        assert!(matches!(out[&2], Err(PersistenceError::Rejected(_))));
    }
}
