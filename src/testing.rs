// testing.rs - in-memory backend and fixtures shared by the unit tests

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::assignment::{AssignmentKey, LayoutId, QuickSlot};
use crate::context::{ScreenInfo, StaticScreens};
use crate::error::PersistenceError;
use crate::layout::{LayoutFlag, LayoutFlagKey, LayoutKindRecord, LayoutRecord, ZoneRecord};
use crate::persistence::{ChangeEvent, EventSink, PersistenceBackend, SetResults};
use crate::tiling::{TilingAlgorithm, TilingParams};

// ── fixtures ──────────────────────────────────────────────────────────────────

pub fn static_record(id: &str, name: &str, zones: &[(f64, f64, f64, f64)]) -> LayoutRecord {
    LayoutRecord {
        id: id.into(),
        name: name.into(),
        default_order: 0,
        hidden_from_selector: false,
        auto_assign: false,
        kind: LayoutKindRecord::Static {
            zones: zones
                .iter()
                .map(|&(x, y, w, h)| ZoneRecord {
                    index: None,
                    x,
                    y,
                    w,
                    h,
                })
                .collect(),
        },
    }
}

pub fn full_record(id: &str, name: &str) -> LayoutRecord {
    static_record(id, name, &[(0.0, 0.0, 1.0, 1.0)])
}

pub fn autotile_record(id: &str, name: &str, algorithm: TilingAlgorithm) -> LayoutRecord {
    LayoutRecord {
        id: id.into(),
        name: name.into(),
        default_order: 0,
        hidden_from_selector: false,
        auto_assign: false,
        kind: LayoutKindRecord::Autotile {
            params: TilingParams {
                algorithm,
                ..TilingParams::default()
            },
        },
    }
}

/// One 1920x1080 monitor: id "S1", connector "DP-1".
pub fn one_screen() -> StaticScreens {
    StaticScreens::new(vec![ScreenInfo {
        id: "S1".into(),
        name: "DP-1".into(),
        width: 1920,
        height: 1080,
        primary: true,
    }])
}

// ── memory backend ────────────────────────────────────────────────────────────

#[derive(Default)]
struct State {
    layouts: BTreeMap<LayoutId, LayoutRecord>,
    assignments: BTreeMap<AssignmentKey, LayoutId>,
    quick_slots: BTreeMap<QuickSlot, LayoutId>,
    failing: BTreeSet<AssignmentKey>,
    delay: Option<Duration>,
    unavailable: bool,
}

#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
    sinks: Mutex<Vec<EventSink>>,
    list_layout_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layouts(records: Vec<LayoutRecord>) -> Self {
        let backend = Self::new();
        {
            let mut state = backend.lock();
            for r in records {
                state.layouts.insert(LayoutId::new(r.id.clone()), r);
            }
        }
        backend
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every call sleeps this long before touching state.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Writes to `key` are rejected from now on.
    pub fn fail_key(&self, key: AssignmentKey) {
        self.lock().failing.insert(key);
    }

    pub fn insert_layout(&self, record: LayoutRecord) {
        self.lock().layouts.insert(LayoutId::new(record.id.clone()), record);
    }

    /// Mutate state directly, as another client would.
    pub fn put_assignment(&self, key: AssignmentKey, layout: &str) {
        self.lock().assignments.insert(key, LayoutId::new(layout));
    }

    pub fn get_quick_slots_now(&self) -> BTreeMap<QuickSlot, LayoutId> {
        self.lock().quick_slots.clone()
    }

    pub fn list_layout_calls(&self) -> usize {
        self.list_layout_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: ChangeEvent) {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        for sink in sinks.iter() {
            sink(event.clone());
        }
    }

    fn enter(&self) -> Result<std::sync::MutexGuard<'_, State>, PersistenceError> {
        let delay = self.lock().delay;
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
        let state = self.lock();
        if state.unavailable {
            return Err(PersistenceError::Unavailable("memory backend offline".into()));
        }
        Ok(state)
    }

    fn wrote(&self) {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl PersistenceBackend for MemoryBackend {
    fn get_assignment(&self, key: &AssignmentKey) -> Result<Option<LayoutId>, PersistenceError> {
        Ok(self.enter()?.assignments.get(key).cloned())
    }

    fn list_assignments(&self) -> Result<Vec<(AssignmentKey, LayoutId)>, PersistenceError> {
        let state = self.enter()?;
        Ok(state
            .assignments
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn set_assignments(&self, batch: BTreeMap<AssignmentKey, Option<LayoutId>>) -> SetResults<AssignmentKey> {
        self.wrote();
        let mut state = match self.enter() {
            Ok(s) => s,
            Err(e) => return batch.into_keys().map(|k| (k, Err(e.clone()))).collect(),
        };
        let mut out = SetResults::new();
        for (key, value) in batch {
            if state.failing.contains(&key) {
                out.insert(key, Err(PersistenceError::Rejected("injected failure".into())));
                continue;
            }
            match value {
                Some(id) => state.assignments.insert(key.clone(), id),
                None => state.assignments.remove(&key),
            };
            out.insert(key, Ok(()));
        }
        out
    }

    fn get_quick_slots(&self) -> Result<BTreeMap<QuickSlot, LayoutId>, PersistenceError> {
        Ok(self.enter()?.quick_slots.clone())
    }

    fn set_quick_slots(&self, slots: BTreeMap<QuickSlot, LayoutId>) -> Result<(), PersistenceError> {
        self.wrote();
        self.enter()?.quick_slots = slots;
        Ok(())
    }

    fn get_layout(&self, id: &LayoutId) -> Result<LayoutRecord, PersistenceError> {
        self.enter()?
            .layouts
            .get(id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))
    }

    fn list_layouts(&self) -> Result<Vec<LayoutRecord>, PersistenceError> {
        self.list_layout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.enter()?.layouts.values().cloned().collect())
    }

    fn set_layout_flags(&self, batch: BTreeMap<LayoutFlagKey, bool>) -> SetResults<LayoutFlagKey> {
        self.wrote();
        let mut state = match self.enter() {
            Ok(s) => s,
            Err(e) => return batch.into_keys().map(|k| (k, Err(e.clone()))).collect(),
        };
        let mut out = SetResults::new();
        for (key, value) in batch {
            let result = match state.layouts.get_mut(&key.layout) {
                Some(record) => {
                    match key.flag {
                        LayoutFlag::HiddenFromSelector => record.hidden_from_selector = value,
                        LayoutFlag::AutoAssign => record.auto_assign = value,
                    }
                    Ok(())
                }
                None => Err(PersistenceError::NotFound(key.layout.to_string())),
            };
            out.insert(key, result);
        }
        out
    }

    fn create_layout(&self, mut record: LayoutRecord) -> Result<LayoutId, PersistenceError> {
        self.wrote();
        let mut state = self.enter()?;
        if record.id.trim().is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        let id = LayoutId::new(record.id.clone());
        if state.layouts.contains_key(&id) {
            return Err(PersistenceError::Rejected(format!("layout {id} already exists")));
        }
        state.layouts.insert(id.clone(), record);
        Ok(id)
    }

    fn duplicate_layout(&self, id: &LayoutId) -> Result<LayoutId, PersistenceError> {
        self.wrote();
        let mut state = self.enter()?;
        let mut copy = state
            .layouts
            .get(id)
            .cloned()
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        copy.id = uuid::Uuid::new_v4().to_string();
        copy.name = format!("{} (Copy)", copy.name);
        let new_id = LayoutId::new(copy.id.clone());
        state.layouts.insert(new_id.clone(), copy);
        Ok(new_id)
    }

    fn delete_layout(&self, id: &LayoutId) -> Result<(), PersistenceError> {
        self.wrote();
        let mut state = self.enter()?;
        state
            .layouts
            .remove(id)
            .ok_or_else(|| PersistenceError::NotFound(id.to_string()))?;
        state.assignments.retain(|_, v| v != id);
        state.quick_slots.retain(|_, v| v != id);
        Ok(())
    }

    fn import_layout(&self, path: &Path) -> Result<LayoutId, PersistenceError> {
        let text = std::fs::read_to_string(path)?;
        let record: LayoutRecord = serde_json::from_str(&text)?;
        self.create_layout(record)
    }

    fn export_layout(&self, id: &LayoutId, path: &Path) -> Result<(), PersistenceError> {
        let record = self.get_layout(id)?;
        std::fs::write(path, serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }

    fn subscribe(&self, sink: EventSink) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }
}
