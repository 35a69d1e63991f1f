// json_store.rs - PersistenceBackend over a plain JSON directory
//
//   <data_dir>/layouts/<id>.json   one LayoutRecord per file
//   <data_dir>/assignments.json    assignments + quick slots
//
// Files are replaced atomically (temp + rename). A notify watcher on the
// directory turns edits from any process, ourselves included, into
// ChangeEvents; the service coalesces the resulting bursts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use notify::{EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use crate::assignment::{AssignmentKey, LayoutId, QuickSlot};
use crate::error::PersistenceError;
use crate::layout::{LayoutFlag, LayoutFlagKey, LayoutRecord};
use crate::persistence::{ChangeEvent, EventSink, PersistenceBackend, SetResults};
use crate::util::write_atomic;

const LAYOUT_DIR: &str = "layouts";
const ASSIGNMENTS_FILE: &str = "assignments.json";

// ── on-disk schema ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct AssignmentsFile {
    #[serde(default)]
    assignments: Vec<AssignmentEntry>,
    #[serde(default)]
    quick_slots: Vec<QuickSlotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssignmentEntry {
    screen: String,
    #[serde(default)]
    desktop: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    activity: Option<String>,
    layout: LayoutId,
}

#[derive(Debug, Serialize, Deserialize)]
struct QuickSlotEntry {
    slot: QuickSlot,
    layout: LayoutId,
}

impl AssignmentsFile {
    fn assignments(&self) -> BTreeMap<AssignmentKey, LayoutId> {
        self.assignments
            .iter()
            .map(|e| {
                (
                    AssignmentKey::new(e.screen.as_str(), e.desktop, e.activity.as_deref()),
                    e.layout.clone(),
                )
            })
            .collect()
    }

    fn set_assignments(&mut self, map: BTreeMap<AssignmentKey, LayoutId>) {
        self.assignments = map
            .into_iter()
            .map(|(k, layout)| AssignmentEntry {
                screen: k.screen().to_string(),
                desktop: k.desktop(),
                activity: k.activity().map(str::to_owned),
                layout,
            })
            .collect();
    }

    fn quick_slots(&self) -> BTreeMap<QuickSlot, LayoutId> {
        self.quick_slots
            .iter()
            .map(|e| (e.slot, e.layout.clone()))
            .collect()
    }

    fn set_quick_slots(&mut self, slots: BTreeMap<QuickSlot, LayoutId>) {
        self.quick_slots = slots
            .into_iter()
            .map(|(slot, layout)| QuickSlotEntry { slot, layout })
            .collect();
    }
}

// ── store ─────────────────────────────────────────────────────────────────────

pub struct JsonStore {
    root: PathBuf,
    // Serializes read-modify-write cycles on our own files.
    write_lock: Mutex<()>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

impl JsonStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(LAYOUT_DIR))?;
        tracing::info!("JSON store at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
            watcher: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn layout_path(&self, id: &LayoutId) -> Result<PathBuf, PersistenceError> {
        let raw = id.as_str();
        if raw.is_empty() || raw.starts_with('.') || raw.contains(|c: char| c == '/' || c == '\\') {
            return Err(PersistenceError::Rejected(format!("invalid layout id `{raw}`")));
        }
        Ok(self.root.join(LAYOUT_DIR).join(format!("{raw}.json")))
    }

    fn read_assignments(&self) -> Result<AssignmentsFile, PersistenceError> {
        let path = self.root.join(ASSIGNMENTS_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AssignmentsFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_assignments(&self, file: &AssignmentsFile) -> Result<(), PersistenceError> {
        let text = serde_json::to_string_pretty(file)?;
        write_atomic(&self.root.join(ASSIGNMENTS_FILE), text.as_bytes())?;
        Ok(())
    }

    fn write_layout(&self, record: &LayoutRecord) -> Result<(), PersistenceError> {
        let path = self.layout_path(&LayoutId::new(record.id.clone()))?;
        let text = serde_json::to_string_pretty(record)?;
        write_atomic(&path, text.as_bytes())?;
        Ok(())
    }

    fn insert_new(&self, mut record: LayoutRecord) -> Result<LayoutId, PersistenceError> {
        if record.id.trim().is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        let id = LayoutId::new(record.id.clone());
        if self.layout_path(&id)?.exists() {
            return Err(PersistenceError::Rejected(format!("layout {id} already exists")));
        }
        self.write_layout(&record)?;
        Ok(id)
    }
}

impl PersistenceBackend for JsonStore {
    fn get_assignment(&self, key: &AssignmentKey) -> Result<Option<LayoutId>, PersistenceError> {
        Ok(self.read_assignments()?.assignments().remove(key))
    }

    fn list_assignments(&self) -> Result<Vec<(AssignmentKey, LayoutId)>, PersistenceError> {
        Ok(self.read_assignments()?.assignments().into_iter().collect())
    }

    fn set_assignments(&self, batch: BTreeMap<AssignmentKey, Option<LayoutId>>) -> SetResults<AssignmentKey> {
        let _guard = self.lock();
        let written = self.read_assignments().and_then(|mut file| {
            let mut map = file.assignments();
            for (key, value) in &batch {
                match value {
                    Some(id) => map.insert(key.clone(), id.clone()),
                    None => map.remove(key),
                };
            }
            file.set_assignments(map);
            self.write_assignments(&file)
        });
        // One file, one write: every key shares its fate.
        batch
            .into_keys()
            .map(|k| (k, written.clone()))
            .collect()
    }

    fn get_quick_slots(&self) -> Result<BTreeMap<QuickSlot, LayoutId>, PersistenceError> {
        Ok(self.read_assignments()?.quick_slots())
    }

    fn set_quick_slots(&self, slots: BTreeMap<QuickSlot, LayoutId>) -> Result<(), PersistenceError> {
        let _guard = self.lock();
        let mut file = self.read_assignments()?;
        file.set_quick_slots(slots);
        self.write_assignments(&file)
    }

    fn get_layout(&self, id: &LayoutId) -> Result<LayoutRecord, PersistenceError> {
        let path = self.layout_path(id)?;
        let text = std::fs::read_to_string(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PersistenceError::NotFound(id.to_string()),
            _ => e.into(),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Unparseable files are skipped with a warning.
    fn list_layouts(&self) -> Result<Vec<LayoutRecord>, PersistenceError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(self.root.join(LAYOUT_DIR))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = std::fs::read_to_string(&path)
                .map_err(PersistenceError::from)
                .and_then(|t| serde_json::from_str::<LayoutRecord>(&t).map_err(PersistenceError::from));
            match parsed {
                Ok(record) => out.push(record),
                Err(e) => tracing::warn!("Skipping {}: {e}", path.display()),
            }
        }
        Ok(out)
    }

    fn set_layout_flags(&self, batch: BTreeMap<LayoutFlagKey, bool>) -> SetResults<LayoutFlagKey> {
        let _guard = self.lock();
        batch
            .into_iter()
            .map(|(key, value)| {
                let result = self.get_layout(&key.layout).and_then(|mut record| {
                    match key.flag {
                        LayoutFlag::HiddenFromSelector => record.hidden_from_selector = value,
                        LayoutFlag::AutoAssign => record.auto_assign = value,
                    }
                    self.write_layout(&record)
                });
                (key, result)
            })
            .collect()
    }

    fn create_layout(&self, record: LayoutRecord) -> Result<LayoutId, PersistenceError> {
        let _guard = self.lock();
        self.insert_new(record)
    }

    fn duplicate_layout(&self, id: &LayoutId) -> Result<LayoutId, PersistenceError> {
        let _guard = self.lock();
        let mut copy = self.get_layout(id)?;
        copy.id = String::new();
        copy.name = format!("{} (Copy)", copy.name);
        self.insert_new(copy)
    }

    fn delete_layout(&self, id: &LayoutId) -> Result<(), PersistenceError> {
        let _guard = self.lock();
        let path = self.layout_path(id)?;
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PersistenceError::NotFound(id.to_string()),
            _ => e.into(),
        })?;

        let mut file = self.read_assignments()?;
        let before = file.assignments.len() + file.quick_slots.len();
        file.assignments.retain(|e| &e.layout != id);
        file.quick_slots.retain(|e| &e.layout != id);
        if file.assignments.len() + file.quick_slots.len() != before {
            self.write_assignments(&file)?;
        }
        Ok(())
    }

    /// An imported id that already exists is replaced by a fresh one.
    fn import_layout(&self, path: &Path) -> Result<LayoutId, PersistenceError> {
        let text = std::fs::read_to_string(path)?;
        let mut record: LayoutRecord = serde_json::from_str(&text)?;
        let _guard = self.lock();
        let taken = !record.id.trim().is_empty()
            && self.layout_path(&LayoutId::new(record.id.clone()))?.exists();
        if taken {
            record.id = String::new();
        }
        self.insert_new(record)
    }

    fn export_layout(&self, id: &LayoutId, path: &Path) -> Result<(), PersistenceError> {
        let record = self.get_layout(id)?;
        write_atomic(path, serde_json::to_string_pretty(&record)?.as_bytes())?;
        Ok(())
    }

    fn subscribe(&self, sink: EventSink) {
        let root = self.root.clone();
        let handler = {
            let root = root.clone();
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for change in classify(&root, &event) {
                        sink(change);
                    }
                }
                Err(e) => tracing::warn!("Store watcher error: {e}"),
            }
        };
        let watcher = notify::recommended_watcher(handler).and_then(|mut w| {
            w.watch(&root, RecursiveMode::Recursive)?;
            Ok(w)
        });
        match watcher {
            Ok(w) => {
                *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(w);
                tracing::info!("Watching {}", root.display());
            }
            Err(e) => tracing::warn!("Could not watch {}: {e}, external edits need a manual refresh", root.display()),
        }
    }
}

/// Map a filesystem event to the changes it implies. Temp files and
/// metadata-only events map to nothing.
fn classify(root: &Path, event: &notify::Event) -> Vec<ChangeEvent> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }
    let structural = matches!(event.kind, EventKind::Create(_) | EventKind::Remove(_))
        || matches!(event.kind, EventKind::Modify(notify::event::ModifyKind::Name(_)));

    let mut out = Vec::new();
    for path in &event.paths {
        let Ok(rel) = path.strip_prefix(root) else { continue };
        let name = match rel.file_name().and_then(|n| n.to_str()) {
            Some(n) if !n.starts_with('.') => n,
            _ => continue,
        };
        if rel == Path::new(ASSIGNMENTS_FILE) {
            push_unique(&mut out, ChangeEvent::AssignmentChanged);
            push_unique(&mut out, ChangeEvent::QuickSlotsChanged);
        } else if rel.parent() == Some(Path::new(LAYOUT_DIR)) {
            if let Some(stem) = name.strip_suffix(".json") {
                push_unique(&mut out, ChangeEvent::LayoutChanged(LayoutId::new(stem)));
                if structural {
                    push_unique(&mut out, ChangeEvent::LayoutListChanged);
                }
            }
        }
    }
    out
}

fn push_unique(out: &mut Vec<ChangeEvent>, event: ChangeEvent) {
    if !out.contains(&event) {
        out.push(event);
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
