// engine.rs - ResolutionEngine: "which layout applies here, right now"
//
// Owns the last good snapshot of persisted state (catalog + assignment store),
// the staged edits layered on top of it, and the backend used to refresh and
// commit. Everything here runs on one thread; the only work that leaves it is
// `CommitBatch::apply`, which the daemon may run on a worker between
// `begin_commit` and `finish_commit`.
//
// Screen references coming from clients are normalized to stable ids before
// any lookup or staging.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::assignment::{
    resolve_in, AssignmentKey, AssignmentSource, AssignmentStore, LayoutId, QuickSlot, Resolution,
    ScreenId,
};
use crate::coalesce::ChangeSet;
use crate::config::Settings;
use crate::context::{normalize_screen, ActivityProvider, ScreenContextProvider, ScreenInfo};
use crate::error::{CommitError, EngineError, PersistenceError};
use crate::layout::{
    builtin_autotile, sort_for_selector, Layout, LayoutCatalog, LayoutFlag, LayoutFlagKey,
    LayoutRecord,
};
use crate::pending::{CommitBatch, CommitReport, PendingChangeBuffer, Staged, StagedTarget};
use crate::persistence::{BoundedBackend, SharedBackend};
use crate::tiling::Rect;

// ── refresh report ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshPart {
    LayoutList,
    Layout(LayoutId),
    Assignments,
    QuickSlots,
}

/// Parts that could not be refetched. Each of them kept its previous
/// snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failures: Vec<(RefreshPart, PersistenceError)>,
}

impl RefreshReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn record<T>(&mut self, part: RefreshPart, r: Result<T, PersistenceError>) -> Option<T> {
        match r {
            Ok(v) => {
                self.refreshed += 1;
                Some(v)
            }
            Err(e) => {
                tracing::warn!("Refresh of {part:?} failed, keeping previous snapshot: {e}");
                self.failures.push((part, e));
                None
            }
        }
    }
}

// ── engine ────────────────────────────────────────────────────────────────────

pub struct ResolutionEngine {
    settings: Arc<Settings>,
    backend: BoundedBackend,
    catalog: LayoutCatalog,
    builtins: BTreeSet<LayoutId>,
    store: AssignmentStore,
    pending: PendingChangeBuffer,
    screens: Box<dyn ScreenContextProvider>,
    activities: Option<Box<dyn ActivityProvider>>,
    /// Last activity reported by a change notification or a client.
    current_activity: Option<String>,
}

impl ResolutionEngine {
    /// Starts with an empty snapshot; call `refresh` to populate it.
    pub fn new(
        settings: Arc<Settings>,
        backend: SharedBackend,
        screens: Box<dyn ScreenContextProvider>,
    ) -> Self {
        let backend = BoundedBackend::new(backend, settings.general.persistence_timeout);
        let mut engine = Self {
            settings,
            backend,
            catalog: LayoutCatalog::new(),
            builtins: BTreeSet::new(),
            store: AssignmentStore::new(),
            pending: PendingChangeBuffer::new(),
            screens,
            activities: None,
            current_activity: None,
        };
        engine.install_builtins();
        engine
    }

    pub fn with_activities(mut self, provider: Box<dyn ActivityProvider>) -> Self {
        self.activities = Some(provider);
        self
    }

    /// Hand `sink` to the activity provider. Returns false without one.
    pub fn subscribe_activities(&self, sink: Box<dyn Fn(String) + Send + Sync>) -> bool {
        match &self.activities {
            Some(provider) => {
                provider.subscribe(sink);
                true
            }
            None => false,
        }
    }

    pub fn activity_changed(&mut self, activity: Option<String>) {
        if self.current_activity != activity {
            tracing::info!("Current activity: {activity:?}");
            self.current_activity = activity;
        }
    }

    /// The last reported activity, else whatever the provider says now.
    pub fn current_activity(&self) -> Option<String> {
        self.current_activity
            .clone()
            .or_else(|| self.activities.as_ref().and_then(|a| a.current_activity()))
    }

    // ── accessors ─────────────────────────────────────────────────────────────

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn backend(&self) -> &BoundedBackend {
        &self.backend
    }

    pub fn catalog(&self) -> &LayoutCatalog {
        &self.catalog
    }

    pub fn layout(&self, id: &LayoutId) -> Option<&Layout> {
        self.catalog.get(id)
    }

    pub fn pending(&self) -> &PendingChangeBuffer {
        &self.pending
    }

    pub fn screens(&self) -> Vec<ScreenInfo> {
        self.screens.list_screens()
    }

    pub fn replace_screens(&mut self, screens: Box<dyn ScreenContextProvider>) {
        self.screens = screens;
    }

    /// Swap in a new settings snapshot. The old one is left untouched for
    /// anyone still holding it.
    pub fn reload(&mut self, settings: Arc<Settings>) {
        self.backend.set_timeout(settings.general.persistence_timeout);
        self.settings = settings;
        self.install_builtins();
        tracing::info!("Settings reloaded");
    }

    // ── normalization ─────────────────────────────────────────────────────────

    pub fn normalize_screen(&self, raw: &str) -> ScreenId {
        normalize_screen(&self.screens.list_screens(), raw)
    }

    /// Key for a client-supplied screen reference.
    pub fn key(&self, screen: &str, desktop: u32, activity: Option<&str>) -> AssignmentKey {
        AssignmentKey::new(self.normalize_screen(screen), desktop, activity)
    }

    fn normalize_key(&self, key: AssignmentKey) -> AssignmentKey {
        let screen = self.normalize_screen(key.screen().as_str());
        key.with_screen(screen)
    }

    // ── resolution ────────────────────────────────────────────────────────────

    pub fn resolve(&self, screen: &str, desktop: u32, activity: Option<&str>) -> Option<LayoutId> {
        self.resolve_detailed(screen, desktop, activity).map(|r| r.layout)
    }

    /// Like `resolve`, but says which entry answered.
    pub fn resolve_detailed(&self, screen: &str, desktop: u32, activity: Option<&str>) -> Option<Resolution> {
        let screen = self.normalize_screen(screen);
        resolve_in(
            &self.pending.overlay(&self.store),
            &screen,
            desktop,
            activity,
            self.settings.general.default_layout.as_ref(),
        )
    }

    /// `resolve`, falling back to the catalog's lowest-ordered layout.
    pub fn resolve_or_implicit(&self, screen: &str, desktop: u32, activity: Option<&str>) -> Option<LayoutId> {
        self.resolve(screen, desktop, activity)
            .or_else(|| self.catalog.implicit_default().map(|l| l.id.clone()))
    }

    /// Resolution for the focused screen and current activity.
    pub fn resolve_current(&self, desktop: u32) -> Option<LayoutId> {
        let screen = self.screens.current_focused_screen()?;
        let activity = self.current_activity();
        self.resolve_or_implicit(screen.as_str(), desktop, activity.as_deref())
    }

    pub fn has_explicit_assignment(&self, key: &AssignmentKey) -> bool {
        let key = self.normalize_key(key.clone());
        self.pending.overlay(&self.store).explicit(&key).is_some()
    }

    /// Explicit entry for exactly `key`, staged edits included. No
    /// inheritance.
    pub fn assignment(&self, key: &AssignmentKey) -> Option<LayoutId> {
        let key = self.normalize_key(key.clone());
        self.pending.overlay(&self.store).explicit(&key).cloned()
    }

    pub fn quick_slot(&self, slot: QuickSlot) -> Option<LayoutId> {
        self.pending
            .quick_slot(slot)
            .or_persisted(self.store.quick_slot(slot))
            .cloned()
    }

    /// Every occupied slot, staged edits included.
    pub fn quick_slots(&self) -> BTreeMap<QuickSlot, LayoutId> {
        QuickSlot::all()
            .filter_map(|s| self.quick_slot(s).map(|id| (s, id)))
            .collect()
    }

    /// Effective flag value; `None` for an unknown layout. A staged clear
    /// reads as `false`.
    pub fn layout_flag(&self, layout: &LayoutId, flag: LayoutFlag) -> Option<bool> {
        let current = self.catalog.get(layout)?.flag(flag);
        let key = LayoutFlagKey {
            layout: layout.clone(),
            flag,
        };
        Some(match self.pending.layout_flag(&key) {
            Staged::Pending(v) => *v,
            Staged::Cleared => false,
            Staged::Untouched => current,
        })
    }

    /// Layouts to offer in the picker, in display order.
    pub fn selector_layouts(&self) -> Vec<&Layout> {
        let mut layouts: Vec<&Layout> = self
            .catalog
            .list()
            .into_iter()
            .filter(|l| self.layout_flag(&l.id, LayoutFlag::HiddenFromSelector) != Some(true))
            .collect();
        sort_for_selector(&mut layouts, self.settings.general.autotile);
        layouts
    }

    // ── geometry ──────────────────────────────────────────────────────────────

    pub fn compute_rects(&self, layout: &LayoutId, container: Rect, window_count: usize) -> Result<Vec<Rect>, EngineError> {
        let layout = self
            .catalog
            .get(layout)
            .ok_or_else(|| EngineError::UnknownLayout(layout.clone()))?;
        Ok(layout.compute_rects(container, window_count))
    }

    /// Resolve a context and lay out `window_count` windows on that screen.
    pub fn compute_for_screen(
        &self,
        screen: &str,
        desktop: u32,
        activity: Option<&str>,
        window_count: usize,
    ) -> Result<(LayoutId, Vec<Rect>), EngineError> {
        let id = self.normalize_screen(screen);
        let info = self
            .screens
            .list_screens()
            .into_iter()
            .find(|s| s.id == id.as_str())
            .ok_or_else(|| EngineError::UnknownScreen(id.clone()))?;
        let layout = self
            .resolve_or_implicit(id.as_str(), desktop, activity)
            .ok_or(EngineError::NoLayout(id))?;
        let rects = self.compute_rects(&layout, info.area(), window_count)?;
        Ok((layout, rects))
    }

    // ── staging ───────────────────────────────────────────────────────────────

    pub fn stage_assignment(&mut self, key: AssignmentKey, layout: Option<LayoutId>) -> Result<(), EngineError> {
        self.check_known(layout.as_ref())?;
        let key = self.normalize_key(key);
        tracing::debug!("Staged assignment {key} → {layout:?}");
        self.pending.stage_assignment(key, layout);
        Ok(())
    }

    pub fn stage_quick_slot(&mut self, slot: QuickSlot, layout: Option<LayoutId>) -> Result<(), EngineError> {
        self.check_known(layout.as_ref())?;
        tracing::debug!("Staged {slot} → {layout:?}");
        self.pending.stage_quick_slot(slot, layout);
        Ok(())
    }

    pub fn stage_layout_flag(&mut self, layout: &LayoutId, flag: LayoutFlag, value: Option<bool>) -> Result<(), EngineError> {
        self.check_known(Some(layout))?;
        self.pending.stage_layout_flag(
            LayoutFlagKey {
                layout: layout.clone(),
                flag,
            },
            value,
        );
        Ok(())
    }

    fn check_known(&self, layout: Option<&LayoutId>) -> Result<(), EngineError> {
        match layout {
            Some(id) if !self.catalog.contains(id) => Err(EngineError::UnknownLayout(id.clone())),
            _ => Ok(()),
        }
    }

    pub fn discard(&mut self) -> usize {
        let n = self.pending.discard();
        tracing::info!("Discarded {n} staged edit(s)");
        n
    }

    // ── commit ────────────────────────────────────────────────────────────────

    pub fn begin_commit(&mut self) -> Result<CommitBatch, CommitError> {
        self.pending.begin_commit(self.store.quick_slots())
    }

    /// Fold successful writes into the snapshot and release the commit guard.
    pub fn finish_commit(&mut self, batch: &CommitBatch, report: &CommitReport) {
        let mut slots_written = false;
        for target in report.succeeded() {
            match target {
                StagedTarget::Assignment(key) => {
                    let value = batch.assignments.get(key).cloned().flatten();
                    self.store.set(key.clone(), value);
                }
                StagedTarget::QuickSlot(_) => slots_written = true,
                StagedTarget::LayoutFlag(key) => {
                    let value = batch.layout_flags.get(key).copied().flatten().unwrap_or(false);
                    if let Some(layout) = self.catalog.get_mut(&key.layout) {
                        layout.set_flag(key.flag, value);
                    }
                }
            }
        }
        if slots_written {
            self.store.replace_quick_slots(batch.quick_slots.clone());
        }
        self.pending.finish_commit(batch, report);
        tracing::info!(
            "Commit finished: {} ok, {} failed, {} still staged",
            report.succeeded().count(),
            report.failures().count(),
            self.pending.len()
        );
    }

    /// Blocking commit on the calling thread.
    pub fn commit(&mut self) -> Result<CommitReport, CommitError> {
        let batch = self.begin_commit()?;
        let report = batch.apply(&self.backend);
        self.finish_commit(&batch, &report);
        Ok(report)
    }

    // ── refresh ───────────────────────────────────────────────────────────────

    pub fn refresh(&mut self) -> RefreshReport {
        self.apply_changes(&ChangeSet::all())
    }

    /// Refetch only what `changes` names.
    pub fn apply_changes(&mut self, changes: &ChangeSet) -> RefreshReport {
        let mut report = RefreshReport::default();

        if changes.layout_list {
            let fetched = self.backend.list_layouts();
            if let Some(records) = report.record(RefreshPart::LayoutList, fetched) {
                self.catalog = LayoutCatalog::from_records(records);
                self.builtins.clear();
                self.install_builtins();
            }
        } else {
            for id in &changes.layouts {
                match self.backend.get_layout(id) {
                    Ok(record) => {
                        report.refreshed += 1;
                        self.upsert_record(record);
                    }
                    Err(PersistenceError::NotFound(_)) => {
                        report.refreshed += 1;
                        self.catalog.remove(id);
                    }
                    Err(e) => {
                        report.record::<()>(RefreshPart::Layout(id.clone()), Err(e));
                    }
                }
            }
        }

        if changes.assignments {
            let fetched = self.backend.list_assignments();
            if let Some(entries) = report.record(RefreshPart::Assignments, fetched) {
                self.store.replace_assignments(entries);
            }
        }

        if changes.quick_slots {
            let fetched = self.backend.get_quick_slots();
            if let Some(slots) = report.record(RefreshPart::QuickSlots, fetched) {
                self.store.replace_quick_slots(slots);
            }
        }

        tracing::info!(
            "Refresh: {} part(s) updated, {} failed, {} layouts, {} assignments",
            report.refreshed,
            report.failures.len(),
            self.catalog.len(),
            self.store.assignments().count()
        );
        report
    }

    fn upsert_record(&mut self, record: LayoutRecord) -> Option<LayoutId> {
        let raw_id = record.id.clone();
        match Layout::try_from(record) {
            Ok(layout) => {
                let id = layout.id.clone();
                self.builtins.remove(&id);
                self.catalog.upsert(layout);
                Some(id)
            }
            Err(e) => {
                tracing::warn!("Layout '{raw_id}' skipped: {e}");
                None
            }
        }
    }

    /// Add the per-algorithm autotile layouts when autotiling is on. Layouts
    /// from the backend with the same id win.
    fn install_builtins(&mut self) {
        for id in std::mem::take(&mut self.builtins) {
            self.catalog.remove(&id);
        }
        if !self.settings.general.autotile {
            return;
        }
        for layout in builtin_autotile(&self.settings.autotile) {
            if !self.catalog.contains(&layout.id) {
                self.builtins.insert(layout.id.clone());
                self.catalog.upsert(layout);
            }
        }
    }

    // ── layout lifecycle ──────────────────────────────────────────────────────

    /// An empty id gets a fresh UUID.
    pub fn create_layout(&mut self, mut record: LayoutRecord) -> Result<LayoutId, EngineError> {
        if record.id.trim().is_empty() {
            record.id = uuid::Uuid::new_v4().to_string();
        }
        let mut layout = Layout::try_from(record.clone())?;
        let id = self.backend.create_layout(record)?;
        layout.id = id.clone();
        self.catalog.upsert(layout);
        tracing::info!("Created layout {id}");
        Ok(id)
    }

    pub fn duplicate_layout(&mut self, id: &LayoutId) -> Result<LayoutId, EngineError> {
        let new_id = self.backend.duplicate_layout(id)?;
        self.fetch_into_catalog(&new_id)?;
        tracing::info!("Duplicated layout {id} as {new_id}");
        Ok(new_id)
    }

    /// Also clears every assignment and quick slot that pointed at the layout,
    /// persisted or staged. Refused while a commit is in flight, since the
    /// batch being written may still reference it.
    pub fn delete_layout(&mut self, id: &LayoutId) -> Result<(), EngineError> {
        if self.builtins.contains(id) {
            return Err(PersistenceError::Rejected(format!("{id} is built in")).into());
        }
        if self.pending.is_committing() {
            return Err(CommitError::Busy.into());
        }
        self.backend.delete_layout(id)?;
        self.catalog.remove(id);
        let unstaged = self.pending.forget_layout(id);

        let mut cleared = 0;
        let stale: BTreeMap<AssignmentKey, Option<LayoutId>> = self
            .store
            .assignments()
            .filter(|(_, l)| *l == id)
            .map(|(k, _)| (k.clone(), None))
            .collect();
        if !stale.is_empty() {
            for (key, result) in self.backend.set_assignments(stale) {
                match result {
                    Ok(()) => {
                        self.store.set(key, None);
                        cleared += 1;
                    }
                    Err(e) => tracing::warn!("Could not clear {key} after deleting {id}: {e}"),
                }
            }
        }
        if self.store.quick_slots().values().any(|l| l == id) {
            let mut slots = self.store.quick_slots().clone();
            let before = slots.len();
            slots.retain(|_, l| l != id);
            let dropped = before - slots.len();
            match self.backend.set_quick_slots(slots.clone()) {
                Ok(()) => {
                    self.store.replace_quick_slots(slots);
                    cleared += dropped;
                }
                Err(e) => tracing::warn!("Could not clear quick slots after deleting {id}: {e}"),
            }
        }
        tracing::info!("Deleted layout {id} ({cleared} reference(s) cleared, {unstaged} staged edit(s) dropped)");
        Ok(())
    }

    pub fn import_layout(&mut self, path: &Path) -> Result<LayoutId, EngineError> {
        let id = self.backend.import_layout(path)?;
        self.fetch_into_catalog(&id)?;
        tracing::info!("Imported layout {id} from {}", path.display());
        Ok(id)
    }

    pub fn export_layout(&self, id: &LayoutId, path: &Path) -> Result<(), EngineError> {
        if !self.catalog.contains(id) {
            return Err(EngineError::UnknownLayout(id.clone()));
        }
        self.backend.export_layout(id, path)?;
        Ok(())
    }

    fn fetch_into_catalog(&mut self, id: &LayoutId) -> Result<(), EngineError> {
        let record = self.backend.get_layout(id)?;
        let layout = Layout::try_from(record)?;
        self.catalog.upsert(layout);
        Ok(())
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
