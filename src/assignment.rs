// assignment.rs - screen/desktop/activity → layout mappings and resolution
//
// Keys always carry a stable screen id (EDID-derived, see `context`), never a
// connector name like "DP-1". Desktop 0 and a missing desktop both mean "all
// desktops"; the constructors fold one into the other so a key has exactly
// one spelling.
//
// Resolution order, most specific first:
//
//   0. (screen, desktop, activity)   both given
//   1. (screen, desktop, -)          desktop != 0
//   2. (screen, -, activity)         activity given
//   3. (screen, -, -)                screen default
//   4. process-wide default layout
//
// Steps 1 and 2 compete when both entries exist. Desktop wins; there is no
// upstream rule for this, see DESIGN.md.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── ids ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayoutId(String);

impl LayoutId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LayoutId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Stable hardware identifier of a monitor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScreenId(String);

impl ScreenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScreenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScreenId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ── quick slots ───────────────────────────────────────────────────────────────

/// One of the nine hotkey-addressable layout slots (1..=9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct QuickSlot(u8);

impl QuickSlot {
    pub const FIRST: u8 = 1;
    pub const LAST: u8 = 9;

    pub fn new(number: u8) -> Option<Self> {
        (Self::FIRST..=Self::LAST)
            .contains(&number)
            .then_some(Self(number))
    }

    pub fn number(self) -> u8 {
        self.0
    }

    pub fn all() -> impl Iterator<Item = Self> {
        (Self::FIRST..=Self::LAST).map(Self)
    }
}

impl TryFrom<u8> for QuickSlot {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        Self::new(n).ok_or_else(|| format!("quick slot {n} outside 1..=9"))
    }
}

impl From<QuickSlot> for u8 {
    fn from(slot: QuickSlot) -> u8 {
        slot.0
    }
}

impl fmt::Display for QuickSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

// ── key ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssignmentKey {
    screen: ScreenId,
    desktop: Option<u32>,
    activity: Option<String>,
}

impl AssignmentKey {
    /// `desktop == 0` and an empty activity are stored as absent.
    pub fn new(screen: impl Into<ScreenId>, desktop: u32, activity: Option<&str>) -> Self {
        Self {
            screen: screen.into(),
            desktop: (desktop != 0).then_some(desktop),
            activity: activity.filter(|a| !a.is_empty()).map(str::to_owned),
        }
    }

    pub fn screen_default(screen: impl Into<ScreenId>) -> Self {
        Self::new(screen, 0, None)
    }

    pub fn screen(&self) -> &ScreenId {
        &self.screen
    }

    /// 0 when the key applies to all desktops.
    pub fn desktop(&self) -> u32 {
        self.desktop.unwrap_or(0)
    }

    pub fn activity(&self) -> Option<&str> {
        self.activity.as_deref()
    }

    pub fn is_screen_default(&self) -> bool {
        self.desktop.is_none() && self.activity.is_none()
    }

    pub fn with_screen(self, screen: ScreenId) -> Self {
        Self { screen, ..self }
    }
}

impl fmt::Display for AssignmentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.screen)?;
        if let Some(d) = self.desktop {
            write!(f, " desktop {d}")?;
        }
        if let Some(a) = &self.activity {
            write!(f, " activity {a}")?;
        }
        Ok(())
    }
}

/// Candidate keys for a context, most specific first.
pub fn resolution_chain(
    screen: &ScreenId,
    desktop: u32,
    activity: Option<&str>,
) -> Vec<AssignmentKey> {
    let activity = activity.filter(|a| !a.is_empty());
    let mut chain = Vec::with_capacity(4);
    if desktop != 0 {
        if let Some(a) = activity {
            chain.push(AssignmentKey::new(screen.clone(), desktop, Some(a)));
        }
        chain.push(AssignmentKey::new(screen.clone(), desktop, None));
    }
    if let Some(a) = activity {
        chain.push(AssignmentKey::new(screen.clone(), 0, Some(a)));
    }
    chain.push(AssignmentKey::screen_default(screen.clone()));
    chain
}

// ── resolution ────────────────────────────────────────────────────────────────

/// Read access to explicit entries, either persisted or with staged edits
/// layered on top.
pub trait AssignmentSource {
    fn explicit(&self, key: &AssignmentKey) -> Option<&LayoutId>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedFrom {
    Explicit(AssignmentKey),
    GlobalDefault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub layout: LayoutId,
    pub from: ResolvedFrom,
}

pub fn resolve_in<S: AssignmentSource + ?Sized>(
    source: &S,
    screen: &ScreenId,
    desktop: u32,
    activity: Option<&str>,
    global_default: Option<&LayoutId>,
) -> Option<Resolution> {
    resolution_chain(screen, desktop, activity)
        .into_iter()
        .find_map(|key| {
            source.explicit(&key).map(|layout| Resolution {
                layout: layout.clone(),
                from: ResolvedFrom::Explicit(key),
            })
        })
        .or_else(|| {
            global_default.map(|layout| Resolution {
                layout: layout.clone(),
                from: ResolvedFrom::GlobalDefault,
            })
        })
}

// ── store ─────────────────────────────────────────────────────────────────────

/// Last known persisted assignments and quick slots.
#[derive(Debug, Default, Clone)]
pub struct AssignmentStore {
    assignments: BTreeMap<AssignmentKey, LayoutId>,
    quick_slots: BTreeMap<QuickSlot, LayoutId>,
}

impl AssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &AssignmentKey) -> Option<&LayoutId> {
        self.assignments.get(key)
    }

    /// `None` removes the entry. Returns the previous value.
    pub fn set(&mut self, key: AssignmentKey, layout: Option<LayoutId>) -> Option<LayoutId> {
        match layout {
            Some(id) => self.assignments.insert(key, id),
            None => self.assignments.remove(&key),
        }
    }

    pub fn has_explicit_assignment(&self, key: &AssignmentKey) -> bool {
        self.assignments.contains_key(key)
    }

    pub fn resolve(
        &self,
        screen: &ScreenId,
        desktop: u32,
        activity: Option<&str>,
        global_default: Option<&LayoutId>,
    ) -> Option<LayoutId> {
        resolve_in(self, screen, desktop, activity, global_default).map(|r| r.layout)
    }

    pub fn assignments(&self) -> impl Iterator<Item = (&AssignmentKey, &LayoutId)> {
        self.assignments.iter()
    }

    pub fn replace_assignments(&mut self, entries: impl IntoIterator<Item = (AssignmentKey, LayoutId)>) {
        self.assignments = entries.into_iter().collect();
    }

    pub fn quick_slot(&self, slot: QuickSlot) -> Option<&LayoutId> {
        self.quick_slots.get(&slot)
    }

    pub fn quick_slots(&self) -> &BTreeMap<QuickSlot, LayoutId> {
        &self.quick_slots
    }

    pub fn replace_quick_slots(&mut self, slots: BTreeMap<QuickSlot, LayoutId>) {
        self.quick_slots = slots;
    }
}

impl AssignmentSource for AssignmentStore {
    fn explicit(&self, key: &AssignmentKey) -> Option<&LayoutId> {
        self.assignments.get(key)
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
