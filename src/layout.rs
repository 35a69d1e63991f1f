// layout.rs - layout records, boundary validation and the in-memory catalog
//
// Layouts cross the persistence/IPC boundary as `LayoutRecord` JSON and are
// validated exactly once, here, into `Layout`. Nothing past this module sees
// an unvalidated zone or an out-of-range tiling parameter.
//
// Record shapes:
//
//   {
//     "id": "5b1c…", "name": "Priority Grid", "default_order": 2,
//     "hidden_from_selector": false, "auto_assign": false,
//     "kind": "static",
//     "zones": [
//       { "x": 0.0, "y": 0.0, "w": 0.66, "h": 1.0 },
//       { "x": 0.66, "y": 0.0, "w": 0.34, "h": 0.5 },
//       { "x": 0.66, "y": 0.5, "w": 0.34, "h": 0.5 }
//     ]
//   }
//
//   {
//     "id": "autotile:bsp", "name": "BSP",
//     "kind": "autotile",
//     "params": { "algorithm": "bsp", "split_ratio": 0.5 }
//   }

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::assignment::LayoutId;
use crate::error::LayoutError;
use crate::tiling::{self, Rect, TilingAlgorithm, TilingParams};

// Zone edges may overshoot the unit square by this much (float noise from
// editors that store percentages).
const ZONE_EPSILON: f64 = 1e-6;

// ── raw records ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub default_order: i32,
    #[serde(default)]
    pub hidden_from_selector: bool,
    #[serde(default)]
    pub auto_assign: bool,
    #[serde(flatten)]
    pub kind: LayoutKindRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutKindRecord {
    Static {
        zones: Vec<ZoneRecord>,
    },
    Autotile {
        #[serde(default)]
        params: TilingParams,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneRecord {
    /// Ordinal; defaults to the position in the list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

// ── validated types ───────────────────────────────────────────────────────────

/// Relative rectangle inside a monitor, every field in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub index: u32,
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Zone {
    /// Absolute rectangle inside `container`. Edges are rounded, not sizes,
    /// so neighbouring zones share their edge exactly.
    pub fn to_rect(&self, container: Rect) -> Rect {
        let w = container.width as f64;
        let h = container.height as f64;
        let left = (self.x * w).round() as i32;
        let top = (self.y * h).round() as i32;
        let right = ((self.x + self.w) * w).round() as i32;
        let bottom = ((self.y + self.h) * h).round() as i32;
        Rect::new(container.x + left, container.y + top, right - left, bottom - top)
    }

    fn in_unit_square(&self) -> bool {
        let unit = |v: f64| v.is_finite() && (-ZONE_EPSILON..=1.0 + ZONE_EPSILON).contains(&v);
        unit(self.x)
            && unit(self.y)
            && unit(self.w)
            && unit(self.h)
            && unit(self.x + self.w)
            && unit(self.y + self.h)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayoutKind {
    /// Zones sorted by index.
    Static(Vec<Zone>),
    /// Rectangles computed on demand; params are already clamped.
    Autotile(TilingParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutFlag {
    HiddenFromSelector,
    AutoAssign,
}

impl LayoutFlag {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "hidden" | "hidden_from_selector" => Some(Self::HiddenFromSelector),
            "auto_assign" | "autoassign" => Some(Self::AutoAssign),
            _ => None,
        }
    }
}

/// A flag on one layout, the unit of a staged flag edit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LayoutFlagKey {
    pub layout: LayoutId,
    pub flag: LayoutFlag,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub id: LayoutId,
    pub name: String,
    pub kind: LayoutKind,
    pub default_order: i32,
    pub hidden_from_selector: bool,
    pub auto_assign: bool,
}

impl Layout {
    pub fn is_autotile(&self) -> bool {
        matches!(self.kind, LayoutKind::Autotile(_))
    }

    pub fn algorithm(&self) -> Option<TilingAlgorithm> {
        match &self.kind {
            LayoutKind::Autotile(p) => Some(p.algorithm),
            LayoutKind::Static(_) => None,
        }
    }

    pub fn zone_count(&self) -> Option<usize> {
        match &self.kind {
            LayoutKind::Static(zones) => Some(zones.len()),
            LayoutKind::Autotile(_) => None,
        }
    }

    /// Window rectangles inside `container`. Static layouts always yield
    /// every zone regardless of `window_count`.
    pub fn compute_rects(&self, container: Rect, window_count: usize) -> Vec<Rect> {
        match &self.kind {
            LayoutKind::Static(zones) => zones.iter().map(|z| z.to_rect(container)).collect(),
            LayoutKind::Autotile(params) => {
                tiling::compute_rects(container.width, container.height, window_count, params)
                    .into_iter()
                    .map(|r| r.translate(container.x, container.y))
                    .collect()
            }
        }
    }

    pub fn flag(&self, flag: LayoutFlag) -> bool {
        match flag {
            LayoutFlag::HiddenFromSelector => self.hidden_from_selector,
            LayoutFlag::AutoAssign => self.auto_assign,
        }
    }

    pub fn set_flag(&mut self, flag: LayoutFlag, value: bool) {
        match flag {
            LayoutFlag::HiddenFromSelector => self.hidden_from_selector = value,
            LayoutFlag::AutoAssign => self.auto_assign = value,
        }
    }

    pub fn to_record(&self) -> LayoutRecord {
        let kind = match &self.kind {
            LayoutKind::Static(zones) => LayoutKindRecord::Static {
                zones: zones
                    .iter()
                    .map(|z| ZoneRecord {
                        index: Some(z.index),
                        x: z.x,
                        y: z.y,
                        w: z.w,
                        h: z.h,
                    })
                    .collect(),
            },
            LayoutKind::Autotile(params) => LayoutKindRecord::Autotile { params: *params },
        };
        LayoutRecord {
            id: self.id.to_string(),
            name: self.name.clone(),
            default_order: self.default_order,
            hidden_from_selector: self.hidden_from_selector,
            auto_assign: self.auto_assign,
            kind,
        }
    }
}

impl TryFrom<LayoutRecord> for Layout {
    type Error = LayoutError;

    fn try_from(raw: LayoutRecord) -> Result<Self, Self::Error> {
        let id = raw.id.trim().to_owned();
        if id.is_empty() {
            return Err(LayoutError::EmptyId);
        }

        let kind = match raw.kind {
            LayoutKindRecord::Static { zones } => {
                if zones.is_empty() {
                    return Err(LayoutError::NoZones { id });
                }
                let mut out = Vec::with_capacity(zones.len());
                for (pos, z) in zones.iter().enumerate() {
                    let zone = Zone {
                        index: z.index.unwrap_or(pos as u32),
                        x: z.x,
                        y: z.y,
                        w: z.w,
                        h: z.h,
                    };
                    if !zone.in_unit_square() {
                        return Err(LayoutError::ZoneOutOfRange {
                            id,
                            index: zone.index,
                        });
                    }
                    out.push(zone);
                }
                out.sort_by_key(|z| z.index);
                LayoutKind::Static(out)
            }
            LayoutKindRecord::Autotile { params } => LayoutKind::Autotile(params.clamped()),
        };

        let name = if raw.name.trim().is_empty() {
            id.clone()
        } else {
            raw.name
        };

        Ok(Self {
            id: LayoutId::new(id),
            name,
            kind,
            default_order: raw.default_order,
            hidden_from_selector: raw.hidden_from_selector,
            auto_assign: raw.auto_assign,
        })
    }
}

// ── catalog ───────────────────────────────────────────────────────────────────

/// All known layouts, keyed by id. `list()` is unordered; use
/// `sort_for_selector` for presentation order.
#[derive(Debug, Default, Clone)]
pub struct LayoutCatalog {
    layouts: HashMap<LayoutId, Layout>,
}

impl LayoutCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from backend records. Invalid records are skipped with a
    /// warning, never fatal.
    pub fn from_records(records: Vec<LayoutRecord>) -> Self {
        let mut catalog = Self::default();
        for record in records {
            let raw_id = record.id.clone();
            match Layout::try_from(record) {
                Ok(layout) => {
                    catalog.upsert(layout);
                }
                Err(e) => tracing::warn!("Layout '{raw_id}' skipped: {e}"),
            }
        }
        catalog
    }

    pub fn get(&self, id: &LayoutId) -> Option<&Layout> {
        self.layouts.get(id)
    }

    pub fn get_mut(&mut self, id: &LayoutId) -> Option<&mut Layout> {
        self.layouts.get_mut(id)
    }

    pub fn contains(&self, id: &LayoutId) -> bool {
        self.layouts.contains_key(id)
    }

    pub fn list(&self) -> Vec<&Layout> {
        self.layouts.values().collect()
    }

    /// Replaces an existing layout with the same id wholesale.
    pub fn upsert(&mut self, layout: Layout) -> Option<Layout> {
        self.layouts.insert(layout.id.clone(), layout)
    }

    pub fn remove(&mut self, id: &LayoutId) -> Option<Layout> {
        self.layouts.remove(id)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Lowest `default_order`, ties broken by name then id.
    pub fn implicit_default(&self) -> Option<&Layout> {
        self.layouts.values().min_by(|a, b| {
            a.default_order
                .cmp(&b.default_order)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        })
    }
}

pub const BUILTIN_PREFIX: &str = "autotile:";

// Built-ins sort after anything the user made when picking an implicit default.
const BUILTIN_ORDER: i32 = 1000;

/// One autotile layout per algorithm (`autotile:bsp`, ...), all sharing the
/// configured `params`.
pub fn builtin_autotile(params: &TilingParams) -> Vec<Layout> {
    TilingAlgorithm::ALL
        .iter()
        .map(|&algorithm| Layout {
            id: LayoutId::new(format!("{BUILTIN_PREFIX}{}", algorithm.key())),
            name: algorithm.label().to_owned(),
            kind: LayoutKind::Autotile(TilingParams { algorithm, ..params.clamped() }),
            default_order: BUILTIN_ORDER,
            hidden_from_selector: false,
            auto_assign: false,
        })
        .collect()
}

/// Static layouts alphabetically, then autotile layouts alphabetically.
/// Autotile layouts are dropped when the feature is off.
pub fn sort_for_selector(layouts: &mut Vec<&Layout>, autotile_enabled: bool) {
    if !autotile_enabled {
        layouts.retain(|l| !l.is_autotile());
    }
    layouts.sort_by(|a, b| {
        a.is_autotile()
            .cmp(&b.is_autotile())
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ── tests ─────────────────────────────────────────────────────────────────────
