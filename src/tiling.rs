// tiling.rs - autotile geometry
//
// Pure functions turning a container size, a window count and a set of
// TilingParams into window rectangles. Nothing here touches assignments or
// persistence.
//
// Output order is the intended stacking order:
//
//   master_stack  →  masters top-to-bottom, then the stack top-to-bottom
//   columns       →  left-to-right
//   bsp           →  pre-order over the split tree
//
// Integer remainders of equal splits go to the last cell so the rectangles
// always cover the whole available area.

use serde::{Deserialize, Serialize};

/// BSP cells are never split below this width or height (logical units).
pub const MIN_CELL_SIZE: i32 = 20;

pub const MIN_SPLIT_RATIO: f64 = 0.1;
pub const MAX_SPLIT_RATIO: f64 = 0.9;
pub const MIN_MASTER_COUNT: u32 = 1;
pub const MAX_MASTER_COUNT: u32 = 5;
/// Gaps above this are treated as this. Keeps gap sums inside `i32`.
pub const MAX_GAP: u32 = (i32::MAX / 4) as u32;

// ── geometry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Shrink by `by` on every edge. Never produces a negative size, and an
    /// inset larger than the rect collapses it onto its centre.
    pub fn inset(&self, by: i32) -> Self {
        let by = by.max(0);
        let dx = by.min(self.width.max(0) / 2);
        let dy = by.min(self.height.max(0) / 2);
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            width: self.width.saturating_sub(by.saturating_mul(2)).max(0),
            height: self.height.saturating_sub(by.saturating_mul(2)).max(0),
        }
    }

    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            ..*self
        }
    }
}

// ── algorithm / params ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TilingAlgorithm {
    #[default]
    MasterStack,
    Columns,
    Bsp,
}

impl TilingAlgorithm {
    pub const ALL: [Self; 3] = [Self::MasterStack, Self::Columns, Self::Bsp];

    /// Config / wire spelling.
    pub fn key(&self) -> &'static str {
        match self {
            Self::MasterStack => "master_stack",
            Self::Columns => "columns",
            Self::Bsp => "bsp",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::MasterStack => "Master + Stack",
            Self::Columns => "Columns",
            Self::Bsp => "BSP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "master_stack" | "masterstack" | "master-stack" => Some(Self::MasterStack),
            "columns" | "cols" => Some(Self::Columns),
            "bsp" => Some(Self::Bsp),
            _ => None,
        }
    }
}

/// Where a newly tiled window enters the tiling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPosition {
    #[default]
    End,
    Start,
    AfterFocused,
}

impl InsertPosition {
    /// Index at which a new window is inserted among `len` tiled windows.
    pub fn index_for(self, len: usize, focused: Option<usize>) -> usize {
        match self {
            Self::End => len,
            Self::Start => 0,
            Self::AfterFocused => focused.map_or(len, |i| (i + 1).min(len)),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "end" | "last" => Some(Self::End),
            "start" | "first" | "master" => Some(Self::Start),
            "after_focused" | "after-focused" => Some(Self::AfterFocused),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TilingParams {
    pub algorithm: TilingAlgorithm,
    pub split_ratio: f64,
    pub master_count: u32,
    pub inner_gap: u32,
    pub outer_gap: u32,
    pub max_windows: u32,
    pub insert_position: InsertPosition,
}

impl Default for TilingParams {
    fn default() -> Self {
        Self {
            algorithm: TilingAlgorithm::MasterStack,
            split_ratio: 0.6,
            master_count: 1,
            inner_gap: 8,
            outer_gap: 8,
            max_windows: 6,
            insert_position: InsertPosition::End,
        }
    }
}

impl TilingParams {
    /// Copy with every field pulled into its valid range. Out-of-range input
    /// is never an error: tiling must always produce usable geometry.
    pub fn clamped(&self) -> Self {
        let split_ratio = if self.split_ratio.is_finite() {
            self.split_ratio.clamp(MIN_SPLIT_RATIO, MAX_SPLIT_RATIO)
        } else {
            Self::default().split_ratio
        };
        let out = Self {
            split_ratio,
            master_count: self.master_count.clamp(MIN_MASTER_COUNT, MAX_MASTER_COUNT),
            inner_gap: self.inner_gap.min(MAX_GAP),
            outer_gap: self.outer_gap.min(MAX_GAP),
            max_windows: self.max_windows.max(1),
            ..*self
        };
        if out != *self {
            tracing::debug!(
                "Tiling params clamped: ratio {} → {}, masters {} → {}, max_windows {} → {}, gaps {}/{} → {}/{}",
                self.split_ratio,
                out.split_ratio,
                self.master_count,
                out.master_count,
                self.max_windows,
                out.max_windows,
                self.inner_gap,
                self.outer_gap,
                out.inner_gap,
                out.outer_gap
            );
        }
        out
    }
}

// ── entry point ───────────────────────────────────────────────────────────────

/// Rectangles for `window_count` windows in a `width` × `height` container
/// whose origin is (0, 0). Returns `min(window_count, max_windows)` rects,
/// except for BSP on a container too small to split (see `bsp_split`).
pub fn compute_rects(
    width: i32,
    height: i32,
    window_count: usize,
    params: &TilingParams,
) -> Vec<Rect> {
    let p = params.clamped();
    let count = window_count.min(p.max_windows as usize);
    if count == 0 {
        return Vec::new();
    }

    let area = Rect::new(0, 0, width.max(0), height.max(0)).inset(gap_px(p.outer_gap));
    if count == 1 {
        return vec![area];
    }

    let gap = gap_px(p.inner_gap);
    match p.algorithm {
        TilingAlgorithm::MasterStack => {
            master_stack(area, count, p.master_count as usize, p.split_ratio, gap)
        }
        TilingAlgorithm::Columns => columns(area, count, gap),
        TilingAlgorithm::Bsp => bsp(area, count, p.split_ratio, gap),
    }
}

fn gap_px(gap: u32) -> i32 {
    i32::try_from(gap).unwrap_or(i32::MAX)
}

// ── algorithms ────────────────────────────────────────────────────────────────

fn master_stack(area: Rect, count: usize, masters: usize, ratio: f64, gap: i32) -> Vec<Rect> {
    if count <= masters {
        return column_cells(area.x, area.width, area, count, gap);
    }
    let master_w = (area.width as f64 * ratio).floor() as i32;
    let stack_w = area.width.saturating_sub(master_w).saturating_sub(gap).max(0);

    let mut out = column_cells(area.x, master_w, area, masters, gap);
    out.extend(column_cells(
        area.x
            .saturating_add(master_w)
            .saturating_add(gap)
            .min(area.x.saturating_add(area.width)),
        stack_w,
        area,
        count - masters,
        gap,
    ));
    out
}

fn columns(area: Rect, count: usize, gap: i32) -> Vec<Rect> {
    split_even(area.x, area.width, count, gap)
        .into_iter()
        .map(|(x, w)| Rect::new(x, area.y, w, area.height))
        .collect()
}

fn bsp(area: Rect, count: usize, ratio: f64, gap: i32) -> Vec<Rect> {
    let mut out = Vec::with_capacity(count);
    // First cut runs across the longer axis.
    bsp_split(area, count, area.width >= area.height, ratio, gap, &mut out);
    out
}

/// Recursive binary partition. `cut_width` splits the rect into left/right
/// halves, otherwise top/bottom; the axis alternates every level.
///
/// When a split would leave a cell under MIN_CELL_SIZE the rect is emitted
/// whole and the remaining windows of that branch get no rectangle. Callers
/// must tolerate fewer rects than windows in that case.
fn bsp_split(rect: Rect, count: usize, cut_width: bool, ratio: f64, gap: i32, out: &mut Vec<Rect>) {
    if count == 0 {
        return;
    }
    if count == 1 {
        out.push(rect);
        return;
    }

    let (span, cross) = if cut_width {
        (rect.width, rect.height)
    } else {
        (rect.height, rect.width)
    };
    let avail = span.saturating_sub(gap);
    let first = (avail as f64 * ratio).floor() as i32;
    let second = avail.saturating_sub(first);

    if first < MIN_CELL_SIZE || second < MIN_CELL_SIZE || cross < MIN_CELL_SIZE {
        tracing::debug!(
            "BSP stopped at {}x{} with {} window(s) left unplaced",
            rect.width,
            rect.height,
            count - 1
        );
        out.push(rect);
        return;
    }

    let (a, b) = if cut_width {
        (
            Rect::new(rect.x, rect.y, first, rect.height),
            Rect::new(rect.x.saturating_add(first).saturating_add(gap), rect.y, second, rect.height),
        )
    } else {
        (
            Rect::new(rect.x, rect.y, rect.width, first),
            Rect::new(rect.x, rect.y.saturating_add(first).saturating_add(gap), rect.width, second),
        )
    };

    let half1 = count / 2;
    bsp_split(a, half1, !cut_width, ratio, gap, out);
    bsp_split(b, count - half1, !cut_width, ratio, gap, out);
}

// ── helpers ───────────────────────────────────────────────────────────────────

/// `n` cells stacked vertically inside `area`, at horizontal offset `x`.
fn column_cells(x: i32, width: i32, area: Rect, n: usize, gap: i32) -> Vec<Rect> {
    split_even(area.y, area.height, n, gap)
        .into_iter()
        .map(|(y, h)| Rect::new(x, y, width, h))
        .collect()
}

/// Divide `[start, start + len)` into `n` segments separated by `gap`.
/// Each segment is `floor((len - (n-1)*gap) / n)` long; the last one also
/// takes the remainder.
fn split_even(start: i32, len: i32, n: usize, gap: i32) -> Vec<(i32, i32)> {
    if n == 0 {
        return Vec::new();
    }
    let n_i = i32::try_from(n).unwrap_or(i32::MAX);
    let each = len.saturating_sub((n_i - 1).saturating_mul(gap)).max(0) / n_i;
    let end = start.saturating_add(len);
    let step = each.saturating_add(gap);

    (0..n_i)
        .map(|i| {
            let off = start.saturating_add(i.saturating_mul(step)).min(end);
            let size = if i == n_i - 1 { end.saturating_sub(off).max(0) } else { each };
            (off, size)
        })
        .collect()
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn params(algorithm: TilingAlgorithm, gap: u32) -> TilingParams {
        TilingParams {
            algorithm,
            split_ratio: 0.5,
            master_count: 1,
            inner_gap: gap,
            outer_gap: 0,
            max_windows: 64,
            insert_position: InsertPosition::End,
        }
    }

    fn overlaps(a: &Rect, b: &Rect) -> bool {
        a.x < b.x + b.width && b.x < a.x + a.width && a.y < b.y + b.height && b.y < a.y + a.height
    }

    #[test]
    fn zero_windows_is_empty() {
        for alg in [TilingAlgorithm::MasterStack, TilingAlgorithm::Columns, TilingAlgorithm::Bsp] {
            assert!(compute_rects(1000, 600, 0, &params(alg, 4)).is_empty());
        }
    }

    #[test]
    fn single_window_fills_area() {
        for alg in [TilingAlgorithm::MasterStack, TilingAlgorithm::Columns, TilingAlgorithm::Bsp] {
            let rects = compute_rects(1000, 600, 1, &params(alg, 4));
            assert_eq!(rects, vec![Rect::new(0, 0, 1000, 600)]);
        }
    }

    #[test]
    fn outer_gap_applied_once() {
        let mut p = params(TilingAlgorithm::Columns, 0);
        p.outer_gap = 10;
        let rects = compute_rects(1000, 600, 2, &p);
        assert_eq!(rects[0], Rect::new(10, 10, 490, 580));
        assert_eq!(rects[1], Rect::new(500, 10, 490, 580));
    }

    #[test]
    fn master_stack_reference_scenario() {
        let mut p = params(TilingAlgorithm::MasterStack, 0);
        p.split_ratio = 0.6;
        let rects = compute_rects(1000, 600, 4, &p);
        assert_eq!(rects.len(), 4);
        assert_eq!(rects[0], Rect::new(0, 0, 600, 600));
        for k in 0..3 {
            assert_eq!(rects[k + 1], Rect::new(600, k as i32 * 200, 400, 200));
        }
    }

    #[test]
    fn master_stack_masters_only_span_full_width() {
        let mut p = params(TilingAlgorithm::MasterStack, 10);
        p.master_count = 3;
        let rects = compute_rects(1000, 610, 3, &p);
        assert_eq!(rects.len(), 3);
        for r in &rects {
            assert_eq!(r.x, 0);
            assert_eq!(r.width, 1000);
        }
        assert_eq!(rects[0].height, 196);
        assert_eq!(rects[1].y, 206);
        // Last master takes the remainder.
        assert_eq!(rects[2].y, 412);
        assert_eq!(rects[2].y + rects[2].height, 610);
    }

    #[test]
    fn master_stack_count_and_no_vertical_overlap() {
        for masters in 1..=5 {
            for ratio in [0.1, 0.35, 0.5, 0.9] {
                for n in 1..=12 {
                    let p = TilingParams {
                        algorithm: TilingAlgorithm::MasterStack,
                        split_ratio: ratio,
                        master_count: masters,
                        inner_gap: 6,
                        outer_gap: 4,
                        max_windows: 8,
                        insert_position: InsertPosition::End,
                    };
                    let rects = compute_rects(1920, 1080, n, &p);
                    assert_eq!(rects.len(), n.min(8));
                    for (i, a) in rects.iter().enumerate() {
                        for b in rects.iter().skip(i + 1) {
                            assert!(!overlaps(a, b), "{a:?} overlaps {b:?}");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn columns_reference_scenario() {
        let rects = compute_rects(900, 500, 3, &params(TilingAlgorithm::Columns, 0));
        assert_eq!(rects.len(), 3);
        assert!(rects.iter().all(|r| r.width == 300 && r.height == 500));
        assert_eq!(rects[2].x, 600);
    }

    #[test]
    fn columns_cover_width_and_height() {
        let gap = 7;
        for n in 1..=12usize {
            let rects = compute_rects(1000, 700, n, &params(TilingAlgorithm::Columns, gap));
            assert_eq!(rects.len(), n);
            let widths: i32 = rects.iter().map(|r| r.width).sum();
            assert_eq!(widths + (n as i32 - 1) * gap as i32, 1000, "n = {n}");
            assert!(rects.iter().all(|r| r.y == 0 && r.height == 700));
        }
    }

    #[test]
    fn bsp_splits_longer_axis_first() {
        let rects = compute_rects(1600, 900, 2, &params(TilingAlgorithm::Bsp, 0));
        assert_eq!(rects, vec![Rect::new(0, 0, 800, 900), Rect::new(800, 0, 800, 900)]);

        let rects = compute_rects(900, 1600, 2, &params(TilingAlgorithm::Bsp, 0));
        assert_eq!(rects, vec![Rect::new(0, 0, 900, 800), Rect::new(0, 800, 900, 800)]);
    }

    #[test]
    fn bsp_preorder_three_windows() {
        let rects = compute_rects(1600, 900, 3, &params(TilingAlgorithm::Bsp, 0));
        // 1 window left, 2 stacked on the right.
        assert_eq!(rects[0], Rect::new(0, 0, 800, 900));
        assert_eq!(rects[1], Rect::new(800, 0, 800, 450));
        assert_eq!(rects[2], Rect::new(800, 450, 800, 450));
    }

    #[test]
    fn bsp_large_container_places_every_window() {
        for n in 1..=16 {
            let rects = compute_rects(3840, 2160, n, &params(TilingAlgorithm::Bsp, 4));
            assert_eq!(rects.len(), n);
            for (i, a) in rects.iter().enumerate() {
                for b in rects.iter().skip(i + 1) {
                    assert!(!overlaps(a, b));
                }
            }
        }
    }

    #[test]
    fn bsp_tiny_container_terminates_with_fewer_rects() {
        for n in 1..=40 {
            let rects = compute_rects(15, 15, n, &params(TilingAlgorithm::Bsp, 2));
            assert!(rects.len() <= n);
            assert!(!rects.is_empty());
        }
        let rects = compute_rects(60, 30, 8, &params(TilingAlgorithm::Bsp, 0));
        assert!(rects.len() < 8);
    }

    #[test]
    fn max_windows_caps_output() {
        let mut p = params(TilingAlgorithm::Columns, 0);
        p.max_windows = 3;
        assert_eq!(compute_rects(900, 600, 10, &p).len(), 3);
    }

    #[test]
    fn out_of_range_params_are_clamped() {
        let p = TilingParams {
            split_ratio: 4.0,
            master_count: 0,
            max_windows: 0,
            ..TilingParams::default()
        }
        .clamped();
        assert_eq!(p.split_ratio, MAX_SPLIT_RATIO);
        assert_eq!(p.master_count, MIN_MASTER_COUNT);
        assert_eq!(p.max_windows, 1);

        let nan = TilingParams {
            split_ratio: f64::NAN,
            master_count: 9,
            ..TilingParams::default()
        }
        .clamped();
        assert_eq!(nan.split_ratio, TilingParams::default().split_ratio);
        assert_eq!(nan.master_count, MAX_MASTER_COUNT);
    }

    #[test]
    fn huge_gaps_do_not_panic() {
        for alg in TilingAlgorithm::ALL {
            for (inner, outer) in [(u32::MAX, 0), (0, 1 << 30), (u32::MAX, u32::MAX), (MAX_GAP, 4)] {
                let p = TilingParams {
                    inner_gap: inner,
                    outer_gap: outer,
                    ..params(alg, 0)
                };
                for n in 1..=6 {
                    let rects = compute_rects(1000, 600, n, &p);
                    assert!(!rects.is_empty(), "{alg:?} n = {n}");
                    for r in &rects {
                        assert!(r.width >= 0 && r.height >= 0, "{alg:?} {r:?}");
                        assert!(r.x >= 0 && r.x <= 1000 && r.y >= 0, "{alg:?} {r:?}");
                    }
                }
            }
        }
        let clamped = TilingParams {
            inner_gap: u32::MAX,
            outer_gap: u32::MAX,
            ..TilingParams::default()
        }
        .clamped();
        assert_eq!((clamped.inner_gap, clamped.outer_gap), (MAX_GAP, MAX_GAP));
    }

    #[test]
    fn insert_position_index() {
        assert_eq!(InsertPosition::End.index_for(4, Some(1)), 4);
        assert_eq!(InsertPosition::Start.index_for(4, Some(1)), 0);
        assert_eq!(InsertPosition::AfterFocused.index_for(4, Some(1)), 2);
        assert_eq!(InsertPosition::AfterFocused.index_for(4, Some(3)), 4);
        assert_eq!(InsertPosition::AfterFocused.index_for(4, None), 4);
    }

    #[test]
    fn algorithm_names_parse() {
        assert_eq!(TilingAlgorithm::parse("BSP"), Some(TilingAlgorithm::Bsp));
        assert_eq!(TilingAlgorithm::parse("master_stack"), Some(TilingAlgorithm::MasterStack));
        assert_eq!(TilingAlgorithm::parse("spiral"), None);
    }
}
