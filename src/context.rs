// context.rs - which monitors exist and what the user is looking at
//
// Connector names ("DP-1", "HDMI-A-2") change across reboots and docks, so
// everything stored is keyed by `ScreenInfo::id`. `normalize_screen` is the
// single place where a name a client sent us becomes that id.

use serde::{Deserialize, Serialize};

use crate::assignment::ScreenId;
use crate::tiling::Rect;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenInfo {
    /// Stable hardware id (manufacturer/model/serial).
    pub id: String,
    /// Connector name, transient.
    pub name: String,
    pub width: i32,
    pub height: i32,
    #[serde(default)]
    pub primary: bool,
}

impl ScreenInfo {
    pub fn screen_id(&self) -> ScreenId {
        ScreenId::new(self.id.clone())
    }

    pub fn area(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }
}

pub trait ScreenContextProvider: Send {
    fn list_screens(&self) -> Vec<ScreenInfo>;

    fn current_focused_screen(&self) -> Option<ScreenId>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub id: String,
    pub name: String,
}

pub trait ActivityProvider: Send {
    fn list_activities(&self) -> Vec<ActivityInfo>;

    fn current_activity(&self) -> Option<String>;

    /// Called with the new activity id whenever it changes. Providers that
    /// cannot notify may ignore this.
    fn subscribe(&self, _on_change: Box<dyn Fn(String) + Send + Sync>) {}
}

/// Map a screen reference to its stable id. Accepts either the id itself or a
/// connector name; anything unknown is passed through unchanged so keys for
/// disconnected monitors stay addressable.
pub fn normalize_screen(screens: &[ScreenInfo], raw: &str) -> ScreenId {
    let raw = raw.trim();
    if let Some(s) = screens.iter().find(|s| s.id == raw) {
        return s.screen_id();
    }
    if let Some(s) = screens.iter().find(|s| s.name == raw) {
        tracing::debug!("Screen '{raw}' normalized to '{}'", s.id);
        return s.screen_id();
    }
    ScreenId::new(raw)
}

// ── static provider ───────────────────────────────────────────────────────────

/// Fixed screen list, replaced wholesale. Used by the daemon (fed over IPC)
/// and by tests.
#[derive(Debug, Clone, Default)]
pub struct StaticScreens {
    screens: Vec<ScreenInfo>,
    focused: Option<ScreenId>,
}

impl StaticScreens {
    /// Focus starts on the primary screen, or the first one.
    pub fn new(screens: Vec<ScreenInfo>) -> Self {
        let focused = screens
            .iter()
            .find(|s| s.primary)
            .or_else(|| screens.first())
            .map(ScreenInfo::screen_id);
        Self { screens, focused }
    }

    pub fn set_focused(&mut self, screen: Option<ScreenId>) {
        self.focused = screen;
    }
}

impl ScreenContextProvider for StaticScreens {
    fn list_screens(&self) -> Vec<ScreenInfo> {
        self.screens.clone()
    }

    fn current_focused_screen(&self) -> Option<ScreenId> {
        self.focused.clone()
    }
}
