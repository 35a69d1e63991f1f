// error.rs - error kinds shared by the engine, the persistence layer and IPC
//
// None of these are fatal. Persistence failures are reported per operation,
// a busy commit is rejected immediately, and invalid tiling parameters never
// reach this module at all (they are clamped in `tiling`).

use std::time::Duration;

use crate::assignment::{LayoutId, ScreenId};

// ── persistence ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PersistenceError {
    /// The backend could not be reached at all. Callers keep using the last
    /// snapshot they fetched successfully.
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),

    #[error("persistence call `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("change rejected by backend: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("malformed data: {0}")]
    Format(String),
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        Self::Format(e.to_string())
    }
}

// ── commit ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    #[error("a commit is already in progress")]
    Busy,
}

// ── layout validation ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LayoutError {
    #[error("layout id must not be empty")]
    EmptyId,

    #[error("static layout `{id}` has no zones")]
    NoZones { id: String },

    #[error("zone {index} of layout `{id}` lies outside the unit square")]
    ZoneOutOfRange { id: String, index: u32 },
}

// ── engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("unknown layout `{0}`")]
    UnknownLayout(LayoutId),

    #[error("unknown screen `{0}`")]
    UnknownScreen(ScreenId),

    #[error("no layout applies to {0}")]
    NoLayout(ScreenId),
}
