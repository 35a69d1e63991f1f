// ipc.rs - Unix socket command surface of the snapzones daemon
//
// The daemon listens on $XDG_RUNTIME_DIR/snapzones.sock. A client connects,
// sends one newline-terminated JSON command and reads one newline-terminated
// JSON response.
//
// ── Commands ──────────────────────────────────────────────────────────────────
//
//   { "cmd": "resolve", "screen": "DP-1", "desktop": 2, "activity": "work" }
//   { "cmd": "current", "desktop": 2 }
//   { "cmd": "layouts" }
//   { "cmd": "compute", "screen": "DP-1", "desktop": 1, "windows": 4 }
//   { "cmd": "compute_layout", "layout": "autotile:bsp", "width": 1920, "height": 1080, "windows": 3 }
//   { "cmd": "assign", "screen": "DP-1", "desktop": 2, "layout": "grid" }     (null layout clears)
//   { "cmd": "quick_slot", "slot": 5, "layout": "grid" }
//   { "cmd": "set_flag", "layout": "grid", "flag": "hidden", "value": true }
//   { "cmd": "commit" } / { "cmd": "discard" }
//   { "cmd": "screens" } / { "cmd": "set_screens", "screens": [ … ] }
//   { "cmd": "set_activity", "activity": "work" }                            (null: none)
//   { "cmd": "refresh" } / { "cmd": "reload" }
//   { "cmd": "create_layout", "layout": { …LayoutRecord… } }
//   { "cmd": "duplicate_layout", "id": "grid" } / { "cmd": "delete_layout", "id": "grid" }
//   { "cmd": "import_layout", "path": "/tmp/a.json" }
//   { "cmd": "export_layout", "id": "grid", "path": "/tmp/a.json" }
//
// ── Responses ─────────────────────────────────────────────────────────────────
//
//   { "ok": true, "layout": "grid", "explicit": true }
//   { "ok": true, "committed": 3, "failed": [ { "target": "quick slot 5", "error": "…" } ] }
//   { "ok": false, "error": "a commit is already in progress" }
//
// `commit` is answered only after the backend round trip, which the service
// runs off the event loop; see `Outcome::Commit`.

use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
};

use calloop::{
    generic::Generic, EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory,
};
use serde::{Deserialize, Serialize};

use crate::assignment::{LayoutId, QuickSlot, ResolvedFrom};
use crate::context::{ScreenInfo, StaticScreens};
use crate::engine::{RefreshReport, ResolutionEngine};
use crate::layout::{Layout, LayoutFlag, LayoutRecord};
use crate::pending::{CommitBatch, CommitReport};
use crate::tiling::{Rect, TilingAlgorithm};

// ── socket path ───────────────────────────────────────────────────────────────

pub fn socket_path() -> PathBuf {
    if let Ok(p) = std::env::var("SNAPZONES_SOCKET") {
        return PathBuf::from(p);
    }
    let runtime = std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    runtime.join("snapzones.sock")
}

// ── wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum IpcCommand {
    Resolve {
        screen: String,
        #[serde(default)]
        desktop: u32,
        #[serde(default)]
        activity: Option<String>,
    },
    Current {
        #[serde(default)]
        desktop: u32,
    },
    Layouts,
    Compute {
        screen: String,
        #[serde(default)]
        desktop: u32,
        #[serde(default)]
        activity: Option<String>,
        windows: usize,
    },
    ComputeLayout {
        layout: LayoutId,
        width: i32,
        height: i32,
        windows: usize,
    },
    Assign {
        screen: String,
        #[serde(default)]
        desktop: u32,
        #[serde(default)]
        activity: Option<String>,
        layout: Option<LayoutId>,
    },
    QuickSlot {
        slot: u8,
        layout: Option<LayoutId>,
    },
    SetFlag {
        layout: LayoutId,
        flag: String,
        value: Option<bool>,
    },
    Commit,
    Discard,
    Screens,
    SetScreens {
        screens: Vec<ScreenInfo>,
    },
    SetActivity {
        activity: Option<String>,
    },
    Refresh,
    Reload,
    CreateLayout {
        layout: LayoutRecord,
    },
    DuplicateLayout {
        id: LayoutId,
    },
    DeleteLayout {
        id: LayoutId,
    },
    ImportLayout {
        path: PathBuf,
    },
    ExportLayout {
        id: LayoutId,
        path: PathBuf,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayoutSummary {
    pub id: LayoutId,
    pub name: String,
    pub autotile: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<TilingAlgorithm>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zones: Option<usize>,
    pub auto_assign: bool,
}

impl LayoutSummary {
    fn of(layout: &Layout, auto_assign: bool) -> Self {
        Self {
            id: layout.id.clone(),
            name: layout.name.clone(),
            autotile: layout.is_autotile(),
            algorithm: layout.algorithm(),
            zones: layout.zone_count(),
            auto_assign,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedOp {
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IpcResponse {
    Resolved {
        ok: bool,
        layout: Option<LayoutId>,
        explicit: bool,
    },
    Layouts {
        ok: bool,
        layouts: Vec<LayoutSummary>,
    },
    Rects {
        ok: bool,
        layout: LayoutId,
        rects: Vec<Rect>,
    },
    Screens {
        ok: bool,
        screens: Vec<ScreenInfo>,
    },
    Staged {
        ok: bool,
        staged: usize,
    },
    Committed {
        ok: bool,
        committed: usize,
        failed: Vec<FailedOp>,
    },
    Refreshed {
        ok: bool,
        refreshed: usize,
        failed: Vec<FailedOp>,
    },
    Layout {
        ok: bool,
        id: LayoutId,
    },
    Done {
        ok: bool,
    },
    Err {
        ok: bool,
        error: String,
    },
}

impl IpcResponse {
    pub fn err(msg: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            error: msg.into(),
        }
    }

    fn done() -> Self {
        Self::Done { ok: true }
    }

    fn staged(engine: &ResolutionEngine) -> Self {
        Self::Staged {
            ok: true,
            staged: engine.pending().len(),
        }
    }

    /// `ok` is false when any operation failed; the rest were still applied.
    pub fn committed(report: &CommitReport) -> Self {
        let failed: Vec<FailedOp> = report
            .failures()
            .map(|o| FailedOp {
                target: o.target.to_string(),
                error: o.result.as_ref().err().map(ToString::to_string).unwrap_or_default(),
            })
            .collect();
        Self::Committed {
            ok: failed.is_empty(),
            committed: report.succeeded().count(),
            failed,
        }
    }

    fn refreshed(report: &RefreshReport) -> Self {
        Self::Refreshed {
            ok: report.is_success(),
            refreshed: report.refreshed,
            failed: report
                .failures
                .iter()
                .map(|(part, e)| FailedOp {
                    target: format!("{part:?}"),
                    error: e.to_string(),
                })
                .collect(),
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Err { .. })
    }
}

// ── dispatch ──────────────────────────────────────────────────────────────────

/// What the service should do with a command.
#[derive(Debug)]
pub enum Outcome {
    Reply(IpcResponse),
    /// Apply the batch through the backend, then `finish_commit` and reply
    /// with `IpcResponse::committed`.
    Commit(CommitBatch),
    /// Load a fresh settings snapshot, hand it to `ResolutionEngine::reload`
    /// and reply `Done`.
    Reload,
}

pub fn dispatch(engine: &mut ResolutionEngine, cmd: IpcCommand) -> Outcome {
    let reply = match cmd {
        IpcCommand::Resolve {
            screen,
            desktop,
            activity,
        } => match engine.resolve_detailed(&screen, desktop, activity.as_deref()) {
            Some(r) => IpcResponse::Resolved {
                ok: true,
                layout: Some(r.layout),
                explicit: matches!(r.from, ResolvedFrom::Explicit(_)),
            },
            None => IpcResponse::Resolved {
                ok: true,
                layout: engine.resolve_or_implicit(&screen, desktop, activity.as_deref()),
                explicit: false,
            },
        },

        IpcCommand::Current { desktop } => IpcResponse::Resolved {
            ok: true,
            layout: engine.resolve_current(desktop),
            explicit: false,
        },

        IpcCommand::Layouts => IpcResponse::Layouts {
            ok: true,
            layouts: engine
                .selector_layouts()
                .into_iter()
                .map(|l| {
                    let auto = engine.layout_flag(&l.id, LayoutFlag::AutoAssign).unwrap_or(false);
                    LayoutSummary::of(l, auto)
                })
                .collect(),
        },

        IpcCommand::Compute {
            screen,
            desktop,
            activity,
            windows,
        } => match engine.compute_for_screen(&screen, desktop, activity.as_deref(), windows) {
            Ok((layout, rects)) => IpcResponse::Rects {
                ok: true,
                layout,
                rects,
            },
            Err(e) => IpcResponse::err(e.to_string()),
        },

        IpcCommand::ComputeLayout {
            layout,
            width,
            height,
            windows,
        } => match engine.compute_rects(&layout, Rect::new(0, 0, width, height), windows) {
            Ok(rects) => IpcResponse::Rects {
                ok: true,
                layout,
                rects,
            },
            Err(e) => IpcResponse::err(e.to_string()),
        },

        IpcCommand::Assign {
            screen,
            desktop,
            activity,
            layout,
        } => {
            let key = engine.key(&screen, desktop, activity.as_deref());
            staged_or_err(engine, |e| e.stage_assignment(key, layout))
        }

        IpcCommand::QuickSlot { slot, layout } => match QuickSlot::new(slot) {
            Some(slot) => staged_or_err(engine, |e| e.stage_quick_slot(slot, layout)),
            None => IpcResponse::err(format!("quick slot {slot} outside 1..=9")),
        },

        IpcCommand::SetFlag {
            layout,
            flag,
            value,
        } => match LayoutFlag::parse(&flag) {
            Some(flag) => staged_or_err(engine, |e| e.stage_layout_flag(&layout, flag, value)),
            None => IpcResponse::err(format!("unknown flag '{flag}'")),
        },

        IpcCommand::Commit => match engine.begin_commit() {
            Ok(batch) => return Outcome::Commit(batch),
            Err(e) => IpcResponse::err(e.to_string()),
        },

        IpcCommand::Discard => {
            engine.discard();
            IpcResponse::staged(engine)
        }

        IpcCommand::Screens => IpcResponse::Screens {
            ok: true,
            screens: engine.screens(),
        },

        IpcCommand::SetScreens { screens } => {
            tracing::info!("Screen list replaced ({} screen(s))", screens.len());
            engine.replace_screens(Box::new(StaticScreens::new(screens)));
            IpcResponse::Screens {
                ok: true,
                screens: engine.screens(),
            }
        }

        IpcCommand::SetActivity { activity } => {
            engine.activity_changed(activity);
            IpcResponse::done()
        }

        IpcCommand::Refresh => IpcResponse::refreshed(&engine.refresh()),

        IpcCommand::Reload => return Outcome::Reload,

        IpcCommand::CreateLayout { layout } => layout_or_err(engine.create_layout(layout)),

        IpcCommand::DuplicateLayout { id } => layout_or_err(engine.duplicate_layout(&id)),

        IpcCommand::DeleteLayout { id } => match engine.delete_layout(&id) {
            Ok(()) => IpcResponse::Layout { ok: true, id },
            Err(e) => IpcResponse::err(e.to_string()),
        },

        IpcCommand::ImportLayout { path } => layout_or_err(engine.import_layout(&path)),

        IpcCommand::ExportLayout { id, path } => match engine.export_layout(&id, &path) {
            Ok(()) => IpcResponse::done(),
            Err(e) => IpcResponse::err(e.to_string()),
        },
    };
    Outcome::Reply(reply)
}

fn staged_or_err<F>(engine: &mut ResolutionEngine, stage: F) -> IpcResponse
where
    F: FnOnce(&mut ResolutionEngine) -> Result<(), crate::error::EngineError>,
{
    match stage(engine) {
        Ok(()) => IpcResponse::staged(engine),
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

fn layout_or_err(r: Result<LayoutId, crate::error::EngineError>) -> IpcResponse {
    match r {
        Ok(id) => IpcResponse::Layout { ok: true, id },
        Err(e) => IpcResponse::err(e.to_string()),
    }
}

// ── server ────────────────────────────────────────────────────────────────────

/// One accepted connection and the command read from it. Answer with
/// `respond`, now or after a deferred commit.
pub struct Request {
    pub stream: UnixStream,
    pub command: Result<IpcCommand, String>,
}

impl Request {
    pub fn respond(mut self, response: &IpcResponse) {
        if let Err(e) = write_response(&mut self.stream, response) {
            tracing::warn!("IPC reply failed: {e}");
        }
    }
}

/// Wraps a `UnixListener` as a calloop `EventSource`. Each readable wakeup
/// drains every pending connection and emits one `Request` per command.
pub struct IpcSource {
    listener: Generic<UnixListener>,
    path: PathBuf,
}

impl IpcSource {
    pub fn bind() -> Result<Self, std::io::Error> {
        Self::bind_at(socket_path())
    }

    pub fn bind_at(path: PathBuf) -> Result<Self, std::io::Error> {
        // Remove stale socket from a previous run.
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        tracing::info!("IPC socket: {}", path.display());

        Ok(Self {
            listener: Generic::new(listener, Interest::READ, Mode::Level),
            path,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for IpcSource {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl EventSource for IpcSource {
    type Event = Request;
    type Metadata = ();
    type Ret = ();
    type Error = std::io::Error;

    fn process_events<F>(
        &mut self,
        _readiness: Readiness,
        _token: Token,
        mut callback: F,
    ) -> Result<PostAction, Self::Error>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        loop {
            match self.listener.get_ref().accept() {
                Ok((stream, _)) => match read_command(&stream) {
                    Ok(Some(command)) => callback(Request { stream, command }, &mut ()),
                    Ok(None) => {}
                    Err(e) => tracing::warn!("IPC read error: {e}"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!("IPC accept error: {e}");
                    break;
                }
            }
        }
        Ok(PostAction::Continue)
    }

    fn register(
        &mut self,
        poll: &mut Poll,
        token_factory: &mut TokenFactory,
    ) -> calloop::Result<()> {
        self.listener.register(poll, token_factory)
    }

    fn reregister(
        &mut self,
        poll: &mut Poll,
        token_factory: &mut TokenFactory,
    ) -> calloop::Result<()> {
        self.listener.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.listener.unregister(poll)
    }
}

// ── framing ───────────────────────────────────────────────────────────────────

/// Read one command line. `Ok(None)` for a client that sent nothing; a
/// malformed line is `Ok(Some(Err(..)))` so it can still be answered.
pub fn read_command(stream: &UnixStream) -> Result<Option<Result<IpcCommand, String>>, std::io::Error> {
    // Clients send one short line and wait, so a blocking read is fine.
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(std::time::Duration::from_secs(2)))?;
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut line = String::new();
    reader.read_line(&mut line)?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        serde_json::from_str::<IpcCommand>(line).map_err(|e| format!("parse error: {e}")),
    ))
}

pub fn write_response(stream: &mut UnixStream, response: &IpcResponse) -> Result<(), std::io::Error> {
    let mut json = serde_json::to_string(response)?;
    json.push('\n');
    stream.write_all(json.as_bytes())
}

// ── client helper ─────────────────────────────────────────────────────────────

/// Send a single command and return the raw JSON response line.
pub fn send_command(cmd: &IpcCommand) -> Result<String, std::io::Error> {
    send_command_to(&socket_path(), cmd)
}

pub fn send_command_to(path: &std::path::Path, cmd: &IpcCommand) -> Result<String, std::io::Error> {
    let mut stream = UnixStream::connect(path)?;

    let mut json = serde_json::to_string(cmd)?;
    json.push('\n');
    stream.write_all(json.as_bytes())?;

    let mut response = String::new();
    BufReader::new(stream).read_line(&mut response)?;
    Ok(response)
}

// ── tests ─────────────────────────────────────────────────────────────────────
