// service.rs - the daemon: one calloop loop owning the ResolutionEngine
//
// Sources on the loop:
//
//   IpcSource        client commands, answered inline (commit: deferred)
//   change channel   ChangeEvents from the backend's watcher thread
//   activity channel activity switches from the ActivityProvider, if any
//   refresh timer    single-shot, re-armed while events keep arriving
//   commit channel   reports from the commit worker thread
//
// The engine is only ever touched from the loop thread. A commit snapshots
// the staged edits on the loop, applies them on a worker so a slow backend
// cannot stall resolution, and folds the report back in on the loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::TrySendError;
use std::sync::Arc;
use std::time::Instant;

use calloop::channel::{self, Channel, Sender, SyncSender};
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop, LoopHandle};

use crate::coalesce::{ChangeSet, Coalescer};
use crate::config::Settings;
use crate::context::StaticScreens;
use crate::engine::ResolutionEngine;
use crate::ipc::{self, IpcResponse, IpcSource, Outcome, Request};
use crate::json_store::JsonStore;
use crate::pending::{CommitBatch, CommitReport};
use crate::persistence::{ChangeEvent, PersistenceBackend, SharedBackend};

// Backlog of unprocessed change events. Events past it are dropped and the
// next refresh becomes a full one.
const CHANGE_BACKLOG: usize = 256;

/// Backend-side end of the change channel. Safe to call from the watcher
/// thread.
pub struct ChangeForwarder {
    tx: SyncSender<ChangeEvent>,
    overflowed: Arc<AtomicBool>,
}

impl ChangeForwarder {
    pub fn forward(&self, event: ChangeEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                if !self.overflowed.swap(true, Ordering::AcqRel) {
                    tracing::warn!("Change backlog full, dropped {dropped:?}; next refresh is a full one");
                }
            }
            // Loop gone means we are shutting down.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

struct CommitDone {
    batch: CommitBatch,
    report: CommitReport,
}

pub struct Daemon {
    engine: ResolutionEngine,
    coalescer: Coalescer,
    handle: LoopHandle<'static, Daemon>,
    timer_armed: bool,
    commit_tx: Sender<CommitDone>,
    in_flight: Option<Request>,
    refreshes: usize,
    overflowed: Arc<AtomicBool>,
}

impl Daemon {
    /// Registers the change and commit channels on `event_loop`. Returns the
    /// daemon and the forwarder to hand to the backend's subscription.
    pub fn new(
        engine: ResolutionEngine,
        event_loop: &EventLoop<'static, Daemon>,
    ) -> Result<(Self, ChangeForwarder), calloop::Error> {
        Self::with_backlog(engine, event_loop, CHANGE_BACKLOG)
    }

    pub fn with_backlog(
        engine: ResolutionEngine,
        event_loop: &EventLoop<'static, Daemon>,
        backlog: usize,
    ) -> Result<(Self, ChangeForwarder), calloop::Error> {
        let handle = event_loop.handle();

        let (change_tx, change_rx): (SyncSender<ChangeEvent>, Channel<ChangeEvent>) =
            channel::sync_channel(backlog);
        handle
            .insert_source(change_rx, |event, _, state: &mut Daemon| {
                if let channel::Event::Msg(change) = event {
                    state.on_change(change);
                }
            })
            .map_err(|e| e.error)?;

        let (commit_tx, commit_rx) = channel::channel::<CommitDone>();
        handle
            .insert_source(commit_rx, |event, _, state: &mut Daemon| {
                if let channel::Event::Msg(done) = event {
                    state.on_commit_done(done);
                }
            })
            .map_err(|e| e.error)?;

        let (activity_tx, activity_rx) = channel::channel::<String>();
        handle
            .insert_source(activity_rx, |event, _, state: &mut Daemon| {
                if let channel::Event::Msg(activity) = event {
                    state.engine.activity_changed(Some(activity));
                }
            })
            .map_err(|e| e.error)?;
        let notifies = engine.subscribe_activities(Box::new(move |activity| {
            // Loop gone means we are shutting down.
            let _ = activity_tx.send(activity);
        }));
        if !notifies {
            tracing::debug!("No activity provider; activity comes from clients");
        }

        let coalescer = Coalescer::new(engine.settings().general.refresh_coalesce);
        let overflowed = Arc::new(AtomicBool::new(false));
        let forwarder = ChangeForwarder {
            tx: change_tx,
            overflowed: overflowed.clone(),
        };
        let daemon = Self {
            engine,
            coalescer,
            handle,
            timer_armed: false,
            commit_tx,
            in_flight: None,
            refreshes: 0,
            overflowed,
        };
        Ok((daemon, forwarder))
    }

    pub fn engine(&self) -> &ResolutionEngine {
        &self.engine
    }

    /// Coalesced refreshes run so far.
    pub fn refreshes(&self) -> usize {
        self.refreshes
    }

    pub fn commit_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    // ── change coalescing ─────────────────────────────────────────────────────

    pub fn on_change(&mut self, event: ChangeEvent) {
        tracing::debug!("Backend change: {event:?}");
        let deadline = self.coalescer.poke(Instant::now(), event);
        if self.timer_armed {
            // The running timer re-reads the deadline when it fires.
            return;
        }
        let inserted = self
            .handle
            .insert_source(Timer::from_deadline(deadline), |_, _, state: &mut Daemon| state.on_timer());
        match inserted {
            Ok(_) => self.timer_armed = true,
            Err(e) => {
                tracing::warn!("Could not arm refresh timer ({}), refreshing now", e.error);
                if let Some(set) = self.coalescer.fire_if_due(deadline) {
                    self.apply_refresh(&set);
                }
            }
        }
    }

    fn on_timer(&mut self) -> TimeoutAction {
        if let Some(set) = self.coalescer.fire_if_due(Instant::now()) {
            self.timer_armed = false;
            self.apply_refresh(&set);
            return TimeoutAction::Drop;
        }
        match self.coalescer.deadline() {
            Some(later) => TimeoutAction::ToInstant(later),
            None => {
                self.timer_armed = false;
                TimeoutAction::Drop
            }
        }
    }

    fn apply_refresh(&mut self, set: &ChangeSet) {
        self.refreshes += 1;
        // Dropped events are unknown, so everything is refetched.
        let report = if self.overflowed.swap(false, Ordering::AcqRel) {
            self.engine.apply_changes(&ChangeSet::all())
        } else {
            self.engine.apply_changes(set)
        };
        if !report.is_success() {
            tracing::warn!("Refresh left {} part(s) stale", report.failures.len());
        }
    }

    // ── requests ──────────────────────────────────────────────────────────────

    pub fn handle_request(&mut self, request: Request) {
        let command = match &request.command {
            Ok(cmd) => cmd.clone(),
            Err(e) => {
                tracing::warn!("IPC parse error: {e}");
                let response = IpcResponse::err(e.clone());
                request.respond(&response);
                return;
            }
        };
        tracing::debug!("IPC command: {command:?}");

        match ipc::dispatch(&mut self.engine, command) {
            Outcome::Reply(response) => request.respond(&response),
            Outcome::Commit(batch) => self.start_commit(batch, request),
            Outcome::Reload => {
                self.reload(Settings::load());
                request.respond(&IpcResponse::Done { ok: true });
            }
        }
    }

    pub fn reload(&mut self, settings: Arc<Settings>) {
        self.coalescer.set_interval(settings.general.refresh_coalesce);
        self.engine.reload(settings);
    }

    // ── commit ────────────────────────────────────────────────────────────────

    fn start_commit(&mut self, batch: CommitBatch, request: Request) {
        if batch.is_empty() {
            let report = CommitReport::default();
            self.engine.finish_commit(&batch, &report);
            request.respond(&IpcResponse::committed(&report));
            return;
        }

        let backend = self.engine.backend().clone();
        let tx = self.commit_tx.clone();
        let spawned = std::thread::Builder::new()
            .name("snapzones-commit".into())
            .spawn(move || {
                let report = batch.apply(&backend);
                // Loop gone means we are shutting down.
                let _ = tx.send(CommitDone { batch, report });
            });

        match spawned {
            Ok(_) => self.in_flight = Some(request),
            Err(e) => {
                tracing::warn!("Could not start commit worker: {e}");
                // Release the guard; the staged edits are untouched.
                self.engine
                    .finish_commit(&CommitBatch::default(), &CommitReport::default());
                request.respond(&IpcResponse::err(format!("commit worker failed to start: {e}")));
            }
        }
    }

    fn on_commit_done(&mut self, done: CommitDone) {
        self.engine.finish_commit(&done.batch, &done.report);
        let response = IpcResponse::committed(&done.report);
        match self.in_flight.take() {
            Some(request) => request.respond(&response),
            None => tracing::warn!("Commit finished with nobody waiting for it"),
        }
    }
}

// ── entry point ───────────────────────────────────────────────────────────────

pub fn run(settings: Arc<Settings>) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonStore::open(&settings.general.data_dir)?;
    let store = Arc::new(store);
    let backend: SharedBackend = store.clone();

    // Screens arrive over IPC (`set_screens`) from the compositor side.
    let mut engine = ResolutionEngine::new(settings, backend, Box::new(StaticScreens::default()));
    let report = engine.refresh();
    if !report.is_success() {
        tracing::warn!("Starting with a partial snapshot: {:?}", report.failures);
    }

    let mut event_loop: EventLoop<'static, Daemon> = EventLoop::try_new()?;
    let (mut daemon, changes) = Daemon::new(engine, &event_loop)?;

    store.subscribe(Box::new(move |event| changes.forward(event)));

    let ipc = IpcSource::bind()?;
    event_loop
        .handle()
        .insert_source(ipc, |request, _, state: &mut Daemon| state.handle_request(request))
        .map_err(|e| e.error)?;

    tracing::info!("snapzones running");
    event_loop.run(None, &mut daemon, |_| {})?;
    Ok(())
}

// ── tests ─────────────────────────────────────────────────────────────────────
