//! # Scheduler
//!
//! Owns the ordered list of download handles and drives the periodic work
//! around them. Split in two layers:
//!
//! - [`Scheduler`]: the loop-owned core. Synchronous, no I/O; every mutation
//!   of the handle list happens here.
//! - [`SchedulerHandle`]: cheap-to-clone handle to an actor task that owns a
//!   `Scheduler`, talks to the [`SwarmTransport`] and the [`HandleStore`], and
//!   runs the timers.
//!
//! ## Timers
//!
//! | Timer | Default | Work |
//! |-------|---------|------|
//! | frequent | 4 s | sample transport, rate control (both directions), push caps, promote queued handles, auto-shutdown |
//! | infrequent | 300 s | persist the queue |
//!
//! Structural changes (add, remove, moves, state changes) are persisted
//! right away as well. Store writes run on the blocking pool and report back
//! to the actor.
//!
//! ## Queue order
//!
//! Position in the list is the user's queue order. Queued handles are
//! promoted strictly in that order while fewer than
//! `max_simultaneous_downloading` handles are downloading.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::handle::{
    Direction, DownloadHandle, Fingerprint, HandleRecord, HandleStatus, PerDir, Priority,
};
use crate::protocols::{HandleStore, SwarmTransport, TransportSample};
use crate::ratecontrol::{PassReport, RateConfig, RateController};
use crate::urm::{UploadRateMaximiser, UrmConfig, UrmObservation};

// ============================================================================
// Constants & configuration
// ============================================================================

pub const FREQUENT_INTERVAL: Duration = Duration::from_secs(4);
pub const INFREQUENT_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_SIMULTANEOUS_DOWNLOADING: usize = 3;

/// Seeding handles idle this long are removed. Zero disables auto-shutdown.
pub const DEFAULT_SEEDING_IDLE_TIMEOUT: Duration = Duration::ZERO;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub frequent_interval: Duration,
    pub infrequent_interval: Duration,
    pub max_simultaneous_downloading: usize,
    pub seeding_idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            frequent_interval: FREQUENT_INTERVAL,
            infrequent_interval: INFREQUENT_INTERVAL,
            max_simultaneous_downloading: DEFAULT_MAX_SIMULTANEOUS_DOWNLOADING,
            seeding_idle_timeout: DEFAULT_SEEDING_IDLE_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    Duplicate(Fingerprint),
    UnknownHandle(Fingerprint),
    ShuttingDown,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::Duplicate(fp) => write!(f, "handle {fp} already scheduled"),
            SchedulerError::UnknownHandle(fp) => write!(f, "unknown handle {fp}"),
            SchedulerError::ShuttingDown => write!(f, "scheduler is shutting down"),
        }
    }
}

impl std::error::Error for SchedulerError {}

// ============================================================================
// Snapshots
// ============================================================================

/// Sizes of the derived sets, recomputed on demand.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityCounts {
    pub active: usize,
    pub inactive: usize,
    pub downloading: usize,
    pub seeding: usize,
    pub paused: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandleSnapshot {
    pub fingerprint: Fingerprint,
    pub index: usize,
    pub status: HandleStatus,
    pub priority: Priority,
    pub peers: usize,
    pub measured: PerDir<f64>,
    pub reserved: PerDir<f64>,
    pub applied: PerDir<f64>,
    pub local_cap: PerDir<f64>,
}

impl From<&DownloadHandle> for HandleSnapshot {
    fn from(h: &DownloadHandle) -> Self {
        let per_dir = |f: &dyn Fn(Direction) -> f64| PerDir::new(f(Direction::Up), f(Direction::Down));
        Self {
            fingerprint: h.fingerprint(),
            index: h.index(),
            status: h.status(),
            priority: h.priority(),
            peers: h.peers(),
            measured: per_dir(&|d| h.measured(d)),
            reserved: per_dir(&|d| h.reserved(d)),
            applied: per_dir(&|d| h.applied(d)),
            local_cap: per_dir(&|d| h.local_cap(d)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub handles: Vec<HandleSnapshot>,
    pub counts: ActivityCounts,
    pub max_rate: PerDir<f64>,
}

// ============================================================================
// Scheduler core
// ============================================================================

#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    handles: Vec<DownloadHandle>,
    rate: RateController,
    urm: UploadRateMaximiser,
    done_flag: bool,
    dirty: bool,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, rate: RateConfig, urm: UrmConfig, now: Instant) -> Self {
        Self {
            config,
            handles: Vec::new(),
            rate: RateController::new(rate),
            urm: UploadRateMaximiser::new(urm, now),
            done_flag: false,
            dirty: false,
        }
    }

    /// Rebuild the queue from persisted records, ordered by `last_index`.
    pub fn restore(&mut self, mut records: Vec<HandleRecord>) {
        records.sort_by_key(|r| r.last_index);
        for record in &records {
            if self.position(record.fingerprint).is_some() {
                warn!(handle = %record.fingerprint, "duplicate record on restore, skipping");
                continue;
            }
            self.handles.push(DownloadHandle::from_record(record));
        }
        self.renumber();
        info!(count = self.handles.len(), "restored download queue");
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn rate_controller(&self) -> &RateController {
        &self.rate
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn handles(&self) -> &[DownloadHandle] {
        &self.handles
    }

    pub fn position(&self, fingerprint: Fingerprint) -> Option<usize> {
        self.handles.iter().position(|h| h.fingerprint() == fingerprint)
    }

    pub fn handle(&self, fingerprint: Fingerprint) -> Option<&DownloadHandle> {
        self.handles.iter().find(|h| h.fingerprint() == fingerprint)
    }

    fn handle_mut(&mut self, fingerprint: Fingerprint) -> Result<&mut DownloadHandle, SchedulerError> {
        self.handles
            .iter_mut()
            .find(|h| h.fingerprint() == fingerprint)
            .ok_or(SchedulerError::UnknownHandle(fingerprint))
    }

    pub fn is_done(&self) -> bool {
        self.done_flag
    }

    pub fn set_done(&mut self) {
        self.done_flag = true;
    }

    /// Whether a structural change happened since the last call.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn renumber(&mut self) {
        for (i, h) in self.handles.iter_mut().enumerate() {
            h.set_index(i);
        }
    }

    // ------------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------------

    /// Append a handle at the end of the queue.
    pub fn add(&mut self, mut handle: DownloadHandle) -> Result<usize, SchedulerError> {
        if self.position(handle.fingerprint()).is_some() {
            return Err(SchedulerError::Duplicate(handle.fingerprint()));
        }
        let index = self.handles.len();
        handle.set_index(index);
        debug!(handle = %handle.fingerprint(), index, "handle added");
        self.handles.push(handle);
        self.dirty = true;
        Ok(index)
    }

    /// Remove the handles at `selection`, highest index first so the
    /// remaining positions stay valid while removing. Out-of-range indices
    /// are ignored.
    pub fn remove(&mut self, selection: &[usize]) -> Vec<DownloadHandle> {
        let mut indices: Vec<usize> = selection
            .iter()
            .copied()
            .filter(|&i| i < self.handles.len())
            .collect();
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.dedup();

        let mut removed = Vec::with_capacity(indices.len());
        for i in indices {
            let handle = self.handles.remove(i);
            self.urm.on_removed(handle.fingerprint());
            removed.push(handle);
        }
        if !removed.is_empty() {
            self.renumber();
            self.refresh_budget();
            self.dirty = true;
        }
        removed
    }

    /// Shift every selected handle one slot towards `direction`. The handle
    /// nearest that end moves first; a handle stays put at the boundary or
    /// when the slot it would take is held by a selected handle that could
    /// not move. Returns whether anything moved.
    pub fn move_selection(&mut self, selection: &[usize], direction: MoveDirection) -> bool {
        let len = self.handles.len();
        let mut indices: Vec<usize> = selection.iter().copied().filter(|&i| i < len).collect();
        indices.sort_unstable();
        indices.dedup();
        if direction == MoveDirection::Down {
            indices.reverse();
        }

        let mut settled: HashSet<usize> = HashSet::with_capacity(indices.len());
        let mut moved = false;
        for i in indices {
            let target = match direction {
                MoveDirection::Up if i > 0 => i - 1,
                MoveDirection::Down if i + 1 < len => i + 1,
                _ => {
                    settled.insert(i);
                    continue;
                }
            };
            if settled.contains(&target) {
                settled.insert(i);
                continue;
            }
            self.handles.swap(i, target);
            settled.insert(target);
            moved = true;
        }
        if moved {
            self.renumber();
            self.dirty = true;
        }
        moved
    }

    /// Move the selection to the front, keeping relative order on both sides.
    pub fn move_top(&mut self, selection: &[usize]) -> bool {
        self.splice(selection, true)
    }

    /// Move the selection to the back, keeping relative order on both sides.
    pub fn move_bottom(&mut self, selection: &[usize]) -> bool {
        self.splice(selection, false)
    }

    fn splice(&mut self, selection: &[usize], to_front: bool) -> bool {
        let wanted: HashSet<usize> = selection
            .iter()
            .copied()
            .filter(|&i| i < self.handles.len())
            .collect();
        if wanted.is_empty() {
            return false;
        }
        let (picked, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.handles)
            .into_iter()
            .enumerate()
            .partition(|(i, _)| wanted.contains(i));
        let (first, second) = if to_front { (picked, rest) } else { (rest, picked) };
        let before: Vec<usize> = first.iter().chain(second.iter()).map(|(i, _)| *i).collect();
        self.handles = first.into_iter().chain(second).map(|(_, h)| h).collect();

        let moved = before.iter().enumerate().any(|(pos, i)| pos != *i);
        self.renumber();
        if moved {
            self.dirty = true;
        }
        moved
    }

    // ------------------------------------------------------------------------
    // Per-handle state
    // ------------------------------------------------------------------------

    pub fn set_status(&mut self, fingerprint: Fingerprint, status: HandleStatus) -> Result<(), SchedulerError> {
        let handle = self.handle_mut(fingerprint)?;
        if handle.status() == status {
            return Ok(());
        }
        handle.set_status(status);
        if !status.is_active() {
            handle.reset_sampling();
        }
        self.dirty = true;
        self.refresh_budget();
        Ok(())
    }

    pub fn set_local_cap(
        &mut self,
        fingerprint: Fingerprint,
        dir: Direction,
        cap: f64,
    ) -> Result<(), SchedulerError> {
        self.handle_mut(fingerprint)?.set_local_cap(dir, cap);
        self.dirty = true;
        Ok(())
    }

    pub fn set_priority(&mut self, fingerprint: Fingerprint, priority: Priority) -> Result<(), SchedulerError> {
        self.handle_mut(fingerprint)?.set_priority(priority);
        self.dirty = true;
        Ok(())
    }

    /// A handle was started on the transport.
    pub fn mark_started(&mut self, fingerprint: Fingerprint) -> Result<(), SchedulerError> {
        let handle = self.handle_mut(fingerprint)?;
        handle.reset_sampling();
        handle.set_status(HandleStatus::Allocating);
        self.urm.on_started(fingerprint);
        self.dirty = true;
        self.refresh_budget();
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tick steps
    // ------------------------------------------------------------------------

    /// Fold a transport sample into the handles. Handles missing from the
    /// sample lose their peers and so drop out of rate control.
    pub fn apply_samples(&mut self, samples: &[TransportSample], now: Instant) {
        let mut seen: HashSet<Fingerprint> = HashSet::with_capacity(samples.len());
        let mut hash_finished = false;

        for sample in samples {
            let Some(handle) = self
                .handles
                .iter_mut()
                .find(|h| h.fingerprint() == sample.fingerprint)
            else {
                trace!(handle = %sample.fingerprint, "sample for unscheduled handle");
                continue;
            };
            seen.insert(sample.fingerprint);

            let previous = handle.status();
            if previous.is_checking() && !sample.status.is_checking() {
                hash_finished = true;
            }
            if sample.status == HandleStatus::ActiveSeeding && previous != HandleStatus::ActiveSeeding {
                handle.touch_upload_activity(now);
            }
            if previous != sample.status {
                debug!(
                    handle = %sample.fingerprint,
                    from = ?previous,
                    to = ?sample.status,
                    "handle status changed"
                );
            }
            handle.set_status(sample.status);
            handle.set_peers(sample.peers);
            handle.record_sample(sample.totals, now);
        }

        for handle in self.handles.iter_mut() {
            if !seen.contains(&handle.fingerprint()) && handle.connected() {
                handle.reset_sampling();
            }
        }
        if hash_finished {
            self.urm.on_hash_finished(now);
        }
    }

    pub fn counts(&self) -> ActivityCounts {
        let mut counts = ActivityCounts::default();
        for h in &self.handles {
            let status = h.status();
            if status.is_active() {
                counts.active += 1;
            } else {
                counts.inactive += 1;
            }
            match status {
                HandleStatus::ActiveDownloading => counts.downloading += 1,
                HandleStatus::ActiveSeeding => counts.seeding += 1,
                HandleStatus::Paused => counts.paused += 1,
                _ => {}
            }
        }
        counts
    }

    /// Switch the upload budget to match whether anything is downloading.
    pub fn refresh_budget(&mut self) -> bool {
        let downloading = self
            .handles
            .iter()
            .any(|h| h.status() == HandleStatus::ActiveDownloading);
        self.rate.update_upload_budget(downloading)
    }

    pub fn run_rate_control(&mut self) -> [PassReport; 2] {
        [
            self.rate.calculate(&mut self.handles, Direction::Up),
            self.rate.calculate(&mut self.handles, Direction::Down),
        ]
    }

    /// Caps changed since the last call, in transport units.
    pub fn take_pending_caps(&mut self) -> Vec<(Fingerprint, PerDir<f64>)> {
        self.handles
            .iter_mut()
            .filter_map(|h| h.take_pending_caps().map(|caps| (h.fingerprint(), caps)))
            .collect()
    }

    /// Queued handles to start now, in queue order.
    pub fn plan_promotions(&self) -> Vec<Fingerprint> {
        let counts = self.counts();
        let downloading = counts.active.saturating_sub(counts.seeding);
        let slots = self.config.max_simultaneous_downloading.saturating_sub(downloading);
        self.handles
            .iter()
            .filter(|h| h.status() == HandleStatus::Queued)
            .take(slots)
            .map(|h| h.fingerprint())
            .collect()
    }

    /// Ask the upload-rate maximiser for one extra handle to start.
    pub fn urm_candidate(&mut self, now: Instant, excluded: &[Fingerprint]) -> Option<Fingerprint> {
        let candidate = self
            .handles
            .iter()
            .find(|h| h.status() == HandleStatus::Queued && !excluded.contains(&h.fingerprint()))
            .map(|h| h.fingerprint());
        let obs = UrmObservation {
            now,
            candidate,
            any_checking: self.handles.iter().any(|h| h.status().is_checking()),
            total_measured_up: self.handles.iter().map(|h| h.measured(Direction::Up)).sum(),
            max_rate_up: self.rate.max_rate(Direction::Up),
        };
        self.urm.tick(obs)
    }

    /// Positions of seeding handles without upload activity for longer than
    /// the idle timeout.
    pub fn idle_seeders(&self, now: Instant) -> Vec<usize> {
        let timeout = self.config.seeding_idle_timeout;
        if timeout.is_zero() {
            return Vec::new();
        }
        self.handles
            .iter()
            .enumerate()
            .filter(|(_, h)| h.status() == HandleStatus::ActiveSeeding)
            .filter(|(_, h)| {
                h.last_upload_activity()
                    .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn records(&self) -> Vec<HandleRecord> {
        self.handles.iter().map(DownloadHandle::to_record).collect()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            handles: self.handles.iter().map(HandleSnapshot::from).collect(),
            counts: self.counts(),
            max_rate: PerDir::new(
                self.rate.max_rate(Direction::Up),
                self.rate.max_rate(Direction::Down),
            ),
        }
    }
}

// ============================================================================
// Actor commands
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, SchedulerError>>;

enum SchedulerCommand {
    Add { handle: DownloadHandle, reply: Reply<usize> },
    Remove { selection: Vec<usize>, delete_files: bool, reply: Reply<Vec<Fingerprint>> },
    Start { fingerprint: Fingerprint, reply: Reply<()> },
    Stop { fingerprint: Fingerprint, reply: Reply<()> },
    Pause { fingerprint: Fingerprint, reply: Reply<()> },
    Resume { fingerprint: Fingerprint, reply: Reply<()> },
    SetLocalCap { fingerprint: Fingerprint, dir: Direction, cap: f64, reply: Reply<()> },
    SetPriority { fingerprint: Fingerprint, priority: Priority, reply: Reply<()> },
    Move { selection: Vec<usize>, direction: MoveDirection, reply: Reply<bool> },
    MoveTop { selection: Vec<usize>, reply: Reply<bool> },
    MoveBottom { selection: Vec<usize>, reply: Reply<bool> },
    Snapshot { reply: Reply<SchedulerSnapshot> },
    Tick { reply: Reply<()> },
    Quit { reply: oneshot::Sender<()> },
}

// ============================================================================
// SchedulerHandle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct SchedulerHandle {
    cmd_tx: mpsc::Sender<SchedulerCommand>,
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("closed", &self.cmd_tx.is_closed())
            .finish()
    }
}

impl SchedulerHandle {
    /// Restore the queue from `store` and spawn the scheduler actor.
    pub async fn spawn(
        config: SchedulerConfig,
        rate: RateConfig,
        urm: UrmConfig,
        transport: Arc<dyn SwarmTransport>,
        store: Arc<dyn HandleStore>,
    ) -> Result<Self> {
        let loader = store.clone();
        let records = tokio::task::spawn_blocking(move || loader.load_all())
            .await
            .context("handle store loader panicked")??;

        let mut core = Scheduler::new(config, rate, urm, Instant::now());
        core.restore(records);
        core.refresh_budget();

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = SchedulerActor::new(core, transport, store);
        tokio::spawn(actor.run(cmd_rx));
        Ok(Self { cmd_tx })
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> SchedulerCommand) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SchedulerError::ShuttingDown)?;
        let result = reply_rx.await.map_err(|_| SchedulerError::ShuttingDown)?;
        Ok(result?)
    }

    pub async fn add(&self, handle: DownloadHandle) -> Result<usize> {
        self.request(|reply| SchedulerCommand::Add { handle, reply }).await
    }

    /// Remove handles by queue position. Returns the removed fingerprints.
    pub async fn remove(&self, selection: Vec<usize>, delete_files: bool) -> Result<Vec<Fingerprint>> {
        self.request(|reply| SchedulerCommand::Remove { selection, delete_files, reply })
            .await
    }

    pub async fn start(&self, fingerprint: Fingerprint) -> Result<()> {
        self.request(|reply| SchedulerCommand::Start { fingerprint, reply }).await
    }

    pub async fn stop(&self, fingerprint: Fingerprint) -> Result<()> {
        self.request(|reply| SchedulerCommand::Stop { fingerprint, reply }).await
    }

    pub async fn pause(&self, fingerprint: Fingerprint) -> Result<()> {
        self.request(|reply| SchedulerCommand::Pause { fingerprint, reply }).await
    }

    /// Put a paused or stopped handle back in the queue.
    pub async fn resume(&self, fingerprint: Fingerprint) -> Result<()> {
        self.request(|reply| SchedulerCommand::Resume { fingerprint, reply }).await
    }

    pub async fn set_local_cap(&self, fingerprint: Fingerprint, dir: Direction, cap: f64) -> Result<()> {
        self.request(|reply| SchedulerCommand::SetLocalCap { fingerprint, dir, cap, reply })
            .await
    }

    pub async fn set_priority(&self, fingerprint: Fingerprint, priority: Priority) -> Result<()> {
        self.request(|reply| SchedulerCommand::SetPriority { fingerprint, priority, reply })
            .await
    }

    pub async fn move_selection(&self, selection: Vec<usize>, direction: MoveDirection) -> Result<bool> {
        self.request(|reply| SchedulerCommand::Move { selection, direction, reply })
            .await
    }

    pub async fn move_top(&self, selection: Vec<usize>) -> Result<bool> {
        self.request(|reply| SchedulerCommand::MoveTop { selection, reply }).await
    }

    pub async fn move_bottom(&self, selection: Vec<usize>) -> Result<bool> {
        self.request(|reply| SchedulerCommand::MoveBottom { selection, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot> {
        self.request(|reply| SchedulerCommand::Snapshot { reply }).await
    }

    /// Run one frequent tick now.
    pub async fn tick(&self) -> Result<()> {
        self.request(|reply| SchedulerCommand::Tick { reply }).await
    }

    /// Set the done flag, persist the queue and stop the actor.
    pub async fn quit(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(SchedulerCommand::Quit { reply: reply_tx }).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct SchedulerActor {
    core: Scheduler,
    transport: Arc<dyn SwarmTransport>,
    store: Arc<dyn HandleStore>,
    persist_tx: mpsc::Sender<Result<usize>>,
    persist_rx: mpsc::Receiver<Result<usize>>,
    /// A store write is in flight; at most one runs at a time.
    persisting: bool,
    persist_again: bool,
}

impl SchedulerActor {
    fn new(core: Scheduler, transport: Arc<dyn SwarmTransport>, store: Arc<dyn HandleStore>) -> Self {
        let (persist_tx, persist_rx) = mpsc::channel(8);
        Self {
            core,
            transport,
            store,
            persist_tx,
            persist_rx,
            persisting: false,
            persist_again: false,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SchedulerCommand>) {
        let mut frequent = tokio::time::interval(self.core.config().frequent_interval);
        let mut infrequent = tokio::time::interval(self.core.config().infrequent_interval);
        frequent.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        frequent.tick().await;
        infrequent.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::Quit { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            self.shutdown().await;
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                _ = frequent.tick() => {
                    self.tick().await;
                }
                _ = infrequent.tick() => {
                    self.persist();
                }
                Some(result) = self.persist_rx.recv() => {
                    self.persisting = false;
                    match result {
                        Ok(count) => trace!(count, "download queue persisted"),
                        Err(e) => warn!(error = %e, "failed to persist download queue"),
                    }
                    if std::mem::take(&mut self.persist_again) {
                        self.persist();
                    }
                }
            }
            if self.core.take_dirty() {
                self.persist();
            }
        }
        debug!("scheduler actor stopped");
    }

    async fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Add { handle, reply } => {
                let _ = reply.send(self.core.add(handle));
            }
            SchedulerCommand::Remove { selection, delete_files, reply } => {
                let removed = self.core.remove(&selection);
                let mut fingerprints = Vec::with_capacity(removed.len());
                for handle in removed {
                    let fp = handle.fingerprint();
                    if let Err(e) = self.transport.remove(fp, delete_files).await {
                        warn!(handle = %fp, error = %e, "transport failed to remove handle");
                    }
                    fingerprints.push(fp);
                }
                let _ = reply.send(Ok(fingerprints));
            }
            SchedulerCommand::Start { fingerprint, reply } => {
                let _ = reply.send(self.start_handle(fingerprint).await);
            }
            SchedulerCommand::Stop { fingerprint, reply } => {
                let _ = reply.send(self.halt(fingerprint, HandleStatus::Stopped).await);
            }
            SchedulerCommand::Pause { fingerprint, reply } => {
                let _ = reply.send(self.halt(fingerprint, HandleStatus::Paused).await);
            }
            SchedulerCommand::Resume { fingerprint, reply } => {
                let result = match self.core.handle(fingerprint).map(|h| h.status()) {
                    Some(HandleStatus::Paused | HandleStatus::Stopped | HandleStatus::StoppedError) => {
                        self.core.set_status(fingerprint, HandleStatus::Queued)
                    }
                    Some(_) => Ok(()),
                    None => Err(SchedulerError::UnknownHandle(fingerprint)),
                };
                let _ = reply.send(result);
            }
            SchedulerCommand::SetLocalCap { fingerprint, dir, cap, reply } => {
                let _ = reply.send(self.core.set_local_cap(fingerprint, dir, cap));
            }
            SchedulerCommand::SetPriority { fingerprint, priority, reply } => {
                let _ = reply.send(self.core.set_priority(fingerprint, priority));
            }
            SchedulerCommand::Move { selection, direction, reply } => {
                let _ = reply.send(Ok(self.core.move_selection(&selection, direction)));
            }
            SchedulerCommand::MoveTop { selection, reply } => {
                let _ = reply.send(Ok(self.core.move_top(&selection)));
            }
            SchedulerCommand::MoveBottom { selection, reply } => {
                let _ = reply.send(Ok(self.core.move_bottom(&selection)));
            }
            SchedulerCommand::Snapshot { reply } => {
                let _ = reply.send(Ok(self.core.snapshot()));
            }
            SchedulerCommand::Tick { reply } => {
                self.tick().await;
                let _ = reply.send(Ok(()));
            }
            SchedulerCommand::Quit { .. } => {}
        }
    }

    async fn start_handle(&mut self, fingerprint: Fingerprint) -> Result<(), SchedulerError> {
        let (sources, priority) = match self.core.handle(fingerprint) {
            Some(h) => (h.sources().to_vec(), h.priority()),
            None => return Err(SchedulerError::UnknownHandle(fingerprint)),
        };
        match self.transport.start(fingerprint, &sources, priority).await {
            Ok(()) => {
                info!(handle = %fingerprint, ?priority, "handle started");
                self.core.mark_started(fingerprint)
            }
            Err(e) => {
                warn!(handle = %fingerprint, error = %e, "transport refused to start handle");
                self.core.set_status(fingerprint, HandleStatus::StoppedError)
            }
        }
    }

    async fn halt(&mut self, fingerprint: Fingerprint, status: HandleStatus) -> Result<(), SchedulerError> {
        let current = self
            .core
            .handle(fingerprint)
            .map(|h| h.status())
            .ok_or(SchedulerError::UnknownHandle(fingerprint))?;
        if current.is_active()
            && let Err(e) = self.transport.stop(fingerprint).await
        {
            warn!(handle = %fingerprint, error = %e, "transport failed to stop handle");
        }
        self.core.set_status(fingerprint, status)
    }

    async fn tick(&mut self) {
        if self.core.is_done() {
            return;
        }
        let now = Instant::now();

        match self.transport.sample().await {
            Ok(samples) => self.core.apply_samples(&samples, now),
            Err(e) => {
                debug!(error = %e, "transport sample failed, retrying next tick");
                return;
            }
        }

        self.core.refresh_budget();

        // promotions and the maximiser see the sample, not this tick's caps
        let mut promotions = self.core.plan_promotions();
        if let Some(extra) = self.core.urm_candidate(now, &promotions) {
            promotions.push(extra);
        }
        for fingerprint in promotions {
            if let Err(e) = self.start_handle(fingerprint).await {
                debug!(handle = %fingerprint, error = %e, "promotion skipped");
            }
        }

        let [up, down] = self.core.run_rate_control();
        trace!(up = ?up.mode, down = ?down.mode, "rate control tick");

        for (fingerprint, caps) in self.core.take_pending_caps() {
            if let Err(e) = self.transport.apply_caps(fingerprint, caps.up, caps.down).await {
                debug!(handle = %fingerprint, error = %e, "failed to apply caps");
            }
        }

        let idle = self.core.idle_seeders(now);
        if !idle.is_empty() {
            for handle in self.core.remove(&idle) {
                let fp = handle.fingerprint();
                info!(handle = %fp, "auto-shutdown of idle seeder");
                if let Err(e) = self.transport.remove(fp, false).await {
                    warn!(handle = %fp, error = %e, "transport failed to remove idle seeder");
                }
            }
        }
    }

    fn persist(&mut self) {
        if self.persisting {
            self.persist_again = true;
            return;
        }
        self.persisting = true;
        let records = self.core.records();
        let store = self.store.clone();
        let tx = self.persist_tx.clone();
        tokio::spawn(async move {
            let count = records.len();
            let result = tokio::task::spawn_blocking(move || store.save_all(&records))
                .await
                .context("handle store writer panicked")
                .and_then(|r| r)
                .map(|()| count);
            let _ = tx.send(result).await;
        });
    }

    async fn shutdown(&mut self) {
        self.core.set_done();
        if self.persisting {
            let _ = self.persist_rx.recv().await;
            self.persisting = false;
        }
        let records = self.core.records();
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.save_all(&records)).await {
            Ok(Ok(())) => debug!("download queue persisted on shutdown"),
            Ok(Err(e)) => warn!(error = %e, "failed to persist download queue on shutdown"),
            Err(e) => warn!(error = %e, "handle store writer panicked on shutdown"),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
