//! # Download Handles
//!
//! A [`DownloadHandle`] is the per-swarm control object the scheduler and the
//! rate controller work on. It is keyed by the swarm's content
//! [`Fingerprint`] and carries, per [`Direction`]:
//!
//! | Field       | Meaning |
//! |-------------|---------|
//! | `measured`  | rate sampled over the last scheduler window (KiB/s) |
//! | `reserved`  | rate the controller is steering towards |
//! | `applied`   | cap handed to the transport (`INFINITY` = unlimited) |
//! | `local_cap` | user ceiling, `0` = none |
//!
//! The handle does no I/O. Caps written by the controller are marked dirty and
//! pushed to the transport by the scheduler once per tick.

use std::ops::{Index, IndexMut};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Rates are KiB/s; one KiB is 1024 bytes.
pub const KIB: f64 = 1024.0;

/// Rate value standing for "no cap".
pub const UNLIMITED: f64 = f64::INFINITY;

/// 20-byte content fingerprint of a swarm.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 20 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..6]))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Up, Direction::Down];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// A value kept once per transfer direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerDir<T> {
    pub up: T,
    pub down: T,
}

impl<T> PerDir<T> {
    pub const fn new(up: T, down: T) -> Self {
        Self { up, down }
    }
}

impl<T> Index<Direction> for PerDir<T> {
    type Output = T;

    fn index(&self, dir: Direction) -> &T {
        match dir {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

impl<T> IndexMut<Direction> for PerDir<T> {
    fn index_mut(&mut self, dir: Direction) -> &mut T {
        match dir {
            Direction::Up => &mut self.up,
            Direction::Down => &mut self.down,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleStatus {
    Hashing,
    Allocating,
    Queued,
    ActiveDownloading,
    ActiveSeeding,
    Paused,
    Stopped,
    StoppedError,
}

impl HandleStatus {
    /// Statuses that occupy a transport slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            HandleStatus::Hashing
                | HandleStatus::Allocating
                | HandleStatus::ActiveDownloading
                | HandleStatus::ActiveSeeding
        )
    }

    pub fn is_checking(&self) -> bool {
        matches!(self, HandleStatus::Hashing | HandleStatus::Allocating)
    }

    /// Whether the rate controller may allocate `dir` bandwidth to a handle in
    /// this status.
    pub fn is_eligible(&self, dir: Direction) -> bool {
        match dir {
            Direction::Down => *self == HandleStatus::ActiveDownloading,
            Direction::Up => matches!(
                self,
                HandleStatus::ActiveDownloading | HandleStatus::ActiveSeeding
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Cumulative transfer counters reported by the transport.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[derive(Clone, Debug)]
pub struct DownloadHandle {
    fingerprint: Fingerprint,
    sources: Vec<String>,
    status: HandleStatus,
    priority: Priority,
    index: usize,
    connected: bool,
    peers: usize,
    measured: PerDir<f64>,
    reserved: PerDir<f64>,
    applied: PerDir<f64>,
    local_cap: PerDir<f64>,
    caps_dirty: bool,
    last_sample: Option<(TransferTotals, Instant)>,
    last_upload_activity: Option<Instant>,
}

impl DownloadHandle {
    pub fn new(fingerprint: Fingerprint, sources: Vec<String>) -> Self {
        Self {
            fingerprint,
            sources,
            status: HandleStatus::Queued,
            priority: Priority::Normal,
            index: 0,
            connected: false,
            peers: 0,
            measured: PerDir::default(),
            reserved: PerDir::default(),
            applied: PerDir::new(UNLIMITED, UNLIMITED),
            local_cap: PerDir::default(),
            caps_dirty: false,
            last_sample: None,
            last_upload_activity: None,
        }
    }

    pub fn from_record(record: &HandleRecord) -> Self {
        let mut handle = Self::new(record.fingerprint, record.sources.clone());
        handle.reserved = PerDir::new(record.reserved_up, record.reserved_down);
        handle.local_cap = record.local_cap;
        handle.priority = record.priority;
        handle.index = record.last_index;
        handle.status = if record.stopped {
            HandleStatus::Stopped
        } else {
            HandleStatus::Queued
        };
        handle
    }

    pub fn to_record(&self) -> HandleRecord {
        HandleRecord {
            fingerprint: self.fingerprint,
            sources: self.sources.clone(),
            reserved_up: finite_or_zero(self.reserved.up),
            reserved_down: finite_or_zero(self.reserved.down),
            local_cap: self.local_cap,
            priority: self.priority,
            last_index: self.index,
            stopped: matches!(
                self.status,
                HandleStatus::Stopped | HandleStatus::StoppedError | HandleStatus::Paused
            ),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    pub fn status(&self) -> HandleStatus {
        self.status
    }

    pub fn set_status(&mut self, status: HandleStatus) {
        self.status = status;
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    pub fn connected(&self) -> bool {
        self.connected
    }

    pub fn peers(&self) -> usize {
        self.peers
    }

    pub fn set_peers(&mut self, peers: usize) {
        self.peers = peers;
        self.connected = peers > 0;
    }

    pub fn measured(&self, dir: Direction) -> f64 {
        self.measured[dir]
    }

    pub fn set_measured(&mut self, dir: Direction, rate: f64) {
        self.measured[dir] = rate;
    }

    pub fn reserved(&self, dir: Direction) -> f64 {
        self.reserved[dir]
    }

    pub fn set_reserved(&mut self, dir: Direction, rate: f64) {
        self.reserved[dir] = rate;
    }

    pub fn applied(&self, dir: Direction) -> f64 {
        self.applied[dir]
    }

    /// Record the cap the transport must honour from the next tick on.
    pub fn set_applied(&mut self, dir: Direction, rate: f64) {
        if self.applied[dir] != rate {
            self.applied[dir] = rate;
            self.caps_dirty = true;
        }
    }

    pub fn local_cap(&self, dir: Direction) -> f64 {
        self.local_cap[dir]
    }

    /// Effective ceiling: the local cap or `UNLIMITED`.
    pub fn ceiling(&self, dir: Direction) -> f64 {
        if self.local_cap[dir] > 0.0 {
            self.local_cap[dir]
        } else {
            UNLIMITED
        }
    }

    pub fn set_local_cap(&mut self, dir: Direction, cap: f64) {
        self.local_cap[dir] = cap.max(0.0);
    }

    /// Caps pending delivery to the transport, in transport units (`0` =
    /// unlimited). Clears the dirty mark.
    pub fn take_pending_caps(&mut self) -> Option<PerDir<f64>> {
        if !self.caps_dirty {
            return None;
        }
        self.caps_dirty = false;
        Some(PerDir::new(
            transport_cap(self.applied.up),
            transport_cap(self.applied.down),
        ))
    }

    /// Derive `measured` from cumulative counters sampled at `now`.
    pub fn record_sample(&mut self, totals: TransferTotals, now: Instant) {
        if let Some((previous, at)) = self.last_sample {
            let elapsed = now.saturating_duration_since(at).as_secs_f64();
            if elapsed > 0.0 {
                let up = totals.bytes_up.saturating_sub(previous.bytes_up) as f64;
                let down = totals.bytes_down.saturating_sub(previous.bytes_down) as f64;
                self.measured.up = up / KIB / elapsed;
                self.measured.down = down / KIB / elapsed;
            }
        }
        if self.measured.up > 0.0 {
            self.last_upload_activity = Some(now);
        }
        self.last_sample = Some((totals, now));
    }

    /// Forget counters so the next sample starts a fresh window.
    pub fn reset_sampling(&mut self) {
        self.last_sample = None;
        self.measured = PerDir::default();
        self.peers = 0;
        self.connected = false;
    }

    pub fn last_upload_activity(&self) -> Option<Instant> {
        self.last_upload_activity
    }

    pub(crate) fn touch_upload_activity(&mut self, now: Instant) {
        self.last_upload_activity = Some(now);
    }
}

/// Persisted form of a handle (one file per handle under `handles/`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub fingerprint: Fingerprint,
    pub sources: Vec<String>,
    pub reserved_up: f64,
    pub reserved_down: f64,
    pub local_cap: PerDir<f64>,
    pub priority: Priority,
    pub last_index: usize,
    pub stopped: bool,
}

/// Convert an internal rate to the transport's convention (`0` = unlimited).
pub fn transport_cap(rate: f64) -> f64 {
    if rate.is_finite() { rate } else { 0.0 }
}

fn finite_or_zero(rate: f64) -> f64 {
    if rate.is_finite() { rate } else { 0.0 }
}
