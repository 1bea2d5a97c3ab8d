//! # Fair-Share Rate Controller
//!
//! Once per scheduler tick and per [`Direction`], [`RateController::calculate`]
//! redistributes a global budget (`max_rate`) across the eligible download
//! handles. It never does I/O: it writes `reserved` and `applied` onto the
//! handles and the scheduler forwards changed caps to the transport.
//!
//! ## Regimes
//!
//! | Regime      | Condition                         | Effect |
//! |-------------|-----------------------------------|--------|
//! | Unlimited   | `max_rate == 0`                   | `applied = local cap` or unlimited |
//! | Free-wheel  | `Σ measured ≤ 80 % of max_rate`   | `applied = min(local cap, max_rate)`, `reserved = measured + TH_MID` |
//! | Allocation  | otherwise                         | classify, then run the phases below |
//!
//! ## Allocation phases
//!
//! 1. raise-in-priority handles are brought to the floor (`RATE_MIN`)
//! 2. priority-local handles reserve up to their local cap
//! 3. to-be-lowered handles give back down to `measured + TH_MID`
//! 4. `pool = max_rate − Σ committed`
//! 5. `pool > 0`: to-be-raised handles claim `measured + TH_MID − reserved`,
//!    scaled down proportionally when claims exceed the pool
//! 6. `pool < 0`: shrink equally, never below `RATE_MIN`, redistributing what
//!    a clamped handle could not give across the untouched tail
//! 7. after a shrink that restored the budget: move handles towards the mean
//!    reservation; raises are capped at `2·(measured + TH_LOW − reserved)` and
//!    never lift a handle past its own claim of `measured + TH_MID`
//!
//! ## Accounting
//!
//! A handle's *committed* rate is what its applied cap will be: its reserved
//! rate floored at `RATE_MIN` (near-zero handles commit exactly `RATE_MIN`,
//! priority-local handles commit their reserved rate). The pool is computed
//! from committed rates so `Σ applied ≤ max_rate` holds after every pass.
//!
//! Every pass leaves the handles at a fixed point: a second pass over
//! unchanged measurements reproduces the first bit for bit. A scaled grant or
//! a completed shrink leaves the pool balanced, and a balanced pool moves
//! nobody. No phase leaves a handle in the to-be-lowered band. A budget below
//! the sum of the floors leaves every shrinkable handle at its floor and skips
//! the mean targeting.
//!
//! ## Failure isolation
//!
//! Each handle's result is validated before it is written. A NaN or negative
//! result leaves that handle's previous `reserved`/`applied` untouched and the
//! pass continues with the others.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::handle::{Direction, DownloadHandle, PerDir, UNLIMITED};

// ============================================================================
// Constants
// ============================================================================

/// Per-direction floor (KiB/s) below which the controller never lowers a
/// handle that is actually transferring.
pub const RATE_MIN: PerDir<f64> = PerDir::new(3.0, 0.01);

/// Reserved-minus-measured gap above which a handle gives bandwidth back.
pub const DEFAULT_TH_HIGH: f64 = 2.3;

/// Reserved-minus-measured gap at or below which a handle asks for more.
pub const DEFAULT_TH_LOW: f64 = 0.7;

/// Measured rates below this are treated as idle.
pub const NEAR_ZERO_RATE: f64 = 0.05;

/// Fraction of the budget below which the controller free-wheels.
pub const FREE_WHEEL_RATIO: f64 = 0.8;

/// Pool magnitudes below this are treated as exactly balanced.
pub const POOL_EPSILON: f64 = 1e-6;

/// Default global upload budget while any handle is downloading (0 = unlimited).
pub const DEFAULT_MAX_UPLOAD_DOWNLOADING: f64 = 0.0;

/// Default global upload budget while only seeding (0 = unlimited).
pub const DEFAULT_MAX_UPLOAD_SEEDING: f64 = 0.0;

/// Default global download budget (0 = unlimited).
pub const DEFAULT_MAX_DOWNLOAD: f64 = 0.0;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Upload budget (KiB/s) while at least one handle is downloading.
    pub max_upload_downloading: f64,
    /// Upload budget (KiB/s) while every active handle is seeding.
    pub max_upload_seeding: f64,
    /// Download budget (KiB/s).
    pub max_download: f64,
    /// Serve handles with a local cap first, outside the general pool.
    pub prioritize_local: bool,
    pub th_high: f64,
    pub th_low: f64,
    pub rate_min: PerDir<f64>,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            max_upload_downloading: DEFAULT_MAX_UPLOAD_DOWNLOADING,
            max_upload_seeding: DEFAULT_MAX_UPLOAD_SEEDING,
            max_download: DEFAULT_MAX_DOWNLOAD,
            prioritize_local: false,
            th_high: DEFAULT_TH_HIGH,
            th_low: DEFAULT_TH_LOW,
            rate_min: RATE_MIN,
        }
    }
}

impl RateConfig {
    /// Midpoint of the hysteresis band: the headroom granted above `measured`.
    pub fn th_mid(&self) -> f64 {
        (self.th_high + self.th_low) / 2.0
    }
}

// ============================================================================
// Classification
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateClass {
    /// Local cap set and `prioritize_local` on: served before the pool.
    PriorityLocal,
    /// Not transferring; reservation reset to zero.
    NearZero,
    /// Reserved well above measured: gives bandwidth back.
    ToBeLowered,
    /// Close to its reservation but under the floor: raised first.
    RaiseInPriority,
    /// Close to its reservation: claims more from the pool.
    ToBeRaised,
    /// Inside the hysteresis band.
    Steady,
    /// Inside the band but at or under the floor: left as is.
    Holding,
}

/// Which regime a pass ran in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassMode {
    /// No eligible handle; nothing written.
    Idle,
    Unlimited,
    FreeWheel,
    /// Pool was positive: claims granted.
    Raise,
    /// Pool was balanced or negative: shrink and mean-targeting.
    Rebalance,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PassReport {
    pub dir: Direction,
    pub mode: PassMode,
    pub eligible: usize,
    pub updated: usize,
    pub rejected: usize,
    pub pool: f64,
}

// ============================================================================
// Controller
// ============================================================================

/// Working copy of one eligible handle during a pass.
#[derive(Clone, Debug)]
struct Slot {
    index: usize,
    class: RateClass,
    measured: f64,
    reserved: f64,
    applied: f64,
    local_cap: f64,
    ceiling: f64,
}

impl Slot {
    fn committed(&self, rate_min: f64) -> f64 {
        match self.class {
            RateClass::PriorityLocal => self.reserved,
            RateClass::NearZero => rate_min,
            _ => self.reserved.max(rate_min),
        }
    }
}

#[derive(Debug)]
pub struct RateController {
    config: RateConfig,
    max_rate: PerDir<f64>,
}

impl RateController {
    pub fn new(config: RateConfig) -> Self {
        let max_rate = PerDir::new(config.max_upload_downloading, config.max_download);
        Self { config, max_rate }
    }

    pub fn config(&self) -> &RateConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: RateConfig) {
        self.config = config;
        self.max_rate.down = self.config.max_download;
    }

    pub fn max_rate(&self, dir: Direction) -> f64 {
        self.max_rate[dir]
    }

    pub fn set_max_rate(&mut self, dir: Direction, rate: f64) {
        self.max_rate[dir] = rate.max(0.0);
    }

    /// Select the upload budget for the current activity. Returns whether the
    /// budget changed.
    pub fn update_upload_budget(&mut self, any_downloading: bool) -> bool {
        let target = if any_downloading {
            self.config.max_upload_downloading
        } else {
            self.config.max_upload_seeding
        };
        if self.max_rate.up != target {
            debug!(
                from = self.max_rate.up,
                to = target,
                downloading = any_downloading,
                "switching upload budget"
            );
            self.max_rate.up = target;
            true
        } else {
            false
        }
    }

    /// Classify a handle for `dir` against the hysteresis thresholds.
    pub fn classify(&self, handle: &DownloadHandle, dir: Direction) -> RateClass {
        let measured = handle.measured(dir);
        let gap = handle.reserved(dir) - measured;
        let rate_min = self.config.rate_min[dir];

        if self.config.prioritize_local && handle.local_cap(dir) > 0.0 {
            RateClass::PriorityLocal
        } else if measured < NEAR_ZERO_RATE {
            RateClass::NearZero
        } else if gap > self.config.th_high {
            RateClass::ToBeLowered
        } else if gap <= self.config.th_low && measured < rate_min {
            RateClass::RaiseInPriority
        } else if gap <= self.config.th_low {
            RateClass::ToBeRaised
        } else if measured > rate_min {
            RateClass::Steady
        } else {
            RateClass::Holding
        }
    }

    /// Run one allocation pass for `dir` over `handles`.
    ///
    /// Only connected handles whose status is eligible for `dir` are read or
    /// written; every other handle is left untouched.
    pub fn calculate(&mut self, handles: &mut [DownloadHandle], dir: Direction) -> PassReport {
        let mut slots: Vec<Slot> = handles
            .iter()
            .enumerate()
            .filter(|(_, h)| h.connected() && h.status().is_eligible(dir))
            .map(|(index, h)| Slot {
                index,
                class: self.classify(h, dir),
                measured: h.measured(dir),
                reserved: h.reserved(dir),
                applied: h.applied(dir),
                local_cap: h.local_cap(dir),
                ceiling: h.ceiling(dir),
            })
            .collect();

        let mut report = PassReport {
            dir,
            mode: PassMode::Idle,
            eligible: slots.len(),
            updated: 0,
            rejected: 0,
            pool: 0.0,
        };
        if slots.is_empty() {
            return report;
        }

        let max_rate = self.max_rate[dir];
        let total_measured: f64 = slots.iter().map(|s| s.measured).sum();

        if max_rate <= 0.0 {
            report.mode = PassMode::Unlimited;
            for slot in &mut slots {
                slot.applied = slot.ceiling;
                slot.reserved = slot.applied;
            }
        } else if total_measured <= FREE_WHEEL_RATIO * max_rate {
            report.mode = PassMode::FreeWheel;
            let th_mid = self.config.th_mid();
            for slot in &mut slots {
                slot.applied = slot.ceiling.min(max_rate);
                slot.reserved = slot.measured + th_mid;
            }
        } else {
            let (mode, pool) = self.allocate(&mut slots, dir, max_rate);
            report.mode = mode;
            report.pool = pool;
        }

        for slot in &slots {
            if commit(&mut handles[slot.index], dir, slot) {
                report.updated += 1;
            } else {
                report.rejected += 1;
            }
        }

        debug!(
            dir = dir.as_str(),
            mode = ?report.mode,
            eligible = report.eligible,
            updated = report.updated,
            rejected = report.rejected,
            max_rate,
            total_measured,
            pool = report.pool,
            "rate allocation pass"
        );
        report
    }

    fn allocate(&self, slots: &mut [Slot], dir: Direction, max_rate: f64) -> (PassMode, f64) {
        let rate_min = self.config.rate_min[dir];
        let th_mid = self.config.th_mid();
        let th_low = self.config.th_low;

        // Prioritised raises, priority-local reservations and givebacks.
        for slot in slots.iter_mut() {
            match slot.class {
                RateClass::RaiseInPriority => {
                    slot.reserved = rate_min.min(slot.measured + th_mid);
                }
                RateClass::PriorityLocal => {
                    slot.reserved = slot.local_cap.min(slot.measured + th_mid);
                    slot.applied = slot.local_cap;
                }
                RateClass::ToBeLowered => {
                    slot.reserved = slot.measured + th_mid;
                }
                RateClass::NearZero => {
                    slot.reserved = 0.0;
                }
                // commits its floor anyway; grants and cuts start from there
                RateClass::ToBeRaised => {
                    slot.reserved = slot.reserved.max(rate_min);
                }
                RateClass::Steady | RateClass::Holding => {}
            }
        }

        let committed: f64 = slots.iter().map(|s| s.committed(rate_min)).sum();
        let pool = max_rate - committed;
        trace!(dir = dir.as_str(), committed, pool, "pool after priority phases");

        let mode = if pool > POOL_EPSILON {
            grant_claims(slots, pool, th_mid);
            PassMode::Raise
        } else {
            if pool < -POOL_EPSILON {
                let mut left = shrink_tier(
                    slots,
                    -pool,
                    rate_min,
                    |s| matches!(s.class, RateClass::ToBeRaised | RateClass::Steady)
                        && s.measured > rate_min,
                );
                if left > POOL_EPSILON {
                    // Givebacks alone did not restore the budget.
                    left = shrink_tier(slots, left, rate_min, |s| {
                        matches!(s.class, RateClass::ToBeLowered | RateClass::Holding)
                    });
                }
                if left > POOL_EPSILON {
                    warn!(
                        dir = dir.as_str(),
                        unassigned = left,
                        "budget below the sum of per-handle floors"
                    );
                } else {
                    target_mean(slots, rate_min, th_low, th_mid);
                }
            }
            PassMode::Rebalance
        };

        for slot in slots.iter_mut() {
            slot.applied = match slot.class {
                RateClass::PriorityLocal => slot.applied,
                RateClass::NearZero => rate_min.min(slot.ceiling),
                _ => slot.reserved.max(rate_min).min(slot.ceiling),
            };
        }

        (mode, pool)
    }
}

/// Phase 1: grant each to-be-raised claim, scaled to fit the pool.
fn grant_claims(slots: &mut [Slot], pool: f64, th_mid: f64) {
    let claims: Vec<(usize, f64)> = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.class == RateClass::ToBeRaised)
        .map(|(i, s)| (i, (s.ceiling.min(s.measured + th_mid) - s.reserved).max(0.0)))
        .collect();
    let total: f64 = claims.iter().map(|(_, c)| c).sum();
    if total <= 0.0 {
        return;
    }
    let scale = if total <= pool { 1.0 } else { pool / total };
    for (i, claim) in claims {
        slots[i].reserved += claim * scale;
    }
}

/// Lower the selected slots by `deficit` in equal shares, never below
/// `rate_min`. Slots are visited in ascending reserved order so whatever a
/// clamped slot cannot give is spread over the rest. Returns the part of the
/// deficit that could not be assigned.
fn shrink_tier<F>(slots: &mut [Slot], deficit: f64, rate_min: f64, select: F) -> f64
where
    F: Fn(&Slot) -> bool,
{
    let mut members: Vec<usize> = (0..slots.len()).filter(|&i| select(&slots[i])).collect();
    members.sort_by(|&a, &b| slots[a].reserved.total_cmp(&slots[b].reserved));
    lower_evenly(slots, &members, deficit, rate_min)
}

fn lower_evenly(slots: &mut [Slot], members: &[usize], amount: f64, floor: f64) -> f64 {
    let mut remaining = amount;
    let mut left = members.len();
    for &i in members {
        if remaining <= 0.0 {
            break;
        }
        let share = remaining / left as f64;
        let room = (slots[i].reserved - floor).max(0.0);
        let cut = share.min(room);
        slots[i].reserved -= cut;
        remaining -= cut;
        left -= 1;
    }
    remaining.max(0.0)
}

/// Phase 2b: pull below-mean handles up towards the mean, paid for by the
/// above-mean handles. Budget neutral. A raise stops at the handle's own claim
/// (`measured + th_mid`) so it lands inside the hysteresis band.
fn target_mean(slots: &mut [Slot], rate_min: f64, th_low: f64, th_mid: f64) {
    let group: Vec<usize> = (0..slots.len())
        .filter(|&i| matches!(slots[i].class, RateClass::ToBeRaised | RateClass::Steady))
        .collect();
    if group.is_empty() {
        return;
    }
    let mean = group.iter().map(|&i| slots[i].reserved).sum::<f64>() / group.len() as f64;

    let mut raises: Vec<(usize, f64)> = Vec::new();
    for &i in &group {
        let s = &slots[i];
        if s.class != RateClass::ToBeRaised || s.reserved >= mean - POOL_EPSILON {
            continue;
        }
        let target = mean.min(s.ceiling).min(s.measured + th_mid);
        let step = 2.0 * (s.measured + th_low - s.reserved);
        let raise = (target - s.reserved).min(step).max(0.0);
        if raise > 0.0 {
            raises.push((i, raise));
        }
    }

    let floor = mean.max(rate_min);
    let mut above: Vec<usize> = group
        .iter()
        .copied()
        .filter(|&i| slots[i].reserved > mean + POOL_EPSILON)
        .collect();
    above.sort_by(|&a, &b| slots[a].reserved.total_cmp(&slots[b].reserved));

    let wanted: f64 = raises.iter().map(|(_, r)| r).sum();
    let capacity: f64 = above.iter().map(|&i| (slots[i].reserved - floor).max(0.0)).sum();
    let granted = wanted.min(capacity);
    if granted <= POOL_EPSILON {
        return;
    }

    let scale = granted / wanted;
    for (i, raise) in raises {
        slots[i].reserved += raise * scale;
    }
    lower_evenly(slots, &above, granted, floor);
}

/// Validate and write one slot's result. Returns false (and leaves the handle
/// untouched) when the result is unusable.
fn commit(handle: &mut DownloadHandle, dir: Direction, slot: &Slot) -> bool {
    let valid = |v: f64| !v.is_nan() && v >= 0.0;
    if !valid(slot.reserved) || !valid(slot.applied) {
        warn!(
            handle = %handle.fingerprint(),
            dir = dir.as_str(),
            reserved = slot.reserved,
            applied = slot.applied,
            "discarding invalid rate result, keeping previous caps"
        );
        return false;
    }
    handle.set_reserved(dir, slot.reserved);
    handle.set_applied(dir, if slot.applied.is_finite() { slot.applied } else { UNLIMITED });
    true
}

// ============================================================================
// Tests
// ============================================================================
