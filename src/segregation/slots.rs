//! Fast/slow slot partitions with idle-slot borrowing
//!
//! Total capacity is split into a slow partition of
//! `max(1, floor(total * fraction))` slots (capped at total) and a fast
//! partition with the rest. A request that finds its own partition full may
//! borrow a free slot from the other partition once that partition has had no
//! acquire or release of its own for the borrow window. The window is measured
//! from creation until the first activity. Borrowed slots go back to the
//! partition they came from.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Which partition an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Fast,
    Slow,
}

impl SlotKind {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Fast => Self::Slow,
            Self::Slow => Self::Fast,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Fast => 0,
            Self::Slow => 1,
        }
    }
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        })
    }
}

/// Slow partition size for `total` slots
#[must_use]
pub fn slow_slots_for(total: usize, fraction: f64) -> usize {
    if total == 0 {
        return 0;
    }
    let fraction = fraction.clamp(0.0, 1.0);
    // Truncation toward zero is the floor for non-negative values
    let floor = (total as f64 * fraction).floor() as usize;
    floor.max(1).min(total)
}

#[derive(Debug)]
struct SlotState {
    total: usize,
    /// Indexed by `SlotKind::index`
    slots: [usize; 2],
    /// Slots of each partition currently in use, by either kind
    used: [usize; 2],
    /// Active operations of each kind
    active: [usize; 2],
    /// Slots of each partition currently lent to the other kind
    lent: [usize; 2],
    last_activity: [Instant; 2],
}

impl SlotState {
    fn idle_since(&self, kind: SlotKind) -> Instant {
        self.last_activity[kind.index()]
    }

    fn has_free(&self, kind: SlotKind) -> bool {
        self.used[kind.index()] < self.slots[kind.index()]
    }
}

/// Point-in-time view of a slot manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub total: usize,
    pub slow_slots: usize,
    pub fast_slots: usize,
    pub active_slow: usize,
    pub active_fast: usize,
    pub slow_lent_to_fast: usize,
    pub fast_lent_to_slow: usize,
    pub enabled: bool,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SlotManager[total={}, slow={}/{}, fast={}/{}, enabled={}]",
            self.total,
            self.active_slow,
            self.slow_slots,
            self.active_fast,
            self.fast_slots,
            self.enabled
        )
    }
}

enum Attempt {
    Taken { origin: SlotKind },
    /// Borrowing becomes possible at this instant if nothing else changes
    RetryAt(Option<Instant>),
}

/// Partitioned admission control in front of a pool
#[derive(Debug)]
pub struct SlotManager {
    state: Mutex<SlotState>,
    released: Notify,
    fraction: f64,
    borrow_window: Duration,
    enabled: bool,
    /// Cumulative borrows, indexed by the lending partition
    borrows: [AtomicU64; 2],
}

impl SlotManager {
    pub fn new(total: usize, slow_fraction: f64, borrow_window: Duration, enabled: bool) -> Self {
        let slow = slow_slots_for(total, slow_fraction);
        let now = Instant::now();
        Self {
            state: Mutex::new(SlotState {
                total,
                slots: [total - slow, slow],
                used: [0, 0],
                active: [0, 0],
                lent: [0, 0],
                last_activity: [now, now],
            }),
            released: Notify::new(),
            fraction: slow_fraction,
            borrow_window,
            enabled,
            borrows: [AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn try_take(&self, kind: SlotKind) -> Attempt {
        let mut state = self.lock();
        let now = Instant::now();
        if state.has_free(kind) {
            state.used[kind.index()] += 1;
            state.active[kind.index()] += 1;
            state.last_activity[kind.index()] = now;
            return Attempt::Taken { origin: kind };
        }

        let lender = kind.other();
        if !state.has_free(lender) {
            return Attempt::RetryAt(None);
        }
        let eligible_at = state.idle_since(lender) + self.borrow_window;
        if now < eligible_at {
            return Attempt::RetryAt(Some(eligible_at));
        }

        state.used[lender.index()] += 1;
        state.lent[lender.index()] += 1;
        state.active[kind.index()] += 1;
        state.last_activity[kind.index()] = now;
        self.borrows[lender.index()].fetch_add(1, Ordering::Relaxed);
        Attempt::Taken { origin: lender }
    }

    /// Wait up to `timeout` for a slot of `kind`
    ///
    /// Returns `None` when the timeout elapses first.
    pub async fn acquire(self: &Arc<Self>, kind: SlotKind, timeout: Duration) -> Option<SlotPermit> {
        if !self.enabled {
            return Some(SlotPermit {
                manager: self.clone(),
                kind,
                origin: None,
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            let retry_at = match self.try_take(kind) {
                Attempt::Taken { origin } => {
                    if origin != kind {
                        debug!(kind = %kind, lender = %origin, "Borrowed idle slot");
                    }
                    return Some(SlotPermit {
                        manager: self.clone(),
                        kind,
                        origin: Some(origin),
                    });
                }
                Attempt::RetryAt(at) => at,
            };

            if Instant::now() >= deadline {
                return None;
            }
            let wake = retry_at.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                () = &mut released => {}
                () = tokio::time::sleep_until(wake) => {}
            }
        }
    }

    fn release(&self, kind: SlotKind, origin: SlotKind) {
        {
            let mut state = self.lock();
            state.used[origin.index()] = state.used[origin.index()].saturating_sub(1);
            state.active[kind.index()] = state.active[kind.index()].saturating_sub(1);
            if origin != kind {
                state.lent[origin.index()] = state.lent[origin.index()].saturating_sub(1);
            }
            state.last_activity[kind.index()] = Instant::now();
        }
        self.released.notify_waiters();
    }

    /// Repartition for a new total, keeping the configured fraction
    ///
    /// Slots in use above the new partition sizes drain as they are released.
    pub fn resize(&self, total: usize) {
        {
            let mut state = self.lock();
            if state.total == total {
                return;
            }
            let slow = slow_slots_for(total, self.fraction);
            state.total = total;
            state.slots = [total - slow, slow];
            debug!(total, slow, fast = total - slow, "Repartitioned slots");
        }
        self.released.notify_waiters();
    }

    #[must_use]
    pub fn status(&self) -> SlotStatus {
        let state = self.lock();
        SlotStatus {
            total: state.total,
            slow_slots: state.slots[SlotKind::Slow.index()],
            fast_slots: state.slots[SlotKind::Fast.index()],
            active_slow: state.active[SlotKind::Slow.index()],
            active_fast: state.active[SlotKind::Fast.index()],
            slow_lent_to_fast: state.lent[SlotKind::Slow.index()],
            fast_lent_to_slow: state.lent[SlotKind::Fast.index()],
            enabled: self.enabled,
        }
    }

    /// Total borrows ever made from `lender`'s partition
    #[must_use]
    pub fn borrows_from(&self, lender: SlotKind) -> u64 {
        self.borrows[lender.index()].load(Ordering::Relaxed)
    }
}

/// A held slot; released on drop
#[derive(Debug)]
pub struct SlotPermit {
    manager: Arc<SlotManager>,
    kind: SlotKind,
    /// Partition the slot belongs to; `None` when the manager is disabled
    origin: Option<SlotKind>,
}

impl SlotPermit {
    #[must_use]
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    #[must_use]
    pub fn is_borrowed(&self) -> bool {
        self.origin.is_some_and(|origin| origin != self.kind)
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        if let Some(origin) = self.origin {
            self.manager.release(self.kind, origin);
        }
    }
}
