//! # Readiness gates
//!
//! An idempotent synchronization point shared by every stage that waits on
//! the radio (device ready, SIM ready, registered, attached).
//!
//! ```text
//!            begin()              open()
//!   Closed ──────────► Pending ──────────► Open
//!     ▲                   │                 │
//!     └──── abandon(err) ─┘                 │
//!     └──────────────── reset() ────────────┘
//! ```
//!
//! Blocking callers park on the condition variable until the gate opens,
//! the pending attempt is abandoned, or their own deadline passes.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{CellularError, Result};

/// How a stage call should behave while the radio works.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Park the calling thread for at most this long.
    Blocking(Duration),
    /// Return at once; completion is reported as an event.
    NonBlocking,
}

/// Result of trying to claim a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateEntry {
    /// Caller owns the new attempt and must start it.
    Start,
    /// Another attempt is outstanding.
    InFlight,
    /// Already open.
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed { last_error: Option<CellularError> },
    Pending,
    Open,
}

pub struct Gate {
    name: &'static str,
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(GateState::Closed { last_error: None }),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn begin(&self) -> GateEntry {
        let mut state = self.lock();
        match *state {
            GateState::Open => GateEntry::Open,
            GateState::Pending => GateEntry::InFlight,
            GateState::Closed { .. } => {
                *state = GateState::Pending;
                GateEntry::Start
            }
        }
    }

    /// Open the gate. Returns `true` only on the transition.
    pub fn open(&self) -> bool {
        let mut state = self.lock();
        if *state == GateState::Open {
            return false;
        }
        *state = GateState::Open;
        self.cond.notify_all();
        true
    }

    /// Give up a pending attempt; waiters see `error`.
    pub fn abandon(&self, error: CellularError) -> bool {
        let mut state = self.lock();
        if *state != GateState::Pending {
            return false;
        }
        *state = GateState::Closed {
            last_error: Some(error),
        };
        self.cond.notify_all();
        true
    }

    /// Close the gate whatever its state. Returns `true` if it was open.
    pub fn reset(&self) -> bool {
        let mut state = self.lock();
        let was_open = *state == GateState::Open;
        *state = GateState::Closed { last_error: None };
        self.cond.notify_all();
        was_open
    }

    pub fn is_open(&self) -> bool {
        *self.lock() == GateState::Open
    }

    pub fn is_pending(&self) -> bool {
        *self.lock() == GateState::Pending
    }

    /// Park until the gate leaves `Pending` or `deadline` passes.
    ///
    /// `Err(Timeout)` leaves the attempt pending; the caller decides whether
    /// to re-poll or abandon.
    pub fn wait_until(&self, deadline: Instant) -> Result<()> {
        let mut state = self.lock();
        loop {
            match *state {
                GateState::Open => return Ok(()),
                GateState::Closed { last_error } => {
                    return Err(last_error.unwrap_or(CellularError::DeviceError))
                }
                GateState::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CellularError::Timeout);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wait on `gate` until `timeout`, calling `repoll` at each interval of
/// `schedule` that passes without a decision. Abandons the attempt with
/// `Timeout` once the budget is spent.
pub(crate) fn wait_with_retries(
    gate: &Gate,
    timeout: Duration,
    schedule: &[Duration],
    mut repoll: impl FnMut(),
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut retries = schedule.iter();
    loop {
        let slice_end = match retries.next() {
            Some(backoff) => (Instant::now() + *backoff).min(deadline),
            None => deadline,
        };
        match gate.wait_until(slice_end) {
            Err(CellularError::Timeout) if slice_end < deadline => {
                tracing::debug!(gate = gate.name(), "re-polling radio");
                repoll();
            }
            Err(CellularError::Timeout) => {
                gate.abandon(CellularError::Timeout);
                return Err(CellularError::Timeout);
            }
            other => return other,
        }
    }
}
