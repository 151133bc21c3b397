//! Process-wide diagnostic counters (§5): `tr_assign` (lifetime total of
//! successful interface assignments) and `online_tr` (currently
//! authenticated clients). Single-reactor code only ever touches these
//! from the one reactor thread, but §5's multi-reactor variant shares
//! them across threads, so they are atomics from the start rather than
//! plain integers that would need retrofitting later.

use std::sync::atomic::{AtomicU32, Ordering};

/// Increments/reads use the ordering §9 calls for: `Release` on publish
/// (a counter bump other threads should observe after this client's
/// state transition), `Acquire` on read-then-act.
#[derive(Default)]
pub struct ServerCounters {
    tr_assign: AtomicU32,
    online_tr: AtomicU32,
}

impl ServerCounters {
    pub fn new() -> Self {
        ServerCounters {
            tr_assign: AtomicU32::new(0),
            online_tr: AtomicU32::new(0),
        }
    }

    /// Records one successful interface assignment (a slot transitioning
    /// into `Authenticated`).
    pub fn record_assignment(&self) {
        self.tr_assign.fetch_add(1, Ordering::Release);
        self.online_tr.fetch_add(1, Ordering::Release);
    }

    /// Records an authenticated client leaving (disconnect/termination).
    pub fn record_offline(&self) {
        self.online_tr.fetch_sub(1, Ordering::Release);
    }

    /// Lifetime total of successful interface assignments.
    pub fn tr_assign(&self) -> u32 {
        self.tr_assign.load(Ordering::Acquire)
    }

    /// Clients currently in `Authenticated` state.
    pub fn online_tr(&self) -> u32 {
        self.online_tr.load(Ordering::Acquire)
    }
}
