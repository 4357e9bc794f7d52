//! Global sync clock.
//!
//! Every mutation, of every entity type, is stamped with a value taken from a
//! single shared counter. That turns independent tables into one totally
//! ordered change log: "everything after tick N" means the same thing for
//! every table at once.
//!
//! The counter always moves in steps of two. Local writes are stamped with the
//! even half of a step (the "tock") and rows written by an import with the odd
//! half (the "tick"), so a row's provenance can be read off its stamp.

use crate::Tick;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Default step for [`TickSource::increment`].
pub const TICK_STEP: i64 = 2;

/// Both halves of one clock step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickTock {
    /// The odd half, reserved for the caller (imports, snapshot bounds)
    pub tick: Tick,
    /// The even half, the counter's new value
    pub tock: Tick,
}

/// Where a row's latest version came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Written on this store
    Local,
    /// Written by importing a peer's record
    Synced,
}

impl Provenance {
    /// Recover provenance from a stamped tick.
    pub fn of(tick: Tick) -> Self {
        if tick.rem_euclid(2) == 0 {
            Provenance::Local
        } else {
            Provenance::Synced
        }
    }

    /// Pick the half of a clock step this provenance stamps rows with.
    pub fn stamp(self, step: TickTock) -> Tick {
        match self {
            Provenance::Local => step.tock,
            Provenance::Synced => step.tick,
        }
    }
}

/// A linearizable source of ticks.
///
/// No two callers may ever observe the same value from `increment`.
/// Implementations must not cache the counter: every call goes to the single
/// shared cell.
pub trait TickSource: Send + Sync {
    /// Atomically add `n` and return the resulting value.
    fn increment(&self, n: i64) -> Tick;

    /// Read the current value without moving it.
    fn current(&self) -> Tick;

    /// Move the clock by one full step.
    fn tick_tock(&self) -> TickTock {
        let tock = self.increment(TICK_STEP);
        TickTock {
            tick: tock - 1,
            tock,
        }
    }
}

/// In-process implementation backed by one atomic cell.
///
/// Clones share the cell, so every handle to a store sees the same counter.
#[derive(Debug, Clone, Default)]
pub struct SharedClock {
    cell: Arc<AtomicI64>,
}

impl SharedClock {
    /// Create a clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock starting at a specific value.
    pub fn starting_at(value: Tick) -> Self {
        Self {
            cell: Arc::new(AtomicI64::new(value)),
        }
    }
}

impl TickSource for SharedClock {
    fn increment(&self, n: i64) -> Tick {
        self.cell.fetch_add(n, Ordering::SeqCst) + n
    }

    fn current(&self) -> Tick {
        self.cell.load(Ordering::SeqCst)
    }
}
