//! Global clock: owns the tick counter that drives every lifecycle pass.
//!
//! The global tick and a branch's `current_tick` are different things:
//! the clock counts passes, a branch counts the passes it took part in
//! starting from its branch point.

use crate::types::{RunId, Tick};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpineClock {
    pub run_id:       RunId,
    pub current_tick: Tick,
    pub paused:       bool,
}

impl SpineClock {
    pub fn new(run_id: RunId) -> Self {
        Self { run_id, current_tick: 0, paused: true }
    }

    /// Advance one tick. Returns the new tick number.
    /// Panics if called while paused; callers must check.
    pub fn advance(&mut self) -> Tick {
        assert!(!self.paused, "advance() called on paused clock");
        self.current_tick += 1;
        self.current_tick
    }

    pub fn pause(&mut self)  { self.paused = true;  }
    pub fn resume(&mut self) { self.paused = false; }
}
