//! Tick-skip counter
//! While positive, ticks do not re-derive liveness so an in-flight action is
//! not second-guessed before its timeout.

use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct TickSkip {
    remaining: Mutex<u64>,
}

impl TickSkip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze liveness for the next `ticks` ticks
    pub fn arm(&self, ticks: u64) {
        *self.lock() = ticks.saturating_add(1);
    }

    /// Give back `ticks` that an early-finishing action no longer needs
    pub fn rollback(&self, ticks: u64) {
        let mut remaining = self.lock();
        *remaining = remaining.saturating_sub(ticks);
    }

    /// Consume one tick. Returns true while the window is still open.
    pub fn skip_tick(&self) -> bool {
        let mut remaining = self.lock();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        *remaining > 0
    }

    pub fn active(&self) -> bool {
        *self.lock() > 0
    }

    pub fn remaining(&self) -> u64 {
        *self.lock()
    }

    pub fn clear(&self) {
        *self.lock() = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, u64> {
        self.remaining.lock().unwrap_or_else(|e| e.into_inner())
    }
}
