use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("handoff cell is closed")]
pub struct CellClosed;

struct CellState<T> {
    value: Option<T>,
    closed: bool,
}

/// A single-slot rendezvous cell.
///
/// `put` blocks while the cell is full and `take` blocks while it is empty, so values pass
/// through strictly one at a time in FIFO order. Closing the cell wakes every waiter: blocked
/// and future `put`s fail, while `take` still returns a value left in the cell before
/// reporting [`CellClosed`]. Teardown uses [`HandoffCell::drain`], which never blocks.
pub struct HandoffCell<T> {
    state: Mutex<CellState<T>>,
    changed: Condvar,
}

impl<T> Default for HandoffCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandoffCell<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                value: None,
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Stores `value`, waiting until the cell is empty.
    pub fn put(&self, value: T) -> Result<(), CellClosed> {
        let mut state = self.state.lock();
        while state.value.is_some() && !state.closed {
            self.changed.wait(&mut state);
        }
        if state.closed {
            return Err(CellClosed);
        }
        state.value = Some(value);
        self.changed.notify_all();
        Ok(())
    }

    /// Stores `value` if the cell is empty and open; otherwise hands it back.
    pub fn try_put(&self, value: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.closed || state.value.is_some() {
            return Err(value);
        }
        state.value = Some(value);
        self.changed.notify_all();
        Ok(())
    }

    /// Removes the stored value, waiting until one is available.
    pub fn take(&self) -> Result<T, CellClosed> {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.value.take() {
                self.changed.notify_all();
                return Ok(value);
            }
            if state.closed {
                return Err(CellClosed);
            }
            self.changed.wait(&mut state);
        }
    }

    /// Like [`HandoffCell::take`] but gives up after `timeout`, returning `Ok(None)`.
    pub fn take_timeout(&self, timeout: Duration) -> Result<Option<T>, CellClosed> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.value.take() {
                self.changed.notify_all();
                return Ok(Some(value));
            }
            if state.closed {
                return Err(CellClosed);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                let value = state.value.take();
                if value.is_some() {
                    self.changed.notify_all();
                }
                return Ok(value);
            }
        }
    }

    /// Removes the stored value without waiting.
    pub fn try_take(&self) -> Option<T> {
        let mut state = self.state.lock();
        let value = state.value.take();
        if value.is_some() {
            self.changed.notify_all();
        }
        value
    }

    /// Closes the cell and wakes every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.changed.notify_all();
    }

    /// Discards any stored value without waiting. Returns the discarded value.
    pub fn drain(&self) -> Option<T> {
        self.try_take()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_full(&self) -> bool {
        self.state.lock().value.is_some()
    }
}
