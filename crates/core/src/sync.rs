//! Small blocking primitives shared by the scheduler crates.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on a condition variable, recovering from poisoning.
pub fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Bounded [`wait`]; spurious wakeups are left to the caller's loop.
pub fn wait_timeout<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    condvar
        .wait_timeout(guard, timeout)
        .unwrap_or_else(PoisonError::into_inner)
        .0
}

enum Slot<T> {
    Empty,
    Full(T),
    Taken,
}

/// A value that is set at most once; the first writer wins.
pub struct OnceLatch<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Default for OnceLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLatch<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Empty),
            ready: Condvar::new(),
        }
    }

    pub fn with_value(value: T) -> Self {
        Self {
            slot: Mutex::new(Slot::Full(value)),
            ready: Condvar::new(),
        }
    }

    /// Returns `false` (dropping `value`) if the latch was already set.
    pub fn set(&self, value: T) -> bool {
        let mut slot = lock(&self.slot);
        if !matches!(*slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Full(value);
        drop(slot);
        self.ready.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        !matches!(*lock(&self.slot), Slot::Empty)
    }

    /// Block until set, then move the value out. Later calls return `None`.
    pub fn take_wait(&self) -> Option<T> {
        let mut slot = lock(&self.slot);
        while matches!(*slot, Slot::Empty) {
            slot = wait(&self.ready, slot);
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Full(value) => Some(value),
            _ => None,
        }
    }
}

impl<T: Clone> OnceLatch<T> {
    pub fn get(&self) -> Option<T> {
        match &*lock(&self.slot) {
            Slot::Full(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn wait(&self) -> Option<T> {
        let mut slot = lock(&self.slot);
        while matches!(*slot, Slot::Empty) {
            slot = wait(&self.ready, slot);
        }
        match &*slot {
            Slot::Full(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.slot);
        while matches!(*slot, Slot::Empty) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            slot = wait_timeout(&self.ready, slot, remaining);
        }
        match &*slot {
            Slot::Full(value) => Some(value.clone()),
            _ => None,
        }
    }
}
