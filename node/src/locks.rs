//! Mutexes with a fixed acquisition order.
//!
//! Every lock of a node carries a [`LockLevel`]. A thread may only take a
//! lock whose level is strictly higher than every lock it already holds,
//! which rules out lock-order deadlocks between handlers. Debug builds
//! check this on every acquisition. Guards are `!Send`, so they can never
//! be held across an `.await` in a spawned task.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Peer/superpeer role transitions.
    Role = 0,
    /// Ring pointers, superpeer and peer lists.
    Overlay = 1,
    /// Lookup tree table.
    Data = 2,
    /// Application-ID mapping table.
    Mapping = 3,
    /// Pending failure notifications.
    Failure = 4,
    /// Stabilization worker handle.
    Worker = 5,
}

thread_local! {
    static HELD: Cell<u8> = const { Cell::new(0) };
}

pub struct OrderedMutex<T> {
    level: LockLevel,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(level: LockLevel, value: T) -> Self {
        Self {
            level,
            inner: Mutex::new(value),
        }
    }

    pub fn lock(&self) -> OrderedGuard<'_, T> {
        let bit = 1u8 << (self.level as u8);
        HELD.with(|held| {
            debug_assert!(
                held.get() >> (self.level as u8) == 0,
                "lock {:?} acquired while holding an equal or later lock (held mask {:#08b})",
                self.level,
                held.get()
            );
            held.set(held.get() | bit);
        });

        // A panicking holder leaves the data usable for our purposes.
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        OrderedGuard { guard, bit }
    }
}

pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    bit: u8,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        let bit = self.bit;
        HELD.with(|held| held.set(held.get() & !bit));
    }
}
