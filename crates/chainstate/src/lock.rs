//! The global header-write lock.
//!
//! Structural chain mutations (header insertion, segment splits, renumbering)
//! must be serialized. Instead of a convention, the lock yields a `WriteToken`
//! and every mutating operation takes `&mut WriteToken`, so holding the lock
//! is visible in the signature.

use std::sync::{Mutex, MutexGuard};

pub struct WriteToken {
    _priv: (),
}

pub struct ChainLock {
    inner: Mutex<WriteToken>,
}

impl ChainLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WriteToken { _priv: () }),
        }
    }

    pub fn write(&self) -> MutexGuard<'_, WriteToken> {
        self.inner.lock().expect("chain write lock")
    }
}

impl Default for ChainLock {
    fn default() -> Self {
        Self::new()
    }
}
