//! Locking substrate.
//!
//! The node/entry hierarchy sits behind one [`VolumeLock`], a reader/writer
//! lock that also stamps a last-access time whenever an acquirer observes
//! another holder or waiter. Listener, query, and iterator state use
//! [`RecursiveLock`]s, which the owning thread may re-acquire.
//!
//! # Lock ordering
//!
//! A thread holding a recursive lock must never acquire the `VolumeLock`.
//! Listener callbacks and live query updates run with a recursive lock held,
//! so they may touch listener or query state but never the hierarchy.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Recursive mutex used for listener, query, and iterator state.
pub type RecursiveLock<T> = parking_lot::ReentrantMutex<T>;

/// Guard of a [`RecursiveLock`].
pub type RecursiveGuard<'a, T> = parking_lot::ReentrantMutexGuard<'a, T>;

/// Reader/writer lock over the volume hierarchy.
pub struct VolumeLock<T> {
    name: &'static str,
    inner: RwLock<T>,
    /// Threads currently holding or waiting for the lock.
    holders: AtomicUsize,
    /// Microseconds since the epoch, 0 until the first contended acquire.
    access_time: AtomicU64,
}

impl<T> VolumeLock<T> {
    /// Create a named lock around `value`.
    pub fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: RwLock::new(value),
            holders: AtomicUsize::new(0),
            access_time: AtomicU64::new(0),
        }
    }

    /// Acquire shared access, blocking until available.
    pub fn read(&self) -> VolumeReadGuard<'_, T> {
        self.holders.fetch_add(1, Ordering::SeqCst);
        let guard = self.inner.read();
        self.touch_if_contended();
        VolumeReadGuard {
            guard,
            holders: &self.holders,
        }
    }

    /// Acquire exclusive access, blocking until available.
    pub fn write(&self) -> VolumeWriteGuard<'_, T> {
        self.holders.fetch_add(1, Ordering::SeqCst);
        let guard = self.inner.write();
        self.touch_if_contended();
        VolumeWriteGuard {
            guard,
            holders: &self.holders,
        }
    }

    /// Last time an acquirer saw contention, if ever.
    pub fn access_time(&self) -> Option<SystemTime> {
        match self.access_time.load(Ordering::Relaxed) {
            0 => None,
            micros => Some(UNIX_EPOCH + Duration::from_micros(micros)),
        }
    }

    fn touch_if_contended(&self) {
        if self.holders.load(Ordering::SeqCst) > 1 {
            let micros = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_micros() as u64)
                .unwrap_or(1)
                .max(1);
            self.access_time.store(micros, Ordering::Relaxed);
        }
    }
}

impl<T> fmt::Debug for VolumeLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeLock")
            .field("name", &self.name)
            .field("holders", &self.holders.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Shared access to the hierarchy.
pub struct VolumeReadGuard<'a, T> {
    guard: RwLockReadGuard<'a, T>,
    holders: &'a AtomicUsize,
}

impl<T> Deref for VolumeReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Drop for VolumeReadGuard<'_, T> {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive access to the hierarchy.
pub struct VolumeWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    holders: &'a AtomicUsize,
}

impl<T> Deref for VolumeWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for VolumeWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for VolumeWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.holders.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_uncontended_access_leaves_time_unset() {
        let lock = VolumeLock::new("test", 0u32);
        {
            let mut guard = lock.write();
            *guard += 1;
        }
        assert_eq!(*lock.read(), 1);
        assert!(lock.access_time().is_none());
    }

    #[test]
    fn test_concurrent_readers_stamp_access_time() {
        let lock = VolumeLock::new("test", ());
        let _a = lock.read();
        let _b = lock.read();
        assert!(lock.access_time().is_some());
    }

    #[test]
    fn test_writer_excludes_writers() {
        let lock = Arc::new(VolumeLock::new("test", 0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.write() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 4000);
    }

    #[test]
    fn test_recursive_lock_reenters() {
        let lock = RecursiveLock::new(5);
        let outer = lock.lock();
        let inner = lock.lock();
        assert_eq!(*outer + *inner, 10);
    }
}
