//! Mutation lock and the recursive read-lock used by iterators.
//!
//! One atomic boolean serialises mutation and the reclamation handshake; a
//! separate counter tracks scoped read-locks held by iterators and by
//! callers holding pointers into mapped memory. While the count is nonzero
//! the write mutex stays held on behalf of the readers, so writers and the
//! reclamation callback are excluded for exactly as long as pointers are
//! outstanding.
//!
//! A point operation skips the mutex only when the *calling thread* holds
//! one of the read-locks (the mutex is then already held on its behalf);
//! each thread tracks its own holdings in a thread-local table keyed by
//! lock address.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

thread_local! {
    /// Read-locks held by this thread, keyed by `MapLock` address.
    static READ_HELD: RefCell<HashMap<usize, u32>> = RefCell::new(HashMap::new());
}

/// The map's internal lock: a spinning write mutex plus a read-lock count.
pub(crate) struct MapLock {
    /// Serialises mutation and the reclamation handshake.
    write_mutex: AtomicBool,
    /// Scoped read-locks currently outstanding, across all threads.
    read_locks: AtomicU32,
}

impl MapLock {
    pub(crate) const fn new() -> Self {
        Self {
            write_mutex: AtomicBool::new(false),
            read_locks: AtomicU32::new(0),
        }
    }

    fn addr(&self) -> usize {
        self as *const Self as usize
    }

    /// Spin until the write mutex is acquired.
    #[inline]
    pub(crate) fn acquire(&self) {
        while self.write_mutex.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }

    /// Release the write mutex.
    #[inline]
    pub(crate) fn release(&self) {
        self.write_mutex.store(false, Ordering::Release);
    }

    /// Acquire the write mutex without blocking. Used by the reclamation
    /// callback, which must never wait at a quiescent point.
    #[inline]
    pub(crate) fn try_acquire(&self) -> bool {
        !self.write_mutex.swap(true, Ordering::Acquire)
    }

    /// Number of outstanding read-locks across all threads.
    #[inline]
    pub(crate) fn read_locks(&self) -> u32 {
        self.read_locks.load(Ordering::Acquire)
    }

    /// True when the calling thread holds at least one read-lock here.
    #[inline]
    fn held_by_current_thread(&self) -> bool {
        READ_HELD.with(|held| held.borrow().contains_key(&self.addr()))
    }

    /// Take a scoped read-lock. The first reader acquires the write mutex
    /// and keeps it held until the last reader releases.
    pub(crate) fn ref_lock(&self) {
        loop {
            let n = self.read_locks.load(Ordering::Acquire);
            if n == 0 {
                self.acquire();
                debug_assert_eq!(self.read_locks.load(Ordering::Acquire), 0);
                self.read_locks.store(1, Ordering::Release);
                break;
            }
            // Join the existing readers. The CAS fails if the count dropped
            // to zero in the meantime, in which case the mutex path is
            // taken on retry.
            if self
                .read_locks
                .compare_exchange_weak(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        READ_HELD.with(|held| {
            *held.borrow_mut().entry(self.addr()).or_insert(0) += 1;
        });
    }

    /// Drop a scoped read-lock; the last one out releases the write mutex.
    pub(crate) fn ref_unlock(&self) {
        READ_HELD.with(|held| {
            let mut held = held.borrow_mut();
            let count = held
                .get_mut(&self.addr())
                .expect("read-lock released by a thread that does not hold one");
            *count -= 1;
            if *count == 0 {
                held.remove(&self.addr());
            }
        });
        let prev = self.read_locks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "read-lock underflow");
        if prev == 1 {
            self.release();
        }
    }

    /// Bracket a point operation with the write mutex.
    ///
    /// When the calling thread holds a read-lock the mutex is already held
    /// on its behalf and the guard releases nothing; otherwise the guard
    /// owns a fresh acquisition. Read-locks held only by *other* threads
    /// are not implied: the caller spins until those readers finish.
    pub(crate) fn lock_for_op(&self) -> OpGuard<'_> {
        if self.held_by_current_thread() {
            return OpGuard {
                lock: self,
                acquired: false,
            };
        }
        self.acquire();
        OpGuard {
            lock: self,
            acquired: true,
        }
    }
}

/// RAII bracket around a point operation; see [`MapLock::lock_for_op`].
pub(crate) struct OpGuard<'a> {
    lock: &'a MapLock,
    acquired: bool,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if self.acquired {
            self.lock.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_ref_lock_recursion() {
        let lock = MapLock::new();
        lock.ref_lock();
        lock.ref_lock();
        assert_eq!(lock.read_locks(), 2);
        assert!(!lock.try_acquire());
        lock.ref_unlock();
        assert!(!lock.try_acquire());
        lock.ref_unlock();
        assert_eq!(lock.read_locks(), 0);
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_op_implied_under_own_read_lock() {
        let lock = MapLock::new();
        lock.ref_lock();
        // Must not deadlock: the mutex is already held for us.
        {
            let _op = lock.lock_for_op();
        }
        assert_eq!(lock.read_locks(), 1);
        lock.ref_unlock();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_op_blocks_on_foreign_read_lock() {
        let lock = Arc::new(MapLock::new());
        lock.ref_lock();

        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let lock = Arc::clone(&lock);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let _op = lock.lock_for_op();
                done.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst), "op ran under foreign read-lock");

        lock.ref_unlock();
        handle.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reader_joining_from_second_thread() {
        let lock = Arc::new(MapLock::new());
        lock.ref_lock();

        let joined = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.ref_lock();
                // The joining thread's own point ops are implied too.
                let _op = lock.lock_for_op();
                drop(_op);
                lock.ref_unlock();
            })
        };
        joined.join().unwrap();

        assert_eq!(lock.read_locks(), 1);
        lock.ref_unlock();
        assert_eq!(lock.read_locks(), 0);
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn test_try_acquire() {
        let lock = MapLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }
}
