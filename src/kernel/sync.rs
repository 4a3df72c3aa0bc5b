//! Blocking synchronization primitives
//!
//! Semaphore, mutual-exclusion lock, and condition variable. These are the
//! only mechanism the process subsystem uses to coordinate across threads:
//! waitpid blocks on a process's condvar, the console blocks readers on a
//! semaphore, and every open-file object serializes I/O behind a lock.
//!
//! All three are built on `std::sync::{Mutex, Condvar}`, whose `wait`
//! provides the atomic release-and-suspend step that makes lost wakeups
//! impossible: a signaller must acquire the internal mutex first, and it
//! cannot do that until the waiter is parked.
//!
//! Contract violations are programming errors in the caller, not user
//! errors, and are always fatal:
//! - acquiring a lock the calling thread already holds
//! - dropping a semaphore while threads are still queued on it
//! - a poisoned internal mutex (a thread panicked inside a critical section)
//!
//! Releasing a lock that is not held cannot be expressed at all: release is
//! the guard going out of scope.

use std::sync::{Condvar as StdCondvar, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::thread::{self, ThreadId};

/// A panic inside a critical section leaves the primitive unusable; treat
/// any later access as fatal rather than limping on.
fn fatal_poison(what: &str, name: &str) -> ! {
    panic!("{} '{}': internal mutex poisoned", what, name);
}

// ========== SEMAPHORE ==========

struct SemState {
    count: usize,
    waiters: usize,
}

/// Counting semaphore.
///
/// `down` blocks while the count is zero; `up` wakes one waiter. No FIFO
/// ordering is guaranteed among waiters: a thread that was never queued may
/// slip in and take a freshly raised count before a parked waiter resumes.
pub struct Semaphore {
    name: String,
    state: StdMutex<SemState>,
    wakeup: StdCondvar,
}

impl Semaphore {
    pub fn new(name: impl Into<String>, initial: usize) -> Self {
        Self {
            name: name.into(),
            state: StdMutex::new(SemState {
                count: initial,
                waiters: 0,
            }),
            wakeup: StdCondvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StdMutexGuard<'_, SemState> {
        self.state
            .lock()
            .unwrap_or_else(|_| fatal_poison("semaphore", &self.name))
    }

    /// P: block until the count is positive, then take one.
    pub fn down(&self) {
        let mut st = self.state();
        st.waiters += 1;
        while st.count == 0 {
            st = self
                .wakeup
                .wait(st)
                .unwrap_or_else(|_| fatal_poison("semaphore", &self.name));
        }
        st.waiters -= 1;
        st.count -= 1;
    }

    /// Non-blocking P. Returns true if a count was taken.
    pub fn try_down(&self) -> bool {
        let mut st = self.state();
        if st.count == 0 {
            return false;
        }
        st.count -= 1;
        true
    }

    /// V: raise the count and wake one waiter, if any.
    pub fn up(&self) {
        let mut st = self.state();
        st.count += 1;
        self.wakeup.notify_one();
        drop(st);
    }

    pub fn count(&self) -> usize {
        self.state().count
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        let waiters = self.state().waiters;
        assert_eq!(
            waiters, 0,
            "semaphore '{}': destroyed with {} thread(s) still queued",
            self.name, waiters
        );
    }
}

// ========== LOCK ==========

/// Non-recursive mutual-exclusion lock that owns the data it protects.
///
/// The owner's thread id is recorded so reentrant acquisition can be caught
/// instead of deadlocking, and so `holds` can answer "does the calling
/// thread hold this lock right now".
pub struct Lock<T> {
    name: String,
    owner: StdMutex<Option<ThreadId>>,
    data: StdMutex<T>,
}

/// Proof of ownership of a [`Lock`]. Dropping the guard releases the lock
/// and wakes one blocked acquirer.
pub struct LockGuard<'a, T> {
    lock: &'a Lock<T>,
    // Taken out (and later restored) by Condvar::wait.
    inner: Option<StdMutexGuard<'a, T>>,
}

impl<T> Lock<T> {
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self {
            name: name.into(),
            owner: StdMutex::new(None),
            data: StdMutex::new(value),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn set_owner(&self, owner: Option<ThreadId>) {
        *self
            .owner
            .lock()
            .unwrap_or_else(|_| fatal_poison("lock", &self.name)) = owner;
    }

    /// True iff the calling thread currently holds this lock.
    pub fn holds(&self) -> bool {
        *self
            .owner
            .lock()
            .unwrap_or_else(|_| fatal_poison("lock", &self.name))
            == Some(thread::current().id())
    }

    /// Block until the lock is free, then take ownership.
    pub fn acquire(&self) -> LockGuard<'_, T> {
        if self.holds() {
            panic!("lock '{}': reentrant acquire", self.name);
        }
        let inner = self
            .data
            .lock()
            .unwrap_or_else(|_| fatal_poison("lock", &self.name));
        self.set_owner(Some(thread::current().id()));
        LockGuard {
            lock: self,
            inner: Some(inner),
        }
    }
}

impl<T> std::ops::Deref for LockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().expect("lock guard dismantled")
    }
}

impl<T> std::ops::DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("lock guard dismantled")
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        // Clear ownership before the inner guard (a struct field) unlocks.
        // A guard dismantled by Condvar::wait has no inner guard and has
        // already given up ownership.
        if self.inner.is_some() {
            self.lock.set_owner(None);
        }
    }
}

// ========== CONDITION VARIABLE ==========

/// Condition variable, always used together with a caller-held [`Lock`].
///
/// Taking the guard by value in `wait` (and by reference in `signal` /
/// `broadcast`) makes "caller holds the paired lock" a compile-time
/// precondition. Wakeups may be spurious and a signalled waiter may lose
/// the race to a barging thread, so callers always re-check their predicate
/// in a loop.
pub struct Condvar {
    name: String,
    inner: StdCondvar,
}

impl Condvar {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: StdCondvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Atomically release the lock and suspend; re-acquire before returning.
    pub fn wait<'a, T>(&self, mut guard: LockGuard<'a, T>) -> LockGuard<'a, T> {
        let lock = guard.lock;
        let inner = guard
            .inner
            .take()
            .expect("lock guard dismantled");
        // Gives up recorded ownership; the data mutex itself stays held
        // until `wait` parks us, which is what closes the wakeup race.
        drop(guard);
        lock.set_owner(None);
        let inner = self
            .inner
            .wait(inner)
            .unwrap_or_else(|_| fatal_poison("condvar", &self.name));
        lock.set_owner(Some(thread::current().id()));
        LockGuard {
            lock,
            inner: Some(inner),
        }
    }

    /// Wake at most one waiter. The lock stays held.
    pub fn signal<T>(&self, _held: &LockGuard<'_, T>) {
        self.inner.notify_one();
    }

    /// Wake every current waiter. The lock stays held.
    pub fn broadcast<T>(&self, _held: &LockGuard<'_, T>) {
        self.inner.notify_all();
    }
}
