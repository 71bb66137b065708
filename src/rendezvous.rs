//! Completion handshake between the driver manager and its consumers.
//!
//! A [`Rendezvous`] is a boolean guarded by a mutex plus a condition variable.
//! The driver manager resets both instances before a run starts, each consumer
//! sets its own instance once it has finalized, and `DriverManager::stop`
//! waits on both with a bounded timeout.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutex + condvar guarded completion flag.
#[derive(Debug)]
pub struct Rendezvous {
    name: &'static str,
    state: Mutex<bool>,
    cond: Condvar,
}

impl Rendezvous {
    /// Unset rendezvous; `name` shows up in timeout logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Name used in timeout logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Clears the flag without waking anybody.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Sets the flag and releases every waiter. Idempotent.
    pub fn set(&self) {
        self.lock().set();
    }

    /// Current state, without waiting.
    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    /// Blocks until the flag is set or `timeout` elapses.
    ///
    /// Returns immediately when the flag is already set. The return value is
    /// the flag at wake-up, so `false` means the wait timed out.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !*state {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return *state;
            }
        }
        true
    }

    /// Holds the mutex for a sequence of `reset`/`set` calls.
    pub fn lock(&self) -> RendezvousGuard<'_> {
        RendezvousGuard {
            state: self.state.lock(),
            cond: &self.cond,
        }
    }
}

/// Scoped lock over a [`Rendezvous`].
pub struct RendezvousGuard<'a> {
    state: MutexGuard<'a, bool>,
    cond: &'a Condvar,
}

impl RendezvousGuard<'_> {
    /// Clears the state without waking anyone.
    pub fn reset(&mut self) {
        *self.state = false;
    }

    /// Sets the state and wakes every waiter.
    pub fn set(&mut self) {
        if !*self.state {
            *self.state = true;
            self.cond.notify_all();
        }
    }

    /// State as seen under the lock.
    pub fn is_set(&self) -> bool {
        *self.state
    }
}

/// Sets the rendezvous when dropped, including during unwinding.
///
/// Consumer workers create one of these before touching any I/O so the
/// driver manager is never left waiting on a consumer that failed.
#[must_use = "the rendezvous is set when this guard is dropped"]
pub struct SetOnDrop(Arc<Rendezvous>);

impl SetOnDrop {
    /// Guard that sets `rendezvous` when dropped.
    pub fn new(rendezvous: Arc<Rendezvous>) -> Self {
        Self(rendezvous)
    }
}

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

/// The two completion flags one acquisition waits on.
#[derive(Debug, Clone)]
pub struct AcquisitionStates {
    /// Set by the storage consumer after it finalized.
    pub storage_done: Arc<Rendezvous>,
    /// Set by the view consumer after it finalized.
    pub view_done: Arc<Rendezvous>,
}

impl Default for AcquisitionStates {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionStates {
    /// Both rendezvous, unset.
    pub fn new() -> Self {
        Self {
            storage_done: Arc::new(Rendezvous::new("storage")),
            view_done: Arc::new(Rendezvous::new("view")),
        }
    }

    /// Clears both rendezvous.
    pub fn reset_all(&self) {
        self.storage_done.reset();
        self.view_done.reset();
    }

    /// Both rendezvous, storage first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Rendezvous>> {
        [&self.storage_done, &self.view_done].into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_returns_immediately_when_set() {
        let r = Rendezvous::new("t");
        r.set();
        let start = Instant::now();
        assert!(r.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out() {
        let r = Rendezvous::new("t");
        let start = Instant::now();
        assert!(!r.wait(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_double_set_is_idempotent() {
        let r = Rendezvous::new("t");
        r.set();
        r.set();
        assert!(r.is_set());
        assert!(r.wait(Duration::from_millis(10)));
        assert!(r.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_reset_clears_flag() {
        let r = Rendezvous::new("t");
        r.set();
        r.reset();
        assert!(!r.is_set());
        assert!(!r.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_set_releases_all_waiters() {
        let r = Arc::new(Rendezvous::new("t"));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&r);
                thread::spawn(move || r.wait(Duration::from_secs(5)))
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        r.set();
        for w in waiters {
            assert!(w.join().unwrap());
        }
    }

    #[test]
    fn test_guard_holds_lock_across_calls() {
        let r = Rendezvous::new("t");
        {
            let mut guard = r.lock();
            guard.set();
            assert!(guard.is_set());
            guard.reset();
            guard.set();
        }
        assert!(r.is_set());
    }

    #[test]
    fn test_set_on_drop_fires_on_panic() {
        let r = Arc::new(Rendezvous::new("t"));
        let worker = {
            let r = Arc::clone(&r);
            thread::spawn(move || {
                let _ack = SetOnDrop::new(r);
                panic!("worker failed");
            })
        };
        assert!(worker.join().is_err());
        assert!(r.is_set());
    }

    #[test]
    fn test_states_reset_all() {
        let states = AcquisitionStates::new();
        states.storage_done.set();
        states.view_done.set();
        states.reset_all();
        assert!(states.iter().all(|r| !r.is_set()));
    }
}
