//! Cooperative cancellation for long-running threads
//!
//! Every background thread in the service is spawned through a
//! [`ThreadGroup`]. The group hands each thread a [`CancelToken`]; shutting
//! the group down cancels the token and then joins every thread, so once
//! `shutdown` returns none of the group's threads is alive any more.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error};

#[derive(Default)]
struct TokenState {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

/// Shared cancellation flag that sleeping threads can wait on
#[derive(Clone, Default)]
pub struct CancelToken {
    state: Arc<TokenState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake every waiter
    pub fn cancel(&self) {
        let mut cancelled = self.state.cancelled.lock();
        *cancelled = true;
        self.state.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.state.cancelled.lock()
    }

    /// Sleep for `timeout`, returning early if cancelled
    ///
    /// Returns `true` when the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = self.state.cancelled.lock();
        while !*cancelled {
            if self
                .state
                .cond
                .wait_until(&mut cancelled, deadline)
                .timed_out()
            {
                break;
            }
        }
        *cancelled
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A set of named threads sharing one cancellation token
pub struct ThreadGroup {
    name: String,
    token: CancelToken,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: CancelToken::new(),
            handles: Vec::new(),
        }
    }

    /// Token shared by every thread in this group
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Spawn a named thread that receives the group's token
    pub fn spawn<F>(&mut self, name: impl Into<String>, f: F) -> std::io::Result<()>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let token = self.token.clone();
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || f(token))?;
        self.handles.push(handle);
        Ok(())
    }

    /// Number of threads spawned and not yet joined
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of threads still running
    pub fn live_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Cancel every thread and wait for all of them to exit
    ///
    /// Returns the number of threads that panicked.
    pub fn shutdown(&mut self) -> usize {
        self.token.cancel();
        let mut panicked = 0;
        for handle in self.handles.drain(..) {
            let thread_name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if let Err(e) = handle.join() {
                panicked += 1;
                error!("Thread {} in group {} panicked: {:?}", thread_name, self.name, e);
            } else {
                debug!("Thread {} in group {} joined", thread_name, self.name);
            }
        }
        panicked
    }
}

impl Drop for ThreadGroup {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.shutdown();
        }
    }
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("name", &self.name)
            .field("threads", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_wait_timeout_elapses() {
        let token = CancelToken::new();
        let start = Instant::now();
        assert!(!token.wait_timeout(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(10)));

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_shutdown_joins_all_threads() {
        let mut group = ThreadGroup::new("test");
        let exited = Arc::new(AtomicUsize::new(0));

        for i in 0..3 {
            let exited = exited.clone();
            group
                .spawn(format!("worker-{}", i), move |token| {
                    while !token.wait_timeout(Duration::from_millis(5)) {}
                    exited.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        assert_eq!(group.len(), 3);

        assert_eq!(group.shutdown(), 0);
        assert_eq!(exited.load(Ordering::SeqCst), 3);
        assert!(group.is_empty());
        assert_eq!(group.live_count(), 0);
    }

    #[test]
    fn test_shutdown_reports_panics() {
        let mut group = ThreadGroup::new("test");
        group.spawn("boom", |_| panic!("expected")).unwrap();
        group
            .spawn("fine", |token| {
                token.wait_timeout(Duration::from_secs(5));
            })
            .unwrap();
        assert_eq!(group.shutdown(), 1);
    }
}
