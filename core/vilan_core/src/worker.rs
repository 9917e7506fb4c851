//! Maintenance loops and their cancellation
//!
//! Each component runs one long-lived loop that wakes on a fixed cadence or on
//! cancellation, whichever comes first.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Cadence of the maintenance loops
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3);

/// One-shot cancellation signal shared by a loop and its owner
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        match self.inner.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep up to `timeout`; returns true if cancelled
    pub fn wait(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = match cvar.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *cancelled
    }
}

/// Handle to a running maintenance loop
pub struct Worker {
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Run `tick` every `interval` until stopped, then run `on_exit` once
    pub fn spawn<T, E>(name: &str, interval: Duration, mut tick: T, on_exit: E) -> io::Result<Self>
    where
        T: FnMut() + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let token = CancelToken::new();
        let loop_token = token.clone();
        let loop_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            log::debug!("{} started", loop_name);
            while !loop_token.wait(interval) {
                if panic::catch_unwind(AssertUnwindSafe(|| tick())).is_err() {
                    log::error!("{} tick panicked, continuing", loop_name);
                }
            }
            on_exit();
            log::debug!("{} stopped", loop_name);
        })?;

        Ok(Worker {
            token,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Cancel the loop and wait for its teardown; safe to call repeatedly
    pub fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("maintenance loop exited with a panic");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
