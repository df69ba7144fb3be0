//! Start/close bookkeeping shared by the server implementations.

use crate::error::{Error, Result};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{error, info};

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Process-wide monotonic id for naming servers and clients.
pub(crate) fn next_id() -> usize {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct State {
    started: bool,
    closed: bool,
    joining: bool,
    terminated: bool,
    threads: Vec<JoinHandle<()>>,
    /// Ids of `threads`, kept after they are taken for joining.
    driving: Vec<ThreadId>,
}

/// Tracks a server's driving threads from `start` to termination.
pub(crate) struct Lifecycle {
    name: String,
    state: Mutex<State>,
    terminated: Condvar,
}

impl Lifecycle {
    pub fn new(kind: &str) -> Self {
        Self {
            name: format!("{kind}-{}", next_id()),
            state: Mutex::new(State::default()),
            terminated: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Run `spawn` exactly once and keep the threads it returns.
    pub fn start<F>(&self, spawn: F) -> Result<()>
    where
        F: FnOnce(&str) -> Result<Vec<JoinHandle<()>>>,
    {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(Error::ServerClosed(self.name.clone()));
        }
        if state.started {
            return Err(Error::AlreadyStarted(self.name.clone()));
        }
        state.threads = spawn(&self.name)?;
        state.driving = state.threads.iter().map(|t| t.thread().id()).collect();
        state.started = true;
        info!(server = %self.name, threads = state.threads.len(), "Server started");
        Ok(())
    }

    /// Block until every driving thread has exited.
    ///
    /// Returns at once if never started, or when called from a driving thread
    /// (a handler running on a loop thread closing its own server).
    pub fn await_termination(&self) {
        let current = thread::current().id();
        let threads = {
            let mut state = lock(&self.state);
            if !state.started || state.terminated || state.driving.contains(&current) {
                return;
            }
            if state.joining {
                while !state.terminated {
                    state = self
                        .terminated
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                return;
            }
            state.joining = true;
            mem::take(&mut state.threads)
        };

        for handle in threads {
            let thread_name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                error!(server = %self.name, thread = ?thread_name, "Server thread panicked");
            }
        }

        lock(&self.state).terminated = true;
        self.terminated.notify_all();
    }

    /// Mark closed, run `signal` once, then wait for termination.
    pub fn close<F: FnOnce()>(&self, signal: F) {
        let first = {
            let mut state = lock(&self.state);
            !mem::replace(&mut state.closed, true)
        };
        if first {
            info!(server = %self.name, "Closing server");
            signal();
        }
        self.await_termination();
    }
}
