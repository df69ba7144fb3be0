//! Single-thread executor that runs submitted jobs in order.

use crate::arch::lifecycle::lock;
use std::io;
use std::sync::{mpsc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum LaneMsg {
    Run(Job),
    Stop,
}

/// A named worker thread fed through a channel.
///
/// Jobs run in submission order. [`Lane::stop`] lets already-queued jobs
/// finish, then joins the thread; later submissions are dropped.
#[derive(Debug)]
pub struct Lane {
    name: String,
    sender: mpsc::Sender<LaneMsg>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Lane {
    pub fn spawn(name: String) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<LaneMsg>();

        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Ok(LaneMsg::Run(job)) = receiver.recv() {
                job();
            }
        })?;

        Ok(Self {
            name,
            sender,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.sender.send(LaneMsg::Run(Box::new(f))).is_err() {
            trace!(lane = %self.name, "Lane stopped, job dropped");
        }
    }

    /// Drain queued jobs and join the thread. Safe to call from the lane itself.
    pub fn stop(&self) {
        let _ = self.sender.send(LaneMsg::Stop);
        let Some(handle) = lock(&self.thread).take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        let _ = handle.join();
        debug!(lane = %self.name, "Lane stopped");
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        self.stop();
    }
}
