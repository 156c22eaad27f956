//! Long-running background tasks and their cancellation.
//!
//! Each worker owns a [StopToken]: the receiving half of a channel nobody writes to.
//! Closing the sending half wakes the worker out of its wait and makes every later
//! wait return immediately.
use log::{debug, warn};
use smol::channel::{self, Receiver, Sender};
use smol::{future, Timer};
use std::collections::HashMap;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Background tasks a node may run, at most one of each.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Receive,
    Watchdog,
    Ping,
    SyncPush,
    Feedback,
    Imu,
    Battery,
    Autonomy,
    CollisionWatch,
    SensorPush,
    /// Clips pushed over the media side-channel.
    Streaming,
    /// Side-channel retry of pending media.
    MediaRetry,
}

#[derive(Clone, Debug)]
pub struct StopToken {
    rx: Receiver<()>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        self.rx.is_closed()
    }

    /// Sleeps for `period` unless stopped first. Returns true when stopped.
    pub fn wait(&self, period: Duration) -> bool {
        if self.is_stopped() {
            return true;
        }
        smol::block_on(future::or(
            async {
                let _ = self.rx.recv().await;
                true
            },
            async {
                Timer::after(period).await;
                false
            },
        ))
    }
}

/// Creates a token and the handle that stops it.
pub fn stop_pair() -> (StopHandle, StopToken) {
    let (tx, rx) = channel::bounded(1);
    (StopHandle { tx }, StopToken { rx })
}

#[derive(Debug)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.close();
    }
}

struct Worker {
    stop: StopHandle,
    thread: JoinHandle<()>,
}

/// Running workers, keyed by kind.
#[derive(Default)]
pub struct Workers {
    running: HashMap<WorkerKind, Worker>,
}

impl Workers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` unless a worker of that kind is still running.
    pub fn start<F>(&mut self, kind: WorkerKind, task: F) -> bool
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        if self.is_running(kind) {
            debug!("{:?} worker already running.", kind);
            return false;
        }
        let (stop, token) = stop_pair();
        let spawned = thread::Builder::new()
            .name(format!("{:?}", kind).to_lowercase())
            .spawn(move || task(token));
        match spawned {
            Ok(thread) => {
                debug!("{:?} worker started.", kind);
                self.running.insert(kind, Worker { stop, thread });
                true
            }
            Err(err) => {
                warn!("Could not spawn {:?} worker: {}", kind, err);
                false
            }
        }
    }

    /// Signals the worker to stop, returns whether one was started. Does not wait.
    pub fn stop(&mut self, kind: WorkerKind) -> bool {
        match self.running.remove(&kind) {
            Some(worker) => {
                worker.stop.stop();
                debug!("{:?} worker stopped.", kind);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, kind: WorkerKind) -> bool {
        self.running
            .get(&kind)
            .map_or(false, |worker| !worker.thread.is_finished())
    }

    pub fn stop_all(&mut self) {
        for (kind, worker) in self.running.drain() {
            worker.stop.stop();
            debug!("{:?} worker stopped.", kind);
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop_all();
    }
}
