//! Debounced deferred work, one handler per user
//!
//! Arming schedules a task after a delay; arming again before it fires
//! replaces the pending task, and cancelling prevents it from running.
//! Tasks run on the blocking pool (they do key store and filesystem work)
//! and never overlap: a per-handler run lock serializes them.

use elk_core::UserId;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::lock;

#[derive(Default)]
struct Pending {
    /// Bumped by every arm and cancel; a woken task runs only if its
    /// generation is still current.
    generation: u64,
    task: Option<JoinHandle<()>>,
}

pub struct DelayHandler {
    user: UserId,
    delay: Duration,
    runtime: Handle,
    pending: Arc<Mutex<Pending>>,
    run_lock: Arc<Mutex<()>>,
}

impl DelayHandler {
    pub fn new(user: UserId, delay: Duration, runtime: Handle) -> Self {
        Self {
            user,
            delay,
            runtime,
            pending: Arc::new(Mutex::new(Pending::default())),
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// Schedule `task` after the handler's configured delay.
    pub fn arm<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.arm_after(self.delay, task);
    }

    /// Schedule `task` after `delay`, superseding any pending task.
    pub fn arm_after<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = lock(&self.pending);
        pending.generation += 1;
        let generation = pending.generation;
        if let Some(previous) = pending.task.take() {
            previous.abort();
            debug!(user = self.user, "pending delayed task superseded");
        }

        let state = Arc::clone(&self.pending);
        let run_lock = Arc::clone(&self.run_lock);
        let user = self.user;
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let result = tokio::task::spawn_blocking(move || {
                let _running = lock(&run_lock);
                {
                    let mut pending = lock(&state);
                    if pending.generation != generation {
                        return;
                    }
                    // From here on the task counts as started; cancel() no
                    // longer reports it as pending.
                    pending.task = None;
                }
                task();
            })
            .await;
            if let Err(e) = result {
                warn!(user, "delayed task failed: {e}");
            }
        });
        pending.task = Some(handle);
        debug!(user = self.user, delay_ms = delay.as_millis() as u64, "delayed task armed");
    }

    /// Cancel the pending task. Returns true if one was pending and will
    /// now never run; false if nothing was pending or it already started.
    pub fn cancel(&self) -> bool {
        let mut pending = lock(&self.pending);
        pending.generation += 1;
        match pending.task.take() {
            Some(handle) => {
                handle.abort();
                debug!(user = self.user, "delayed task cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending).task.is_some()
    }

    /// Block until a task that has already started finishes.
    pub fn wait_idle(&self) {
        drop(lock(&self.run_lock));
    }
}

impl Drop for DelayHandler {
    fn drop(&mut self) {
        self.cancel();
    }
}
