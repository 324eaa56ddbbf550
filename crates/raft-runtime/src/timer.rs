//! # timer
//!
//! why: followers and candidates need a randomized deadline that restarts on every sign of a leader
//! relations: owned by node.rs's actor; fires into the actor's select loop
//! what: ElectionTimer with epoch-tagged firings
//!
//! Each `reset` aborts the running sleep and starts a new one tagged with a
//! fresh epoch. A firing whose epoch is no longer current lost a race with
//! a reset and is ignored by the caller.

use raft_core::RaftConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

pub struct ElectionTimer {
    config: RaftConfig,
    fired: mpsc::UnboundedSender<u64>,
    epoch: u64,
    task: Option<JoinHandle<()>>,
}

impl ElectionTimer {
    /// Create a stopped timer and the receiver its firings arrive on.
    pub fn new(config: RaftConfig) -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (fired, fired_rx) = mpsc::unbounded_channel();
        let timer = Self {
            config,
            fired,
            epoch: 0,
            task: None,
        };
        (timer, fired_rx)
    }

    /// Arm the timer with a new random timeout, returning its epoch.
    pub fn reset(&mut self) -> u64 {
        self.cancel_task();
        self.epoch += 1;
        let epoch = self.epoch;
        let timeout = self.config.random_election_timeout();
        let fired = self.fired.clone();
        trace!(epoch, timeout_ms = timeout.as_millis() as u64, "election timer armed");
        self.task = Some(tokio::spawn(async move {
            time::sleep(timeout).await;
            let _ = fired.send(epoch);
        }));
        epoch
    }

    /// Disarm the timer; any firing already in flight becomes stale.
    pub fn stop(&mut self) {
        self.cancel_task();
        self.epoch += 1;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    /// True if `epoch` came from the currently armed timeout.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.is_armed() && epoch == self.epoch
    }

    fn cancel_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ElectionTimer {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

impl std::fmt::Debug for ElectionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionTimer")
            .field("epoch", &self.epoch)
            .field("armed", &self.is_armed())
            .finish()
    }
}
