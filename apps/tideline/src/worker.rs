//! Worker slot bookkeeping shared between the coordinator and the analyzer
//! and decoder threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use chunk_log::CancelToken;
use parking_lot::{Condvar, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Analyzer,
    Decoder,
}

impl WorkerKind {
    pub fn label(self) -> &'static str {
        match self {
            WorkerKind::Analyzer => "analyzer",
            WorkerKind::Decoder => "decoder",
        }
    }
}

/// Created -> Running <-> Paused -> (Stopped | Subsumed). The two right-hand
/// states are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Paused,
    Stopped,
    Subsumed,
}

/// Handle to one analyzer or decoder thread. Progress is bytes consumed for
/// analyzers and frames produced for decoders; the coordinator compares the
/// two to decide when a backport has caught up.
pub struct WorkerHandle {
    kind: WorkerKind,
    seq: u64,
    progress: AtomicU64,
    state: Mutex<WorkerState>,
    state_changed: Condvar,
    cancel: CancelToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn new(kind: WorkerKind, seq: u64) -> Self {
        Self {
            kind,
            seq,
            progress: AtomicU64::new(0),
            state: Mutex::new(WorkerState::Created),
            state_changed: Condvar::new(),
            cancel: CancelToken::new(),
            thread: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    pub fn record_progress(&self, units: u64) {
        self.progress.store(units, Ordering::Release);
    }

    /// Token workers pass into blocking log and frame waits so a stop request
    /// interrupts them.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn mark_running(&self) {
        let mut state = self.state.lock();
        if *state == WorkerState::Created {
            *state = WorkerState::Running;
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state == WorkerState::Running {
            *state = WorkerState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if *state == WorkerState::Paused {
            *state = WorkerState::Running;
        }
        drop(state);
        self.state_changed.notify_all();
    }

    /// Asks the worker to stop. Terminal state transitions are applied by the
    /// worker itself when it observes the request.
    pub fn request_stop(&self) {
        self.cancel.cancel();
        self.state_changed.notify_all();
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn mark_stopped(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, WorkerState::Subsumed) {
            *state = WorkerState::Stopped;
        }
        drop(state);
        self.state_changed.notify_all();
    }

    pub fn mark_subsumed(&self) {
        *self.state.lock() = WorkerState::Subsumed;
        self.cancel.cancel();
        self.state_changed.notify_all();
    }

    /// Polled between work items. Blocks while paused; false once a stop was
    /// requested.
    pub fn keep_running(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            match *state {
                WorkerState::Paused => {
                    self.state_changed
                        .wait_for(&mut state, Duration::from_millis(50));
                }
                WorkerState::Stopped | WorkerState::Subsumed => return false,
                _ => return true,
            }
        }
    }

    pub fn attach_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    pub fn join(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn stop_request_flips_keep_running() {
        let handle = WorkerHandle::new(WorkerKind::Analyzer, 1);
        handle.mark_running();
        assert!(handle.keep_running());
        handle.request_stop();
        assert!(!handle.keep_running());
    }

    #[test]
    fn pause_blocks_until_resume() {
        let handle = Arc::new(WorkerHandle::new(WorkerKind::Decoder, 2));
        handle.mark_running();
        handle.pause();
        let waiter = {
            let handle = handle.clone();
            std::thread::spawn(move || handle.keep_running())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        handle.resume();
        assert!(waiter.join().expect("join"));
    }

    #[test]
    fn subsume_is_terminal() {
        let handle = WorkerHandle::new(WorkerKind::Decoder, 3);
        handle.mark_running();
        handle.mark_subsumed();
        handle.mark_stopped();
        assert_eq!(handle.state(), WorkerState::Subsumed);
        assert!(!handle.keep_running());
    }
}
