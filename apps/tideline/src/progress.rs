//! Progress fan-out with debouncing.
//!
//! Workers report progress far faster than anyone wants to observe it. The
//! hub coalesces per-kind updates and flushes them at most every 100 ms, so
//! sinks see at most 10 Hz and never wait longer than one flush interval for
//! the latest value.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;

const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// The pipeline stage a progress figure belongs to. Read counts source bytes
/// appended to the log, Analyze counts bytes consumed, Decode counts frames
/// rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProgressKind {
    Read,
    Analyze,
    Decode,
}

impl ProgressKind {
    pub fn label(self) -> &'static str {
        match self {
            ProgressKind::Read => "read",
            ProgressKind::Analyze => "analyze",
            ProgressKind::Decode => "decode",
        }
    }
}

/// Receiver of user-visible pipeline events. Implementations must tolerate
/// being called from the hub's flusher thread.
pub trait ProgressSink: Send + Sync {
    fn ingestion_started(&self) {}
    fn progress(&self, kind: ProgressKind, units: u64);
    fn ingestion_complete(&self) {}
    fn fatal_input_failure(&self, message: &str) {
        let _ = message;
    }
}

struct HubInner {
    sinks: Mutex<Vec<Arc<dyn ProgressSink>>>,
    pending: Mutex<HashMap<ProgressKind, u64>>,
    started: AtomicBool,
    completed: AtomicBool,
}

impl HubInner {
    fn flush(&self) {
        let drained: Vec<(ProgressKind, u64)> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        let sinks = self.sinks.lock().clone();
        for (kind, units) in drained {
            for sink in &sinks {
                sink.progress(kind, units);
            }
        }
    }

    fn each_sink(&self, f: impl Fn(&dyn ProgressSink)) {
        let sinks = self.sinks.lock().clone();
        for sink in &sinks {
            f(sink.as_ref());
        }
    }
}

pub struct ProgressHub {
    inner: Arc<HubInner>,
    shutdown: Sender<()>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        let inner = Arc::new(HubInner {
            sinks: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        });
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let flusher_inner = Arc::clone(&inner);
        let flusher = std::thread::Builder::new()
            .name("progress-flush".into())
            .spawn(move || {
                let ticker = tick(FLUSH_INTERVAL);
                loop {
                    select! {
                        recv(ticker) -> _ => flusher_inner.flush(),
                        recv(shutdown_rx) -> _ => {
                            flusher_inner.flush();
                            return;
                        }
                    }
                }
            })
            .ok();
        Self {
            inner,
            shutdown,
            flusher: Mutex::new(flusher),
        }
    }

    pub fn subscribe(&self, sink: Arc<dyn ProgressSink>) {
        if self.inner.started.load(Ordering::Acquire) {
            sink.ingestion_started();
        }
        self.inner.sinks.lock().push(sink);
    }

    /// Latched; only the first call reaches the sinks.
    pub fn note_started(&self) {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.each_sink(|s| s.ingestion_started());
        }
    }

    pub fn note_progress(&self, kind: ProgressKind, units: u64) {
        self.inner.pending.lock().insert(kind, units);
    }

    /// Latched; flushes outstanding progress first.
    pub fn note_complete(&self) {
        if self
            .inner
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.inner.flush();
            self.inner.each_sink(|s| s.ingestion_complete());
        }
    }

    pub fn note_fatal(&self, message: &str) {
        self.inner.flush();
        self.inner.each_sink(|s| s.fatal_input_failure(message));
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.try_send(());
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        started: AtomicUsize,
        ticks: AtomicUsize,
        completed: AtomicUsize,
        last: Mutex<Option<(ProgressKind, u64)>>,
    }

    impl ProgressSink for CountingSink {
        fn ingestion_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn progress(&self, kind: ProgressKind, units: u64) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some((kind, units));
        }
        fn ingestion_complete(&self) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn started_and_complete_latch() {
        let hub = ProgressHub::new();
        let sink = Arc::new(CountingSink::default());
        hub.subscribe(sink.clone());
        hub.note_started();
        hub.note_started();
        hub.note_complete();
        hub.note_complete();
        assert_eq!(sink.started.load(Ordering::SeqCst), 1);
        assert_eq!(sink.completed.load(Ordering::SeqCst), 1);
        hub.shutdown();
    }

    #[test]
    fn bursts_coalesce_to_the_latest_value() {
        let hub = ProgressHub::new();
        let sink = Arc::new(CountingSink::default());
        hub.subscribe(sink.clone());
        for units in 0..1000 {
            hub.note_progress(ProgressKind::Analyze, units);
        }
        std::thread::sleep(Duration::from_millis(250));
        let ticks = sink.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 1 && ticks < 10, "got {ticks} ticks");
        assert_eq!(
            *sink.last.lock(),
            Some((ProgressKind::Analyze, 999)),
            "latest value must win"
        );
        hub.shutdown();
    }

    #[test]
    fn complete_flushes_pending_progress() {
        let hub = ProgressHub::new();
        let sink = Arc::new(CountingSink::default());
        hub.subscribe(sink.clone());
        hub.note_progress(ProgressKind::Decode, 7);
        hub.note_complete();
        assert_eq!(*sink.last.lock(), Some((ProgressKind::Decode, 7)));
        hub.shutdown();
    }
}
