//! Session coordination: one source pump, up to two analyzers, up to two
//! decoders, and the subsume protocol between them.
//!
//! Workers report through a channel; a coordinator thread owns all slot
//! mutation. Readers snapshot the current lead under a short mutex, so a
//! subsume is observed atomically: either the old lead's frames up to its
//! final progress, or the new lead's.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chunk_log::{CancelToken, ChunkedByteLog};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::analyzer::{Analyzer, AnalyzerExit, Candidate};
use crate::decoder::Decoder;
use crate::error::SettingsError;
use crate::progress::{ProgressHub, ProgressKind, ProgressSink};
use crate::recording::{EncodingChoice, FileFormat, Frame, Recording};
use crate::source::{self, ByteSource};
use crate::worker::{WorkerHandle, WorkerKind};

/// Messages workers send the coordinator thread.
pub enum PipelineEvent {
    Progress { kind: WorkerKind },
    AnalyzerFinished { seq: u64, exit: AnalyzerExit },
    DecoderFinished { seq: u64 },
    AutoResizeMarker { seq: u64 },
    EncodingRuledOut,
    Shutdown,
}

#[derive(Default)]
struct Slots {
    analyzer_lead: Option<Arc<WorkerHandle>>,
    analyzer_backport: Option<Arc<WorkerHandle>>,
    decoder_lead: Option<Arc<WorkerHandle>>,
    decoder_backport: Option<Arc<WorkerHandle>>,
    /// Stopped and subsumed workers, kept for the final join.
    retired: Vec<Arc<WorkerHandle>>,
}

impl Slots {
    fn lead(&self, kind: WorkerKind) -> Option<&Arc<WorkerHandle>> {
        match kind {
            WorkerKind::Analyzer => self.analyzer_lead.as_ref(),
            WorkerKind::Decoder => self.decoder_lead.as_ref(),
        }
    }
}

struct Shared {
    recording: Arc<Recording>,
    log: Arc<ChunkedByteLog>,
    slots: Mutex<Slots>,
    candidates: Mutex<HashMap<u64, Candidate>>,
    next_seq: AtomicU64,
    hub: ProgressHub,
    events: Sender<PipelineEvent>,
    closed: AtomicBool,
    completed: AtomicBool,
}

impl Shared {
    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn spawn_analyzer(self: &Arc<Self>, candidate: Candidate, as_lead: bool) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let seq = self.next_seq();
        let handle = Arc::new(WorkerHandle::new(WorkerKind::Analyzer, seq));
        self.candidates.lock().insert(seq, candidate);
        let analyzer = Analyzer::new(
            Arc::clone(&handle),
            Arc::clone(&self.recording),
            Arc::clone(&self.log),
            candidate,
            self.events.clone(),
        );
        let events = self.events.clone();
        let thread_handle = Arc::clone(&handle);
        let spawned = std::thread::Builder::new()
            .name(format!("analyzer-{seq}"))
            .spawn(move || {
                let exit = match catch_unwind(AssertUnwindSafe(|| analyzer.run())) {
                    Ok(exit) => exit,
                    Err(_) => {
                        error!(target: "session", seq, "analyzer panicked");
                        AnalyzerExit::Stopped
                    }
                };
                thread_handle.mark_stopped();
                let _ = events.send(PipelineEvent::AnalyzerFinished { seq, exit });
            });
        match spawned {
            Ok(thread) => handle.attach_thread(thread),
            Err(err) => {
                error!(target: "session", %err, "failed to spawn analyzer thread");
                return;
            }
        }
        let mut slots = self.slots.lock();
        let slot = if as_lead {
            &mut slots.analyzer_lead
        } else {
            &mut slots.analyzer_backport
        };
        if let Some(old) = slot.replace(handle) {
            old.request_stop();
            slots.retired.push(old);
        }
    }

    fn spawn_decoder(self: &Arc<Self>, as_lead: bool) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let seq = self.next_seq();
        let handle = Arc::new(WorkerHandle::new(WorkerKind::Decoder, seq));
        let decoder = Decoder::new(
            Arc::clone(&handle),
            Arc::clone(&self.recording),
            self.events.clone(),
        );
        let events = self.events.clone();
        let thread_handle = Arc::clone(&handle);
        let spawned = std::thread::Builder::new()
            .name(format!("decoder-{seq}"))
            .spawn(move || {
                if catch_unwind(AssertUnwindSafe(|| decoder.run())).is_err() {
                    error!(target: "session", seq, "decoder panicked");
                }
                thread_handle.mark_stopped();
                let _ = events.send(PipelineEvent::DecoderFinished { seq });
            });
        match spawned {
            Ok(thread) => handle.attach_thread(thread),
            Err(err) => {
                error!(target: "session", %err, "failed to spawn decoder thread");
                return;
            }
        }
        let mut slots = self.slots.lock();
        let slot = if as_lead {
            &mut slots.decoder_lead
        } else {
            &mut slots.decoder_backport
        };
        if let Some(old) = slot.replace(handle) {
            old.request_stop();
            slots.retired.push(old);
        }
    }

    /// Replaces the lead with the backport once the backport has caught up.
    fn maybe_subsume(&self, kind: WorkerKind) {
        let mut slots = self.slots.lock();
        let slots = &mut *slots;
        let (lead_slot, backport_slot) = match kind {
            WorkerKind::Analyzer => (&mut slots.analyzer_lead, &mut slots.analyzer_backport),
            WorkerKind::Decoder => (&mut slots.decoder_lead, &mut slots.decoder_backport),
        };
        let (Some(lead), Some(backport)) = (lead_slot.as_ref(), backport_slot.as_ref()) else {
            return;
        };
        if backport.progress() < lead.progress() {
            return;
        }
        info!(
            target: "session",
            kind = kind.label(),
            old_seq = lead.seq(),
            new_seq = backport.seq(),
            progress = backport.progress(),
            "backport subsumed the leading edge"
        );
        let old = lead_slot.take();
        *lead_slot = backport_slot.take();
        if let Some(old) = old {
            old.mark_subsumed();
            slots.retired.push(old);
        }
    }

    /// Spawns a backport decoder that re-reads the recording's settings from
    /// scratch. It becomes the lead when it catches up.
    fn reset_decoder(self: &Arc<Self>) {
        self.spawn_decoder(false);
    }

    /// If a backport decoder exists it becomes the lead immediately; with no
    /// backport this is a no-op, the session is never left without a
    /// decoder.
    fn cancel_leading_decode(&self) {
        let mut slots = self.slots.lock();
        let Some(backport) = slots.decoder_backport.take() else {
            return;
        };
        if let Some(old) = slots.decoder_lead.replace(backport) {
            old.request_stop();
            slots.retired.push(old);
        }
    }

    fn is_analyzer_lead(&self, seq: u64) -> bool {
        self.slots
            .lock()
            .analyzer_lead
            .as_ref()
            .is_some_and(|h| h.seq() == seq)
    }

    fn on_analyzer_finished(self: &Arc<Self>, seq: u64, exit: AnalyzerExit) {
        // a finished backport has all the progress it will ever have
        self.maybe_subsume(WorkerKind::Analyzer);
        match exit {
            AnalyzerExit::Complete => {
                if self.is_analyzer_lead(seq) {
                    self.recording.mark_analysis_complete();
                    self.check_complete();
                }
            }
            AnalyzerExit::Reject {
                read_full_header,
                reason,
            } => {
                if !self.is_analyzer_lead(seq) {
                    return;
                }
                let candidate = self.candidates.lock().get(&seq).copied();
                let Some(candidate) = candidate else {
                    return;
                };
                let next = candidate.next(read_full_header);
                debug!(
                    target: "session",
                    seq,
                    reason,
                    from = candidate.file_format().label(),
                    to = next.file_format().label(),
                    compression = next.compression.label(),
                    "format rejected, trying next candidate"
                );
                self.spawn_analyzer(next, true);
            }
            AnalyzerExit::Corrupt { frames, reason } => {
                warn!(
                    target: "session",
                    seq,
                    frames,
                    reason,
                    "record stream corrupt, keeping the valid prefix"
                );
                if self.is_analyzer_lead(seq) {
                    self.recording.mark_analysis_complete();
                    self.check_complete();
                }
            }
            AnalyzerExit::Stopped => {}
        }
    }

    fn on_decoder_finished(self: &Arc<Self>, seq: u64) {
        self.maybe_subsume(WorkerKind::Decoder);
        let is_lead = self
            .slots
            .lock()
            .decoder_lead
            .as_ref()
            .is_some_and(|h| h.seq() == seq);
        if is_lead {
            self.check_complete();
        }
    }

    /// Ingestion is complete when analysis has finished and the lead decoder
    /// has caught up with every emitted frame.
    fn check_complete(&self) {
        if !self.recording.analysis_complete() {
            return;
        }
        let decoded = self
            .slots
            .lock()
            .decoder_lead
            .as_ref()
            .map(|h| h.progress())
            .unwrap_or(0);
        if decoded >= self.recording.frame_count() as u64 {
            self.completed.store(true, Ordering::Release);
            self.hub.note_complete();
        }
    }

    fn on_progress(&self, kind: WorkerKind) {
        self.maybe_subsume(kind);
        let units = self
            .slots
            .lock()
            .lead(kind)
            .map(|h| h.progress())
            .unwrap_or(0);
        let progress_kind = match kind {
            WorkerKind::Analyzer => ProgressKind::Analyze,
            WorkerKind::Decoder => ProgressKind::Decode,
        };
        self.hub.note_progress(progress_kind, units);
        if kind == WorkerKind::Decoder {
            self.check_complete();
        }
    }

    fn run_coordinator(self: Arc<Self>, events: Receiver<PipelineEvent>) {
        while let Ok(event) = events.recv() {
            match event {
                PipelineEvent::Progress { kind } => self.on_progress(kind),
                PipelineEvent::AnalyzerFinished { seq, exit } => {
                    self.on_analyzer_finished(seq, exit)
                }
                PipelineEvent::DecoderFinished { seq } => self.on_decoder_finished(seq),
                PipelineEvent::AutoResizeMarker { seq } => {
                    info!(
                        target: "session",
                        analyzer_seq = seq,
                        "alt-screen switch observed, restarting decode without growth"
                    );
                    self.reset_decoder();
                    self.cancel_leading_decode();
                }
                PipelineEvent::EncodingRuledOut => {
                    info!(target: "session", "auto-selected encoding changed, redecoding");
                    self.reset_decoder();
                }
                PipelineEvent::Shutdown => return,
            }
        }
    }
}

/// One ingestion run over one source. Dropping the session without calling
/// [`Session::complete_cancel`] leaks running worker threads, so callers
/// cancel or wait first.
pub struct Session {
    shared: Arc<Shared>,
    source_cancel: CancelToken,
    source_thread: Mutex<Option<JoinHandle<()>>>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn start(byte_source: Box<dyn ByteSource>) -> Self {
        let (events, events_rx) = unbounded();
        let shared = Arc::new(Shared {
            recording: Arc::new(Recording::new()),
            log: Arc::new(ChunkedByteLog::new()),
            slots: Mutex::new(Slots::default()),
            candidates: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            hub: ProgressHub::new(),
            events,
            closed: AtomicBool::new(false),
            completed: AtomicBool::new(false),
        });

        let source_cancel = CancelToken::new();
        let pump_log = Arc::clone(&shared.log);
        let pump_recording = Arc::clone(&shared.recording);
        let pump_cancel = source_cancel.clone();
        let pump_shared = Arc::clone(&shared);
        let source_thread = std::thread::Builder::new()
            .name("source-pump".into())
            .spawn(move || {
                let on_read =
                    |bytes| pump_shared.hub.note_progress(ProgressKind::Read, bytes);
                if !source::pump(byte_source, pump_log, pump_recording, pump_cancel, on_read) {
                    pump_shared.hub.note_fatal("input source failed mid-read");
                }
            })
            .ok();

        let coordinator_shared = Arc::clone(&shared);
        let coordinator = std::thread::Builder::new()
            .name("pipeline-coordinator".into())
            .spawn(move || coordinator_shared.run_coordinator(events_rx))
            .ok();

        shared.spawn_analyzer(Candidate::first(), true);
        shared.spawn_decoder(true);
        shared.hub.note_started();

        Self {
            shared,
            source_cancel,
            source_thread: Mutex::new(source_thread),
            coordinator: Mutex::new(coordinator),
        }
    }

    pub fn recording(&self) -> Arc<Recording> {
        Arc::clone(&self.shared.recording)
    }

    pub fn frame_count(&self) -> usize {
        self.shared.recording.frame_count()
    }

    pub fn frame(&self, index: usize) -> Option<Frame> {
        self.shared.recording.frame(index)
    }

    pub fn frame_index_at_time(&self, t: f64) -> usize {
        self.shared.recording.frame_index_at_time(t)
    }

    pub fn length(&self) -> f64 {
        self.shared.recording.length()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.recording.is_streaming()
    }

    pub fn subscribe_progress(&self, sink: Arc<dyn ProgressSink>) {
        self.shared.hub.subscribe(sink);
    }

    /// Pauses every worker between work items. The source keeps feeding the
    /// byte log.
    pub fn pause(&self) {
        self.each_worker(WorkerHandle::pause);
    }

    pub fn resume(&self) {
        self.each_worker(WorkerHandle::resume);
    }

    fn each_worker(&self, f: impl Fn(&WorkerHandle)) {
        let slots = self.shared.slots.lock();
        for handle in [
            slots.analyzer_lead.as_ref(),
            slots.analyzer_backport.as_ref(),
            slots.decoder_lead.as_ref(),
            slots.decoder_backport.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            f(handle);
        }
    }

    /// Current (analyzer, decoder) lead sequence numbers.
    pub fn current_seqs(&self) -> (u64, u64) {
        let slots = self.shared.slots.lock();
        (
            slots.analyzer_lead.as_ref().map(|h| h.seq()).unwrap_or(0),
            slots.decoder_lead.as_ref().map(|h| h.seq()).unwrap_or(0),
        )
    }

    pub fn set_forced_size(&self, size: Option<(u16, u16)>) -> Result<(), SettingsError> {
        self.ensure_open()?;
        self.shared.recording.set_forced_size(size);
        self.shared.reset_decoder();
        Ok(())
    }

    pub fn set_encoding(&self, choice: EncodingChoice) -> Result<(), SettingsError> {
        self.ensure_open()?;
        self.shared.recording.set_selected_encoding(choice)?;
        self.shared.reset_decoder();
        Ok(())
    }

    /// Forces the container framing, re-running analysis from scratch as a
    /// backport under the compression layer already in effect.
    pub fn set_file_format(&self, format: FileFormat) -> Result<(), SettingsError> {
        self.ensure_open()?;
        let compression = {
            let slots = self.shared.slots.lock();
            let seq = slots.analyzer_lead.as_ref().map(|h| h.seq());
            drop(slots);
            seq.and_then(|seq| self.shared.candidates.lock().get(&seq).copied())
                .map(|c| c.compression)
                .unwrap_or(chunk_log::Compression::Plain)
        };
        self.shared
            .spawn_analyzer(Candidate::for_format(format, compression), false);
        self.shared.reset_decoder();
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), SettingsError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(SettingsError::Closed);
        }
        Ok(())
    }

    /// True once analysis finished and every emitted frame is decoded.
    pub fn is_complete(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Polls for completion. False on timeout (a live stream never
    /// completes).
    pub fn wait_until_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_complete() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.is_complete()
    }

    /// Stops the source and every worker, joins them all, and shuts the
    /// progress hub down. The session is unusable afterwards.
    pub fn complete_cancel(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.source_cancel.cancel();
        if let Some(thread) = self.source_thread.lock().take() {
            let _ = thread.join();
        }
        let workers: Vec<Arc<WorkerHandle>> = {
            let mut slots = self.shared.slots.lock();
            let mut workers = Vec::new();
            for slot in [
                slots.analyzer_lead.take(),
                slots.analyzer_backport.take(),
                slots.decoder_lead.take(),
                slots.decoder_backport.take(),
            ]
            .into_iter()
            .flatten()
            {
                slot.request_stop();
                workers.push(slot);
            }
            workers.extend(slots.retired.drain(..));
            workers
        };
        for worker in &workers {
            worker.join();
        }
        let _ = self.shared.events.send(PipelineEvent::Shutdown);
        if let Some(thread) = self.coordinator.lock().take() {
            let _ = thread.join();
        }
        self.shared.hub.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.complete_cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BufferSource;

    fn record(sec: u32, usec: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&sec.to_le_bytes());
        out.extend_from_slice(&usec.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn ingest(bytes: Vec<u8>) -> Session {
        let session = Session::start(Box::new(BufferSource::new(bytes)));
        assert!(
            session.wait_until_complete(Duration::from_secs(10)),
            "ingestion did not complete"
        );
        session
    }

    #[test]
    fn plain_ttyrec_end_to_end() {
        let mut bytes = record(100, 0, b"hi");
        bytes.extend(record(100, 500_000, b"!"));
        let session = ingest(bytes);
        assert_eq!(session.frame_count(), 2);
        assert_eq!(
            session.recording().file_format(),
            Some(FileFormat::Ttyrec)
        );
        let frame = session.frame(1).expect("frame 1");
        assert_eq!(frame.relative_ts, 0.5);
        let term = frame.terminal.expect("snapshot");
        assert_eq!(term.char_at(0, 0), 'h');
        assert_eq!(term.char_at(0, 1), 'i');
        assert_eq!(term.char_at(0, 2), '!');
        session.complete_cancel();
    }

    #[test]
    fn unrecognizable_bytes_fall_back_to_script() {
        let mut bytes = vec![0x1f, 0x8b];
        bytes.extend(std::iter::repeat(0xff).take(10));
        let session = ingest(bytes.clone());
        assert_eq!(
            session.recording().file_format(),
            Some(FileFormat::Script)
        );
        assert_eq!(session.frame_count(), 1);
        assert_eq!(
            &session.frame(0).expect("frame").raw[..],
            &bytes[..],
            "script frames carry the bytes verbatim"
        );
        session.complete_cancel();
    }

    #[test]
    fn empty_input_completes_with_no_frames() {
        let session = ingest(Vec::new());
        assert_eq!(session.frame_count(), 0);
        assert_eq!(session.length(), 0.0);
        session.complete_cancel();
    }

    #[test]
    fn encoding_change_redecodes_with_a_fresh_decoder() {
        let session = ingest(record(0, 0, b"abc"));
        let old_seq = session.frame(0).expect("frame").decoder_seq;
        session
            .set_encoding(EncodingChoice::Latin1)
            .expect("latin1 is always available");
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let frame = session.frame(0).expect("frame");
            if frame.decoder_seq > old_seq {
                assert_eq!(frame.terminal.expect("snapshot").char_at(0, 0), 'a');
                break;
            }
            assert!(Instant::now() < deadline, "redecode never happened");
            std::thread::sleep(Duration::from_millis(10));
        }
        session.complete_cancel();
    }

    #[test]
    fn closed_session_rejects_settings() {
        let session = ingest(record(0, 0, b"x"));
        session.complete_cancel();
        assert!(matches!(
            session.set_encoding(EncodingChoice::Utf8),
            Err(SettingsError::Closed)
        ));
        assert!(matches!(
            session.set_forced_size(Some((132, 50))),
            Err(SettingsError::Closed)
        ));
    }
}
