//! Shared session aggregate: the frame list plus everything the workers
//! negotiate about it (format, encodings, markers, streaming state).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chunk_log::CancelToken;
use parking_lot::{Condvar, Mutex};
use vt_emu::{Encoding, Terminal};

use crate::error::{Cancelled, SettingsError};

/// Immutable terminal state attached to a decoded frame. Readers may retain
/// it across frame-list updates.
pub type Snapshot = Arc<Terminal>;

const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Container framing detected (or forced) for the byte stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Ttyrec,
    MultistreamTtyrec,
    Script,
}

impl FileFormat {
    pub fn label(self) -> &'static str {
        match self {
            FileFormat::Ttyrec => "ttyrec",
            FileFormat::MultistreamTtyrec => "ttyrec2",
            FileFormat::Script => "script",
        }
    }
}

/// Externally selected encoding. `Auto` follows whatever the analyzer has not
/// ruled out yet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncodingChoice {
    #[default]
    Auto,
    Utf8,
    Ibm,
    Latin1,
}

/// The encodings the byte stream is still consistent with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodingSet {
    utf8: bool,
    ibm: bool,
    latin1: bool,
}

impl Default for EncodingSet {
    fn default() -> Self {
        Self {
            utf8: true,
            ibm: true,
            latin1: true,
        }
    }
}

impl EncodingSet {
    pub fn allows(self, encoding: Encoding) -> bool {
        match encoding {
            Encoding::Utf8 => self.utf8,
            Encoding::IbmCp437 => self.ibm,
            Encoding::Latin1 => self.latin1,
        }
    }

    pub fn rule_out(&mut self, encoding: Encoding) {
        match encoding {
            Encoding::Utf8 => self.utf8 = false,
            Encoding::IbmCp437 => self.ibm = false,
            Encoding::Latin1 => self.latin1 = false,
        }
    }

    /// Best remaining guess. UTF-8 wins while it is still possible, then the
    /// IBM code page, then Latin-1 as the encoding that never fails.
    pub fn auto_pick(self) -> Encoding {
        if self.utf8 {
            Encoding::Utf8
        } else if self.ibm {
            Encoding::IbmCp437
        } else {
            Encoding::Latin1
        }
    }
}

/// One timestamped unit of payload plus the terminal state it produces.
/// Back-pointers are indices into the owning frame list, never owning
/// pointers.
#[derive(Clone, Debug)]
pub struct Frame {
    pub stream: u8,
    /// Seconds since the recording's first frame.
    pub relative_ts: f64,
    pub raw: Bytes,
    /// Bytes borrowed from the previous frame on this stream to heal a UTF-8
    /// codepoint split across the boundary.
    pub utf8_prefix: Bytes,
    /// Number of trailing payload bytes deferred to the next frame.
    pub utf8_chop_tail: u32,
    pub analyzer_seq: u64,
    pub decoder_seq: u64,
    pub terminal: Option<Snapshot>,
    pub dirty: bool,
    pub prev: Option<usize>,
    pub prev_in_stream: [Option<usize>; 2],
}

/// Frame fields an analyzer hands over in one piece.
#[derive(Clone, Debug)]
pub struct FrameWrite {
    pub index: usize,
    pub analyzer_seq: u64,
    pub stream: u8,
    /// Absolute timestamp, already fudged into strict ascending order.
    pub abs_ts: f64,
    pub raw: Bytes,
    pub utf8_prefix: Bytes,
    pub utf8_chop_tail: u32,
    /// Index of the previous frame on each stream, tracked by the writing
    /// analyzer so interleaved analyzers keep independent chains.
    pub prev_in_stream: [Option<usize>; 2],
}

#[derive(Default)]
struct RecordingState {
    frames: Vec<Frame>,
    first_abs_ts: Option<f64>,
    length_sec: f64,
    length_offset_sec: f64,
    file_format: Option<FileFormat>,
    possible_encodings: EncodingSet,
    selected_encoding: EncodingChoice,
    forced_size: Option<(u16, u16)>,
    is_streaming: bool,
    last_activity: Option<Instant>,
    auto_resize_markers: HashSet<u64>,
    registry: HashMap<(u32, u32), Bytes>,
    analysis_complete: bool,
}

/// Thread-safe aggregate owned by the session. All frame mutation goes
/// through the single lock; readers clone out cheap handles (`Bytes`, `Arc`)
/// and drop the lock before looking at them.
#[derive(Default)]
pub struct Recording {
    state: Mutex<RecordingState>,
    grew: Condvar,
}

impl Recording {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame_count(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn frame(&self, index: usize) -> Option<Frame> {
        self.state.lock().frames.get(index).cloned()
    }

    /// Floor lookup: the frame whose timestamp is <= `t`, or 0 when `t` is
    /// before the first frame.
    pub fn frame_index_at_time(&self, t: f64) -> usize {
        let state = self.state.lock();
        let after = state.frames.partition_point(|f| f.relative_ts <= t);
        after.saturating_sub(1)
    }

    pub fn first_abs_ts(&self) -> Option<f64> {
        self.state.lock().first_abs_ts
    }

    /// Writes (or replaces) the analyzer-owned half of a frame. Returns false
    /// when a newer analyzer already owns the slot.
    pub fn set_frame(&self, write: FrameWrite) -> bool {
        let mut state = self.state.lock();
        if write.index == 0 {
            state.first_abs_ts = Some(write.abs_ts);
        }
        let first = state.first_abs_ts.unwrap_or(write.abs_ts);
        let relative_ts = write.abs_ts - first;

        let raw = register_payload(&mut state.registry, write.raw);
        let prev = write.index.checked_sub(1);
        let frame = Frame {
            stream: write.stream,
            relative_ts,
            raw,
            utf8_prefix: write.utf8_prefix,
            utf8_chop_tail: write.utf8_chop_tail,
            analyzer_seq: write.analyzer_seq,
            decoder_seq: 0,
            terminal: None,
            dirty: false,
            prev,
            prev_in_stream: write.prev_in_stream,
        };
        if write.index < state.frames.len() {
            if state.frames[write.index].analyzer_seq > write.analyzer_seq {
                return false;
            }
            state.frames[write.index] = frame;
        } else {
            // analyzers emit densely, index == len
            state.frames.push(frame);
        }
        if relative_ts > state.length_sec {
            state.length_sec = relative_ts;
        }
        drop(state);
        self.grew.notify_all();
        true
    }

    /// Attaches a decoded snapshot. Refused when a newer decoder already
    /// wrote this frame.
    pub fn store_snapshot(&self, index: usize, decoder_seq: u64, snapshot: Snapshot) -> bool {
        let mut state = self.state.lock();
        let Some(frame) = state.frames.get_mut(index) else {
            return false;
        };
        if frame.decoder_seq > decoder_seq {
            return false;
        }
        frame.decoder_seq = decoder_seq;
        frame.terminal = Some(snapshot);
        frame.dirty = true;
        true
    }

    /// Blocks until frame `index` exists. Returns `Ok(false)` when analysis
    /// completed without producing it.
    pub fn wait_for_frame(&self, index: usize, cancel: &CancelToken) -> Result<bool, Cancelled> {
        let mut state = self.state.lock();
        loop {
            if index < state.frames.len() {
                return Ok(true);
            }
            if state.analysis_complete {
                return Ok(false);
            }
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            self.grew.wait_for(&mut state, WAIT_SLICE);
        }
    }

    pub fn mark_analysis_complete(&self) {
        self.state.lock().analysis_complete = true;
        self.grew.notify_all();
    }

    pub fn analysis_complete(&self) -> bool {
        self.state.lock().analysis_complete
    }

    pub fn file_format(&self) -> Option<FileFormat> {
        self.state.lock().file_format
    }

    pub fn set_file_format(&self, format: FileFormat) {
        self.state.lock().file_format = Some(format);
    }

    pub fn possible_encodings(&self) -> EncodingSet {
        self.state.lock().possible_encodings
    }

    /// Removes UTF-8 from the possible set. Returns true when that changed
    /// the encoding an `Auto` selection resolves to.
    pub fn rule_out_utf8(&self) -> bool {
        let mut state = self.state.lock();
        let before = actual_encoding_of(&state);
        state.possible_encodings.rule_out(Encoding::Utf8);
        actual_encoding_of(&state) != before
    }

    pub fn selected_encoding(&self) -> EncodingChoice {
        self.state.lock().selected_encoding
    }

    pub fn set_selected_encoding(&self, choice: EncodingChoice) -> Result<(), SettingsError> {
        let mut state = self.state.lock();
        let wanted = match choice {
            EncodingChoice::Auto => None,
            EncodingChoice::Utf8 => Some(Encoding::Utf8),
            EncodingChoice::Ibm => Some(Encoding::IbmCp437),
            EncodingChoice::Latin1 => Some(Encoding::Latin1),
        };
        if let Some(encoding) = wanted {
            if !state.possible_encodings.allows(encoding) {
                return Err(SettingsError::EncodingRuledOut(encoding));
            }
        }
        state.selected_encoding = choice;
        Ok(())
    }

    /// The encoding decoders should feed bytes with right now.
    pub fn actual_encoding(&self) -> Encoding {
        actual_encoding_of(&self.state.lock())
    }

    pub fn forced_size(&self) -> Option<(u16, u16)> {
        self.state.lock().forced_size
    }

    pub fn set_forced_size(&self, size: Option<(u16, u16)>) {
        self.state.lock().forced_size = size;
    }

    /// Records that analyzer `seq` saw an alt-screen switch in the byte
    /// stream. Returns true on first observation by that analyzer.
    pub fn add_auto_resize_marker(&self, seq: u64) -> bool {
        self.state.lock().auto_resize_markers.insert(seq)
    }

    pub fn auto_resize_marker_seen(&self) -> bool {
        !self.state.lock().auto_resize_markers.is_empty()
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.state.lock().is_streaming = streaming;
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().is_streaming
    }

    pub fn touch_activity(&self) {
        let mut state = self.state.lock();
        state.last_activity = Some(Instant::now());
        state.length_offset_sec = 0.0;
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.state.lock().last_activity
    }

    pub fn set_length_offset(&self, offset: f64) {
        self.state.lock().length_offset_sec = offset;
    }

    /// Timeline length in seconds, including any live-stream extension.
    pub fn length(&self) -> f64 {
        let state = self.state.lock();
        state.length_sec + state.length_offset_sec
    }

    pub fn length_sec(&self) -> f64 {
        self.state.lock().length_sec
    }
}

fn actual_encoding_of(state: &RecordingState) -> Encoding {
    match state.selected_encoding {
        EncodingChoice::Auto => state.possible_encodings.auto_pick(),
        EncodingChoice::Utf8 => Encoding::Utf8,
        EncodingChoice::Ibm => Encoding::IbmCp437,
        EncodingChoice::Latin1 => Encoding::Latin1,
    }
}

/// Content-addressed dedup: identical payloads share one buffer. The key is
/// (crc32c, len); a byte compare guards against collisions.
fn register_payload(registry: &mut HashMap<(u32, u32), Bytes>, raw: Bytes) -> Bytes {
    if raw.is_empty() {
        return raw;
    }
    let key = (crc32c::crc32c(&raw), raw.len() as u32);
    match registry.get(&key) {
        Some(existing) if existing[..] == raw[..] => existing.clone(),
        Some(_) => raw,
        None => {
            registry.insert(key, raw.clone());
            raw
        }
    }
}
