//! Frame analysis: splitting the byte log into timestamped payload records.
//!
//! Candidate formats are tried in a fixed order. A failure before the first
//! emitted frame is a format rejection the coordinator recovers from by
//! spawning the next candidate; after the first frame the analyzer is
//! committed and a malformed record merely halts it, leaving the emitted
//! prefix valid.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use chunk_log::{is_cancelled_io, overlay, ChunkedByteLog, Compression};
use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::recording::{FileFormat, FrameWrite, Recording};
use crate::session::PipelineEvent;
use crate::worker::{WorkerHandle, WorkerKind};

/// Largest increment the timestamp fudge may reach before a regression is
/// treated as corruption.
const FUDGE_CAP: f64 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// 13-byte headers carrying a stream byte (.ttyrec2).
    Multistream,
    /// Classic 12-byte ttyrec headers.
    Single,
    /// No framing: one log chunk per frame, stamped with its arrival time.
    Script,
}

/// One (compression, framing) pairing the analyzer assumes about the input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub compression: Compression,
    pub framing: Framing,
}

impl Candidate {
    pub fn first() -> Self {
        Self {
            compression: Compression::Gzip,
            framing: Framing::Multistream,
        }
    }

    pub fn for_format(format: FileFormat, compression: Compression) -> Self {
        let framing = match format {
            FileFormat::MultistreamTtyrec => Framing::Multistream,
            FileFormat::Ttyrec => Framing::Single,
            FileFormat::Script => Framing::Script,
        };
        Self {
            compression,
            framing,
        }
    }

    /// The candidate to try after this one was rejected. Never reading a
    /// whole header points at the compression layer; rejecting a complete
    /// header points at the framing, so multistream falls back to
    /// single-stream at most once before the script fallback.
    pub fn next(self, read_full_header: bool) -> Candidate {
        if self.framing == Framing::Script {
            return self;
        }
        if !read_full_header {
            return match self.compression {
                Compression::Gzip => Candidate {
                    compression: Compression::Bzip2,
                    framing: self.framing,
                },
                Compression::Bzip2 => Candidate {
                    compression: Compression::Plain,
                    framing: self.framing,
                },
                Compression::Plain => self.demote_framing(),
            };
        }
        self.demote_framing()
    }

    fn demote_framing(self) -> Candidate {
        match self.framing {
            Framing::Multistream => Candidate {
                compression: self.compression,
                framing: Framing::Single,
            },
            _ => Candidate {
                compression: Compression::Plain,
                framing: Framing::Script,
            },
        }
    }

    pub fn file_format(self) -> FileFormat {
        match self.framing {
            Framing::Multistream => FileFormat::MultistreamTtyrec,
            Framing::Single => FileFormat::Ttyrec,
            Framing::Script => FileFormat::Script,
        }
    }
}

/// Why an analyzer run ended.
#[derive(Debug)]
pub enum AnalyzerExit {
    /// Clean end of input.
    Complete,
    /// Validation failure before the first frame; try the next candidate.
    Reject {
        read_full_header: bool,
        reason: String,
    },
    /// Malformed record after `frames` valid ones; the prefix stands.
    Corrupt { frames: usize, reason: String },
    /// Stop or subsume request observed.
    Stopped,
}

pub struct Analyzer {
    handle: Arc<WorkerHandle>,
    recording: Arc<Recording>,
    log: Arc<ChunkedByteLog>,
    candidate: Candidate,
    events: Sender<PipelineEvent>,
}

impl Analyzer {
    pub fn new(
        handle: Arc<WorkerHandle>,
        recording: Arc<Recording>,
        log: Arc<ChunkedByteLog>,
        candidate: Candidate,
        events: Sender<PipelineEvent>,
    ) -> Self {
        Self {
            handle,
            recording,
            log,
            candidate,
            events,
        }
    }

    pub fn candidate(&self) -> Candidate {
        self.candidate
    }

    pub fn run(&self) -> AnalyzerExit {
        self.handle.mark_running();
        self.recording.set_file_format(self.candidate.file_format());
        let exit = match self.candidate.framing {
            Framing::Script => self.run_script(),
            _ => self.run_ttyrec(),
        };
        debug!(
            target: "analyzer",
            seq = self.handle.seq(),
            compression = self.candidate.compression.label(),
            format = self.candidate.file_format().label(),
            exit = ?exit,
            "analyzer finished"
        );
        exit
    }

    fn run_ttyrec(&self) -> AnalyzerExit {
        let multistream = self.candidate.framing == Framing::Multistream;
        let header_len = if multistream { 13 } else { 12 };
        let mut reader = overlay(
            Arc::clone(&self.log),
            self.candidate.compression,
            self.handle.cancel_token().clone(),
        );
        let mut assembler = FrameAssembler::new(
            Arc::clone(&self.recording),
            self.handle.seq(),
            self.events.clone(),
        );
        let mut consumed: u64 = 0;
        let mut read_full_header = false;
        let fail = |assembler: &FrameAssembler, full: bool, reason: String| {
            if assembler.index == 0 {
                AnalyzerExit::Reject {
                    read_full_header: full,
                    reason,
                }
            } else {
                AnalyzerExit::Corrupt {
                    frames: assembler.index,
                    reason,
                }
            }
        };

        loop {
            if !self.handle.keep_running() {
                return AnalyzerExit::Stopped;
            }
            let mut header = [0u8; 13];
            match fill(reader.as_mut(), &mut header[..header_len]) {
                Ok(Fill::Eof) => return AnalyzerExit::Complete,
                Ok(Fill::Partial(n)) => {
                    return fail(
                        &assembler,
                        read_full_header || n >= 12,
                        format!("header truncated at eof ({n} of {header_len} bytes)"),
                    );
                }
                Ok(Fill::Full) => {}
                Err(err) => {
                    if is_cancelled_io(&err) {
                        return AnalyzerExit::Stopped;
                    }
                    return fail(&assembler, read_full_header, err.to_string());
                }
            }
            read_full_header = true;

            let sec = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
            let usec = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
            let payload_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
            let stream = if multistream { header[12] } else { 0 };

            if usec >= 1_000_000 {
                return fail(
                    &assembler,
                    true,
                    format!("microsecond field out of range ({usec})"),
                );
            }
            if stream > 1 {
                return fail(&assembler, true, format!("unknown stream id {stream}"));
            }
            if self.candidate.compression == Compression::Plain && self.log.is_complete() {
                let total = self.log.len();
                let end = consumed + header_len as u64 + payload_len as u64;
                if end > total {
                    return fail(&assembler, true, "payload overruns end of input".into());
                }
                let remaining = total - end;
                if remaining > 0 && remaining < 12 && !(multistream && remaining == 1) {
                    return fail(
                        &assembler,
                        true,
                        format!("{remaining} trailing bytes cannot hold a record"),
                    );
                }
            }

            let mut payload = vec![0u8; payload_len as usize];
            match fill(reader.as_mut(), &mut payload) {
                Ok(Fill::Full) => {}
                Ok(_) => return fail(&assembler, true, "payload truncated at eof".into()),
                Err(err) => {
                    if is_cancelled_io(&err) {
                        return AnalyzerExit::Stopped;
                    }
                    return fail(&assembler, true, err.to_string());
                }
            }

            let abs_ts = sec as f64 + usec as f64 * 1e-6;
            if let Err(reason) = assembler.emit(abs_ts, stream, Bytes::from(payload), true) {
                return fail(&assembler, true, reason);
            }
            consumed += header_len as u64 + payload_len as u64;
            self.handle.record_progress(consumed);
            let _ = self.events.send(PipelineEvent::Progress {
                kind: WorkerKind::Analyzer,
            });
        }
    }

    /// Fallback framing: every chunk appended to the log is one frame, its
    /// append time its timestamp. Cannot fail.
    fn run_script(&self) -> AnalyzerExit {
        let mut assembler = FrameAssembler::new(
            Arc::clone(&self.recording),
            self.handle.seq(),
            self.events.clone(),
        );
        let mut offset: u64 = 0;
        loop {
            if !self.handle.keep_running() {
                return AnalyzerExit::Stopped;
            }
            let chunk = match self.log.read_chunk(offset, self.handle.cancel_token()) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return AnalyzerExit::Complete,
                Err(_) => return AnalyzerExit::Stopped,
            };
            let (bytes, stamp) = chunk;
            let abs_ts = stamp
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            offset += bytes.len() as u64;
            if let Err(reason) = assembler.emit(abs_ts, 0, bytes, false) {
                // unreachable with strict=false, but keep the analyzer alive
                warn!(target: "analyzer", reason, "script frame dropped");
            }
            self.handle.record_progress(offset);
            let _ = self.events.send(PipelineEvent::Progress {
                kind: WorkerKind::Analyzer,
            });
        }
    }
}

/// Per-frame bookkeeping shared by the ttyrec and script paths: timestamp
/// ordering, UTF-8 boundary healing and alt-screen marker detection.
struct FrameAssembler {
    recording: Arc<Recording>,
    seq: u64,
    events: Sender<PipelineEvent>,
    index: usize,
    last_ts: f64,
    last_fudged: bool,
    chops: [Vec<u8>; 2],
    stream_tails: [Option<usize>; 2],
}

impl FrameAssembler {
    fn new(recording: Arc<Recording>, seq: u64, events: Sender<PipelineEvent>) -> Self {
        Self {
            recording,
            seq,
            events,
            index: 0,
            last_ts: f64::NEG_INFINITY,
            last_fudged: false,
            chops: [Vec::new(), Vec::new()],
            stream_tails: [None, None],
        }
    }

    fn emit(&mut self, abs_ts: f64, stream: u8, raw: Bytes, strict: bool) -> Result<(), String> {
        let ts = self.order_timestamp(abs_ts, strict)?;
        let (prefix, chop_tail) = self.heal_utf8(stream, &raw);
        if contains_alt_screen_switch(&raw) && self.recording.add_auto_resize_marker(self.seq) {
            let _ = self
                .events
                .send(PipelineEvent::AutoResizeMarker { seq: self.seq });
        }
        let accepted = self.recording.set_frame(FrameWrite {
            index: self.index,
            analyzer_seq: self.seq,
            stream,
            abs_ts: ts,
            raw,
            utf8_prefix: prefix,
            utf8_chop_tail: chop_tail,
            prev_in_stream: self.stream_tails,
        });
        if !accepted {
            return Err("superseded by a newer analyzer".into());
        }
        self.stream_tails[(stream & 1) as usize] = Some(self.index);
        self.index += 1;
        Ok(())
    }

    /// Enforces strictly ascending timestamps. Exact ties (and regressions
    /// into a stretch we previously fudged upward) are nudged by 1 ps,
    /// escalating tenfold per retry. A regression past an unfudged timestamp
    /// is corruption when `strict`, clamped otherwise.
    fn order_timestamp(&mut self, abs_ts: f64, strict: bool) -> Result<f64, String> {
        let mut ts = abs_ts;
        if ts < self.last_ts && !self.last_fudged {
            if strict {
                return Err(format!(
                    "timestamp regressed from {} to {}",
                    self.last_ts, ts
                ));
            }
            ts = self.last_ts;
        }
        let mut fudged = false;
        let mut delta = 1e-12;
        while ts <= self.last_ts {
            if delta > FUDGE_CAP {
                if strict {
                    return Err("timestamp tie exceeded the fudge cap".into());
                }
                ts = self.last_ts + FUDGE_CAP;
                break;
            }
            ts = self.last_ts + delta;
            delta *= 10.0;
            fudged = true;
        }
        self.last_ts = ts;
        self.last_fudged = fudged;
        Ok(ts)
    }

    /// Validates UTF-8 over (pending chop || payload) for the frame's stream.
    /// Up to three trailing bytes that look like a split codepoint are parked
    /// for the next frame; a hard failure rules UTF-8 out for the whole
    /// recording.
    fn heal_utf8(&mut self, stream: u8, raw: &Bytes) -> (Bytes, u32) {
        let slot = (stream & 1) as usize;
        let pending = std::mem::take(&mut self.chops[slot]);
        if !self.recording.possible_encodings().allows(vt_emu::Encoding::Utf8) {
            return (Bytes::new(), 0);
        }
        let combined: Vec<u8>;
        let check: &[u8] = if pending.is_empty() {
            raw
        } else {
            combined = [pending.as_slice(), raw].concat();
            &combined
        };
        match std::str::from_utf8(check) {
            Ok(_) => (Bytes::from(pending), 0),
            Err(err) if err.error_len().is_none() => {
                let tail = check.len() - err.valid_up_to();
                if tail > 3 {
                    self.rule_out_utf8();
                    return (Bytes::new(), 0);
                }
                self.chops[slot] = check[check.len() - tail..].to_vec();
                if tail > raw.len() {
                    // the split codepoint swallowed the pending prefix too;
                    // this frame contributes no complete characters
                    (Bytes::new(), raw.len() as u32)
                } else {
                    (Bytes::from(pending), tail as u32)
                }
            }
            Err(_) => {
                self.rule_out_utf8();
                (Bytes::new(), 0)
            }
        }
    }

    fn rule_out_utf8(&mut self) {
        if self.recording.rule_out_utf8() {
            let _ = self.events.send(PipelineEvent::EncodingRuledOut);
        }
        self.chops = [Vec::new(), Vec::new()];
    }
}

fn contains_alt_screen_switch(raw: &[u8]) -> bool {
    raw.windows(8)
        .any(|w| w == b"\x1b[?1049h" || w == b"\x1b[?1049l")
}

enum Fill {
    Full,
    Eof,
    Partial(usize),
}

fn fill(reader: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<Fill> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => {
                return Ok(if got == 0 { Fill::Eof } else { Fill::Partial(got) });
            }
            Ok(n) => got += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(Fill::Full)
}
