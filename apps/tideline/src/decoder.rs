//! Frame decoding: replaying payload bytes through the terminal emulator.

use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::trace;
use vt_emu::{Encoding, Terminal};

use crate::recording::{Recording, Snapshot};
use crate::session::PipelineEvent;
use crate::worker::{WorkerHandle, WorkerKind};

/// Walks frames in index order, cloning the previous frame's terminal and
/// applying only the current frame's bytes. Settings (encoding, forced size,
/// growth policy) are sampled once at startup; a settings change spawns a
/// fresh decoder instead of reconfiguring a running one.
pub struct Decoder {
    handle: Arc<WorkerHandle>,
    recording: Arc<Recording>,
    events: Sender<PipelineEvent>,
}

impl Decoder {
    pub fn new(
        handle: Arc<WorkerHandle>,
        recording: Arc<Recording>,
        events: Sender<PipelineEvent>,
    ) -> Self {
        Self {
            handle,
            recording,
            events,
        }
    }

    pub fn run(&self) {
        self.handle.mark_running();
        let encoding = self.recording.actual_encoding();
        let forced = self.recording.forced_size();
        let grow = !self.recording.auto_resize_marker_seen();
        let mut last: Option<Snapshot> = None;
        let mut index = 0usize;
        loop {
            if !self.handle.keep_running() {
                return;
            }
            match self.recording.wait_for_frame(index, self.handle.cancel_token()) {
                Ok(true) => {}
                Ok(false) | Err(_) => return,
            }
            let Some(frame) = self.recording.frame(index) else {
                return;
            };
            let snapshot = if frame.stream != 0 {
                // non-display streams carry keystrokes; the screen holds
                match &last {
                    Some(prev) => Arc::clone(prev),
                    None => Arc::new(fresh_terminal(encoding, forced, grow)),
                }
            } else {
                let mut term = match &last {
                    Some(prev) => (**prev).clone(),
                    None => fresh_terminal(encoding, forced, grow),
                };
                if encoding == Encoding::Utf8 {
                    if !frame.utf8_prefix.is_empty() {
                        term.feed_bytes(&frame.utf8_prefix);
                    }
                    let cut = frame.raw.len().saturating_sub(frame.utf8_chop_tail as usize);
                    term.feed_bytes(&frame.raw[..cut]);
                } else {
                    term.feed_bytes(&frame.raw);
                }
                Arc::new(term)
            };
            if !self
                .recording
                .store_snapshot(index, self.handle.seq(), Arc::clone(&snapshot))
            {
                trace!(
                    target: "decoder",
                    seq = self.handle.seq(),
                    index,
                    "frame already owned by a newer decoder"
                );
            }
            last = Some(snapshot);
            index += 1;
            self.handle.record_progress(index as u64);
            let _ = self.events.send(PipelineEvent::Progress {
                kind: WorkerKind::Decoder,
            });
        }
    }
}

fn fresh_terminal(encoding: Encoding, forced: Option<(u16, u16)>, grow: bool) -> Terminal {
    let mut term = match forced {
        Some((cols, rows)) => Terminal::new(cols as usize, rows as usize),
        None => Terminal::new(80, 24),
    };
    term.set_encoding(encoding);
    if forced.is_some() {
        term.set_auto_grow_veto(true);
    } else if !grow {
        term.set_auto_grow(false);
    }
    term
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::FrameWrite;
    use bytes::Bytes;

    fn recording_with(frames: &[(u8, &[u8], Bytes, u32)]) -> Arc<Recording> {
        let recording = Arc::new(Recording::new());
        let mut tails = [None, None];
        for (i, (stream, raw, prefix, chop)) in frames.iter().enumerate() {
            recording.set_frame(FrameWrite {
                index: i,
                analyzer_seq: 1,
                stream: *stream,
                abs_ts: i as f64,
                raw: Bytes::copy_from_slice(raw),
                utf8_prefix: prefix.clone(),
                utf8_chop_tail: *chop,
                prev_in_stream: tails,
            });
            tails[(*stream & 1) as usize] = Some(i);
        }
        recording.mark_analysis_complete();
        recording
    }

    fn decode(recording: &Arc<Recording>, seq: u64) {
        let (tx, _rx) = crossbeam_channel::unbounded();
        let handle = Arc::new(WorkerHandle::new(WorkerKind::Decoder, seq));
        Decoder::new(handle, Arc::clone(recording), tx).run();
    }

    #[test]
    fn renders_payload_text() {
        let recording = recording_with(&[(0, b"hello", Bytes::new(), 0)]);
        decode(&recording, 2);
        let frame = recording.frame(0).expect("frame");
        let term = frame.terminal.expect("snapshot");
        assert_eq!(term.row_text(0).trim_end(), "hello");
        assert!(frame.dirty);
        assert_eq!(frame.decoder_seq, 2);
    }

    #[test]
    fn state_stream_frames_share_the_previous_screen() {
        let recording = recording_with(&[
            (0, b"abc", Bytes::new(), 0),
            (1, b"XY", Bytes::new(), 0),
        ]);
        decode(&recording, 2);
        let f0 = recording.frame(0).expect("f0").terminal.expect("t0");
        let f1 = recording.frame(1).expect("f1").terminal.expect("t1");
        assert!(Arc::ptr_eq(&f0, &f1));
        assert_eq!(f0.row_text(0).trim_end(), "abc");
    }

    #[test]
    fn utf8_prefix_and_chop_heal_split_codepoints() {
        let recording = recording_with(&[
            (0, &[0xe2, 0x82][..], Bytes::new(), 2),
            (0, &[0xac, b'A'][..], Bytes::from_static(&[0xe2, 0x82]), 0),
        ]);
        decode(&recording, 2);
        let f0 = recording.frame(0).expect("f0").terminal.expect("t0");
        assert_eq!(f0.row_text(0).trim_end(), "");
        let f1 = recording.frame(1).expect("f1").terminal.expect("t1");
        assert_eq!(f1.char_at(0, 0), '\u{20ac}');
        assert_eq!(f1.char_at(0, 1), 'A');
    }

    #[test]
    fn forced_size_pins_the_grid() {
        let recording = recording_with(&[(0, b"\x1b[40;1Hdown", Bytes::new(), 0)]);
        recording.set_forced_size(Some((132, 50)));
        decode(&recording, 2);
        let term = recording.frame(0).expect("frame").terminal.expect("snapshot");
        assert_eq!((term.cols(), term.rows()), (132, 50));
        assert_eq!(term.row_text(39).trim_end(), "down");
    }

    #[test]
    fn marker_disables_growth_for_fresh_decoders() {
        let recording = recording_with(&[(0, b"\x1b[30;1HX", Bytes::new(), 0)]);
        recording.add_auto_resize_marker(1);
        decode(&recording, 2);
        let term = recording.frame(0).expect("frame").terminal.expect("snapshot");
        assert_eq!((term.cols(), term.rows()), (80, 24));
        assert_eq!(term.char_at(23, 0), 'X');
    }

    #[test]
    fn empty_payload_is_a_noop_clone() {
        let recording = recording_with(&[
            (0, b"seed", Bytes::new(), 0),
            (0, b"", Bytes::new(), 0),
        ]);
        decode(&recording, 2);
        let f0 = recording.frame(0).expect("f0").terminal.expect("t0");
        let f1 = recording.frame(1).expect("f1").terminal.expect("t1");
        assert_eq!(*f0, *f1);
    }

    #[test]
    fn rerunning_a_decoder_is_bitwise_idempotent() {
        let recording = recording_with(&[
            (0, b"first\r\n", Bytes::new(), 0),
            (0, b"\x1b[1;31msecond", Bytes::new(), 0),
        ]);
        decode(&recording, 2);
        let pass1: Vec<_> = (0..2)
            .map(|i| recording.frame(i).expect("frame").terminal.expect("t"))
            .collect();
        decode(&recording, 3);
        let pass2: Vec<_> = (0..2)
            .map(|i| recording.frame(i).expect("frame").terminal.expect("t"))
            .collect();
        for (a, b) in pass1.iter().zip(&pass2) {
            assert_eq!(**a, **b);
        }
    }
}
