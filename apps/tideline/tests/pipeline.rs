//! End-to-end ingestion runs over in-memory byte sources.

use std::io::Write;
use std::time::{Duration, Instant};

use flate2::write::GzEncoder;
use tideline::recording::{EncodingChoice, FileFormat};
use tideline::session::Session;
use tideline::source::BufferSource;
use vt_emu::Encoding;

fn record(sec: u32, usec: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&sec.to_le_bytes());
    out.extend_from_slice(&usec.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn record2(sec: u32, usec: u32, stream: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&sec.to_le_bytes());
    out.extend_from_slice(&usec.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.push(stream);
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

/// Polls until `check` passes or the deadline expires.
fn eventually(check: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn single_record_renders_hello() {
    let session = ingest(record(1_700_000_000, 0, b"hello"));
    assert_eq!(session.frame_count(), 1);
    assert_eq!(session.recording().file_format(), Some(FileFormat::Ttyrec));
    let term = session.frame(0).expect("frame").terminal.expect("snapshot");
    for (col, ch) in "hello".chars().enumerate() {
        assert_eq!(term.char_at(0, col), ch);
    }
    session.complete_cancel();
}

#[test]
fn frames_accumulate_and_keep_relative_time() {
    let mut bytes = record(100, 0, b"hello");
    bytes.extend(record(100, 500_000, b"!"));
    let session = ingest(bytes);
    assert_eq!(session.frame_count(), 2);
    let frame = session.frame(1).expect("frame 1");
    assert_eq!(frame.relative_ts, 0.5);
    let term = frame.terminal.expect("snapshot");
    assert_eq!(term.char_at(0, 5), '!');
    assert_eq!(session.frame_index_at_time(0.2), 0);
    assert_eq!(session.frame_index_at_time(0.5), 1);
    session.complete_cancel();
}

#[test]
fn multistream_frames_share_the_previous_screen() {
    let mut bytes = record2(10, 0, 0, b"hi");
    bytes.extend(record2(11, 0, 1, b"typed input"));
    bytes.extend(record2(12, 0, 0, b"!"));
    let session = ingest(bytes);
    assert_eq!(
        session.recording().file_format(),
        Some(FileFormat::MultistreamTtyrec)
    );
    assert_eq!(session.frame_count(), 3);
    let f0 = session.frame(0).expect("frame 0").terminal.expect("snapshot");
    let f1 = session.frame(1).expect("frame 1").terminal.expect("snapshot");
    assert!(
        std::sync::Arc::ptr_eq(&f0, &f1),
        "input frames must not disturb the screen"
    );
    let f2 = session.frame(2).expect("frame 2").terminal.expect("snapshot");
    assert_eq!(f2.char_at(0, 0), 'h');
    assert_eq!(f2.char_at(0, 1), 'i');
    assert_eq!(f2.char_at(0, 2), '!');
    session.complete_cancel();
}

#[test]
fn alt_screen_switch_pins_the_screen_size() {
    let session = ingest(record(5, 0, b"\x1b[?1049hX"));
    let term = session.frame(0).expect("frame").terminal.expect("snapshot");
    assert_eq!(term.cols(), 80);
    assert_eq!(term.rows(), 24);
    assert_eq!(term.char_at(0, 0), 'X');
    assert!(session.recording().auto_resize_marker_seen());
    session.complete_cancel();
}

#[test]
fn utf8_codepoint_split_across_frames_is_healed() {
    let euro = "€".as_bytes();
    let mut bytes = record(0, 0, &euro[..2]);
    let mut tail = euro[2..].to_vec();
    tail.extend_from_slice(b"A");
    bytes.extend(record(0, 100_000, &tail));
    let session = ingest(bytes);
    assert_eq!(session.frame_count(), 2);
    let f0 = session.frame(0).expect("frame 0");
    assert_eq!(f0.utf8_chop_tail, 2);
    let t0 = f0.terminal.expect("snapshot 0");
    assert_eq!(t0.char_at(0, 0), ' ', "split bytes must be deferred");
    let f1 = session.frame(1).expect("frame 1");
    assert_eq!(&f1.utf8_prefix[..], &euro[..2]);
    let t1 = f1.terminal.expect("snapshot 1");
    assert_eq!(t1.char_at(0, 0), '€');
    assert_eq!(t1.char_at(0, 1), 'A');
    session.complete_cancel();
}

#[test]
fn gzipped_ttyrec_is_detected_and_decoded() {
    let mut plain = record(50, 0, b"zip");
    plain.extend(record(51, 0, b"ped"));
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&plain).expect("gzip write");
    let session = ingest(encoder.finish().expect("gzip finish"));
    assert_eq!(session.recording().file_format(), Some(FileFormat::Ttyrec));
    assert_eq!(session.frame_count(), 2);
    let term = session.frame(1).expect("frame").terminal.expect("snapshot");
    for (col, ch) in "zipped".chars().enumerate() {
        assert_eq!(term.char_at(0, col), ch);
    }
    session.complete_cancel();
}

#[test]
fn microsecond_field_boundary() {
    let ok = ingest(record(1, 999_999, b"a"));
    assert_eq!(ok.recording().file_format(), Some(FileFormat::Ttyrec));
    assert_eq!(ok.frame_count(), 1);
    ok.complete_cancel();

    let bad = ingest(record(1, 1_000_000, b"a"));
    assert_eq!(bad.recording().file_format(), Some(FileFormat::Script));
    bad.complete_cancel();
}

#[test]
fn zero_length_payload_is_a_frame() {
    let session = ingest(record(7, 0, b""));
    assert_eq!(session.frame_count(), 1);
    let term = session.frame(0).expect("frame").terminal.expect("snapshot");
    assert_eq!(term.char_at(0, 0), ' ');
    session.complete_cancel();
}

#[test]
fn trailing_sliver_rejects_the_ttyrec_reading() {
    let mut bytes = record(3, 0, b"ok");
    bytes.extend_from_slice(&[0, 0, 0]);
    let session = ingest(bytes);
    assert_eq!(session.recording().file_format(), Some(FileFormat::Script));
    session.complete_cancel();
}

#[test]
fn invalid_utf8_degrades_the_auto_encoding() {
    // 0xb0 is the light-shade block in the IBM code page and invalid UTF-8
    let session = ingest(record(0, 0, &[0xb0]));
    assert_eq!(session.recording().actual_encoding(), Encoding::IbmCp437);
    eventually(
        || {
            session
                .frame(0)
                .and_then(|f| f.terminal)
                .is_some_and(|t| t.char_at(0, 0) == '░')
        },
        "redecode under the IBM code page",
    );
    session.complete_cancel();
}

#[test]
fn forced_size_redecodes_at_that_size() {
    let session = ingest(record(0, 0, b"wide"));
    session
        .set_forced_size(Some((132, 50)))
        .expect("session is open");
    eventually(
        || {
            session
                .frame(0)
                .and_then(|f| f.terminal)
                .is_some_and(|t| t.cols() == 132 && t.rows() == 50)
        },
        "redecode at the forced size",
    );
    session.complete_cancel();
}

#[test]
fn forced_script_format_reanalyzes() {
    let session = ingest(record(9, 0, b"raw"));
    assert_eq!(session.recording().file_format(), Some(FileFormat::Ttyrec));
    session
        .set_file_format(FileFormat::Script)
        .expect("session is open");
    eventually(
        || session.recording().file_format() == Some(FileFormat::Script),
        "reanalysis under the forced framing",
    );
    eventually(
        || {
            session
                .frame(0)
                .map(|f| f.raw.len() == 15)
                .unwrap_or(false)
        },
        "script frame carrying the verbatim record",
    );
    session.complete_cancel();
}

#[test]
fn manual_encoding_choice_sticks() {
    let session = ingest(record(0, 0, &[0xb0]));
    session
        .set_encoding(EncodingChoice::Latin1)
        .expect("latin1 is always available");
    assert_eq!(session.recording().actual_encoding(), Encoding::Latin1);
    eventually(
        || {
            session
                .frame(0)
                .and_then(|f| f.terminal)
                .is_some_and(|t| t.char_at(0, 0) == '°')
        },
        "redecode as latin-1",
    );
    session.complete_cancel();
}
