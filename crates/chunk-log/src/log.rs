use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// How long a blocked reader sleeps between cancel-flag polls. Cancellation
/// does not signal the condvar, so waits are sliced.
const WAIT_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LogError {
    #[error("wait on byte log cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag shared between a session and the threads
/// that block on the byte log.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct LogState {
    chunks: Vec<Bytes>,
    cumulative: Vec<u64>,
    stamps: Vec<SystemTime>,
    complete: bool,
}

impl LogState {
    fn len(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Index of the chunk containing `offset`. Binary search over the
    /// cumulative chunk-end offsets.
    fn chunk_index(&self, offset: u64) -> usize {
        self.cumulative.partition_point(|&end| end <= offset)
    }

    fn chunk_start(&self, index: usize) -> u64 {
        if index == 0 {
            0
        } else {
            self.cumulative[index - 1]
        }
    }
}

/// An ordered sequence of immutable byte chunks, each stamped with its
/// append time. Chunks are never copied on append and never removed.
pub struct ChunkedByteLog {
    state: Mutex<LogState>,
    grew: Condvar,
}

impl Default for ChunkedByteLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedByteLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            grew: Condvar::new(),
        }
    }

    /// Appends a chunk, stamping it with the current wall clock. Empty
    /// chunks are ignored. Wakes every blocked reader.
    pub fn append(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        let end = state.len() + chunk.len() as u64;
        state.cumulative.push(end);
        state.chunks.push(chunk);
        state.stamps.push(SystemTime::now());
        drop(state);
        self.grew.notify_all();
    }

    pub fn len(&self) -> u64 {
        self.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the log complete: no further appends will arrive. Readers
    /// blocked at the end of the log return EOF.
    pub fn mark_complete(&self) {
        self.state.lock().complete = true;
        self.grew.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    /// Copies bytes starting at `offset` into `dst`, stopping at the end of
    /// the containing chunk. Short reads at chunk boundaries are part of the
    /// contract; callers loop. Returns 0 only at the end of a complete log.
    /// Blocks while `offset` is past the end of an incomplete log.
    pub fn read_span(
        &self,
        offset: u64,
        dst: &mut [u8],
        cancel: &CancelToken,
    ) -> Result<usize, LogError> {
        if dst.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            if offset < state.len() {
                break;
            }
            if state.complete {
                return Ok(0);
            }
            if cancel.is_cancelled() {
                return Err(LogError::Cancelled);
            }
            self.grew.wait_for(&mut state, WAIT_SLICE);
        }
        let index = state.chunk_index(offset);
        let in_chunk = (offset - state.chunk_start(index)) as usize;
        let chunk = &state.chunks[index];
        let n = dst.len().min(chunk.len() - in_chunk);
        dst[..n].copy_from_slice(&chunk[in_chunk..in_chunk + n]);
        Ok(n)
    }

    /// Returns the rest of the chunk containing `offset` as a zero-copy
    /// slice, together with the chunk's append timestamp. `None` at the end
    /// of a complete log; blocks at the end of an incomplete one.
    pub fn read_chunk(
        &self,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<Option<(Bytes, SystemTime)>, LogError> {
        let mut state = self.state.lock();
        loop {
            if offset < state.len() {
                break;
            }
            if state.complete {
                return Ok(None);
            }
            if cancel.is_cancelled() {
                return Err(LogError::Cancelled);
            }
            self.grew.wait_for(&mut state, WAIT_SLICE);
        }
        let index = state.chunk_index(offset);
        let in_chunk = (offset - state.chunk_start(index)) as usize;
        let rest = state.chunks[index].slice(in_chunk..);
        Ok(Some((rest, state.stamps[index])))
    }

    /// Append timestamp of the chunk containing `offset`, if present.
    pub fn chunk_time(&self, offset: u64) -> Option<SystemTime> {
        let state = self.state.lock();
        if offset >= state.len() {
            return None;
        }
        Some(state.stamps[state.chunk_index(offset)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reads_stop_at_chunk_boundaries() {
        let log = ChunkedByteLog::new();
        log.append(Bytes::from_static(b"abc"));
        log.append(Bytes::from_static(b"defgh"));
        log.mark_complete();
        let cancel = CancelToken::new();
        let mut buf = [0u8; 16];

        let n = log.read_span(0, &mut buf, &cancel).expect("read");
        assert_eq!(&buf[..n], b"abc");
        let n = log.read_span(1, &mut buf, &cancel).expect("read");
        assert_eq!(&buf[..n], b"bc");
        let n = log.read_span(3, &mut buf, &cancel).expect("read");
        assert_eq!(&buf[..n], b"defgh");
        let n = log.read_span(8, &mut buf, &cancel).expect("read");
        assert_eq!(n, 0);
        assert_eq!(log.len(), 8);
    }

    #[test]
    fn read_chunk_returns_rest_and_stamp() {
        let log = ChunkedByteLog::new();
        log.append(Bytes::from_static(b"hello"));
        log.mark_complete();
        let cancel = CancelToken::new();
        let (rest, _stamp) = log.read_chunk(2, &cancel).expect("read").expect("some");
        assert_eq!(&rest[..], b"llo");
        assert!(log.read_chunk(5, &cancel).expect("read").is_none());
    }

    #[test]
    fn blocked_reader_wakes_on_append() {
        let log = Arc::new(ChunkedByteLog::new());
        let writer = Arc::clone(&log);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.append(Bytes::from_static(b"late"));
            writer.mark_complete();
        });
        let cancel = CancelToken::new();
        let mut buf = [0u8; 8];
        let n = log.read_span(0, &mut buf, &cancel).expect("read");
        assert_eq!(&buf[..n], b"late");
        handle.join().expect("writer thread");
    }

    #[test]
    fn cancel_unblocks_reader() {
        let log = Arc::new(ChunkedByteLog::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut buf = [0u8; 8];
        assert!(matches!(
            log.read_span(0, &mut buf, &cancel),
            Err(LogError::Cancelled)
        ));
    }

    #[test]
    fn stamps_are_non_decreasing() {
        let log = ChunkedByteLog::new();
        log.append(Bytes::from_static(b"a"));
        log.append(Bytes::from_static(b"b"));
        let t0 = log.chunk_time(0).expect("stamp");
        let t1 = log.chunk_time(1).expect("stamp");
        assert!(t1 >= t0);
    }
}
