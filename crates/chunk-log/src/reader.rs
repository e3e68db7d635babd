use std::io::{self, Read};
use std::sync::Arc;

use crate::log::{CancelToken, ChunkedByteLog, LogError};

/// Blocking `Read` adapter over a [`ChunkedByteLog`]. Returns `Ok(0)` only
/// once the log is complete, so decompressors layered on top see a normal
/// stream that ends exactly when the source does.
pub struct LogReader {
    log: Arc<ChunkedByteLog>,
    offset: u64,
    cancel: CancelToken,
}

impl LogReader {
    pub fn new(log: Arc<ChunkedByteLog>, cancel: CancelToken) -> Self {
        Self {
            log,
            offset: 0,
            cancel,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self
            .log
            .read_span(self.offset, buf, &self.cancel)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Whether an I/O error originated from a cancelled log wait. Cancellation
/// is mapped to `ErrorKind::Other` rather than `Interrupted` so that
/// decompressors do not retry it.
pub fn is_cancelled_io(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<LogError>())
        .unwrap_or(false)
}
