//! Byte sources and the pump thread that drains them into the byte log.

pub mod file;
pub mod http;
pub mod tcp;
pub mod telnet;
pub mod termcast;

use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chunk_log::{CancelToken, ChunkedByteLog};
use tracing::{debug, warn};
use url::Url;

use crate::error::SourceError;
use crate::recording::Recording;

const RETRY_DELAY: Duration = Duration::from_millis(100);
const READ_BUF: usize = 16 * 1024;

/// A place bytes come from. Implementations block in `read`; the pump runs
/// each source on its own thread.
pub trait ByteSource: Send {
    fn description(&self) -> String;

    fn is_readable(&self) -> bool {
        true
    }

    /// True when a zero-byte read means the stream is finished for good
    /// (sockets), false when the underlying store may still grow (files).
    fn eof_is_permanent(&self) -> bool;

    /// Whether this source might turn out to be live.
    fn could_stream(&self) -> bool;

    /// Whether this source is live by construction.
    fn must_stream(&self) -> bool {
        false
    }

    /// Size hint. Never an overestimate.
    fn declared_length(&self) -> Option<u64> {
        None
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Maps a URI (or bare path) onto a source. `follow` turns a local file into
/// a growing one that is re-polled at EOF.
pub fn open_source(uri: &str, follow: bool) -> Result<Box<dyn ByteSource>, SourceError> {
    if !uri.contains("://") {
        return Ok(Box::new(file::FileSource::open(Path::new(uri), follow)?));
    }
    let url = Url::parse(uri)?;
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| SourceError::UnsupportedScheme("file".into()))?;
            Ok(Box::new(file::FileSource::open(&path, follow)?))
        }
        "http" | "https" => Ok(Box::new(http::HttpSource::open(url)?)),
        "tcp" => Ok(Box::new(tcp::TcpSource::connect(&url)?)),
        "telnet" => Ok(Box::new(telnet::TelnetSource::connect(&url)?)),
        "termcast" | "dgamelaunch" => Ok(Box::new(termcast::TermcastSource::connect(&url)?)),
        other => Err(SourceError::UnsupportedScheme(other.to_string())),
    }
}

/// Drains the source into the log until EOF or cancellation. A transient EOF
/// is retried after a short sleep; bytes arriving after one mark the
/// recording as a live stream. `on_read` observes the running byte total.
/// Returns false when the source failed rather than finishing.
pub fn pump(
    mut source: Box<dyn ByteSource>,
    log: Arc<ChunkedByteLog>,
    recording: Arc<Recording>,
    cancel: CancelToken,
    on_read: impl Fn(u64),
) -> bool {
    if source.must_stream() {
        recording.set_streaming(true);
    }
    let mut buf = vec![0u8; READ_BUF];
    let mut saw_transient_eof = false;
    let mut clean = true;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match source.read(&mut buf) {
            Ok(0) => {
                if source.eof_is_permanent() {
                    break;
                }
                saw_transient_eof = true;
                std::thread::sleep(RETRY_DELAY);
            }
            Ok(n) => {
                if saw_transient_eof && source.could_stream() {
                    recording.set_streaming(true);
                }
                recording.touch_activity();
                log.append(Bytes::copy_from_slice(&buf[..n]));
                on_read(log.len());
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                std::thread::sleep(RETRY_DELAY);
            }
            Err(err) => {
                warn!(target: "source", source = %source.description(), %err, "read failed");
                clean = false;
                break;
            }
        }
    }
    debug!(target: "source", source = %source.description(), bytes = log.len(), "pump finished");
    log.mark_complete();
    clean
}

/// In-memory source, mainly for tests and programmatic ingestion.
pub struct BufferSource {
    data: Bytes,
    pos: usize,
}

impl BufferSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl ByteSource for BufferSource {
    fn description(&self) -> String {
        format!("buffer ({} bytes)", self.data.len())
    }

    fn eof_is_permanent(&self) -> bool {
        true
    }

    fn could_stream(&self) -> bool {
        false
    }

    fn declared_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
