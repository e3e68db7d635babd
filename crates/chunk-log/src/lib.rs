//! Append-only byte log with chunk-level timestamps, plus blocking reader
//! adapters and transparent decompression overlays.
//!
//! The log is the hand-off point between a source thread that appends chunks
//! as they arrive and analyzer threads that consume them. Readers that reach
//! the end of the log block until either more bytes arrive or the source
//! declares the log complete.

mod compress;
mod log;
mod reader;

pub use compress::{overlay, Compression};
pub use log::{CancelToken, ChunkedByteLog, LogError};
pub use reader::{is_cancelled_io, LogReader};
