//! Streaming ttyrec ingestion and decoding.
//!
//! Bytes flow from a [`source`] into a shared [`chunk_log::ChunkedByteLog`],
//! where an [`analyzer`] splits them into timestamped frames and a [`decoder`]
//! replays each frame through a VT320 emulator. The [`session`] coordinator
//! owns the worker pair per stage: a leading edge that races ahead on
//! best-guess assumptions and a backport that re-runs with corrected ones and
//! takes over once it catches up.

pub mod analyzer;
pub mod decoder;
pub mod error;
pub mod progress;
pub mod recording;
pub mod session;
pub mod source;
pub mod telemetry;
pub mod worker;
