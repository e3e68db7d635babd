//! VT320/ANSI terminal emulation over a copy-on-write character grid.
//!
//! The emulator is a pure state machine: bytes in, grid mutations out. It is
//! cheap to clone (rows are reference counted and copied on first write), so
//! a decoder can snapshot the terminal after every frame without copying the
//! whole grid.

pub mod attr;
mod charsets;
mod emulator;
mod grid;

pub use charsets::{cp437_to_unicode, dec_special_to_unicode};
pub use emulator::{Encoding, EncodingOverride, Terminal};
pub use grid::Row;
