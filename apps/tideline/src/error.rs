use std::path::PathBuf;

use thiserror::Error;
use vt_emu::Encoding;

/// Errors opening or driving a byte source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported url scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("url {0:?} has no host")]
    MissingHost(String),
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot build menu pattern for {path:?}: {source}")]
    Pattern {
        path: String,
        source: regex::Error,
    },
}

/// Rejected changes to a running session's settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("encoding {0:?} was ruled out by the byte stream")]
    EncodingRuledOut(Encoding),
    #[error("session already closed")]
    Closed,
}

/// Cooperative cancellation, observed between work items. Never shown to
/// users.
#[derive(Debug, Error)]
#[error("pipeline cancelled")]
pub struct Cancelled;
