use std::io::{self, Read};

use url::Url;

use crate::error::SourceError;

use super::ByteSource;

/// A recording fetched over HTTP. The body is streamed, not buffered, so a
/// slow-loading download still decodes as it arrives. HTTP sources are never
/// flagged as live streams.
pub struct HttpSource {
    url: String,
    response: reqwest::blocking::Response,
    length: Option<u64>,
}

impl HttpSource {
    pub fn open(url: Url) -> Result<Self, SourceError> {
        let response = reqwest::blocking::get(url.clone())?.error_for_status()?;
        let length = response.content_length();
        Ok(Self {
            url: url.to_string(),
            response,
            length,
        })
    }
}

impl ByteSource for HttpSource {
    fn description(&self) -> String {
        self.url.clone()
    }

    fn eof_is_permanent(&self) -> bool {
        true
    }

    fn could_stream(&self) -> bool {
        false
    }

    fn declared_length(&self) -> Option<u64> {
        self.length
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.response.read(buf)
    }
}
