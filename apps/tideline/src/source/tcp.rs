use std::io::{self, Read};
use std::net::TcpStream;

use url::Url;

use crate::error::SourceError;

use super::ByteSource;

/// Raw TCP connection delivering ttyrec bytes with no protocol on top.
/// Always treated as a live stream.
pub struct TcpSource {
    peer: String,
    stream: TcpStream,
}

impl TcpSource {
    pub fn connect(url: &Url) -> Result<Self, SourceError> {
        let host = url
            .host_str()
            .ok_or_else(|| SourceError::MissingHost(url.to_string()))?;
        let port = url.port().unwrap_or(23);
        let stream = TcpStream::connect((host, port))?;
        Ok(Self {
            peer: format!("{host}:{port}"),
            stream,
        })
    }
}

impl ByteSource for TcpSource {
    fn description(&self) -> String {
        format!("tcp://{}", self.peer)
    }

    fn eof_is_permanent(&self) -> bool {
        true
    }

    fn could_stream(&self) -> bool {
        true
    }

    fn must_stream(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}
