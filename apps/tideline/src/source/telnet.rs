//! Telnet option negotiation, just enough to watch a recording over a
//! telnet-framed connection. IAC sequences are stripped from the delivered
//! byte stream and answered inline.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use url::Url;

use crate::error::SourceError;

use super::ByteSource;

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_BINARY: u8 = 0;
const OPT_ECHO: u8 = 1;
const OPT_SUPPRESS_GA: u8 = 3;
const OPT_TERMINAL_TYPE: u8 = 24;
const OPT_NAWS: u8 = 31;
const OPT_FLOW_CONTROL: u8 = 33;
const OPT_NEW_ENVIRON: u8 = 39;

const TERMINAL_TYPE: &[u8] = b"DEC-VT220";

fn option_supported(opt: u8) -> bool {
    matches!(
        opt,
        OPT_BINARY
            | OPT_ECHO
            | OPT_SUPPRESS_GA
            | OPT_TERMINAL_TYPE
            | OPT_NAWS
            | OPT_FLOW_CONTROL
            | OPT_NEW_ENVIRON
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FilterState {
    Data,
    Iac,
    Will,
    Wont,
    Do,
    Dont,
    SbOption,
    SbData(u8),
    SbIac(u8),
}

/// Strips telnet negotiation out of a byte stream and produces the replies
/// the peer expects. Pure state machine; the owning source does the socket
/// I/O.
pub struct TelnetFilter {
    state: FilterState,
    sb_payload: Vec<u8>,
    refused_do: [bool; 256],
    refused_will: [bool; 256],
}

impl Default for TelnetFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self {
            state: FilterState::Data,
            sb_payload: Vec::new(),
            refused_do: [false; 256],
            refused_will: [false; 256],
        }
    }

    /// The unconditional option announcement sent right after connecting.
    pub fn hello() -> Vec<u8> {
        let mut out = Vec::new();
        for (cmd, opt) in [
            (WILL, OPT_BINARY),
            (DO, OPT_BINARY),
            (WILL, OPT_NEW_ENVIRON),
            (WILL, OPT_TERMINAL_TYPE),
            (WILL, OPT_NAWS),
            (WILL, OPT_FLOW_CONTROL),
            (DO, OPT_SUPPRESS_GA),
            (WILL, OPT_SUPPRESS_GA),
            (DO, OPT_ECHO),
            (WILL, OPT_ECHO),
        ] {
            out.extend_from_slice(&[IAC, cmd, opt]);
        }
        out
    }

    /// Feeds raw socket bytes. Display bytes land in `out`, protocol
    /// responses in `reply`.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>, reply: &mut Vec<u8>) {
        for &b in input {
            self.state = match self.state {
                FilterState::Data => {
                    if b == IAC {
                        FilterState::Iac
                    } else {
                        out.push(b);
                        FilterState::Data
                    }
                }
                FilterState::Iac => match b {
                    IAC => {
                        out.push(IAC);
                        FilterState::Data
                    }
                    WILL => FilterState::Will,
                    WONT => FilterState::Wont,
                    DO => FilterState::Do,
                    DONT => FilterState::Dont,
                    SB => FilterState::SbOption,
                    _ => FilterState::Data,
                },
                FilterState::Will => {
                    self.on_will(b, reply);
                    FilterState::Data
                }
                FilterState::Wont | FilterState::Dont => FilterState::Data,
                FilterState::Do => {
                    self.on_do(b, reply);
                    FilterState::Data
                }
                FilterState::SbOption => {
                    self.sb_payload.clear();
                    FilterState::SbData(b)
                }
                FilterState::SbData(opt) => {
                    if b == IAC {
                        FilterState::SbIac(opt)
                    } else {
                        self.sb_payload.push(b);
                        FilterState::SbData(opt)
                    }
                }
                FilterState::SbIac(opt) => match b {
                    SE => {
                        self.on_subnegotiation(opt, reply);
                        FilterState::Data
                    }
                    IAC => {
                        self.sb_payload.push(IAC);
                        FilterState::SbData(opt)
                    }
                    _ => FilterState::Data,
                },
            };
        }
    }

    fn on_do(&mut self, opt: u8, reply: &mut Vec<u8>) {
        if option_supported(opt) {
            // already announced in the hello burst; NAWS wants the size now
            if opt == OPT_NAWS {
                reply.extend_from_slice(&[IAC, SB, OPT_NAWS, 0, 80, 0, 24, IAC, SE]);
            }
        } else if !self.refused_do[opt as usize] {
            self.refused_do[opt as usize] = true;
            reply.extend_from_slice(&[IAC, WONT, opt]);
        }
    }

    fn on_will(&mut self, opt: u8, reply: &mut Vec<u8>) {
        let accepted = matches!(opt, OPT_BINARY | OPT_ECHO | OPT_SUPPRESS_GA);
        if !accepted && !self.refused_will[opt as usize] {
            self.refused_will[opt as usize] = true;
            reply.extend_from_slice(&[IAC, DONT, opt]);
        }
    }

    fn on_subnegotiation(&mut self, opt: u8, reply: &mut Vec<u8>) {
        match opt {
            // SEND -> IS "DEC-VT220"
            OPT_TERMINAL_TYPE if self.sb_payload.first() == Some(&1) => {
                reply.extend_from_slice(&[IAC, SB, OPT_TERMINAL_TYPE, 0]);
                reply.extend_from_slice(TERMINAL_TYPE);
                reply.extend_from_slice(&[IAC, SE]);
            }
            // SEND -> IS USERVAR "TERM" VALUE "vt220"
            OPT_NEW_ENVIRON if self.sb_payload.first() == Some(&1) => {
                reply.extend_from_slice(&[IAC, SB, OPT_NEW_ENVIRON, 0, 3]);
                reply.extend_from_slice(b"TERM");
                reply.push(1);
                reply.extend_from_slice(b"vt220");
                reply.extend_from_slice(&[IAC, SE]);
            }
            _ => {}
        }
    }
}

/// Telnet connection carrying ttyrec bytes, negotiation stripped.
pub struct TelnetSource {
    peer: String,
    stream: TcpStream,
    filter: TelnetFilter,
    pending: Vec<u8>,
}

impl TelnetSource {
    pub fn connect(url: &Url) -> Result<Self, SourceError> {
        let host = url
            .host_str()
            .ok_or_else(|| SourceError::MissingHost(url.to_string()))?;
        let port = url.port().unwrap_or(23);
        let mut stream = TcpStream::connect((host, port))?;
        stream.write_all(&TelnetFilter::hello())?;
        Ok(Self {
            peer: format!("{host}:{port}"),
            stream,
            filter: TelnetFilter::new(),
            pending: Vec::new(),
        })
    }
}

impl ByteSource for TelnetSource {
    fn description(&self) -> String {
        format!("telnet://{}", self.peer)
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
        loop {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                return Ok(n);
            }
            let mut raw = [0u8; 4096];
            let n = self.stream.read(&mut raw)?;
            if n == 0 {
                return Ok(0);
            }
            let mut reply = Vec::new();
            self.filter.feed(&raw[..n], &mut self.pending, &mut reply);
            if !reply.is_empty() {
                self.stream.write_all(&reply)?;
            }
            // all negotiation and nothing to deliver: read again
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(filter: &mut TelnetFilter, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut out = Vec::new();
        let mut reply = Vec::new();
        filter.feed(input, &mut out, &mut reply);
        (out, reply)
    }

    #[test]
    fn plain_bytes_pass_through() {
        let mut filter = TelnetFilter::new();
        let (out, reply) = feed(&mut filter, b"hello");
        assert_eq!(out, b"hello");
        assert!(reply.is_empty());
    }

    #[test]
    fn escaped_iac_is_unescaped() {
        let mut filter = TelnetFilter::new();
        let (out, _) = feed(&mut filter, &[b'a', IAC, IAC, b'b']);
        assert_eq!(out, vec![b'a', IAC, b'b']);
    }

    #[test]
    fn naws_request_gets_a_size_report() {
        let mut filter = TelnetFilter::new();
        let (out, reply) = feed(&mut filter, &[IAC, DO, OPT_NAWS]);
        assert!(out.is_empty());
        assert_eq!(reply, vec![IAC, SB, OPT_NAWS, 0, 80, 0, 24, IAC, SE]);
    }

    #[test]
    fn unsupported_option_is_refused_once() {
        let mut filter = TelnetFilter::new();
        let (_, reply) = feed(&mut filter, &[IAC, DO, 200]);
        assert_eq!(reply, vec![IAC, WONT, 200]);
        let (_, reply) = feed(&mut filter, &[IAC, DO, 200]);
        assert!(reply.is_empty(), "refusals must not loop");
    }

    #[test]
    fn unsupported_will_is_refused() {
        let mut filter = TelnetFilter::new();
        let (_, reply) = feed(&mut filter, &[IAC, WILL, OPT_NAWS]);
        assert_eq!(reply, vec![IAC, DONT, OPT_NAWS]);
    }

    #[test]
    fn terminal_type_send_answers_vt220() {
        let mut filter = TelnetFilter::new();
        let (_, reply) = feed(&mut filter, &[IAC, SB, OPT_TERMINAL_TYPE, 1, IAC, SE]);
        let mut expected = vec![IAC, SB, OPT_TERMINAL_TYPE, 0];
        expected.extend_from_slice(b"DEC-VT220");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(reply, expected);
    }

    #[test]
    fn new_environ_send_answers_term() {
        let mut filter = TelnetFilter::new();
        let (_, reply) = feed(&mut filter, &[IAC, SB, OPT_NEW_ENVIRON, 1, IAC, SE]);
        let mut expected = vec![IAC, SB, OPT_NEW_ENVIRON, 0, 3];
        expected.extend_from_slice(b"TERM");
        expected.push(1);
        expected.extend_from_slice(b"vt220");
        expected.extend_from_slice(&[IAC, SE]);
        assert_eq!(reply, expected);
    }

    #[test]
    fn negotiation_interleaved_with_data() {
        let mut filter = TelnetFilter::new();
        let mut input = b"ab".to_vec();
        input.extend_from_slice(&[IAC, WILL, OPT_ECHO]);
        input.extend_from_slice(b"cd");
        let (out, reply) = feed(&mut filter, &input);
        assert_eq!(out, b"abcd");
        assert!(reply.is_empty());
    }

    #[test]
    fn hello_announces_the_expected_options() {
        let hello = TelnetFilter::hello();
        assert_eq!(hello.len(), 30);
        assert_eq!(&hello[..3], &[IAC, WILL, OPT_BINARY]);
        assert_eq!(&hello[3..6], &[IAC, DO, OPT_BINARY]);
        assert_eq!(&hello[27..], &[IAC, WILL, OPT_ECHO]);
    }
}
