//! Termcast bootstrapping: drive the menu far enough to start watching the
//! session named by the URL path, then hand the byte stream over verbatim.

use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info};
use url::Url;
use vt_emu::Terminal;

use crate::error::SourceError;

use super::telnet::TelnetFilter;
use super::ByteSource;

/// Socket read timeout. Short enough to notice menu quiescence promptly.
const POLL_TIMEOUT: Duration = Duration::from_millis(250);
/// How long the menu must stay quiet before it is considered settled.
const MENU_QUIESCENCE: Duration = Duration::from_secs(1);

const LISTINGS_MARKER: &str = "are in progress";
const RESIZE_HINT: &str = "(use uppercase to try to change size)";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MenuState {
    /// Waiting for the listings screen to show up.
    Loading,
    /// Listings visible; waiting for quiescence, then pick or page.
    Menu,
    /// Selection sent; bytes now belong to the recording.
    Watching,
}

/// A termcast (or dgamelaunch) menu session. Pre-menu bytes are consumed by
/// an internal 80x24 terminal and never delivered downstream.
pub struct TermcastSource {
    peer: String,
    stream: TcpStream,
    filter: TelnetFilter,
    term: Terminal,
    state: MenuState,
    last_byte: Instant,
    entry: Regex,
    pending: Vec<u8>,
}

impl TermcastSource {
    pub fn connect(url: &Url) -> Result<Self, SourceError> {
        let host = url
            .host_str()
            .ok_or_else(|| SourceError::MissingHost(url.to_string()))?;
        let port = url.port().unwrap_or(23);
        let mut stream = TcpStream::connect((host, port))?;
        stream.set_read_timeout(Some(POLL_TIMEOUT))?;
        stream.write_all(&TelnetFilter::hello())?;
        // dgamelaunch fronts its watch menu behind one extra keypress
        if url.scheme() == "dgamelaunch" {
            stream.write_all(b"w")?;
        }
        let path = url.path().trim_start_matches('/').to_lowercase();
        let entry = Regex::new(&format!(r"(?i)^([a-z])\) {}", regex::escape(&path))).map_err(
            |source| SourceError::Pattern {
                path: path.clone(),
                source,
            },
        )?;
        Ok(Self {
            peer: format!("{host}:{port}"),
            stream,
            filter: TelnetFilter::new(),
            term: Terminal::new(80, 24),
            state: MenuState::Loading,
            last_byte: Instant::now(),
            entry,
            pending: Vec::new(),
        })
    }

    fn absorb_menu_bytes(&mut self, bytes: &[u8]) {
        self.term.feed_bytes(bytes);
        self.last_byte = Instant::now();
        if self.state == MenuState::Loading && self.screen_contains(LISTINGS_MARKER) {
            debug!(target: "termcast", peer = %self.peer, "listings visible");
            self.state = MenuState::Menu;
        }
    }

    fn screen_contains(&self, needle: &str) -> bool {
        (0..self.term.rows()).any(|row| self.term.row_text(row).contains(needle))
    }

    /// Called once the settled menu is on screen: press the entry's letter,
    /// or page onward when the entry is not listed yet.
    fn act_on_menu(&mut self) -> io::Result<()> {
        for row in 0..self.term.rows() {
            let text = self.term.row_text(row);
            let Some(caps) = self.entry.captures(text.trim_end()) else {
                continue;
            };
            let letter = caps[1]
                .chars()
                .next()
                .unwrap_or('a')
                .to_ascii_lowercase();
            let key = if self.screen_contains(RESIZE_HINT) {
                letter.to_ascii_uppercase().to_string()
            } else {
                format!("{letter}r")
            };
            info!(target: "termcast", peer = %self.peer, %key, "selecting entry");
            self.stream.write_all(key.as_bytes())?;
            self.state = MenuState::Watching;
            return Ok(());
        }
        debug!(target: "termcast", peer = %self.peer, "entry not listed, paging");
        self.stream.write_all(b">")?;
        self.last_byte = Instant::now();
        Ok(())
    }
}

impl ByteSource for TermcastSource {
    fn description(&self) -> String {
        format!("termcast://{}", self.peer)
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
            if self.state == MenuState::Watching && !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                return Ok(n);
            }
            let mut raw = [0u8; 4096];
            match self.stream.read(&mut raw) {
                Ok(0) => return Ok(0),
                Ok(n) => {
                    let mut out = Vec::new();
                    let mut reply = Vec::new();
                    self.filter.feed(&raw[..n], &mut out, &mut reply);
                    if !reply.is_empty() {
                        self.stream.write_all(&reply)?;
                    }
                    match self.state {
                        MenuState::Watching => self.pending.extend_from_slice(&out),
                        _ => {
                            if !out.is_empty() {
                                self.absorb_menu_bytes(&out);
                            }
                        }
                    }
                }
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    match self.state {
                        MenuState::Menu if self.last_byte.elapsed() >= MENU_QUIESCENCE => {
                            self.act_on_menu()?;
                        }
                        MenuState::Watching => return Err(err),
                        _ => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
