//! A point-to-point [`Transport`] over a byte stream.
//!
//! Each message travels as one JSON document followed by a NUL byte. There
//! is no bus daemon: whatever one end sends, the other end receives.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{trace, warn};

use crate::error::*;
use crate::event_loop::poll;
use crate::message::{Message, MessageKind};
use crate::stream::{self, Stream};
use crate::transport::{DispatchStatus, Transport, WatchEvent};
use crate::watch::{Watch, WatchFlags, WatchId};

static NEXT_PEER: AtomicU32 = AtomicU32::new(1);

const READ_CHUNK: usize = 64 * 1024;

/// Largest unterminated frame a peer may leave in the receive buffer.
pub const MAX_FRAME_LEN: usize = 128 * 1024 * 1024;

/// Result of scanning a receive buffer for a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// A complete frame was found
    Complete {
        /// The frame payload (without NUL terminator)
        message: Vec<u8>,
        /// Number of bytes consumed from input (including NUL terminator)
        consumed: usize,
    },
    /// More data is needed
    Incomplete,
    /// A terminated frame that cannot be a message; skip `consumed` bytes
    Invalid { error: String, consumed: usize },
}

/// Find the first NUL terminated frame in `buf`.
///
/// # Arguments
///
/// * `buf` - The receive buffer
///
/// # Returns
///
/// * `ParseResult::Complete` - A complete frame was found
/// * `ParseResult::Incomplete` - No terminator yet
/// * `ParseResult::Invalid` - The frame is not a JSON object
///
/// # Example
///
/// ```
/// use simpledbus::peer::{parse_frame, ParseResult};
///
/// let buf = b"{\"kind\":\"Signal\"}\0{\"kind";
/// match parse_frame(buf) {
///     ParseResult::Complete { consumed, .. } => assert_eq!(consumed, 18),
///     _ => panic!("Expected complete frame"),
/// }
/// ```
pub fn parse_frame(buf: &[u8]) -> ParseResult {
    let Some(pos) = buf.iter().position(|&b| b == 0) else {
        return ParseResult::Incomplete;
    };
    let message = &buf[..pos];
    let consumed = pos + 1;

    match std::str::from_utf8(message) {
        Ok(s) if s.trim_start().starts_with('{') => ParseResult::Complete {
            message: message.to_vec(),
            consumed,
        },
        Ok(s) if s.trim().is_empty() => ParseResult::Invalid {
            error: "Empty message".into(),
            consumed,
        },
        Ok(_) => ParseResult::Invalid {
            error: "Message is not a JSON object".into(),
            consumed,
        },
        Err(_) => ParseResult::Invalid {
            error: "Message is not valid UTF-8".into(),
            consumed,
        },
    }
}

/// Serialize `message` with its NUL terminator.
pub fn serialize_message(message: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_string(message).map_err(map_context!())?;
    let mut bytes = json.into_bytes();
    bytes.push(0);
    Ok(bytes)
}

/// Parse a frame payload as returned in `ParseResult::Complete`.
pub fn parse_payload(message: &[u8]) -> Result<Message> {
    serde_json::from_slice(message).map_err(map_context!())
}

pub struct PeerTransport {
    stream: Option<Box<dyn Stream>>,
    unique_name: String,
    recv_buf: Vec<u8>,
    max_frame_len: usize,
    send_buf: Vec<u8>,
    inbox: VecDeque<Message>,
    next_serial: u32,
    watch: Option<Watch>,
    watch_events: VecDeque<WatchEvent>,
}

impl PeerTransport {
    /// Two transports connected to each other.
    pub fn pair() -> Result<(PeerTransport, PeerTransport)> {
        let (a, b) = UnixStream::pair().map_err(map_context!())?;
        Ok((PeerTransport::from_stream(a)?, PeerTransport::from_stream(b)?))
    }

    /// Connect to `address`, see [`stream::connect`].
    pub fn connect(address: &str) -> Result<PeerTransport> {
        PeerTransport::from_boxed(stream::connect(address)?)
    }

    pub fn from_stream<S: Stream + 'static>(stream: S) -> Result<PeerTransport> {
        PeerTransport::from_boxed(Box::new(stream))
    }

    fn from_boxed(mut stream: Box<dyn Stream>) -> Result<PeerTransport> {
        stream.set_nonblocking(true)?;
        let watch = Watch {
            id: WatchId(1),
            fd: stream.as_raw_fd(),
            flags: WatchFlags::READABLE,
            enabled: true,
        };
        let unique_name = format!(
            ":{}.{}",
            std::process::id(),
            NEXT_PEER.fetch_add(1, Ordering::Relaxed)
        );
        trace!(%unique_name, fd = watch.fd, "peer transport");

        Ok(PeerTransport {
            stream: Some(stream),
            unique_name,
            recv_buf: Vec::new(),
            max_frame_len: MAX_FRAME_LEN,
            send_buf: Vec::new(),
            inbox: VecDeque::new(),
            next_serial: 1,
            watch_events: VecDeque::from(vec![WatchEvent::Added(watch.clone())]),
            watch: Some(watch),
        })
    }

    /// A peer sending more than `len` bytes without a terminator is
    /// disconnected.
    pub fn set_max_frame_len(&mut self, len: usize) {
        self.max_frame_len = len;
    }

    fn next_serial(&mut self) -> u32 {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.checked_add(1).unwrap_or(1);
        serial
    }

    fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown();
        }
        if let Some(watch) = self.watch.take() {
            self.watch_events.push_back(WatchEvent::Removed(watch.id));
        }
        self.send_buf.clear();
        trace!(unique_name = %self.unique_name, "peer disconnected");
    }

    /// Ask for WRITABLE exactly while output is queued.
    fn update_interest(&mut self) {
        let Some(watch) = self.watch.as_mut() else {
            return;
        };
        let mut flags = WatchFlags::READABLE;
        if !self.send_buf.is_empty() {
            flags |= WatchFlags::WRITABLE;
        }
        if watch.flags != flags {
            watch.flags = flags;
            self.watch_events.push_back(WatchEvent::Toggled(watch.clone()));
        }
    }

    /// Write as much queued output as the stream takes.
    fn flush(&mut self) -> Result<()> {
        while !self.send_buf.is_empty() {
            let Some(stream) = self.stream.as_mut() else {
                return Err(context!(ErrorKind::Disconnected));
            };
            match stream.write(&self.send_buf) {
                Ok(0) => {
                    self.disconnect();
                    return Err(context!(ErrorKind::Disconnected));
                }
                Ok(n) => {
                    self.send_buf.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let kind = ErrorKind::from(&e);
                    if kind == ErrorKind::Disconnected {
                        self.disconnect();
                    }
                    return Err(context!(e, kind));
                }
            }
        }
        Ok(())
    }

    /// Read everything available and split it into messages.
    fn fill(&mut self) -> Result<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let Some(stream) = self.stream.as_mut() else {
                break;
            };
            match stream.read(&mut chunk) {
                Ok(0) => {
                    self.disconnect();
                    break;
                }
                Ok(n) => {
                    self.recv_buf.extend_from_slice(&chunk[..n]);
                    self.split_frames();
                    if self.recv_buf.len() > self.max_frame_len {
                        warn!(
                            unique_name = %self.unique_name,
                            buffered = self.recv_buf.len(),
                            limit = self.max_frame_len,
                            "frame too large"
                        );
                        self.recv_buf.clear();
                        self.disconnect();
                        break;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let kind = ErrorKind::from(&e);
                    if kind != ErrorKind::Disconnected {
                        return Err(context!(e, kind));
                    }
                    self.disconnect();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Move every complete frame from the receive buffer to the inbox.
    fn split_frames(&mut self) {
        loop {
            match parse_frame(&self.recv_buf) {
                ParseResult::Complete { message, consumed } => {
                    self.recv_buf.drain(..consumed);
                    match parse_payload(&message) {
                        Ok(message) => self.inbox.push_back(message),
                        Err(e) => warn!(error = %e, "dropping undecodable message"),
                    }
                }
                ParseResult::Invalid { error, consumed } => {
                    self.recv_buf.drain(..consumed);
                    warn!(%error, "dropping invalid frame");
                }
                ParseResult::Incomplete => break,
            }
        }
    }

    fn handle_io(&mut self, flags: WatchFlags) -> Result<()> {
        if flags.contains(WatchFlags::WRITABLE) {
            self.flush()?;
        }
        if flags.intersects(WatchFlags::READABLE | WatchFlags::HANGUP | WatchFlags::ERROR) {
            self.fill()?;
        }
        self.update_interest();
        Ok(())
    }

    fn take_reply(&mut self, serial: u32) -> Option<Message> {
        let pos = self.inbox.iter().position(|m| {
            m.reply_serial == Some(serial)
                && matches!(m.kind, MessageKind::MethodReturn | MessageKind::Error)
        })?;
        self.inbox.remove(pos)
    }
}

impl Transport for PeerTransport {
    fn send(&mut self, mut message: Message) -> Result<u32> {
        if self.stream.is_none() {
            return Err(context!(ErrorKind::Disconnected));
        }
        message.serial = self.next_serial();
        message.sender = Some(self.unique_name.clone());
        let bytes = serialize_message(&message)?;

        self.send_buf.extend_from_slice(&bytes);
        let flushed = self.flush();
        self.update_interest();
        flushed?;
        Ok(message.serial)
    }

    fn send_with_reply_and_block(&mut self, message: Message) -> Result<Message> {
        let serial = self.send(message)?;
        loop {
            if let Some(reply) = self.take_reply(serial) {
                return Ok(reply);
            }
            let Some(stream) = self.stream.as_ref() else {
                return Err(context!(ErrorKind::Disconnected));
            };
            let mut fds = [libc::pollfd {
                fd: stream.as_raw_fd(),
                events: self
                    .watch
                    .as_ref()
                    .map_or(WatchFlags::READABLE, |w| w.flags)
                    .to_poll_events(),
                revents: 0,
            }];
            poll(&mut fds, -1)?;
            self.handle_io(WatchFlags::from_poll_revents(fds[0].revents))?;
        }
    }

    fn dispatch_status(&self) -> DispatchStatus {
        if self.inbox.is_empty() {
            DispatchStatus::Complete
        } else {
            DispatchStatus::DataRemains
        }
    }

    fn pop_message(&mut self) -> Option<Message> {
        self.inbox.pop_front()
    }

    fn poll_watch_event(&mut self) -> Option<WatchEvent> {
        self.watch_events.pop_front()
    }

    fn handle_watch(&mut self, id: WatchId, flags: WatchFlags) -> Result<()> {
        match self.watch {
            Some(ref w) if w.id == id => self.handle_io(flags),
            _ => Ok(()),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn unique_name(&self) -> Option<&str> {
        Some(&self.unique_name)
    }

    fn close(&mut self) {
        if self.stream.is_some() {
            // best effort, the peer may be gone already
            let _ = self.flush();
            self.disconnect();
        }
    }
}
