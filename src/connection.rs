//! Per-connection state and the non-blocking I/O paths
//!
//! A connection owns its socket, the read buffer the parser works over, and
//! the response head + mapped file pair the write path sends. Exactly one
//! component — reactor or worker — drives a connection at any moment; the
//! mutex around it exists to move it between threads, not to share it.

use std::io::{self, ErrorKind, IoSlice, Write};
use std::net::SocketAddr;

use memmap2::Mmap;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::debug;

use crate::db::UserStore;
use crate::handler::{Reply, Responder};
use crate::parser::buffer::RequestBuffer;
use crate::parser::request::{Progress, RequestParser};
use crate::response::{ResponseBuffer, Status};

/// What the connection needs from the reactor next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    /// Arm for read readiness.
    Read,
    /// Arm for write readiness.
    Write,
    /// Evict: deregister, close, drop the deadline.
    Close,
}

/// One accepted connection.
#[derive(Debug)]
pub struct HttpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    token: Token,
    buf: RequestBuffer,
    parser: RequestParser,
    head: ResponseBuffer,
    file: Option<Mmap>,
    head_sent: usize,
    file_sent: usize,
    bytes_to_send: usize,
    bytes_sent: usize,
    keep_alive: bool,
    want: Want,
}

impl HttpConnection {
    /// Wraps a freshly accepted stream.
    pub fn new(stream: TcpStream, peer: SocketAddr, token: Token) -> Self {
        Self {
            stream,
            peer,
            token,
            buf: RequestBuffer::new(),
            parser: RequestParser::new(),
            head: ResponseBuffer::new(),
            file: None,
            head_sent: 0,
            file_sent: 0,
            bytes_to_send: 0,
            bytes_sent: 0,
            keep_alive: false,
            want: Want::Read,
        }
    }

    /// The connection's slab token.
    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    /// Peer address, for logging.
    #[inline]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// What the connection asked for after its last processing step.
    #[inline]
    pub fn want(&self) -> Want {
        self.want
    }

    /// Drains the socket into the read buffer.
    ///
    /// Returns the bytes received; `Ok(0)` means the peer closed. Parser
    /// state is untouched, so the next [`Self::process`] resumes mid-request.
    pub fn fill(&mut self) -> io::Result<usize> {
        self.buf.fill(&mut self.stream)
    }

    /// Runs the state machine over everything buffered and, on a complete
    /// request, prepares the response. Worker entry point.
    pub fn process<S: UserStore>(&mut self, responder: &Responder, store: &mut S) -> Want {
        let want = match self.parser.advance(&mut self.buf) {
            Progress::Incomplete => Want::Read,
            Progress::Overflow => {
                debug!(peer = %self.peer, "declared body exceeds the read buffer");
                Want::Close
            }
            Progress::BadRequest => {
                self.keep_alive = self.parser.request().keep_alive;
                self.prepare_error(Status::BadRequest)
            }
            Progress::Complete => {
                let req = self.parser.request().clone();
                let reply = {
                    let body = req.body.clone().map(|range| self.buf.bytes(range));
                    responder.respond(&req, body, store)
                };
                self.keep_alive = req.keep_alive;
                match reply {
                    Reply::File(map) => self.prepare_file(map),
                    Reply::Error(status) => self.prepare_error(status),
                }
            }
        };

        self.want = want;
        want
    }

    fn prepare_file(&mut self, map: Option<Mmap>) -> Want {
        let len = map.as_ref().map_or(0, |m| m.len());
        self.head.clear();
        if !(self.head.status_line(Status::Ok) && self.head.headers(len, self.keep_alive)) {
            return Want::Close;
        }

        self.file = map;
        self.begin_send(len);
        Want::Write
    }

    fn prepare_error(&mut self, status: Status) -> Want {
        let form = status.form().unwrap_or_default();
        self.head.clear();
        self.file = None;
        let built = self.head.status_line(status)
            && self.head.headers(form.len(), self.keep_alive)
            && self.head.body(form);
        if !built {
            return Want::Close;
        }

        self.begin_send(0);
        Want::Write
    }

    fn begin_send(&mut self, file_len: usize) {
        self.head_sent = 0;
        self.file_sent = 0;
        self.bytes_sent = 0;
        self.bytes_to_send = self.head.len() + file_len;
    }

    /// Pushes the response out with vectored writes: segment 0 is the
    /// unsent head prefix, segment 1 the unsent file suffix.
    ///
    /// `Ok(Want::Write)` means the socket would block and the connection
    /// stays write-armed. On completion the mapping is dropped and the
    /// connection either resets for the next request (keep-alive) or asks
    /// to close.
    pub fn drive_write(&mut self) -> io::Result<Want> {
        loop {
            if self.bytes_to_send == 0 {
                return Ok(self.finish_response());
            }

            let head = &self.head.as_bytes()[self.head_sent..];
            let file: &[u8] = match &self.file {
                Some(map) => &map[self.file_sent..],
                None => &[],
            };
            let segments = [IoSlice::new(head), IoSlice::new(file)];

            match self.stream.write_vectored(&segments) {
                Ok(0) => {
                    self.file = None;
                    return Err(io::Error::from(ErrorKind::WriteZero));
                }
                Ok(n) => {
                    let from_head = n.min(head.len());
                    self.head_sent += from_head;
                    self.file_sent += n - from_head;
                    self.bytes_sent += n;
                    self.bytes_to_send -= n;
                }
                Err(e) => match e.kind() {
                    ErrorKind::WouldBlock => {
                        self.want = Want::Write;
                        return Ok(Want::Write);
                    }
                    ErrorKind::Interrupted => {}
                    _ => {
                        self.file = None;
                        return Err(e);
                    }
                },
            }
        }
    }

    fn finish_response(&mut self) -> Want {
        debug!(peer = %self.peer, bytes = self.bytes_sent, "response complete");
        self.file = None;
        self.head.clear();

        self.want = if self.keep_alive {
            self.reset();
            Want::Read
        } else {
            Want::Close
        };
        self.want
    }

    /// Readies the connection for the next sequential request.
    fn reset(&mut self) {
        self.buf.reset();
        self.parser.reset();
        self.head_sent = 0;
        self.file_sent = 0;
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.keep_alive = false;
    }

    /// Registers with the connection's currently wanted interest.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let token = self.token;
        let interest = self.interest();
        registry.register(&mut self.stream, token, interest)
    }

    /// Re-registers with the connection's currently wanted interest.
    pub fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let token = self.token;
        let interest = self.interest();
        registry.reregister(&mut self.stream, token, interest)
    }

    /// Removes the connection from the readiness set.
    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    #[inline]
    fn interest(&self) -> Interest {
        match self.want {
            Want::Write => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }
}
