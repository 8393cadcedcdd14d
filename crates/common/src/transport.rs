//! TCP line transport for the control and data planes
//!
//! Every message is one newline-terminated JSON record (see
//! [`protocol::codec`]). Four socket roles are built on top of that framing:
//!
//! - [`Publisher`]: binds a port and fans each record out to every connected
//!   subscriber. Slow or dead subscribers are dropped, never waited on.
//! - [`Subscriber`]: connects to a publisher and reads records.
//! - [`Inbox`]: receiving end of a controller-to-device stream. Either binds
//!   and accepts one peer at a time, or connects out to the controller.
//! - [`ReplySocket`] / [`Requester`]: strict request/reply turn-taking on the
//!   control plane.
//!
//! All blocking reads carry a timeout so the owning thread can observe its
//! [`CancelToken`](crate::task::CancelToken) between reads.

use crate::{Error, Result};
use protocol::{
    MAX_FRAME_SIZE, ProtocolError, encode_line, frame_overflowed, frame_to_string, read_frame,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Write timeout applied to every publisher subscriber
pub const PUBLISH_WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Default read timeout used by data-plane readers
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of a single receive attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// One complete line, terminator stripped
    Line(String),
    /// Nothing arrived before the read timeout
    Timeout,
    /// The peer closed the connection
    Closed,
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

fn frame_too_large(size: usize) -> Error {
    Error::Protocol(ProtocolError::FrameTooLarge {
        size,
        max: MAX_FRAME_SIZE,
    })
}

fn terminated(line: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(line.len() + 1);
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');
    frame
}

/// Resolve `host:port` to the first socket address
pub fn resolve(addr: impl ToSocketAddrs) -> Result<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Transport("address resolved to nothing".to_string()))
}

/// Line reader over a TCP stream with a read timeout
///
/// Partial lines survive timeouts: bytes read before a timeout stay in the
/// internal buffer and are completed by the next call.
pub struct LineReader {
    reader: BufReader<TcpStream>,
    pending: Vec<u8>,
}

impl LineReader {
    pub fn new(stream: TcpStream, timeout: Duration) -> Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(timeout))?;
        Ok(Self {
            reader: BufReader::new(stream),
            pending: Vec::new(),
        })
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.reader.get_ref().peer_addr()?)
    }

    /// Clone the underlying stream, e.g. to write replies
    pub fn try_clone_stream(&self) -> Result<TcpStream> {
        Ok(self.reader.get_ref().try_clone()?)
    }

    pub fn recv(&mut self) -> Result<Received> {
        match read_frame(&mut self.reader, &mut self.pending) {
            Ok(0) => {
                self.pending.clear();
                Ok(Received::Closed)
            }
            Ok(_) => {
                if frame_overflowed(&self.pending) {
                    let size = self.pending.len();
                    self.pending.clear();
                    return Err(frame_too_large(size));
                }
                // A read stops short of the delimiter only at end of stream;
                // a trailing unterminated record is still delivered.
                let frame = std::mem::take(&mut self.pending);
                Ok(Received::Line(frame_to_string(frame)?))
            }
            Err(e) if is_timeout(&e) => Ok(Received::Timeout),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fan-out publisher bound to one port
pub struct Publisher {
    listener: TcpListener,
    local_addr: SocketAddr,
    subscribers: Vec<(SocketAddr, TcpStream)>,
}

impl Publisher {
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        debug!("Publisher bound on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            subscribers: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept pending subscribers and return how many are connected
    pub fn poll_subscribers(&mut self) -> usize {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = Self::prepare(&stream) {
                        warn!("Rejecting subscriber {}: {}", peer, e);
                        continue;
                    }
                    debug!("Subscriber {} connected to {}", peer, self.local_addr);
                    self.subscribers.push((peer, stream));
                }
                Err(e) if is_timeout(&e) => break,
                Err(e) => {
                    warn!("Accept failed on {}: {}", self.local_addr, e);
                    break;
                }
            }
        }
        self.subscribers.len()
    }

    fn prepare(stream: &TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(PUBLISH_WRITE_TIMEOUT))?;
        stream.set_nodelay(true)
    }

    /// Send one pre-encoded line to every subscriber
    ///
    /// Returns the number of subscribers that received it. Having no
    /// subscribers is not an error.
    pub fn send_line(&mut self, line: &str) -> Result<usize> {
        if line.contains('\n') {
            return Err(ProtocolError::EmbeddedNewline.into());
        }
        if line.len() > MAX_FRAME_SIZE {
            return Err(frame_too_large(line.len()));
        }
        self.poll_subscribers();

        let frame = terminated(line);
        let local = self.local_addr;
        self.subscribers.retain_mut(|(peer, stream)| {
            match stream.write_all(&frame).and_then(|_| stream.flush()) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Dropping subscriber {} of {}: {}", peer, local, e);
                    false
                }
            }
        });
        trace!("Published {} bytes to {} subscribers", frame.len(), self.subscribers.len());
        Ok(self.subscribers.len())
    }

    /// Encode and send one record
    pub fn send<T: Serialize>(&mut self, record: &T) -> Result<usize> {
        let line = encode_line(record)?;
        self.send_line(&line)
    }
}

/// Client side of a [`Publisher`]
pub struct Subscriber {
    reader: LineReader,
}

impl Subscriber {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        Ok(Self {
            reader: LineReader::new(stream, timeout)?,
        })
    }

    pub fn recv(&mut self) -> Result<Received> {
        self.reader.recv()
    }

    /// Receive and decode one record, `None` on timeout
    pub fn recv_record<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        match self.recv()? {
            Received::Line(line) => Ok(Some(protocol::decode_line(&line)?)),
            Received::Timeout => Ok(None),
            Received::Closed => Err(Error::Closed),
        }
    }
}

enum InboxMode {
    Bind(TcpListener),
    Connect(SocketAddr),
}

/// Receiving end of a controller-to-device stream
pub struct Inbox {
    mode: InboxMode,
    peer: Option<LineReader>,
    poll: Duration,
}

impl Inbox {
    /// Bind `addr` and accept one peer at a time
    pub fn bind(addr: impl ToSocketAddrs, poll: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            mode: InboxMode::Bind(listener),
            peer: None,
            poll,
        })
    }

    /// Connect out to `addr`, reconnecting whenever the link drops
    pub fn connect(addr: SocketAddr, poll: Duration) -> Self {
        Self {
            mode: InboxMode::Connect(addr),
            peer: None,
            poll,
        }
    }

    /// Bound address in bind mode
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.mode {
            InboxMode::Bind(listener) => listener.local_addr().ok(),
            InboxMode::Connect(_) => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.peer.is_some()
    }

    fn establish(&mut self) -> Result<bool> {
        let stream = match &self.mode {
            InboxMode::Bind(listener) => match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Inbox accepted {}", peer);
                    stream
                }
                Err(e) if is_timeout(&e) => return Ok(false),
                Err(e) => return Err(e.into()),
            },
            InboxMode::Connect(addr) => match TcpStream::connect_timeout(addr, self.poll) {
                Ok(stream) => {
                    debug!("Inbox connected to {}", addr);
                    stream
                }
                Err(e) => {
                    trace!("Inbox connect to {} failed: {}", addr, e);
                    return Ok(false);
                }
            },
        };
        self.peer = Some(LineReader::new(stream, self.poll)?);
        Ok(true)
    }

    /// Wait up to one poll interval for the next line
    ///
    /// `Closed` reports that the current peer went away; the next call waits
    /// for a new one.
    pub fn recv(&mut self) -> Result<Received> {
        if self.peer.is_none() && !self.establish()? {
            thread::sleep(self.poll);
            return Ok(Received::Timeout);
        }
        let Some(peer) = self.peer.as_mut() else {
            return Ok(Received::Timeout);
        };
        match peer.recv() {
            Ok(Received::Closed) => {
                self.peer = None;
                Ok(Received::Closed)
            }
            Ok(received) => Ok(received),
            Err(e) => {
                self.peer = None;
                Err(e)
            }
        }
    }
}

/// Server side of the request/reply pattern
pub struct ReplySocket {
    listener: TcpListener,
    poll: Duration,
}

impl ReplySocket {
    pub fn bind(addr: impl ToSocketAddrs, poll: Duration) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, poll })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next connection, waiting at most one poll interval
    pub fn accept(&self) -> Result<Option<ReplyConnection>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nodelay(true)?;
                let writer = stream.try_clone()?;
                Ok(Some(ReplyConnection {
                    reader: LineReader::new(stream, self.poll)?,
                    writer,
                    peer,
                }))
            }
            Err(e) if is_timeout(&e) => {
                thread::sleep(self.poll);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// One accepted control-plane connection
pub struct ReplyConnection {
    reader: LineReader,
    writer: TcpStream,
    peer: SocketAddr,
}

impl ReplyConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn recv(&mut self) -> Result<Received> {
        self.reader.recv()
    }

    pub fn reply(&mut self, line: &str) -> Result<()> {
        protocol::write_line(&mut self.writer, line)?;
        Ok(())
    }
}

/// Client side of the request/reply pattern
pub struct Requester {
    reader: LineReader,
    writer: TcpStream,
    timeout: Duration,
}

impl Requester {
    pub fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(timeout))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: LineReader::new(stream, timeout)?,
            writer,
            timeout,
        })
    }

    /// Send one line and wait for exactly one reply line
    pub fn request_line(&mut self, line: &str) -> Result<String> {
        protocol::write_line(&mut self.writer, line)?;
        match self.reader.recv()? {
            Received::Line(reply) => Ok(reply),
            Received::Timeout => Err(Error::Timeout(self.timeout)),
            Received::Closed => Err(Error::Closed),
        }
    }

    pub fn request<Req, Resp>(&mut self, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let line = encode_line(request)?;
        let reply = self.request_line(&line)?;
        Ok(protocol::decode_line(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn loopback_pair(timeout: Duration) -> (LineReader, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (LineReader::new(server, timeout).unwrap(), client)
    }

    #[test]
    fn test_line_reader_reassembles_split_lines() {
        let (mut reader, mut client) = loopback_pair(Duration::from_millis(50));

        client.write_all(b"{\"data\":\"he").unwrap();
        client.flush().unwrap();
        assert_eq!(reader.recv().unwrap(), Received::Timeout);

        client.write_all(b"llo\"}\n").unwrap();
        assert_eq!(
            reader.recv().unwrap(),
            Received::Line("{\"data\":\"hello\"}".to_string())
        );
    }

    #[test]
    fn test_line_reader_reports_close() {
        let (mut reader, client) = loopback_pair(Duration::from_millis(50));
        drop(client);
        assert_eq!(reader.recv().unwrap(), Received::Closed);
    }

    #[test]
    fn test_line_reader_caps_unterminated_stream() {
        let (mut reader, mut client) = loopback_pair(Duration::from_millis(200));
        let writer = thread::spawn(move || {
            let chunk = vec![b'x'; 1024 * 1024];
            for _ in 0..24 {
                if client.write_all(&chunk).is_err() {
                    break;
                }
            }
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let result = loop {
            match reader.recv() {
                Ok(Received::Timeout) if std::time::Instant::now() < deadline => continue,
                other => break other,
            }
        };
        match result {
            Err(Error::Protocol(ProtocolError::FrameTooLarge { size, .. })) => {
                assert!(size <= MAX_FRAME_SIZE + 2, "buffered {} bytes", size);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
        assert!(reader.pending.is_empty());

        drop(reader);
        writer.join().unwrap();
    }

    #[test]
    fn test_publisher_without_subscribers() {
        let mut publisher = Publisher::bind("127.0.0.1:0").unwrap();
        assert_eq!(publisher.send_line("{}").unwrap(), 0);
    }

    #[test]
    fn test_publisher_rejects_embedded_newline() {
        let mut publisher = Publisher::bind("127.0.0.1:0").unwrap();
        assert!(publisher.send_line("{}\n{}").is_err());
    }

    #[test]
    fn test_inbox_connect_without_listener_times_out() {
        let addr = resolve("127.0.0.1:1").unwrap();
        let mut inbox = Inbox::connect(addr, Duration::from_millis(10));
        assert_eq!(inbox.recv().unwrap(), Received::Timeout);
        assert!(!inbox.is_connected());
    }
}
