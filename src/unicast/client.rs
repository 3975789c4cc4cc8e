//! Per-connection client state.
//!
//! A connection starts as a control client: its HTTP request is
//! collected in a buffer growing by 256-byte steps until the blank-line
//! terminator arrives. Routing either answers and closes, or binds the
//! client to a channel, after which it only ever receives TS data (and a
//! 501 for any further request). Streamed data that does not fit the
//! socket is queued in a bounded backlog, flushed on writability.

use bytes::Bytes;
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

/// Growth step of the request receive buffer.
pub const RECV_BUFFER_STEP: usize = 256;

/// What [`UnicastClient::send_stream`] did with the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Everything was written or queued.
    Queued,
    /// Data was dropped (flush-on-eagain or backlog overflow).
    Dropped,
    /// The socket is dead; the client must be closed.
    Dead,
}

/// One accepted unicast connection.
#[derive(Debug)]
pub struct UnicastClient {
    /// The non-blocking client socket.
    pub stream: TcpStream,
    /// Peer address, for logs and the XML state.
    pub peer: SocketAddr,
    /// Channel index preset by a per-channel listener.
    pub asked_channel: Option<usize>,
    /// Channel index once the client is streaming.
    pub channel: Option<usize>,
    buffer: Vec<u8>,
    used: usize,
    backlog: VecDeque<Bytes>,
    backlog_bytes: usize,
    blocked_since: Option<Instant>,
}

impl UnicastClient {
    /// Wraps an accepted socket.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            asked_channel: None,
            channel: None,
            buffer: Vec::new(),
            used: 0,
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            blocked_since: None,
        }
    }

    /// True once the client is bound to a channel.
    pub fn is_streaming(&self) -> bool {
        self.channel.is_some()
    }

    /// Reads whatever the socket has into the request buffer, growing it
    /// in 256-byte steps. Returns the number of bytes read; 0 means the
    /// peer closed the connection.
    pub fn read_request(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            if self.buffer.len() - self.used < RECV_BUFFER_STEP {
                self.buffer.resize(self.buffer.len() + RECV_BUFFER_STEP, 0);
            }
            match self.stream.read(&mut self.buffer[self.used..]) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    self.used += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    return Ok(total);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// True when the buffer holds a complete HTTP request.
    pub fn request_complete(&self) -> bool {
        self.used > 5
            && self.buffer[..self.used]
                .windows(3)
                .any(|window| window == b"\n\r\n")
    }

    /// The collected request bytes.
    pub fn request(&self) -> &[u8] {
        &self.buffer[..self.used]
    }

    /// Releases the request buffer once it has been acted upon.
    pub fn clear_request(&mut self) {
        self.buffer = Vec::new();
        self.used = 0;
    }

    /// Writes streaming data, queueing what the socket does not accept.
    ///
    /// `queue_size` bounds the backlog in bytes (0 = unbounded); with
    /// `flush_on_eagain` blocked data is dropped instead of queued.
    pub fn send_stream(
        &mut self,
        data: Bytes,
        queue_size: usize,
        flush_on_eagain: bool,
    ) -> SendOutcome {
        if !self.backlog.is_empty() {
            return self.enqueue(data, queue_size, flush_on_eagain);
        }
        let mut offset = 0;
        while offset < data.len() {
            match self.stream.write(&data[offset..]) {
                Ok(0) => return SendOutcome::Dead,
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return self.enqueue(data.slice(offset..), queue_size, flush_on_eagain);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return SendOutcome::Dead,
            }
        }
        self.blocked_since = None;
        SendOutcome::Queued
    }

    fn enqueue(&mut self, data: Bytes, queue_size: usize, flush_on_eagain: bool) -> SendOutcome {
        if self.blocked_since.is_none() {
            self.blocked_since = Some(Instant::now());
        }
        if flush_on_eagain {
            return SendOutcome::Dropped;
        }
        if queue_size > 0 && self.backlog_bytes + data.len() > queue_size {
            return SendOutcome::Dropped;
        }
        self.backlog_bytes += data.len();
        self.backlog.push_back(data);
        SendOutcome::Queued
    }

    /// Drains as much backlog as the socket accepts. Returns true when
    /// the backlog is empty afterwards.
    pub fn flush_backlog(&mut self) -> io::Result<bool> {
        while let Some(front) = self.backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.backlog_bytes -= n;
                    if n == front.len() {
                        self.backlog.pop_front();
                    } else {
                        let rest = front.slice(n..);
                        *front = rest;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.blocked_since = None;
        Ok(true)
    }

    /// True when writes have been failing longer than the timeout.
    pub fn blocked_longer_than(&self, now: Instant, timeout_secs: u64) -> bool {
        self.blocked_since
            .map(|since| now.duration_since(since).as_secs() >= timeout_secs)
            .unwrap_or(false)
    }

    /// Bytes currently queued for this client.
    pub fn backlog_bytes(&self) -> usize {
        self.backlog_bytes
    }

    /// True when a backlog is waiting for writability.
    pub fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_terminator_detection() {
        // Build a client around a socket pair via a local listener.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer_addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let mut client = UnicastClient::new(TcpStream::from_std(accepted), peer_addr);

        use std::io::Write as _;
        let mut peer = peer;
        peer.write_all(b"GET /bysid/100 HTTP/1.0\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = client.read_request();
        assert!(!client.request_complete());

        peer.write_all(b"Host: x\r\n\r\n").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = client.read_request();
        assert!(client.request_complete());
        assert!(client.request().starts_with(b"GET /bysid/100"));

        client.clear_request();
        assert!(!client.request_complete());
    }
}
