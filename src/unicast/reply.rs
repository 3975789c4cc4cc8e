//! HTTP/1.0 reply building.
//!
//! Monitor endpoints format their payload into a grow-as-you-write body
//! buffer; [`ReplyBuilder::send`] then synthesizes the status line and
//! headers (Server, Content-Type, Content-Length) and writes everything
//! to the socket until fully drained. Only 200 and 404 are synthesized;
//! 501 and 503 are sent as static byte blobs.

use bytes::BytesMut;
use log::error;
use std::io::{self, Write};

/// Server token sent in every reply.
pub const SERVER_TOKEN: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Static 501 reply for unsupported methods and re-requests on
/// streaming connections.
pub const HTTP_501_REPLY: &[u8] = b"HTTP/1.0 501 Not implemented\r\n\r\n";

/// Static 503 reply for the max-clients cap.
pub const HTTP_503_REPLY: &[u8] = b"HTTP/1.0 503 Too many clients\r\n\r\n";

/// Header written to a client right before raw TS streaming starts.
pub const HTTP_STREAM_HEADER: &str = concat!(
    "HTTP/1.0 200 OK\r\nServer: ",
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "\r\nContent-Type: video/mpegts\r\n\r\n"
);

/// HTML body of the 404 reply.
pub fn http_404_body() -> String {
    format!(
        "<html><head><title>404 not found</title></head><body>\
         <h1>404 not found</h1><hr>{SERVER_TOKEN}</body></html>\r\n"
    )
}

/// Buffer step granularity, matching the receive-side growth step.
const REPLY_SIZE_STEP: usize = 256;

/// Grow-as-you-write HTTP/1.0 reply.
#[derive(Debug, Default)]
pub struct ReplyBuilder {
    body: BytesMut,
}

impl ReplyBuilder {
    /// Creates an empty reply.
    pub fn new() -> Self {
        Self {
            body: BytesMut::with_capacity(REPLY_SIZE_STEP),
        }
    }

    /// Current body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// True when nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Serializes headers plus body and writes them fully to the socket,
    /// looping over short writes. Returns the number of bytes sent.
    ///
    /// Only 200 and 404 have status lines here; anything else is a
    /// caller bug that gets logged and sends nothing.
    pub fn send(
        &mut self,
        socket: &mut dyn Write,
        code: u16,
        content_type: &str,
    ) -> io::Result<usize> {
        let status = match code {
            200 => "200 OK",
            404 => "404 Not found",
            other => {
                error!("reply send with unexpected status code {other}");
                return Ok(0);
            }
        };
        let mut message = BytesMut::with_capacity(self.body.len() + REPLY_SIZE_STEP);
        message.extend_from_slice(b"HTTP/1.0 ");
        message.extend_from_slice(status.as_bytes());
        message.extend_from_slice(b"\r\nServer: ");
        message.extend_from_slice(SERVER_TOKEN.as_bytes());
        message.extend_from_slice(b"\r\nContent-Type: ");
        message.extend_from_slice(content_type.as_bytes());
        message.extend_from_slice(
            format!("\r\nContent-Length: {}\r\n\r\n", self.body.len()).as_bytes(),
        );
        message.extend_from_slice(&self.body);

        let mut sent = 0;
        while sent < message.len() {
            match socket.write(&message[sent..]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }
}

impl Write for ReplyBuilder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.body.capacity() - self.body.len() < buf.len() {
            let needed = buf.len().div_ceil(REPLY_SIZE_STEP) * REPLY_SIZE_STEP;
            self.body.reserve(needed);
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_length_matches_body() {
        let mut reply = ReplyBuilder::new();
        write!(reply, "{{\"answer\":{}}}\n", 42).unwrap();
        let body_len = reply.len();

        let mut wire = Vec::new();
        let sent = reply.send(&mut wire, 200, "application/json").unwrap();
        assert_eq!(sent, wire.len());

        let text = String::from_utf8(wire).unwrap();
        let (headers, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(headers.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(headers.contains(&format!("Content-Length: {body_len}")));
        assert!(headers.contains("Content-Type: application/json"));
        assert_eq!(body.len(), body_len);
    }

    #[test]
    fn test_404_reply() {
        let mut reply = ReplyBuilder::new();
        write!(reply, "{}", http_404_body()).unwrap();
        let mut wire = Vec::new();
        reply.send(&mut wire, 404, "text/html").unwrap();
        assert!(String::from_utf8(wire).unwrap().starts_with("HTTP/1.0 404 Not found"));
    }

    #[test]
    fn test_unexpected_code_sends_nothing() {
        let mut reply = ReplyBuilder::new();
        write!(reply, "body").unwrap();
        let mut wire = Vec::new();
        assert_eq!(reply.send(&mut wire, 500, "text/plain").unwrap(), 0);
        assert!(wire.is_empty());
    }

    #[test]
    fn test_growth_in_steps() {
        let mut reply = ReplyBuilder::new();
        for _ in 0..100 {
            write!(reply, "0123456789").unwrap();
        }
        assert_eq!(reply.len(), 1000);
    }
}
