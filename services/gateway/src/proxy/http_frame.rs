//! HTTP/1.1 message framing for the terminating reframer.
//!
//! A [`MessageBuffer`] accumulates plaintext from one direction of a
//! connection until it holds a complete request or response. Completion
//! rules:
//!
//! - Requests: `headers_len + Content-Length` bytes (length defaults to 0).
//! - Responses: `Content-Length > 0` fully received; otherwise, for
//!   `Transfer-Encoding: chunked`, a `0\r\n\r\n` seen after the header block;
//!   otherwise the message has no body and ends with its headers.
//!
//! The chunked rule looks for the terminator anywhere after the headers and
//! does not walk chunk sizes, so chunk data containing `0\r\n\r\n` ends the
//! message early.
//!
//! Header blocks are parsed with `httparse`; a block it rejects is forwarded
//! as a message without a body.

use httparse::{Header, Request, Response, EMPTY_HEADER};
use tracing::debug;

use crate::error::ProxyError;

/// End of the header block.
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Last-chunk marker of a chunked body (no trailers).
pub const CHUNKED_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Headers parsed per message; larger blocks are framed without a body.
const MAX_HEADERS: usize = 64;

const CRLF: &[u8] = b"\r\n";

/// Which side of the exchange a buffer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the header block including its terminator, if complete.
fn header_end(buf: &[u8]) -> Option<usize> {
    find(buf, HEADER_TERMINATOR).map(|pos| pos + HEADER_TERMINATOR.len())
}

fn header_values<'a>(headers: &'a [Header<'a>], name: &'a str) -> impl Iterator<Item = &'a str> {
    headers
        .iter()
        .filter(move |h| h.name.eq_ignore_ascii_case(name))
        .filter_map(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
}

fn has_token(headers: &[Header<'_>], name: &str, token: &str) -> bool {
    header_values(headers, name).any(|value| {
        value
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    })
}

/// What framing needs from a header block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Head {
    len: usize,
    start_line: String,
    status: Option<u16>,
    content_length: Option<usize>,
    chunked: bool,
    connection_close: bool,
}

impl Head {
    fn parse(kind: MessageKind, block: &[u8]) -> Self {
        match parse_head(kind, block) {
            Ok(Some(head)) => head,
            Ok(None) => Self::opaque(block),
            Err(e) => {
                debug!(error = %e, "Unparsable header block, framing without a body");
                Self::opaque(block)
            }
        }
    }

    /// Fallback for blocks httparse rejects: forwarded as a bodyless message.
    fn opaque(block: &[u8]) -> Self {
        let end = find(block, CRLF).unwrap_or(block.len());
        Self {
            len: block.len(),
            start_line: String::from_utf8_lossy(&block[..end]).into_owned(),
            status: None,
            content_length: None,
            chunked: false,
            connection_close: false,
        }
    }
}

/// Parse a header block ending in `\r\n\r\n`.
///
/// `Ok(None)` if httparse still reports the block as partial.
fn parse_head(kind: MessageKind, block: &[u8]) -> Result<Option<Head>, httparse::Error> {
    let mut headers = [EMPTY_HEADER; MAX_HEADERS];

    let (start_line, status, headers) = match kind {
        MessageKind::Request => {
            let mut req = Request::new(&mut headers);
            if req.parse(block)?.is_partial() {
                return Ok(None);
            }
            let line = format!(
                "{} {} HTTP/1.{}",
                req.method.unwrap_or_default(),
                req.path.unwrap_or_default(),
                req.version.unwrap_or(1)
            );
            (line, None, req.headers)
        }
        MessageKind::Response => {
            let mut res = Response::new(&mut headers);
            if res.parse(block)?.is_partial() {
                return Ok(None);
            }
            let line = format!(
                "HTTP/1.{} {} {}",
                res.version.unwrap_or(1),
                res.code.unwrap_or_default(),
                res.reason.unwrap_or_default()
            );
            (line.trim_end().to_string(), res.code, res.headers)
        }
    };
    let headers: &[Header<'_>] = headers;

    let head = Head {
        len: block.len(),
        start_line,
        status,
        content_length: header_values(headers, "content-length")
            .next()
            .and_then(|v| v.parse().ok()),
        chunked: has_token(headers, "transfer-encoding", "chunked"),
        connection_close: has_token(headers, "connection", "close"),
    };
    Ok(Some(head))
}

/// A complete message at the front of a [`MessageBuffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    /// Total message length in bytes.
    pub len: usize,
    pub headers_len: usize,
    pub start_line: String,
    /// Response status code.
    pub status: Option<u16>,
    pub connection_close: bool,
}

/// Growable, bounded accumulator for one direction of HTTP traffic.
#[derive(Debug)]
pub struct MessageBuffer {
    kind: MessageKind,
    buf: Vec<u8>,
    limit: usize,
    head: Option<Head>,
    /// Bytes already searched for the header terminator.
    scanned: usize,
}

impl MessageBuffer {
    /// Buffer holding at most `limit` bytes.
    pub fn new(kind: MessageKind, limit: usize) -> Self {
        Self {
            kind,
            buf: Vec::with_capacity(limit),
            limit,
            head: None,
            scanned: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        if self.buf.len() + data.len() > self.limit {
            return Err(ProxyError::FramingOverflow { limit: self.limit });
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn head(&mut self) -> Option<&Head> {
        if self.head.is_none() {
            let from = self.scanned.saturating_sub(HEADER_TERMINATOR.len() - 1);
            let Some(end) = header_end(&self.buf[from..]) else {
                self.scanned = self.buf.len();
                return None;
            };
            self.head = Some(Head::parse(self.kind, &self.buf[..from + end]));
        }
        self.head.as_ref()
    }

    fn complete_len(&mut self) -> Option<usize> {
        let kind = self.kind;
        let (headers_len, content_length, chunked) = {
            let head = self.head()?;
            (head.len, head.content_length, head.chunked)
        };

        let total = match (kind, content_length) {
            (MessageKind::Request, cl) => headers_len + cl.unwrap_or(0),
            (MessageKind::Response, Some(cl)) if cl > 0 => headers_len + cl,
            (MessageKind::Response, _) if chunked => {
                headers_len + find(&self.buf[headers_len..], CHUNKED_TERMINATOR)? + CHUNKED_TERMINATOR.len()
            }
            (MessageKind::Response, _) => headers_len,
        };

        (self.buf.len() >= total).then_some(total)
    }

    /// The complete message at the front of the buffer, if any.
    pub fn complete(&mut self) -> Option<FramedMessage> {
        let len = self.complete_len()?;
        let head = self.head.as_ref()?;
        Some(FramedMessage {
            len,
            headers_len: head.len,
            start_line: head.start_line.clone(),
            status: head.status,
            connection_close: head.connection_close,
        })
    }

    /// Remove every `name` header line from `msg` in place.
    ///
    /// Returns the number of bytes removed.
    pub fn strip_header(&mut self, msg: &mut FramedMessage, name: &str) -> usize {
        let mut removed = 0;
        let mut pos = match find(&self.buf[..msg.headers_len], CRLF) {
            Some(p) => p + CRLF.len(),
            None => return 0,
        };

        // The final CRLF of the block is the empty line.
        while pos + CRLF.len() < msg.headers_len {
            let Some(eol) = find(&self.buf[pos..msg.headers_len], CRLF) else {
                break;
            };
            let line = &self.buf[pos..pos + eol];
            let matches = line
                .iter()
                .position(|&b| b == b':')
                .map(|colon| line[..colon].trim_ascii().eq_ignore_ascii_case(name.as_bytes()))
                .unwrap_or(false);

            if matches {
                let line_len = eol + CRLF.len();
                self.buf.drain(pos..pos + line_len);
                msg.headers_len -= line_len;
                msg.len -= line_len;
                removed += line_len;
            } else {
                pos += eol + CRLF.len();
            }
        }

        if removed > 0 {
            if let Some(head) = self.head.as_mut() {
                head.len = msg.headers_len;
            }
        }
        removed
    }

    /// Bytes of a message returned by [`complete`](Self::complete).
    pub fn message_bytes(&self, msg: &FramedMessage) -> &[u8] {
        &self.buf[..msg.len]
    }

    /// Drop a forwarded message; anything after it starts the next one.
    pub fn consume(&mut self, msg: &FramedMessage) {
        self.buf.drain(..msg.len.min(self.buf.len()));
        self.head = None;
        self.scanned = 0;
    }

    /// Drain whatever is buffered, complete or not.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        self.head = None;
        self.scanned = 0;
        std::mem::take(&mut self.buf)
    }
}
