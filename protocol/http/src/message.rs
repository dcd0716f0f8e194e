//! HTTP/1.1 message parsing.
//!
//! The parser follows the incremental `(value, consumed)` convention: feed it
//! the unconsumed head of a receive buffer and it either returns a parsed
//! message with the byte count of the start line and headers, or
//! [`ParseError::Incomplete`] when the terminating empty line has not arrived
//! yet. Growing the input never turns `Incomplete` into a hard error for the
//! same prefix, which lets callers retry after every read.

use std::fmt::Write as _;

/// Upper bound on the number of headers accepted in one message.
pub const MAX_HEADERS: usize = 40;

/// Parse error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Need more data to complete parsing.
    #[error("incomplete")]
    Incomplete,
    /// The start line is not a valid request or status line.
    #[error("malformed start line")]
    BadStartLine,
    /// A header line is malformed (missing colon, non-UTF-8, or a deprecated
    /// continuation line).
    #[error("malformed header")]
    BadHeader,
    /// More than [`MAX_HEADERS`] headers.
    #[error("too many headers")]
    TooManyHeaders,
    /// `Content-Length` is present but not a decimal number.
    #[error("invalid content length")]
    BadContentLength,
    /// Chunked transfer encoding is malformed.
    #[error("malformed chunked encoding")]
    BadChunk,
}

/// A single header as a pair of views into the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header<'a> {
    pub name: &'a str,
    pub value: &'a str,
}

/// Request line or status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartLine<'a> {
    Request {
        method: &'a str,
        uri: &'a str,
        version: &'a str,
    },
    Response {
        version: &'a str,
        status: u16,
        reason: &'a str,
    },
}

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLen {
    /// `Content-Length` bytes follow the headers. Requests without any body
    /// indicator are `Fixed(0)`.
    Fixed(usize),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// A response with no body indicator; streaming consumers read to close,
    /// and message delivery treats the body as empty.
    None,
}

/// A parsed HTTP/1.1 message.
///
/// All slices borrow from the buffer passed to [`Message::parse`]; they become
/// invalid once that buffer is compacted. `parse` returns as soon as the start
/// line and headers are complete; `body` is empty until the caller attaches
/// the bytes indicated by [`Message::body_len`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    pub start: StartLine<'a>,
    pub headers: Vec<Header<'a>>,
    pub body: &'a [u8],
}

impl<'a> Message<'a> {
    /// Parse a message's start line and headers from the buffer.
    ///
    /// Returns the message and the number of bytes consumed, covering the
    /// start line, headers and the terminating empty line. Body bytes are not
    /// consumed; use [`Message::body_len`] to find how many follow.
    pub fn parse(data: &'a [u8]) -> Result<(Self, usize), ParseError> {
        let mut pos = 0;

        let line = read_line(data, &mut pos)?;
        let start = parse_start_line(line)?;

        let mut headers = Vec::new();
        loop {
            let line = read_line(data, &mut pos)?;
            if line.is_empty() {
                break;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                // obs-fold continuation lines are rejected (RFC 7230 §3.2.4).
                return Err(ParseError::BadHeader);
            }
            if headers.len() == MAX_HEADERS {
                return Err(ParseError::TooManyHeaders);
            }
            headers.push(parse_header(line)?);
        }

        Ok((
            Message {
                start,
                headers,
                body: &[],
            },
            pos,
        ))
    }

    /// Returns true for a request, false for a response.
    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// Case-insensitive header lookup, first match wins.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    }

    /// The `Content-Length` value, if present and valid.
    pub fn content_length(&self) -> Result<Option<usize>, ParseError> {
        match self.header("content-length") {
            None => Ok(None),
            Some(v) => v
                .trim()
                .parse::<usize>()
                .map(Some)
                .map_err(|_| ParseError::BadContentLength),
        }
    }

    /// Whether the message uses chunked transfer encoding.
    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    }

    /// Classify how the body is delimited.
    ///
    /// `Content-Length` wins when present; `Transfer-Encoding: chunked`
    /// otherwise; a request with neither has an empty body, a response with
    /// neither has no parseable body at all.
    pub fn body_len(&self) -> Result<BodyLen, ParseError> {
        if let Some(n) = self.content_length()? {
            return Ok(BodyLen::Fixed(n));
        }
        if self.is_chunked() {
            return Ok(BodyLen::Chunked);
        }
        if self.is_request() {
            Ok(BodyLen::Fixed(0))
        } else {
            Ok(BodyLen::None)
        }
    }

    /// Whether this request asks for a WebSocket upgrade.
    ///
    /// Requires `Upgrade: websocket`, a `Connection` header containing
    /// `Upgrade`, and a `Sec-WebSocket-Key`.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.is_request()
            && self
                .header("upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
            && self.header("connection").is_some_and(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
            })
            && self.header("sec-websocket-key").is_some()
    }
}

/// Read one CRLF-terminated line starting at `*pos`, advancing past it.
fn read_line<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], ParseError> {
    let rest = &data[*pos..];
    let mut i = 0;
    while i + 1 < rest.len() {
        if rest[i] == b'\r' && rest[i + 1] == b'\n' {
            let line = &rest[..i];
            *pos += i + 2;
            return Ok(line);
        }
        i += 1;
    }
    Err(ParseError::Incomplete)
}

fn parse_start_line(line: &[u8]) -> Result<StartLine<'_>, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadStartLine)?;

    let (first, rest) = line.split_once(' ').ok_or(ParseError::BadStartLine)?;
    if first.is_empty() || rest.is_empty() {
        return Err(ParseError::BadStartLine);
    }

    if first.starts_with("HTTP/") {
        // Status line: version SP status-code SP reason-phrase. The reason
        // phrase may contain spaces or be empty.
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason),
            None => (rest, ""),
        };
        let status = code.parse::<u16>().map_err(|_| ParseError::BadStartLine)?;
        Ok(StartLine::Response {
            version: first,
            status,
            reason,
        })
    } else {
        let (uri, version) = rest.split_once(' ').ok_or(ParseError::BadStartLine)?;
        if uri.is_empty() || !version.starts_with("HTTP/") {
            return Err(ParseError::BadStartLine);
        }
        Ok(StartLine::Request {
            method: first,
            uri,
            version,
        })
    }
}

fn parse_header(line: &[u8]) -> Result<Header<'_>, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
    let (name, value) = line.split_once(':').ok_or(ParseError::BadHeader)?;
    if name.is_empty() || name.contains(' ') {
        return Err(ParseError::BadHeader);
    }
    Ok(Header {
        name,
        value: value.trim(),
    })
}

/// Scan a chunked body for its end.
///
/// `data` starts immediately after the headers. Returns `Ok(Some(len))` with
/// the total length of the chunked payload (through the terminating zero-size
/// chunk and its CRLF) once it is fully present, `Ok(None)` when more data is
/// needed, or an error for malformed framing. Trailer sections are rejected.
pub fn chunked_body_len(data: &[u8]) -> Result<Option<usize>, ParseError> {
    let mut pos = 0;
    loop {
        let line = match read_line(data, &mut pos) {
            Ok(line) => line,
            Err(ParseError::Incomplete) => return Ok(None),
            Err(e) => return Err(e),
        };
        let size = parse_chunk_size(line)?;
        if size == 0 {
            // Terminating chunk is followed by a bare CRLF; trailers are not
            // supported.
            if data.len() < pos + 2 {
                return Ok(None);
            }
            if &data[pos..pos + 2] != b"\r\n" {
                return Err(ParseError::BadChunk);
            }
            return Ok(Some(pos + 2));
        }
        // Chunk data plus its trailing CRLF.
        if data.len() < pos + size + 2 {
            return Ok(None);
        }
        if &data[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ParseError::BadChunk);
        }
        pos += size + 2;
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    // Chunk extensions after ';' are ignored.
    let digits = match line.iter().position(|&b| b == b';') {
        Some(i) => &line[..i],
        None => line,
    };
    let digits = std::str::from_utf8(digits).map_err(|_| ParseError::BadChunk)?;
    usize::from_str_radix(digits.trim(), 16).map_err(|_| ParseError::BadChunk)
}

/// Canonical reason phrase for common status codes.
pub fn status_reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "",
    }
}

/// Append a status line and headers (with the terminating empty line) to the
/// buffer. The caller appends the body afterwards.
pub fn encode_response_head(buf: &mut String, status: u16, headers: &[(&str, &str)]) {
    let _ = write!(buf, "HTTP/1.1 {} {}\r\n", status, status_reason(status));
    for (name, value) in headers {
        let _ = write!(buf, "{name}: {value}\r\n");
    }
    buf.push_str("\r\n");
}
