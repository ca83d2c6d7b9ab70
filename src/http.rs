//! HTTP/1.x message codec and stream reader.
//!
//! Bodies are delimited by Content-Length, by chunked transfer coding, or
//! (responses only) by the end of the stream. Chunked bodies are decoded
//! and the message is re-framed with a Content-Length header, so
//! serializing a parsed message always yields a length-delimited message.

use std::io::{self, BufRead, BufReader, Read};

use serde::{Deserialize, Serialize};

use crate::frame::FrameType;
use crate::stream::{MessageReader, ReadOutcome};
use crate::{Codec, FrameError};

const MAX_LINE_LENGTH: usize = 8192;
const MAX_HEADERS: usize = 128;
/// Largest body accepted, whatever its framing.
pub const MAX_BODY_LENGTH: usize = 16 * 1024 * 1024;

/// First line of an HTTP message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        target: String,
        version: String,
    },
    Response {
        version: String,
        status: u16,
        reason: String,
    },
}

impl std::fmt::Display for StartLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartLine::Request { method, target, version } => write!(f, "{} {} {}", method, target, version),
            StartLine::Response { version, status, reason } => write!(f, "{} {} {}", version, status, reason),
        }
    }
}

/// An HTTP request or response with headers in wire order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpMessage {
    pub start_line: StartLine,
    pub headers: Vec<(String, String)>,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl HttpMessage {
    pub fn request(method: &str, target: &str) -> Self {
        Self {
            start_line: StartLine::Request {
                method: method.to_string(),
                target: target.to_string(),
                version: "HTTP/1.1".to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn response(status: u16, reason: &str) -> Self {
        Self {
            start_line: StartLine::Response {
                version: "HTTP/1.1".to_string(),
                status,
                reason: reason.to_string(),
            },
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, StartLine::Request { .. })
    }

    /// Value of the first header named `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replaces every header named `name` with a single one.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter().position(|(key, _)| key.eq_ignore_ascii_case(name)) {
            Some(index) => {
                self.headers[index].1 = value;
                let mut seen = 0;
                self.headers.retain(|(key, _)| {
                    if key.eq_ignore_ascii_case(name) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.headers.push((name.to_string(), value)),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    /// Replaces the body and updates Content-Length.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.set_body(body);
        self
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>) {
        self.body = body.into();
        self.remove_header("Transfer-Encoding");
        self.set_header("Content-Length", self.body.len().to_string());
    }

    fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|value| value.to_ascii_lowercase().contains("chunked"))
    }

    fn content_length(&self) -> io::Result<Option<usize>> {
        self.header("Content-Length")
            .map(|value| value.trim().parse::<usize>().map_err(|_| invalid_data("invalid Content-Length")))
            .transpose()
    }

    /// True when the message carries no body by definition.
    fn bodiless(&self) -> bool {
        match &self.start_line {
            StartLine::Request { .. } => false,
            StartLine::Response { status, .. } => (100..200).contains(status) || *status == 204 || *status == 304,
        }
    }

    /// Reads one message from `reader`.
    ///
    /// Returns `Ok(None)` when the stream ends before a start line.
    pub fn read_from<R: BufRead>(reader: &mut R) -> io::Result<Option<HttpMessage>> {
        let line = loop {
            match read_line(reader)? {
                None => return Ok(None),
                // tolerate blank lines between messages
                Some(line) if line.is_empty() => continue,
                Some(line) => break line,
            }
        };
        let mut message = HttpMessage {
            start_line: parse_start_line(&line)?,
            headers: Vec::new(),
            body: Vec::new(),
        };

        loop {
            let line = read_line(reader)?.ok_or_else(|| unexpected_eof("headers"))?;
            if line.is_empty() {
                break;
            }
            if message.headers.len() == MAX_HEADERS {
                return Err(invalid_data("too many headers"));
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| invalid_data(format!("malformed header line: {}", line)))?;
            message.headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        if message.bodiless() {
            return Ok(Some(message));
        }
        if message.is_chunked() {
            let body = read_chunked(reader)?;
            message.set_body(body);
        } else if let Some(length) = message.content_length()? {
            if length > MAX_BODY_LENGTH {
                return Err(invalid_data(format!("body of {} bytes exceeds the limit", length)));
            }
            read_body(reader, length, &mut message.body)?;
        } else if !message.is_request() {
            let read = reader
                .by_ref()
                .take(MAX_BODY_LENGTH as u64 + 1)
                .read_to_end(&mut message.body)?;
            if read > MAX_BODY_LENGTH {
                return Err(invalid_data("body exceeds the limit"));
            }
        }
        Ok(Some(message))
    }
}

/// Appends exactly `length` bytes to `body`, growing it only as data arrives.
fn read_body<R: Read>(reader: &mut R, length: usize, body: &mut Vec<u8>) -> io::Result<()> {
    let read = reader.by_ref().take(length as u64).read_to_end(body)?;
    if read < length {
        return Err(unexpected_eof("a body"));
    }
    Ok(())
}

fn invalid_data<S: Into<String>>(message: S) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn unexpected_eof(context: &str) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, format!("stream ended inside {}", context))
}

/// Reads a CRLF- or LF-terminated line without its terminator.
fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    let mut buffer = Vec::new();
    let read = reader.by_ref().take(MAX_LINE_LENGTH as u64 + 1).read_until(b'\n', &mut buffer)?;
    if read == 0 {
        return Ok(None);
    }
    if buffer.last() != Some(&b'\n') {
        if buffer.len() > MAX_LINE_LENGTH {
            return Err(invalid_data("line exceeds 8192 bytes"));
        }
        return Err(unexpected_eof("a line"));
    }
    buffer.pop();
    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }
    String::from_utf8(buffer)
        .map(Some)
        .map_err(|_| invalid_data("line is not valid UTF-8"))
}

fn parse_start_line(line: &str) -> io::Result<StartLine> {
    let mut parts = line.splitn(3, ' ');
    let first = parts.next().unwrap_or_default();
    let second = parts.next().ok_or_else(|| invalid_data(format!("malformed start line: {}", line)))?;
    let third = parts.next().unwrap_or_default();

    if first.starts_with("HTTP/") {
        let status = second
            .parse()
            .map_err(|_| invalid_data(format!("invalid status code: {}", second)))?;
        Ok(StartLine::Response {
            version: first.to_string(),
            status,
            reason: third.to_string(),
        })
    } else {
        if !third.starts_with("HTTP/") {
            return Err(invalid_data(format!("malformed request line: {}", line)));
        }
        Ok(StartLine::Request {
            method: first.to_string(),
            target: second.to_string(),
            version: third.to_string(),
        })
    }
}

fn read_chunked<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line = read_line(reader)?.ok_or_else(|| unexpected_eof("chunk size"))?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| invalid_data(format!("invalid chunk size: {}", size_field)))?;
        if size == 0 {
            // trailers up to the terminating blank line
            while let Some(trailer) = read_line(reader)? {
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        if size > MAX_BODY_LENGTH - body.len() {
            return Err(invalid_data(format!("chunk of {} bytes exceeds the body limit", size)));
        }
        read_body(reader, size, &mut body)?;
        let terminator = read_line(reader)?.ok_or_else(|| unexpected_eof("chunk"))?;
        if !terminator.is_empty() {
            return Err(invalid_data("chunk data longer than its size"));
        }
    }
}

impl Codec for HttpMessage {
    const FRAME_TYPE: FrameType = FrameType::Http;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = io::Cursor::new(bytes);
        match HttpMessage::read_from(&mut cursor) {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(FrameError::InvalidHeaderFormat("empty HTTP message".to_string())),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::invalid_length("http", err.to_string())),
            Err(err) => Err(FrameError::InvalidHeaderFormat(err.to_string())),
        }
    }

    fn header_length(&self) -> usize {
        self.to_bytes().len() - self.body.len()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = format!("{}\r\n", self.start_line).into_bytes();
        for (name, value) in &self.headers {
            bytes.extend_from_slice(name.as_bytes());
            bytes.extend_from_slice(b": ");
            bytes.extend_from_slice(value.as_bytes());
            bytes.extend_from_slice(b"\r\n");
        }
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Reads consecutive HTTP messages from a byte stream.
pub struct HttpReader<R> {
    reader: BufReader<R>,
}

impl<R: Read> HttpReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }
}

impl<R: Read + Send> MessageReader for HttpReader<R> {
    type Message = HttpMessage;

    fn read_message(&mut self) -> io::Result<ReadOutcome<HttpMessage>> {
        Ok(match HttpMessage::read_from(&mut self.reader)? {
            Some(message) => ReadOutcome::Message(message),
            None => ReadOutcome::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let mut request = HttpMessage::request("POST", "/submit").with_body("a=1");
        request.set_header("Host", "example.com");
        let bytes = request.to_bytes();
        assert!(bytes.starts_with(b"POST /submit HTTP/1.1\r\nContent-Length: 3\r\nHost: example.com\r\n\r\n"));
        assert_eq!(HttpMessage::parse(&bytes).unwrap(), request);
    }

    #[test]
    fn test_chunked_body_is_reframed() {
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\n";
        let response = HttpMessage::parse(wire).unwrap();
        assert_eq!(response.body, b"Wikipedia");
        assert_eq!(response.header("content-length"), Some("9"));
        assert!(response.header("Transfer-Encoding").is_none());

        let reparsed = HttpMessage::parse(&response.to_bytes()).unwrap();
        assert_eq!(reparsed, response);
    }

    #[test]
    fn test_response_reads_to_close() {
        let response = HttpMessage::parse(b"HTTP/1.0 200 OK\nServer: x\n\nall of it").unwrap();
        assert_eq!(response.body, b"all of it");

        let not_modified = HttpMessage::parse(b"HTTP/1.1 304 Not Modified\r\n\r\n").unwrap();
        assert!(not_modified.body.is_empty());
    }

    #[test]
    fn test_reader_yields_messages_then_closed() {
        let wire = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\n\r\n".to_vec();
        let mut reader = HttpReader::new(io::Cursor::new(wire));

        let first = reader.read_message().unwrap();
        assert!(matches!(first, ReadOutcome::Message(ref m) if m.header("host") == Some("a")));
        let second = reader.read_message().unwrap();
        assert!(matches!(second, ReadOutcome::Message(ref m) if m.start_line.to_string() == "GET /two HTTP/1.1"));
        assert!(matches!(reader.read_message().unwrap(), ReadOutcome::Closed));
    }

    #[test]
    fn test_malformed_messages() {
        assert!(HttpMessage::parse(b"").is_err());
        assert!(HttpMessage::parse(b"NOT-HTTP\r\n\r\n").is_err());
        assert!(HttpMessage::parse(b"GET / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort").is_err());
        assert!(HttpMessage::parse(b"GET / HTTP/1.1\r\nbroken header\r\n\r\n").is_err());
    }

    #[test]
    fn test_huge_content_length_is_rejected() {
        let result = HttpMessage::parse(b"GET / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nab");
        assert!(matches!(result, Err(FrameError::InvalidHeaderFormat(_))));

        let just_over = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\nab", MAX_BODY_LENGTH + 1);
        assert!(HttpMessage::parse(just_over.as_bytes()).is_err());

        // in range but larger than the data: truncated, not preallocated
        let result = HttpMessage::parse(b"POST / HTTP/1.1\r\nContent-Length: 16000000\r\n\r\nab");
        assert!(matches!(result, Err(FrameError::InvalidLength { .. })));
    }

    #[test]
    fn test_huge_chunk_size_is_rejected() {
        let response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nab\r\n0\r\n\r\n";
        assert!(HttpMessage::parse(response).is_err());

        let response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffff\r\nab\r\n0\r\n\r\n";
        assert!(HttpMessage::parse(response).is_err());
    }
}
