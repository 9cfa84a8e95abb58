// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Bytes land in a fixed read buffer; [`RequestParser::process`] consumes
//! whatever has arrived and either asks for more or reports a complete
//! request. Three cursors track progress:
//!
//! - `read_cursor`: one past the last byte received
//! - `parsed_cursor`: next byte the line scanner will look at
//! - `line_start`: first byte of the current unterminated line
//!
//! Nothing before `parsed_cursor` is ever scanned twice; a trailing `\r` is
//! held at `parsed_cursor` until its successor arrives. Line terminators are
//! zeroed in place once recognized.

use crate::http::{Method, Status};
use memchr::memchr2;
use std::ops::Range;

pub const READ_BUF_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitingRequestLine,
    AwaitingHeaders,
    AwaitingBody,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    Complete,
    Incomplete,
    Malformed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Bad line framing: a `\r` not followed by `\n`, or a bare `\n`.
    MalformedLine,
    /// Request line is not `method SP target SP version`.
    BadRequestLine,
    BadMethod,
    BadVersion,
    BadTarget,
    BadContentLength,
    /// Declared body does not fit in the read buffer.
    BodyTooLarge,
    /// `process` called after the request was already complete.
    InvalidState,
}

impl ParseError {
    pub fn status(&self) -> Status {
        match self {
            ParseError::InvalidState => Status::InternalError,
            _ => Status::BadRequest,
        }
    }

    /// After broken framing or an unusable `Content-Length` the end of the
    /// request is unknown, so the connection cannot be reused.
    pub fn forces_close(&self) -> bool {
        matches!(
            self,
            ParseError::MalformedLine | ParseError::BadContentLength | ParseError::BodyTooLarge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    RequestReady,
}

/// Fields accumulated while parsing. Ranges index the read buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Option<Method>,
    pub target: Range<usize>,
    pub version: Range<usize>,
    pub host: Option<Range<usize>>,
    pub content_length: usize,
    pub keep_alive: bool,
    pub body_start: usize,
}

pub struct RequestParser {
    buf: Box<[u8]>,
    read_cursor: usize,
    parsed_cursor: usize,
    line_start: usize,
    state: ParseState,
    head: RequestHead,
}

impl RequestParser {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_cursor: 0,
            parsed_cursor: 0,
            line_start: 0,
            state: ParseState::AwaitingRequestLine,
            head: RequestHead::default(),
        }
    }

    /// Back to `AwaitingRequestLine` with every cursor at zero. Bytes still
    /// buffered from the previous request are discarded.
    pub fn reset(&mut self) {
        self.read_cursor = 0;
        self.parsed_cursor = 0;
        self.line_start = 0;
        self.state = ParseState::AwaitingRequestLine;
        self.head = RequestHead::default();
    }

    /// Free space after the received bytes, for the next `read`.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_cursor..]
    }

    /// Record `n` bytes written into [`Self::spare_mut`].
    pub fn commit(&mut self, n: usize) {
        self.read_cursor = (self.read_cursor + n).min(self.buf.len());
    }

    /// Copy as much of `bytes` as fits. Returns the count copied.
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    pub fn is_full(&self) -> bool {
        self.read_cursor == self.buf.len()
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn read_cursor(&self) -> usize {
        self.read_cursor
    }

    pub fn parsed_cursor(&self) -> usize {
        self.parsed_cursor
    }

    pub fn line_start(&self) -> usize {
        self.line_start
    }

    pub fn method(&self) -> Option<Method> {
        self.head.method
    }

    pub fn keep_alive(&self) -> bool {
        self.head.keep_alive
    }

    pub fn target(&self) -> &[u8] {
        &self.buf[self.head.target.clone()]
    }

    pub fn version(&self) -> &[u8] {
        &self.buf[self.head.version.clone()]
    }

    pub fn host(&self) -> Option<&[u8]> {
        self.head.host.clone().map(|r| &self.buf[r])
    }

    /// Request body. Only meaningful once a POST is `RequestReady`.
    pub fn body(&self) -> &[u8] {
        let start = self.head.body_start.min(self.read_cursor);
        let end = (start + self.head.content_length).min(self.read_cursor);
        &self.buf[start..end]
    }

    /// Scan for the next CRLF from `parsed_cursor`.
    ///
    /// A `\r` that is the last received byte is `Incomplete` and stays
    /// pending: the cursor parks on it, so the next call sees whether a `\n`
    /// followed.
    pub fn scan_line(&mut self) -> LineStatus {
        let window = &self.buf[self.parsed_cursor..self.read_cursor];
        let Some(offset) = memchr2(b'\r', b'\n', window) else {
            self.parsed_cursor = self.read_cursor;
            return LineStatus::Incomplete;
        };

        let idx = self.parsed_cursor + offset;
        self.parsed_cursor = idx;
        if self.buf[idx] == b'\n' {
            return LineStatus::Malformed;
        }
        if idx + 1 == self.read_cursor {
            return LineStatus::Incomplete;
        }
        if self.buf[idx + 1] != b'\n' {
            return LineStatus::Malformed;
        }
        self.buf[idx] = 0;
        self.buf[idx + 1] = 0;
        self.parsed_cursor = idx + 2;
        LineStatus::Complete
    }

    /// Advance the state machine over everything received so far.
    pub fn process(&mut self) -> Result<Progress, ParseError> {
        loop {
            match self.state {
                ParseState::Done => return Err(ParseError::InvalidState),
                ParseState::AwaitingBody => {
                    let have = self.read_cursor - self.head.body_start;
                    if have < self.head.content_length {
                        return Ok(Progress::NeedMore);
                    }
                    self.state = ParseState::Done;
                    return Ok(Progress::RequestReady);
                }
                ParseState::AwaitingRequestLine | ParseState::AwaitingHeaders => {
                    match self.scan_line() {
                        LineStatus::Incomplete => return Ok(Progress::NeedMore),
                        LineStatus::Malformed => return Err(ParseError::MalformedLine),
                        LineStatus::Complete => {}
                    }
                    let line = self.line_start..self.parsed_cursor - 2;
                    self.line_start = self.parsed_cursor;

                    if self.state == ParseState::AwaitingRequestLine {
                        self.parse_request_line(line)?;
                        self.state = ParseState::AwaitingHeaders;
                    } else if line.is_empty() {
                        if let Some(progress) = self.end_of_headers()? {
                            return Ok(progress);
                        }
                    } else {
                        self.parse_header(line)?;
                    }
                }
            }
        }
    }

    fn end_of_headers(&mut self) -> Result<Option<Progress>, ParseError> {
        self.head.body_start = self.line_start;
        match self.head.method {
            Some(Method::Get) => {
                // A stray body on GET is never waited for.
                self.state = ParseState::Done;
                Ok(Some(Progress::RequestReady))
            }
            Some(Method::Post) => {
                if self.head.content_length > self.buf.len() - self.head.body_start {
                    return Err(ParseError::BodyTooLarge);
                }
                self.state = ParseState::AwaitingBody;
                Ok(None)
            }
            None => Err(ParseError::InvalidState),
        }
    }

    fn parse_request_line(&mut self, line: Range<usize>) -> Result<(), ParseError> {
        let bytes = &self.buf[line.clone()];
        let is_ws = |b: &u8| *b == b' ' || *b == b'\t';

        let method_end = bytes.iter().position(is_ws).ok_or(ParseError::BadRequestLine)?;
        let target_start = method_end
            + bytes[method_end..]
                .iter()
                .position(|b| !is_ws(b))
                .ok_or(ParseError::BadRequestLine)?;
        let target_end = target_start
            + bytes[target_start..]
                .iter()
                .position(is_ws)
                .ok_or(ParseError::BadRequestLine)?;
        let version_start = target_end
            + bytes[target_end..]
                .iter()
                .position(|b| !is_ws(b))
                .ok_or(ParseError::BadRequestLine)?;

        let method = Method::from_bytes(&bytes[..method_end]).ok_or(ParseError::BadMethod)?;
        if !bytes[version_start..].eq_ignore_ascii_case(b"HTTP/1.1") {
            return Err(ParseError::BadVersion);
        }

        let mut target = target_start..target_end;
        const ABSOLUTE: &[u8] = b"http://";
        let raw = &bytes[target.clone()];
        if raw.len() >= ABSOLUTE.len() && raw[..ABSOLUTE.len()].eq_ignore_ascii_case(ABSOLUTE) {
            let authority = target.start + ABSOLUTE.len();
            let slash = bytes[authority..target.end]
                .iter()
                .position(|b| *b == b'/')
                .ok_or(ParseError::BadTarget)?;
            target.start = authority + slash;
        }
        if bytes.get(target.start) != Some(&b'/') {
            return Err(ParseError::BadTarget);
        }

        self.head.method = Some(method);
        self.head.target = line.start + target.start..line.start + target.end;
        self.head.version = line.start + version_start..line.end;
        tracing::trace!(method = method.as_str(), "request line parsed");
        Ok(())
    }

    fn parse_header(&mut self, line: Range<usize>) -> Result<(), ParseError> {
        let bytes = &self.buf[line.clone()];
        let value_of = |name: &[u8]| -> Option<usize> {
            if bytes.len() >= name.len() && bytes[..name.len()].eq_ignore_ascii_case(name) {
                let skip = bytes[name.len()..]
                    .iter()
                    .take_while(|b| **b == b' ' || **b == b'\t')
                    .count();
                Some(name.len() + skip)
            } else {
                None
            }
        };

        if let Some(at) = value_of(b"Connection:") {
            if bytes[at..].eq_ignore_ascii_case(b"keep-alive") {
                self.head.keep_alive = true;
            }
        } else if let Some(at) = value_of(b"Content-Length:") {
            let digits = std::str::from_utf8(&bytes[at..])
                .map_err(|_| ParseError::BadContentLength)?
                .trim_end();
            self.head.content_length = digits.parse().map_err(|_| ParseError::BadContentLength)?;
        } else if let Some(at) = value_of(b"Host:") {
            self.head.host = Some(line.start + at..line.end);
        } else {
            tracing::trace!("ignoring unrecognized header");
        }
        Ok(())
    }
}
