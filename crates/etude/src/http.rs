// src/http.rs
use crate::error::{EtudeError, EtudeResult};
use std::fmt::{self, Write as _};

/// Capacity of the per-connection response header buffer.
pub const WRITE_BUF_SIZE: usize = 1024;

/// Body sent in place of an empty file.
pub const EMPTY_FILE_BODY: &str = "<html><body></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Case-insensitive match against the supported methods.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if bytes.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Forbidden,
    NotFound,
    InternalError,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::Forbidden => 403,
            Status::NotFound => 404,
            Status::InternalError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::InternalError => "Internal Error",
        }
    }

    /// Fixed HTML body for error statuses. `None` for 200.
    pub fn error_body(&self) -> Option<&'static str> {
        match self {
            Status::Ok => None,
            Status::BadRequest => Some(
                "<html><body><h1>400 Bad Request</h1><p>Your request has bad syntax or is inherently impossible to satisfy.</p></body></html>",
            ),
            Status::Forbidden => Some(
                "<html><body><h1>403 Forbidden</h1><p>You do not have permission to get file from this server.</p></body></html>",
            ),
            Status::NotFound => Some(
                "<html><body><h1>404 Not Found</h1><p>The requested file was not found on this server.</p></body></html>",
            ),
            Status::InternalError => Some(
                "<html><body><h1>500 Internal Error</h1><p>There was an unusual problem serving the requested file.</p></body></html>",
            ),
        }
    }
}

/// Fixed-capacity response header buffer. Overflow is an error, never a
/// reallocation.
pub struct WriteBuffer {
    buf: Box<[u8]>,
    len: usize,
}

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn append(&mut self, bytes: &[u8]) -> EtudeResult<()> {
        let end = self.len + bytes.len();
        if end > self.buf.len() {
            return Err(EtudeError::WriteBufferFull);
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl fmt::Write for WriteBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// Compose status line, `Content-Length`, `Connection` and the blank line.
///
/// On overflow the buffer is left cleared.
pub fn compose_head(
    out: &mut WriteBuffer,
    status: Status,
    content_length: usize,
    keep_alive: bool,
) -> EtudeResult<()> {
    out.clear();
    let res = write!(
        out,
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status.code(),
        status.reason(),
        content_length,
        if keep_alive { "keep-alive" } else { "close" },
    );
    if res.is_err() {
        out.clear();
        return Err(EtudeError::WriteBufferFull);
    }
    Ok(())
}

/// Compose a complete error (or inline-body) response into `out`.
pub fn compose_inline(
    out: &mut WriteBuffer,
    status: Status,
    body: &str,
    keep_alive: bool,
) -> EtudeResult<()> {
    compose_head(out, status, body.len(), keep_alive)?;
    if let Err(e) = out.append(body.as_bytes()) {
        out.clear();
        return Err(e);
    }
    Ok(())
}
