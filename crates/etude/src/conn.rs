// src/conn.rs
use crate::cgi::{CgiError, CgiGateway};
use crate::file::{DocumentRoot, FileBody};
use crate::http::{self, Method, Status, WriteBuffer, EMPTY_FILE_BODY};
use crate::metrics::ServerStats;
use crate::parser::{Progress, RequestParser};
use crate::syscalls::{self, MappedFile, SocketWriter};
use libc::c_int;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Free,
    /// Waiting for (more of) a request.
    Reading,
    /// A response is partially written.
    Writing,
}

/// What the caller must do with the descriptor after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Re-arm for readability.
    Read,
    /// Re-arm for writability.
    Write,
    Close,
}

/// Collaborators a connection needs to answer a request.
#[derive(Clone, Copy)]
pub struct Services<'a> {
    pub doc_root: &'a DocumentRoot,
    pub gateway: &'a CgiGateway,
    pub stats: &'a ServerStats,
}

enum Fill {
    Data,
    NoData,
    Closed,
}

pub struct Connection {
    pub fd: c_int,
    pub peer: Option<SocketAddr>,
    pub state: ConnState,
    /// Bumped every time the slot is released.
    pub generation: u32,
    pub requests_served: u32,
    pub parser: RequestParser,
    pub write_buf: WriteBuffer,
    body: Option<MappedFile>,
    bytes_sent: usize,
    bytes_total: usize,
    keep_alive: bool,
}

impl Connection {
    pub fn new(read_capacity: usize, write_capacity: usize) -> Self {
        Self {
            fd: -1,
            peer: None,
            state: ConnState::Free,
            generation: 0,
            requests_served: 0,
            parser: RequestParser::new(read_capacity),
            write_buf: WriteBuffer::new(write_capacity),
            body: None,
            bytes_sent: 0,
            bytes_total: 0,
            keep_alive: false,
        }
    }

    /// Take ownership of a freshly accepted socket.
    pub fn open(&mut self, fd: c_int, peer: Option<SocketAddr>) {
        self.fd = fd;
        self.peer = peer;
        self.state = ConnState::Reading;
        self.requests_served = 0;
        self.parser.reset();
        self.clear_response();
    }

    /// Forget the socket and invalidate outstanding tokens. Does not close `fd`.
    pub fn release(&mut self) {
        self.fd = -1;
        self.peer = None;
        self.state = ConnState::Free;
        self.generation = self.generation.wrapping_add(1);
        self.parser.reset();
        self.clear_response();
    }

    pub fn is_open(&self) -> bool {
        self.state != ConnState::Free
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn bytes_total(&self) -> usize {
        self.bytes_total
    }

    fn clear_response(&mut self) {
        self.body = None;
        self.write_buf.clear();
        self.bytes_sent = 0;
        self.bytes_total = 0;
        self.keep_alive = false;
    }

    /// Run one step for a ready descriptor.
    pub fn step(&mut self, services: Services<'_>) -> Next {
        match self.state {
            ConnState::Free => Next::Close,
            ConnState::Writing => self.flush(services.stats),
            ConnState::Reading => self.on_readable(services),
        }
    }

    fn on_readable(&mut self, services: Services<'_>) -> Next {
        match self.fill() {
            Fill::Closed => Next::Close,
            // Duplicate wake-up: nothing new to parse.
            Fill::NoData if !self.parser.is_full() => Next::Read,
            Fill::NoData | Fill::Data => self.advance(services),
        }
    }

    /// Drain the socket into the read buffer until it would block.
    fn fill(&mut self) -> Fill {
        let mut got = false;
        while !self.parser.is_full() {
            match syscalls::read_nonblocking(self.fd, self.parser.spare_mut()) {
                Ok(Some(0)) => return Fill::Closed,
                Ok(Some(n)) => {
                    self.parser.commit(n);
                    got = true;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "read failed");
                    return Fill::Closed;
                }
            }
        }
        if got { Fill::Data } else { Fill::NoData }
    }

    /// Feed buffered bytes to the parser and respond once a request is complete.
    pub fn advance(&mut self, services: Services<'_>) -> Next {
        match self.parser.process() {
            Ok(Progress::NeedMore) if self.parser.is_full() => {
                tracing::debug!(fd = self.fd, "request exceeds read buffer");
                Next::Close
            }
            Ok(Progress::NeedMore) => Next::Read,
            Ok(Progress::RequestReady) => {
                services.stats.inc_req();
                self.requests_served += 1;
                self.route(services)
            }
            Err(e) => {
                tracing::debug!(fd = self.fd, error = ?e, "rejecting request");
                let keep_alive = !e.forces_close() && self.parser.keep_alive();
                self.respond_inline(e.status(), keep_alive, services.stats)
            }
        }
    }

    fn route(&mut self, services: Services<'_>) -> Next {
        let keep_alive = self.parser.keep_alive();
        match self.parser.method() {
            Some(Method::Get) => match services.doc_root.resolve(self.parser.target()) {
                Ok(body) => self.respond_file(body, keep_alive, services.stats),
                Err(e) => self.respond_inline(e.status(), keep_alive, services.stats),
            },
            Some(Method::Post) => self.run_cgi(services),
            None => self.respond_inline(Status::InternalError, false, services.stats),
        }
    }

    fn respond_file(&mut self, body: FileBody, keep_alive: bool, stats: &ServerStats) -> Next {
        match body {
            FileBody::Empty => self.respond_with(Status::Ok, EMPTY_FILE_BODY, keep_alive, stats),
            FileBody::Mapped(map) => {
                if let Err(e) = http::compose_head(&mut self.write_buf, Status::Ok, map.len(), keep_alive) {
                    tracing::error!(fd = self.fd, error = %e, "cannot compose response");
                    return Next::Close;
                }
                self.bytes_total = self.write_buf.len() + map.len();
                self.body = Some(map);
                self.begin_write(keep_alive, stats)
            }
        }
    }

    fn respond_inline(&mut self, status: Status, keep_alive: bool, stats: &ServerStats) -> Next {
        let body = status.error_body().unwrap_or_default();
        self.respond_with(status, body, keep_alive, stats)
    }

    fn respond_with(&mut self, status: Status, body: &str, keep_alive: bool, stats: &ServerStats) -> Next {
        if let Err(e) = http::compose_inline(&mut self.write_buf, status, body, keep_alive) {
            tracing::error!(fd = self.fd, error = %e, "cannot compose response");
            return Next::Close;
        }
        self.body = None;
        self.bytes_total = self.write_buf.len();
        self.begin_write(keep_alive, stats)
    }

    fn begin_write(&mut self, keep_alive: bool, stats: &ServerStats) -> Next {
        self.keep_alive = keep_alive;
        self.bytes_sent = 0;
        self.state = ConnState::Writing;
        self.flush(stats)
    }

    /// Continue sending header and body as one vectored stream.
    fn flush(&mut self, stats: &ServerStats) -> Next {
        while self.bytes_sent < self.bytes_total {
            let head = self.write_buf.as_bytes();
            let body = self.body.as_ref().map(|m| m.as_slice()).unwrap_or(&[]);
            let result = if self.bytes_sent < head.len() {
                syscalls::writev_nonblocking(self.fd, &[&head[self.bytes_sent..], body])
            } else {
                syscalls::writev_nonblocking(self.fd, &[&body[self.bytes_sent - head.len()..]])
            };
            match result {
                Ok(Some(0)) => {
                    self.clear_response();
                    return Next::Close;
                }
                Ok(Some(n)) => {
                    self.bytes_sent += n;
                    stats.add_bytes(n);
                }
                Ok(None) => return Next::Write,
                Err(e) => {
                    tracing::debug!(fd = self.fd, error = %e, "write failed");
                    self.clear_response();
                    return Next::Close;
                }
            }
        }
        self.finish_response()
    }

    fn finish_response(&mut self) -> Next {
        let keep_alive = self.keep_alive;
        self.clear_response();
        if keep_alive {
            self.parser.reset();
            self.state = ConnState::Reading;
            Next::Read
        } else {
            Next::Close
        }
    }

    /// Hand the buffered body to the CGI program. The connection always
    /// closes afterwards unless nothing reached the client yet.
    fn run_cgi(&mut self, services: Services<'_>) -> Next {
        let mut writer = SocketWriter::new(self.fd);
        let result = services.gateway.run(self.parser.body(), &mut writer);
        services.stats.add_bytes(writer.written());

        match result {
            Ok(_) if writer.written() > 0 => Next::Close,
            Ok(_) => {
                tracing::warn!(fd = self.fd, "CGI program produced no output");
                self.respond_inline(Status::InternalError, false, services.stats)
            }
            Err(e @ CgiError::Spawn { .. }) => {
                tracing::error!(fd = self.fd, error = %e, "CGI spawn failed");
                self.respond_inline(Status::InternalError, false, services.stats)
            }
            Err(e) => {
                tracing::warn!(fd = self.fd, error = %e, "CGI relay aborted");
                Next::Close
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::WRITE_BUF_SIZE;
    use crate::parser::{ParseState, READ_BUF_SIZE};
    use std::fs;
    use std::io::{Read, Write};
    use std::os::fd::IntoRawFd;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;

    struct Fixture {
        _dir: tempfile::TempDir,
        doc_root: DocumentRoot,
        gateway: CgiGateway,
        stats: ServerStats,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let index = dir.path().join("index.html");
            fs::write(&index, b"hello world").unwrap();
            fs::set_permissions(&index, fs::Permissions::from_mode(0o644)).unwrap();
            Self {
                doc_root: DocumentRoot::new(dir.path()),
                gateway: CgiGateway::new("/bin/cat"),
                stats: ServerStats::new(),
                _dir: dir,
            }
        }

        fn services(&self) -> Services<'_> {
            Services {
                doc_root: &self.doc_root,
                gateway: &self.gateway,
                stats: &self.stats,
            }
        }
    }

    fn connected() -> (Connection, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(READ_BUF_SIZE, WRITE_BUF_SIZE);
        conn.open(ours.into_raw_fd(), None);
        (conn, theirs)
    }

    fn read_available(peer: &mut UnixStream) -> Vec<u8> {
        peer.set_read_timeout(Some(std::time::Duration::from_millis(200)))
            .unwrap();
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        while let Ok(n) = peer.read(&mut chunk) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }

    #[test]
    fn keep_alive_get_resets_parser_for_next_request() {
        let fx = Fixture::new();
        let (mut conn, mut peer) = connected();

        peer.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert_eq!(conn.step(fx.services()), Next::Read);
        assert_eq!(conn.state, ConnState::Reading);
        assert_eq!(conn.parser.state(), ParseState::AwaitingRequestLine);
        assert_eq!(conn.parser.read_cursor(), 0);
        assert_eq!(conn.parser.parsed_cursor(), 0);

        let wire = read_available(&mut peer);
        assert_eq!(
            wire,
            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: keep-alive\r\n\r\nhello world"
        );
        assert_eq!(fx.stats.snapshot().req_count, 1);
        assert_eq!(fx.stats.snapshot().bytes_sent, wire.len());
        assert_eq!(conn.requests_served, 1);

        peer.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(conn.step(fx.services()), Next::Close);
        let wire = String::from_utf8(read_available(&mut peer)).unwrap();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("Connection: close"));
        assert_eq!(conn.requests_served, 2);
        syscalls::close_fd(conn.fd);
    }

    #[test]
    fn partial_request_waits_for_more_bytes() {
        let fx = Fixture::new();
        let (mut conn, mut peer) = connected();

        peer.write_all(b"GET / HTT").unwrap();
        assert_eq!(conn.step(fx.services()), Next::Read);
        // Nothing new: a duplicate wake-up just re-arms.
        assert_eq!(conn.step(fx.services()), Next::Read);

        peer.write_all(b"P/1.1\r\n\r\n").unwrap();
        assert_eq!(conn.step(fx.services()), Next::Close);
        assert!(read_available(&mut peer).starts_with(b"HTTP/1.1 200 OK"));
        syscalls::close_fd(conn.fd);
    }

    #[test]
    fn malformed_framing_forces_close_even_with_keep_alive() {
        let fx = Fixture::new();
        let (mut conn, mut peer) = connected();
        peer.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\nX: a\rb\r\n\r\n")
            .unwrap();
        assert_eq!(conn.step(fx.services()), Next::Close);
        let wire = String::from_utf8(read_available(&mut peer)).unwrap();
        assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(wire.contains("Connection: close"));
        syscalls::close_fd(conn.fd);
    }

    #[test]
    fn unframeable_body_forces_close_even_with_keep_alive() {
        let fx = Fixture::new();
        for request in [
            &b"POST /c HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 99999\r\n\r\nabc"[..],
            b"POST /c HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: ten\r\n\r\nabc",
        ] {
            let (mut conn, mut peer) = connected();
            peer.write_all(request).unwrap();
            assert_eq!(conn.step(fx.services()), Next::Close);
            let wire = String::from_utf8(read_available(&mut peer)).unwrap();
            assert!(wire.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", wire);
            assert!(wire.contains("Connection: close"));
            syscalls::close_fd(conn.fd);
        }
    }

    #[test]
    fn bad_method_gets_fixed_400_body() {
        let fx = Fixture::new();
        let (mut conn, mut peer) = connected();
        // Rejected at the request line, before any Connection header is seen.
        peer.write_all(b"DELETE / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        assert_eq!(conn.step(fx.services()), Next::Close);
        let wire = String::from_utf8(read_available(&mut peer)).unwrap();
        let body = Status::BadRequest.error_body().unwrap();
        assert!(wire.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(wire.ends_with(body));
        syscalls::close_fd(conn.fd);
    }

    #[test]
    fn eof_closes() {
        let fx = Fixture::new();
        let (mut conn, peer) = connected();
        drop(peer);
        assert_eq!(conn.step(fx.services()), Next::Close);
        syscalls::close_fd(conn.fd);
    }

    #[test]
    fn oversized_request_closes() {
        let fx = Fixture::new();
        let (mut conn, mut peer) = connected();
        let mut junk = b"GET /".to_vec();
        junk.resize(READ_BUF_SIZE + 10, b'a');
        peer.write_all(&junk).unwrap();
        assert_eq!(conn.step(fx.services()), Next::Close);
        syscalls::close_fd(conn.fd);
    }

    #[test]
    fn post_relays_cgi_output_and_closes() {
        let fx = Fixture::new();
        let (mut conn, mut peer) = connected();
        let body = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi";
        let request = format!("POST /calc HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len());
        peer.write_all(request.as_bytes()).unwrap();
        peer.write_all(body).unwrap();

        assert_eq!(conn.step(fx.services()), Next::Close);
        // /bin/cat echoes the body, so the wire carries it verbatim.
        assert_eq!(read_available(&mut peer), body);
        syscalls::close_fd(conn.fd);
    }

    #[test]
    fn release_invalidates_generation() {
        let (mut conn, _peer) = connected();
        let fd = conn.fd;
        let generation = conn.generation;
        conn.release();
        assert!(!conn.is_open());
        assert_eq!(conn.generation, generation.wrapping_add(1));
        syscalls::close_fd(fd);
    }
}
