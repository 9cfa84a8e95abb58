#![allow(dead_code)]

use etude::{EtudeResult, Server, ServerConfig, ShutdownHandle, StatsSnapshot};
use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ShutdownHandle,
    pub root: tempfile::TempDir,
    thread: Option<JoinHandle<EtudeResult<StatsSnapshot>>>,
}

impl TestServer {
    /// Start a server on an ephemeral port. `tweak` adjusts the config and
    /// may populate the document root first.
    pub fn start(tweak: impl FnOnce(&Path, ServerConfig) -> ServerConfig) -> Self {
        let root = tempfile::tempdir().unwrap();
        write_file(&root.path().join("index.html"), b"<h1>index</h1>", 0o644);

        let config = ServerConfig::new("127.0.0.1".parse().unwrap(), 0, root.path())
            .threads(2)
            .max_requests(64)
            .max_connections(32);
        let config = tweak(root.path(), config);

        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let thread = thread::Builder::new()
            .name("etude-test-reactor".into())
            .spawn(move || server.run())
            .unwrap();

        Self {
            addr,
            handle,
            root,
            thread: Some(thread),
        }
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
    }

    /// Send one request on a fresh connection and read until the server closes.
    pub fn round_trip(&self, request: &[u8]) -> Vec<u8> {
        let mut stream = self.connect();
        stream.write_all(request).unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    pub fn stop(mut self) -> StatsSnapshot {
        self.handle.shutdown();
        self.thread.take().unwrap().join().unwrap().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

pub fn write_file(path: &Path, body: &[u8], mode: u32) {
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// Read exactly one `Content-Length` framed response.
pub fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let len: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .expect("Content-Length header")
        .trim()
        .parse()
        .unwrap();
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    (head, body)
}
