// src/server.rs
use crate::cgi::CgiGateway;
use crate::config::ServerConfig;
use crate::context::{Job, ServerContext};
use crate::error::EtudeResult;
use crate::file::DocumentRoot;
use crate::metrics::{ServerStats, StatsSnapshot};
use crate::pool::WorkerPool;
use crate::reactor::Reactor;
use crate::slab::ConnectionTable;
use crate::syscalls::{self, Epoll, EventFd};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A bound server, ready to [`run`](Server::run).
///
/// ```rust,no_run
/// use etude::{Server, ServerConfig};
///
/// let config = ServerConfig::new("127.0.0.1".parse().unwrap(), 8080, "/srv/www");
/// let server = Server::bind(&config).unwrap();
/// let handle = server.shutdown_handle();
/// std::thread::spawn(move || server.run());
/// handle.shutdown();
/// ```
pub struct Server {
    reactor: Reactor,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<EventFd>,
}

/// Cloneable trigger for a graceful stop from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<EventFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.notify() {
            tracing::error!(error = %e, "failed to wake reactor");
        }
    }
}

impl Server {
    /// Bind the listener, allocate the connection table and start the workers.
    pub fn bind(config: &ServerConfig) -> EtudeResult<Self> {
        let listen_fd = syscalls::create_listen_socket(config.addr, config.backlog)?;
        // SAFETY: `listen_fd` was just created and is owned by nobody else.
        let listener = unsafe { OwnedFd::from_raw_fd(listen_fd) };
        let local_addr = syscalls::local_addr(listen_fd)?;

        let ctx = Arc::new(ServerContext {
            epoll: Epoll::new()?,
            table: ConnectionTable::new(
                config.max_connections,
                config.read_buf_size,
                config.write_buf_size,
            ),
            stats: ServerStats::new(),
            doc_root: DocumentRoot::new(&config.doc_root),
            gateway: CgiGateway::new(config.cgi_program_path()),
        });

        let worker_ctx = Arc::clone(&ctx);
        let pool = WorkerPool::new(config.threads, config.max_requests, move |job: Job| {
            worker_ctx.handle(job)
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let waker = Arc::new(EventFd::new()?);
        let reactor = Reactor::new(ctx, pool, listener, Arc::clone(&waker), Arc::clone(&stop))?;

        tracing::info!(
            addr = %local_addr,
            workers = config.threads,
            max_connections = config.max_connections,
            doc_root = %config.doc_root.display(),
            "server bound"
        );
        Ok(Self {
            reactor,
            local_addr,
            stop,
            waker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.reactor.context().stats.snapshot()
    }

    /// Serve until a [`ShutdownHandle`] fires, then drain the pool, close
    /// every connection and return the final counters.
    pub fn run(self) -> EtudeResult<StatsSnapshot> {
        let result = self.reactor.run();
        let closed = self.reactor.teardown();
        let stats = self.stats();
        tracing::info!(
            closed,
            requests = stats.req_count,
            bytes_sent = stats.bytes_sent,
            rejected = stats.rejected,
            "server shut down"
        );
        result.map(|()| stats)
    }
}
