// src/reactor.rs
//! Single-threaded accept + dispatch loop.
//!
//! The reactor owns the listening socket and the wake-up eventfd. Client
//! readiness of every kind is forwarded to the worker pool as a [`Job`]; the
//! reactor itself only touches a connection to initialize its slot on accept
//! or to close it when the pool refuses the job.

use crate::context::{Job, ServerContext};
use crate::error::EtudeResult;
use crate::pool::WorkerPool;
use crate::slab::SlotId;
use crate::syscalls::{self, EPOLLIN, EventFd, client_interest, epoll_event};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const LISTENER_TOKEN: u64 = u64::MAX;
pub const WAKER_TOKEN: u64 = u64::MAX - 1;

/// Written to a client that arrives while every slot is taken.
pub const BUSY_RESPONSE: &[u8] = b"Internal server busy";

const MAX_EVENTS: usize = 1024;

pub struct Reactor {
    ctx: Arc<ServerContext>,
    pool: WorkerPool<Job>,
    listener: OwnedFd,
    waker: Arc<EventFd>,
    stop: Arc<AtomicBool>,
}

impl Reactor {
    /// Register the listener (level-triggered, no oneshot) and the waker.
    pub fn new(
        ctx: Arc<ServerContext>,
        pool: WorkerPool<Job>,
        listener: OwnedFd,
        waker: Arc<EventFd>,
        stop: Arc<AtomicBool>,
    ) -> EtudeResult<Self> {
        ctx.epoll.add(listener.as_raw_fd(), LISTENER_TOKEN, EPOLLIN)?;
        ctx.epoll.add(waker.fd, WAKER_TOKEN, EPOLLIN)?;
        Ok(Self {
            ctx,
            pool,
            listener,
            waker,
            stop,
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Block in `epoll_wait` and dispatch until the stop flag is raised.
    pub fn run(&self) -> EtudeResult<()> {
        let mut events = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !self.stop.load(Ordering::Acquire) {
            let n = self.ctx.epoll.wait(&mut events, -1)?;

            for event in &events[..n] {
                let token = event.u64;
                let flags = event.events;
                match token {
                    LISTENER_TOKEN => self.accept_one(),
                    WAKER_TOKEN => {
                        self.waker.drain();
                    }
                    _ => self.dispatch(SlotId::from_token(token), flags),
                }
            }
        }
        tracing::info!("reactor stopped");
        Ok(())
    }

    /// Stop accepting, drain and join the pool, then close what is left.
    pub fn teardown(&self) -> usize {
        if let Err(e) = self.ctx.epoll.delete(self.listener.as_raw_fd()) {
            tracing::debug!(error = %e, "listener deregistration failed");
        }
        self.pool.shutdown();
        self.ctx.close_all()
    }

    fn accept_one(&self) {
        let (fd, peer) = match syscalls::accept_connection(self.listener.as_raw_fd()) {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                return;
            }
        };

        let slot = match self.ctx.table.allocate(fd, peer) {
            Ok(slot) => slot,
            Err(e) if e.is_capacity() => {
                tracing::warn!(fd, error = %e, "rejecting connection");
                // Best effort, never blocks the reactor.
                let _ = syscalls::writev_nonblocking(fd, &[BUSY_RESPONSE]);
                syscalls::close_fd(fd);
                self.ctx.stats.inc_rejected();
                return;
            }
            Err(e) => {
                tracing::error!(fd, error = %e, "cannot allocate connection slot");
                syscalls::close_fd(fd);
                return;
            }
        };
        self.ctx.stats.inc_conn();

        if let Err(e) = self.ctx.epoll.add(fd, slot.token(), client_interest(false)) {
            tracing::error!(fd, error = %e, "failed to register connection");
            if let Some(conn) = self.ctx.table.get(slot) {
                self.ctx.close(slot, conn);
            }
            return;
        }
        tracing::debug!(fd, slot = slot.index, peer = ?peer, "connection accepted");
    }

    fn dispatch(&self, slot: SlotId, events: u32) {
        if let Err(e) = self.pool.submit(Job { slot, events }) {
            if e.is_capacity() {
                tracing::warn!(slot = slot.index, error = %e, "job rejected; closing connection");
            } else {
                tracing::error!(slot = slot.index, error = %e, "dispatch failed; closing connection");
            }
            self.ctx.stats.inc_rejected();
            if let Some(conn) = self.ctx.table.get(slot) {
                self.ctx.close(slot, conn);
            }
        }
    }
}
