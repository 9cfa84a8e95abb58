// src/context.rs
use crate::cgi::CgiGateway;
use crate::conn::{Connection, Next, Services};
use crate::file::DocumentRoot;
use crate::metrics::ServerStats;
use crate::slab::{ConnectionTable, SlotId};
use crate::syscalls::{self, EPOLLERR, EPOLLHUP, EPOLLRDHUP, Epoll, client_interest};
use std::sync::MutexGuard;

/// One unit of pool work: "this slot has readiness `events`".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Job {
    pub slot: SlotId,
    pub events: u32,
}

impl Job {
    pub fn is_hangup(&self) -> bool {
        self.events & (EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0
    }
}

/// Everything the reactor and the workers share. Passed explicitly as an
/// `Arc`; there is no global state.
pub struct ServerContext {
    pub epoll: Epoll,
    pub table: ConnectionTable,
    pub stats: ServerStats,
    pub doc_root: DocumentRoot,
    pub gateway: CgiGateway,
}

impl ServerContext {
    pub fn services(&self) -> Services<'_> {
        Services {
            doc_root: &self.doc_root,
            gateway: &self.gateway,
            stats: &self.stats,
        }
    }

    /// Worker entry point. Stale or duplicated jobs fall through harmlessly.
    pub fn handle(&self, job: Job) {
        let Some(mut conn) = self.table.get(job.slot) else {
            tracing::trace!(slot = job.slot.index, "dropping stale job");
            return;
        };

        if job.is_hangup() {
            tracing::debug!(fd = conn.fd, "peer hung up");
            self.close(job.slot, conn);
            return;
        }

        let next = conn.step(self.services());
        self.apply(job.slot, conn, next);
    }

    fn apply(&self, slot: SlotId, conn: MutexGuard<'_, Connection>, next: Next) {
        let writable = match next {
            Next::Read => false,
            Next::Write => true,
            Next::Close => return self.close(slot, conn),
        };
        if let Err(e) = self
            .epoll
            .modify(conn.fd, slot.token(), client_interest(writable))
        {
            tracing::error!(fd = conn.fd, error = %e, "failed to re-arm descriptor");
            self.close(slot, conn);
        }
    }

    /// Deregister, close the descriptor and free the slot.
    pub fn close(&self, slot: SlotId, conn: MutexGuard<'_, Connection>) {
        let fd = conn.fd;
        let requests = conn.requests_served;
        if let Err(e) = self.epoll.delete(fd) {
            tracing::debug!(fd, error = %e, "epoll delete failed");
        }
        syscalls::close_fd(fd);
        self.table.free(slot, conn);
        self.stats.dec_conn();
        tracing::debug!(fd, slot = slot.index, requests, "connection closed");
    }

    /// Close every open connection. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for slot in self.table.open_slots() {
            if let Some(conn) = self.table.get(slot) {
                self.close(slot, conn);
                closed += 1;
            }
        }
        closed
    }
}
