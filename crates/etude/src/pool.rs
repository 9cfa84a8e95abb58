// src/pool.rs
//! Fixed-size worker pool draining a bounded FIFO job queue.
//!
//! The queue sits behind a mutex; a counting semaphore carries one permit per
//! queued job so idle workers sleep instead of spinning. Jobs run in strict
//! submission order. `shutdown` drains what is already queued, then joins.

use crate::error::{EtudeError, EtudeResult};
use crate::sync::{Semaphore, lock};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Handler<J> = Arc<dyn Fn(J) + Send + Sync + 'static>;

struct PoolInner<J> {
    queue: Mutex<VecDeque<J>>,
    ready: Semaphore,
    stop: AtomicBool,
    max_queue_len: usize,
}

pub struct WorkerPool<J: Send + 'static> {
    inner: Arc<PoolInner<J>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Spawn `thread_count` workers, each running `handler` on dequeued jobs.
    ///
    /// Both `thread_count` and `max_queue_len` must be non-zero.
    pub fn new<F>(thread_count: usize, max_queue_len: usize, handler: F) -> EtudeResult<Self>
    where
        F: Fn(J) + Send + Sync + 'static,
    {
        if thread_count == 0 {
            return Err(EtudeError::InvalidPool("thread_count must be > 0"));
        }
        if max_queue_len == 0 {
            return Err(EtudeError::InvalidPool("max_queue_len must be > 0"));
        }

        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::with_capacity(max_queue_len.min(4096))),
            ready: Semaphore::new(0),
            stop: AtomicBool::new(false),
            max_queue_len,
        });
        let pool = Self {
            inner,
            handles: Mutex::new(Vec::with_capacity(thread_count)),
            thread_count,
        };

        let handler: Handler<J> = Arc::new(handler);
        for worker_id in 0..thread_count {
            let inner = Arc::clone(&pool.inner);
            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name(format!("etude-worker-{}", worker_id))
                .spawn(move || worker_loop(inner, handler, worker_id));
            match spawned {
                Ok(handle) => lock(&pool.handles).push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(thread_count, max_queue_len, "worker pool started");
        Ok(pool)
    }

    /// Queue a job without blocking.
    ///
    /// Fails with `QueueFull` when the queue already holds `max_queue_len`
    /// jobs and with `PoolClosed` after `shutdown`.
    pub fn submit(&self, job: J) -> EtudeResult<()> {
        let mut queue = lock(&self.inner.queue);
        if self.inner.stop.load(Ordering::Acquire) {
            return Err(EtudeError::PoolClosed);
        }
        if queue.len() >= self.inner.max_queue_len {
            return Err(EtudeError::QueueFull);
        }
        queue.push_back(job);
        drop(queue);
        self.inner.ready.post();
        Ok(())
    }

    /// Stop accepting jobs, let workers drain the queue, and join them.
    /// Idempotent.
    pub fn shutdown(&self) {
        {
            let _queue = lock(&self.inner.queue);
            self.inner.stop.store(true, Ordering::Release);
        }

        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for _ in 0..handles.len() {
            self.inner.ready.post();
        }
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }
        tracing::debug!("worker pool stopped");
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn max_queue_len(&self) -> usize {
        self.inner.max_queue_len
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }
}

impl<J: Send + 'static> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<J>(inner: Arc<PoolInner<J>>, handler: Handler<J>, worker_id: usize) {
    loop {
        inner.ready.wait();

        let job = {
            let mut queue = lock(&inner.queue);
            match queue.pop_front() {
                Some(job) => job,
                // Empty with stop set: everything queued before shutdown has run.
                None if inner.stop.load(Ordering::Acquire) => break,
                None => continue,
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(job)));
        if result.is_err() {
            tracing::error!(worker_id, "job panicked; worker continues");
        }
    }
    tracing::trace!(worker_id, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn rejects_invalid_arguments() {
        assert!(matches!(
            WorkerPool::new(0, 10, |_: u32| {}),
            Err(EtudeError::InvalidPool(_))
        ));
        assert!(matches!(
            WorkerPool::new(2, 0, |_: u32| {}),
            Err(EtudeError::InvalidPool(_))
        ));
    }

    #[test]
    fn single_worker_runs_jobs_in_submission_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pool = WorkerPool::new(1, 64, move |job: u32| sink.lock().unwrap().push(job)).unwrap();
        for i in 0..50 {
            pool.submit(i).unwrap();
        }
        pool.shutdown();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn full_queue_rejects_without_blocking_or_corruption() {
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = Mutex::new(gate_rx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let pool = WorkerPool::new(1, 2, move |job: u32| {
            if job == 0 {
                started_tx.send(()).unwrap();
                gate_rx.lock().unwrap().recv().unwrap();
            }
            sink.lock().unwrap().push(job);
        })
        .unwrap();

        pool.submit(0).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.submit(1).unwrap();
        pool.submit(2).unwrap();
        assert!(matches!(pool.submit(3), Err(EtudeError::QueueFull)));
        assert!(matches!(pool.submit(4), Err(EtudeError::QueueFull)));
        assert_eq!(pool.queue_len(), 2);

        gate_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn shutdown_drains_queued_jobs_then_closes() {
        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        let pool = WorkerPool::new(4, 1000, move |_: usize| {
            thread::sleep(Duration::from_millis(1));
            *sink.lock().unwrap() += 1;
        })
        .unwrap();
        for i in 0..200 {
            pool.submit(i).unwrap();
        }
        pool.shutdown();
        assert_eq!(*count.lock().unwrap(), 200);
        assert_eq!(pool.queue_len(), 0);
        assert!(pool.is_closed());
        assert!(matches!(pool.submit(1), Err(EtudeError::PoolClosed)));
        // second call is a no-op
        pool.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pool = WorkerPool::new(1, 8, move |job: u32| {
            if job == 1 {
                panic!("boom");
            }
            sink.lock().unwrap().push(job);
        })
        .unwrap();
        for i in 0..4 {
            pool.submit(i).unwrap();
        }
        pool.shutdown();
        assert_eq!(*seen.lock().unwrap(), vec![0, 2, 3]);
    }
}
