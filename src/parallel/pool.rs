//! Per-query worker pools.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{ExecError, OperatorId, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Kind of work a pool is sized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Storage-bound scans; bounded by configuration.
    Io,
    /// CPU-bound joins and aggregations; sized to available cores.
    Cpu,
}

impl PoolKind {
    fn label(self) -> &'static str {
        match self {
            PoolKind::Io => "io",
            PoolKind::Cpu => "cpu",
        }
    }
}

#[derive(Default)]
struct PoolQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<PoolQueue>,
    wakeup: Condvar,
}

/// Fixed-size thread pool owned by one query run.
///
/// Dropping the pool stops its workers after the queued jobs drain without
/// waiting for them; [`WorkerPool::shutdown`] waits up to a timeout.
pub struct WorkerPool {
    kind: PoolKind,
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    exited: Receiver<usize>,
}

/// Handle to a job's result.
pub struct TaskHandle<T> {
    operator: OperatorId,
    result: Receiver<thread::Result<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the job finished. A panic becomes a fatal operator error;
    /// a job discarded by shutdown reports cancellation.
    pub fn join(self) -> Result<T> {
        match self.result.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_owned());
                Err(ExecError::fatal(&self.operator, format!("worker panicked: {reason}")))
            }
            Err(_) => Err(ExecError::Cancelled),
        }
    }
}

impl WorkerPool {
    /// Starts `size` workers (at least one). Fails if the OS refuses to
    /// create a thread.
    pub fn new(kind: PoolKind, size: usize) -> Result<Self> {
        let size = size.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(PoolQueue::default()),
            wakeup: Condvar::new(),
        });
        let (exit_tx, exited) = mpsc::channel();
        let mut pool = Self {
            kind,
            shared,
            workers: Vec::with_capacity(size),
            exited,
        };
        for index in 0..size {
            let shared = Arc::clone(&pool.shared);
            let exit_tx = exit_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("lakeflow-{}-{index}", kind.label()))
                .spawn(move || Self::worker_loop(index, shared, exit_tx))?;
            pool.workers.push(handle);
        }
        debug!(kind = kind.label(), size, "parallel.pool.started");
        Ok(pool)
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Kind of work the pool was created for.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Queues `job` on behalf of `operator`.
    pub fn spawn<F, T>(&self, operator: OperatorId, job: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx): (SyncSender<thread::Result<T>>, _) = mpsc::sync_channel(1);
        let wrapped: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(job));
            let _ = tx.send(outcome);
        });
        {
            let mut queue = self.shared.queue.lock();
            if !queue.shutdown {
                queue.jobs.push_back(wrapped);
            }
        }
        self.shared.wakeup.notify_one();
        TaskHandle {
            operator,
            result: rx,
        }
    }

    /// Stops accepting jobs, discards queued ones and waits up to `timeout`
    /// for workers to finish what they are running. Workers still busy at
    /// the deadline are detached. Returns whether every worker exited.
    pub fn shutdown(mut self, timeout: Duration) -> bool {
        self.signal_shutdown();
        let deadline = Instant::now() + timeout;
        let mut remaining = self.workers.len();
        while remaining > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.exited.recv_timeout(left) {
                Ok(_) => remaining -= 1,
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let workers = std::mem::take(&mut self.workers);
        if remaining > 0 {
            warn!(
                kind = self.kind.label(),
                busy = remaining,
                timeout_ms = timeout.as_millis() as u64,
                "parallel.pool.shutdown_timeout"
            );
            return false;
        }
        for worker in workers {
            let _ = worker.join();
        }
        debug!(kind = self.kind.label(), "parallel.pool.stopped");
        true
    }

    fn signal_shutdown(&self) {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            std::mem::take(&mut queue.jobs)
        };
        self.shared.wakeup.notify_all();
        // Dropping the jobs closes their result channels.
        drop(discarded);
    }

    fn worker_loop(index: usize, shared: Arc<PoolShared>, exited: Sender<usize>) {
        loop {
            let job = {
                let mut queue = shared.queue.lock();
                loop {
                    if let Some(job) = queue.jobs.pop_front() {
                        break Some(job);
                    }
                    if queue.shutdown {
                        break None;
                    }
                    shared.wakeup.wait(&mut queue);
                }
            };
            match job {
                Some(job) => job(),
                None => break,
            }
        }
        let _ = exited.send(index);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.signal_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_jobs_and_returns_results() -> Result<()> {
        let pool = WorkerPool::new(PoolKind::Cpu, 3)?;
        let handles: Vec<_> = (0..10u64)
            .map(|i| pool.spawn(OperatorId::from("sq"), move || i * i))
            .collect();
        let mut total: u64 = 0;
        for handle in handles {
            total += handle.join()?;
        }
        assert_eq!(total, (0..10u64).map(|i| i * i).sum::<u64>());
        assert!(pool.shutdown(Duration::from_secs(5)));
        Ok(())
    }

    #[test]
    fn panics_become_fatal_errors() -> Result<()> {
        let pool = WorkerPool::new(PoolKind::Io, 1)?;
        let handle = pool.spawn(OperatorId::from("boom"), || -> u32 { panic!("bad row") });
        let err = handle.join();
        assert!(matches!(err, Err(ExecError::FatalOperator { .. })));
        // The worker survives the panic.
        assert_eq!(pool.spawn(OperatorId::from("ok"), || 7).join()?, 7);
        Ok(())
    }

    #[test]
    fn shutdown_times_out_on_stuck_workers() -> Result<()> {
        let pool = WorkerPool::new(PoolKind::Io, 1)?;
        let started = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&started);
        let _slow = pool.spawn(OperatorId::from("slow"), move || {
            flag.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(500));
        });
        while started.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        let queued = pool.spawn(OperatorId::from("queued"), || 1);
        let begin = Instant::now();
        assert!(!pool.shutdown(Duration::from_millis(20)));
        assert!(begin.elapsed() < Duration::from_millis(400));
        assert!(matches!(queued.join(), Err(ExecError::Cancelled)));
        Ok(())
    }
}
