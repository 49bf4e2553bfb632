//! Fixed-parallelism worker pool with a two-level priority queue.
//!
//! Block downloads run here rather than on free-floating tasks so that the
//! number of concurrent bucket reads stays fixed regardless of how many
//! handles are prefetching. The block a caller is actively waiting on goes on
//! the urgent queue; readahead goes on the normal queue. Workers always drain
//! urgent work first.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Urgent,
    Normal,
}

struct Job {
    cancel: CancellationToken,
    fut: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct Queues {
    urgent: VecDeque<Job>,
    normal: VecDeque<Job>,
}

struct Inner {
    queues: Mutex<Queues>,
    notify: Notify,
    shutdown: CancellationToken,
}

pub struct WorkerPool {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks onto the current runtime.
    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(Inner {
            queues: Mutex::new(Queues::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let handles = (0..workers.max(1))
            .map(|_| {
                let inner = inner.clone();
                tokio::spawn(async move { worker_loop(inner).await })
            })
            .collect();

        Self {
            inner,
            handles: Mutex::new(handles),
        }
    }

    /// Enqueues a task. `cancel` is the task's cooperative cancellation
    /// signal; the future is expected to observe it at its I/O boundaries.
    pub fn submit(&self, priority: Priority, cancel: CancellationToken, fut: BoxFuture<'static, ()>) {
        if self.inner.shutdown.is_cancelled() {
            cancel.cancel();
        }
        {
            let mut queues = self.inner.queues.lock();
            let job = Job { cancel, fut };
            match priority {
                Priority::Urgent => queues.urgent.push_back(job),
                Priority::Normal => queues.normal.push_back(job),
            }
        }
        self.inner.notify.notify_one();
    }

    /// Tasks waiting for a worker, both priorities.
    pub fn queued(&self) -> usize {
        let queues = self.inner.queues.lock();
        queues.urgent.len() + queues.normal.len()
    }

    /// Stops the workers. Every still-queued task has its cancel signal
    /// fired and is then run to completion so no waiter is left hanging on a
    /// task that will never execute.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();

        let drained: Vec<Job> = {
            let mut queues = self.inner.queues.lock();
            let urgent: Vec<Job> = queues.urgent.drain(..).collect();
            let normal: Vec<Job> = queues.normal.drain(..).collect();
            urgent.into_iter().chain(normal.into_iter()).collect()
        };
        debug!(drained = drained.len(), "worker pool shutting down");
        for job in drained {
            job.cancel.cancel();
            job.fut.await;
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(inner: Arc<Inner>) {
    loop {
        let notified = inner.notify.notified();

        let job = {
            let mut queues = inner.queues.lock();
            queues
                .urgent
                .pop_front()
                .or_else(|| queues.normal.pop_front())
        };

        match job {
            Some(job) => job.fut.await,
            None => {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    _ = notified => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use tokio::sync::{mpsc, oneshot};

    #[tokio::test]
    async fn urgent_runs_before_normal() {
        let pool = WorkerPool::new(1);
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();

        // Occupy the single worker so the queue builds up behind it.
        pool.submit(
            Priority::Normal,
            CancellationToken::new(),
            async move {
                let _ = gate_rx.await;
            }
            .boxed(),
        );

        for label in ["n1", "n2"] {
            let tx = tx.clone();
            pool.submit(
                Priority::Normal,
                CancellationToken::new(),
                async move {
                    let _ = tx.send(label);
                }
                .boxed(),
            );
        }
        let tx_urgent = tx.clone();
        pool.submit(
            Priority::Urgent,
            CancellationToken::new(),
            async move {
                let _ = tx_urgent.send("u1");
            }
            .boxed(),
        );

        gate_tx.send(()).expect("worker is waiting");

        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(rx.recv().await.expect("job must run"));
        }
        assert_eq!(order, vec!["u1", "n1", "n2"]);
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_tasks() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let pool = Arc::new(WorkerPool::new(1));
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        pool.submit(
            Priority::Normal,
            CancellationToken::new(),
            async move {
                let _ = gate_rx.await;
            }
            .boxed(),
        );
        // Wait until the single worker holds the blocker, so anything queued
        // next stays queued.
        while pool.queued() > 0 {
            tokio::task::yield_now().await;
        }

        let queued_cancel = CancellationToken::new();
        let observed = Arc::new(AtomicBool::new(false));
        {
            let cancel = queued_cancel.clone();
            let observed = observed.clone();
            pool.submit(
                Priority::Normal,
                queued_cancel.clone(),
                async move {
                    observed.store(cancel.is_cancelled(), Ordering::SeqCst);
                }
                .boxed(),
            );
        }

        let shutdown = tokio::spawn({
            let pool = pool.clone();
            async move { pool.shutdown().await }
        });
        // Shutdown drains and runs the queued job with its cancel signal
        // fired, while the worker is still parked on the blocker.
        while !observed.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        gate_tx.send(()).expect("worker is waiting");
        shutdown.await.expect("shutdown task");

        assert!(queued_cancel.is_cancelled());
        assert!(observed.load(Ordering::SeqCst));
    }
}
