//! Bounded job queue drained by a fixed worker pool.
//!
//! `try_enqueue` never waits: a full queue rejects the job and counts it as
//! dropped. `shutdown` closes the queue, lets the workers finish everything
//! already accepted and waits for them. It takes `&self`, so handles shared
//! with the webhook ingestor do not block it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("work queue '{0}' is full")]
pub struct QueueFull(pub &'static str);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub workers: usize,
    pub depth: usize,
    pub enqueued: u64,
    pub dropped: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct WorkQueue<J> {
    name: &'static str,
    tx: mpsc::Sender<J>,
    capacity: usize,
    worker_count: usize,
    closing: watch::Sender<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl<J: Send + 'static> WorkQueue<J> {
    /// Spawn `workers` tasks pulling from a queue of `capacity` slots. Each
    /// job is handed to `handler`; an `Err` is logged and counted.
    pub fn spawn<H, Fut>(name: &'static str, capacity: usize, workers: usize, handler: H) -> Self
    where
        H: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let capacity = capacity.max(1);
        let worker_count = workers.max(1);
        let (tx, rx) = mpsc::channel::<J>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let (closing, _) = watch::channel(false);
        let handler = Arc::new(handler);
        let counters = Arc::new(Counters::default());

        let handles = (0..worker_count)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let mut closing = closing.subscribe();
                let handler = Arc::clone(&handler);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    loop {
                        // Lock only while waiting for the next job.
                        let job = {
                            let mut rx = rx.lock().await;
                            if *closing.borrow_and_update() {
                                rx.close();
                                rx.recv().await
                            } else {
                                tokio::select! {
                                    job = rx.recv() => job,
                                    _ = closing.changed() => {
                                        // Closed receivers still yield buffered jobs.
                                        rx.close();
                                        rx.recv().await
                                    }
                                }
                            }
                        };
                        let Some(job) = job else { break };
                        match handler(job).await {
                            Ok(()) => {
                                counters.completed.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!(queue = name, worker, error = %format!("{e:#}"), "job failed");
                            }
                        }
                    }
                    tracing::debug!(queue = name, worker, "worker stopped");
                })
            })
            .collect();

        Self {
            name,
            tx,
            capacity,
            worker_count,
            closing,
            workers: std::sync::Mutex::new(handles),
            counters,
        }
    }

    pub fn try_enqueue(&self, job: J) -> Result<(), QueueFull> {
        match self.tx.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(queue = self.name, capacity = self.capacity, "queue full, job dropped");
                Err(QueueFull(self.name))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(queue = self.name, "queue shut down, job dropped");
                Err(QueueFull(self.name))
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            workers: self.worker_count,
            depth: self.capacity - self.tx.capacity(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs, drain what is queued, wait for the workers.
    /// A second call returns immediately.
    pub async fn shutdown(&self) {
        self.closing.send_replace(true);
        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let pending = self.stats().depth;
        if !handles.is_empty() {
            tracing::info!(queue = self.name, pending, "draining queue");
        }
        for w in handles {
            if let Err(e) = w.await {
                tracing::warn!(queue = self.name, error = %e, "worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn runs_jobs_and_counts_outcomes() {
        let q = WorkQueue::spawn("test", 8, 2, |n: u32| async move {
            if n % 2 == 0 {
                Ok(())
            } else {
                anyhow::bail!("odd job {n}")
            }
        });
        for n in 0..4 {
            q.try_enqueue(n).unwrap();
        }
        let stats_before = q.stats();
        assert_eq!(stats_before.enqueued, 4);
        assert_eq!(stats_before.workers, 2);

        q.shutdown().await;
        assert_eq!(q.stats().completed, 2);
        assert_eq!(q.stats().failed, 2);
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let gate = Arc::new(Notify::new());
        let worker_gate = Arc::clone(&gate);
        let q = WorkQueue::spawn("test", 1, 1, move |_: u32| {
            let gate = Arc::clone(&worker_gate);
            async move {
                gate.notified().await;
                Ok(())
            }
        });

        // First job is taken by the worker, second fills the single slot.
        q.try_enqueue(1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.try_enqueue(2).unwrap();
        assert_eq!(q.try_enqueue(3), Err(QueueFull("test")));
        assert_eq!(q.stats().dropped, 1);
        assert_eq!(q.stats().depth, 1);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
        q.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_while_other_handles_are_alive() {
        let gate = Arc::new(Notify::new());
        let worker_gate = Arc::clone(&gate);
        let q = Arc::new(WorkQueue::spawn("test", 8, 1, move |_: u32| {
            let gate = Arc::clone(&worker_gate);
            async move {
                gate.notified().await;
                Ok(())
            }
        }));
        let held_elsewhere = Arc::clone(&q);

        for n in 0..3 {
            q.try_enqueue(n).unwrap();
        }
        let releaser = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move {
                for _ in 0..3 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    gate.notify_one();
                }
            }
        });

        q.shutdown().await;
        releaser.await.unwrap();
        assert_eq!(q.stats().completed, 3);
        assert_eq!(q.stats().depth, 0);

        assert_eq!(held_elsewhere.try_enqueue(9), Err(QueueFull("test")));
        held_elsewhere.shutdown().await;
    }
}
