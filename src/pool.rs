//! Bounded worker pool that runs indicator tasks under a wall-clock deadline.
//!
//! Tasks are spawned onto a rayon pool and report back over a channel. The
//! caller waits until every task has reported or the deadline passes; on
//! expiry a shared cancel flag is raised, tasks that have not started are
//! skipped and results that arrive late are dropped. A task that is already
//! running cannot be interrupted, but nothing waits for it.

use anyhow::{Context, Result};
use log::{debug, warn};
use rayon::ThreadPool;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Instant;

use crate::errors::panic_message;

#[derive(Debug)]
pub struct PoolOutcome<T> {
    /// `(submission index, output)` in submission order.
    pub completed: Vec<(usize, T)>,
    pub timed_out: bool,
}

/// Task counters since the pool was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub submitted: u64,
    pub completed: u64,
    /// Skipped or discarded after the deadline.
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
}

pub struct IndicatorPool {
    pool: ThreadPool,
    workers: usize,
    counters: Arc<Counters>,
}

impl IndicatorPool {
    /// `min(available parallelism, max_workers)` threads, at least one.
    pub fn new(max_workers: usize) -> Result<Self> {
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = available.min(max_workers).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("boot-finder-indicator-{i}"))
            .panic_handler(|payload| {
                warn!("indicator worker panicked: {}", panic_message(payload.as_ref()));
            })
            .build()
            .context("Failed to build indicator worker pool")?;
        debug!("indicator pool: {workers} workers");
        Ok(Self {
            pool,
            workers,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }

    pub fn run_until<T, F>(&self, tasks: Vec<F>, deadline: Instant) -> PoolOutcome<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let total = tasks.len();
        let cancel = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel::<(usize, T)>();

        for (index, task) in tasks.into_iter().enumerate() {
            let tx = tx.clone();
            let cancel = Arc::clone(&cancel);
            let stats = Arc::clone(&self.counters);
            stats.submitted.fetch_add(1, Ordering::Relaxed);
            self.pool.spawn(move || {
                if cancel.load(Ordering::Relaxed) {
                    stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                let output = task();
                if cancel.load(Ordering::Relaxed) {
                    stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                stats.completed.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send((index, output));
            });
        }
        drop(tx);

        let mut completed = Vec::with_capacity(total);
        let mut timed_out = false;
        while completed.len() < total {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(item) => completed.push(item),
                Err(RecvTimeoutError::Timeout) => {
                    timed_out = true;
                    cancel.store(true, Ordering::Relaxed);
                    break;
                }
                // Every sender is gone: the remaining tasks panicked.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        completed.sort_by_key(|(index, _)| *index);
        PoolOutcome {
            completed,
            timed_out,
        }
    }
}

impl std::fmt::Debug for IndicatorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorPool")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}
