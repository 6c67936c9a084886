// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.

//! Bounded parallel execution engine (§4.F).
//!
//! A fixed-size worker pool realized as a `tokio::sync::Semaphore`: each
//! submitted task acquires one permit, runs as a spawned Tokio task, and
//! releases its permit on completion. The whole engine runs on one Tokio
//! runtime for the life of the process, rather than entering and leaving
//! one per remote call.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, trace};

use crate::cancel::CancellationToken;
use crate::planner::{Task, TaskError};
use crate::stats::{Op, Stats};

/// A handle collecting the outcome of every task submitted under it. Named
/// "waiter" per the glossary: a scoped group of sub-task completions whose
/// error channel closes once the group drains.
pub struct Waiter {
    errors_tx: mpsc::UnboundedSender<TaskError>,
    errors_rx: Option<mpsc::UnboundedReceiver<TaskError>>,
    outstanding: Arc<AtomicUsize>,
}

impl Waiter {
    fn new() -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Waiter {
            errors_tx,
            errors_rx: Some(errors_rx),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Block until every task submitted under this waiter has completed,
    /// then return every error observed, in completion order.
    pub async fn wait(mut self) -> Vec<TaskError> {
        drop(self.errors_tx);
        let mut rx = self.errors_rx.take().expect("wait() called once");
        let mut errors = Vec::new();
        while let Some(error) = rx.recv().await {
            errors.push(error);
        }
        errors
    }
}

/// Bounded worker pool consuming [`Task`]s against a storage backend.
pub struct Engine {
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    stats: Arc<Stats>,
}

impl Engine {
    pub fn new(workers: usize, cancel: CancellationToken, stats: Arc<Stats>) -> Self {
        Engine {
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            cancel,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Start a new group of tasks. Call [`Engine::submit`] for each task,
    /// then await [`Waiter::wait`] once all sources are exhausted.
    pub fn new_waiter(&self) -> Waiter {
        Waiter::new()
    }

    /// Submit one task to run under `waiter`. Runs opportunistically as soon
    /// as a semaphore permit is available; never blocks the caller past the
    /// acquire itself.
    pub fn submit<F, Fut>(&self, waiter: &Waiter, op: Op, run: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        waiter.outstanding.fetch_add(1, Ordering::SeqCst);
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();
        let stats = self.stats.clone();
        let errors_tx = waiter.errors_tx.clone();
        let outstanding = waiter.outstanding.clone();

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if cancel.is_cancelled() {
                outstanding.fetch_sub(1, Ordering::SeqCst);
                return;
            }
            let result = tokio::select! {
                result = run() => result,
                _ = cancel.cancelled() => Err(TaskError {
                    task: None,
                    message: "cancelled".to_owned(),
                }),
            };
            match result {
                Ok(()) => stats.record_success(op),
                Err(ref e) => {
                    stats.record_error(op);
                    debug!(error = %e.message, "task failed");
                    let _ = errors_tx.send(e.clone());
                }
            }
            outstanding.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Run every task in `tasks` to completion under a fresh waiter,
    /// returning the collected errors. This is the common case: one
    /// command's worth of tasks drained before the next command starts.
    ///
    /// `tasks` carries planner-level failures (a source that matched
    /// nothing, a listing error) as `Err` items; those are counted and
    /// reported without ever reaching the worker pool.
    pub async fn run_to_completion<S>(&self, op: Op, mut tasks: S) -> Vec<TaskError>
    where
        S: futures::stream::Stream<Item = std::result::Result<Task, TaskError>> + Unpin,
    {
        use futures::stream::StreamExt;
        let waiter = self.new_waiter();
        let mut planning_errors = Vec::new();
        while let Some(item) = tasks.next().await {
            if self.cancel.is_cancelled() {
                break;
            }
            match item {
                Ok(task) => self.submit(&waiter, op, move || async move { task.run().await }),
                Err(e) => {
                    self.stats.record_error(op);
                    planning_errors.push(e);
                }
            }
        }
        trace!("all tasks submitted, draining waiter");
        let mut errors = waiter.wait().await;
        errors.extend(planning_errors);
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn concurrency_never_exceeds_worker_count() {
        let cancel = CancellationToken::new();
        let stats = Arc::new(Stats::new());
        let engine = Engine::new(2, cancel, stats);
        let concurrent = Arc::new(StdAtomicUsize::new(0));
        let max_seen = Arc::new(StdAtomicUsize::new(0));

        let waiter = engine.new_waiter();
        for _ in 0..8 {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            engine.submit(&waiter, Op::Copy, move || async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let errors = waiter.wait().await;
        assert!(errors.is_empty());
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn errors_are_collected_without_cancelling_siblings() {
        let cancel = CancellationToken::new();
        let stats = Arc::new(Stats::new());
        let engine = Engine::new(4, cancel, stats);
        let waiter = engine.new_waiter();
        for i in 0..5 {
            engine.submit(&waiter, Op::Delete, move || async move {
                if i == 2 {
                    Err(TaskError { task: None, message: "boom".into() })
                } else {
                    Ok(())
                }
            });
        }
        let errors = waiter.wait().await;
        assert_eq!(errors.len(), 1);
        assert_eq!(engine.stats().total_success(), 4);
        assert_eq!(engine.stats().total_errors(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_pending_submissions() {
        let cancel = CancellationToken::new();
        let stats = Arc::new(Stats::new());
        let engine = Engine::new(1, cancel.clone(), stats);
        cancel.cancel();
        let waiter = engine.new_waiter();
        engine.submit(&waiter, Op::Copy, || async { Ok(()) });
        let errors = waiter.wait().await;
        assert!(errors.is_empty());
    }
}
