// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared periodic-task runner.
//!
//! `TimeScheduler` is process-wide shared state: a [`crate::NakWindow`]
//! or [`crate::RouterStubManager`] holds an `Arc<TimeScheduler>` it
//! neither constructs by default nor tears down -- the host owns its
//! lifetime and calls [`TimeScheduler::shutdown`] once, at process
//! teardown.
//!
//! Each scheduled task owns a dedicated background thread, following
//! the handle-owns-thread pattern: the task closure returns the delay
//! until its next run, so a single task models both the Retransmitter's
//! escalating backoff and the RouterStubManager's fixed-delay
//! reconnect/ping loops.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type TaskId = u64;

struct SchedulerInner {
    next_id: AtomicU64,
    stop_flags: DashMap<TaskId, Arc<AtomicBool>>,
}

/// A shared, cloneable handle to the scheduler's task registry.
#[derive(Clone)]
pub struct TimeScheduler {
    inner: Arc<SchedulerInner>,
}

/// A handle to a single scheduled task. Dropping it does not cancel
/// the task; call [`TimeScheduler::cancel`] explicitly.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    stop: Arc<AtomicBool>,
}

impl TimeScheduler {
    /// Creates a scheduler. `num_workers` is accepted for API
    /// compatibility with a bounded-pool implementation but is
    /// currently advisory only: every scheduled task runs on its own
    /// background thread, since periodic tasks run indefinitely and do
    /// not fit a bounded work-stealing pool without blocking a worker
    /// for the task's entire lifetime.
    #[must_use]
    pub fn new(_num_workers: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                next_id: AtomicU64::new(1),
                stop_flags: DashMap::new(),
            }),
        }
    }

    /// Runs `task` after `delay`, then repeatedly after whatever delay
    /// `task` returns, until [`Self::cancel`] is called.
    pub fn schedule_fixed_delay<F>(&self, delay: Duration, mut task: F) -> TaskHandle
    where
        F: FnMut() -> Duration + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        self.inner.stop_flags.insert(id, stop.clone());

        let stop_for_thread = stop.clone();
        let inner = self.inner.clone();
        let build = thread::Builder::new().name(format!("naklib-sched-{id}"));
        let spawn_result = build.spawn(move || {
            thread::sleep(delay);
            loop {
                if stop_for_thread.load(Ordering::Relaxed) {
                    break;
                }
                let next_delay = task();
                if stop_for_thread.load(Ordering::Relaxed) {
                    break;
                }
                thread::sleep(next_delay);
            }
            inner.stop_flags.remove(&id);
        });
        if let Err(e) = spawn_result {
            log::warn!("naklib: failed to spawn scheduler thread for task {id}: {e}");
        }

        TaskHandle { id, stop }
    }

    /// Cancels a scheduled task. Idempotent -- cancelling an
    /// already-fired-and-exited task is a no-op.
    pub fn cancel(&self, handle: &TaskHandle) {
        handle.stop.store(true, Ordering::Relaxed);
        self.inner.stop_flags.remove(&handle.id);
    }

    /// Signals every currently scheduled task to stop. Called once by
    /// the process host; never by a `NakWindow` or `RouterStubManager`.
    pub fn shutdown(&self) {
        for entry in self.inner.stop_flags.iter() {
            entry.value().store(true, Ordering::Relaxed);
        }
        self.inner.stop_flags.clear();
    }

    /// Number of tasks currently registered (best-effort; a task may
    /// be mid-exit and not yet reflected here).
    #[must_use]
    pub fn active_task_count(&self) -> usize {
        self.inner.stop_flags.len()
    }
}

impl Default for TimeScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}
