//! Bounded-concurrency task dispatch for crawl sessions.
//!
//! At most `concurrency` tasks run at any instant; as one completes the next
//! queued task is dispatched, in submission order. Before every dispatch the
//! scheduler consults the [`LoadController`]: a pause holds dispatch without
//! dropping queued work, a stop ends dispatch. Tasks see the same stop
//! signal through [`TaskContext::should_stop`] and are expected to skip
//! further sub-work; in-flight tasks are never interrupted.

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::SchedulerConfig;
use crate::control::LoadController;
use crate::models::SourceProfile;

/// Handle given to every running task.
#[derive(Clone)]
pub struct TaskContext {
    controller: Arc<dyn LoadController>,
    index: usize,
}

impl TaskContext {
    /// True once the load controller asked the session to stop.
    pub fn should_stop(&self) -> bool {
        self.controller.is_stop_requested()
    }

    /// Dispatch position of this task within its run.
    pub fn index(&self) -> usize {
        self.index
    }
}

type TaskFn = Box<dyn FnOnce(TaskContext) -> BoxFuture<'static, ()> + Send>;

/// A unit of work: fetch something and hand the result to a callback.
pub struct CrawlTask {
    label: String,
    run: TaskFn,
}

impl CrawlTask {
    pub fn new<F, Fut>(label: impl Into<String>, f: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            label: label.into(),
            run: Box::new(move |ctx| f(ctx).boxed()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for CrawlTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlTask").field("label", &self.label).finish()
    }
}

/// Counters of one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub panicked: usize,
    /// Tasks pulled from the queue but not dispatched because of a stop.
    pub skipped: usize,
    pub max_in_flight: usize,
}

/// Returned by [`TaskSender::submit`] once the scheduler stopped accepting work.
#[derive(Debug, Error)]
#[error("scheduler stopped accepting tasks")]
pub struct SchedulerClosed(pub CrawlTask);

/// Producer side of a queued run. `submit` waits while the queue is full.
#[derive(Clone)]
pub struct TaskSender {
    tx: mpsc::Sender<CrawlTask>,
}

impl TaskSender {
    pub async fn submit(&self, task: CrawlTask) -> Result<(), SchedulerClosed> {
        self.tx.send(task).await.map_err(|e| SchedulerClosed(e.0))
    }
}

#[derive(Clone)]
pub struct Scheduler {
    config: SchedulerConfig,
    controller: Arc<dyn LoadController>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, controller: Arc<dyn LoadController>) -> Self {
        Self { config, controller }
    }

    pub fn controller(&self) -> &Arc<dyn LoadController> {
        &self.controller
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Concurrency ceiling for one crawl session of `profile`.
    ///
    /// Operator override beats the profile hint, which beats the default. An
    /// idle host adds `idle_boost`; sources needing the render transport are
    /// capped at `render_concurrency`. Always within `1..=max_concurrency`.
    pub fn session_concurrency(&self, profile: &SourceProfile) -> usize {
        let config = &self.config;
        let mut concurrency = config
            .per_source
            .get(&profile.name)
            .copied()
            .or(profile.concurrency_hint)
            .unwrap_or(config.default_concurrency);
        if self.controller.is_host_idle() {
            concurrency += config.idle_boost;
        }
        if profile.needs_render {
            concurrency = concurrency.min(config.render_concurrency);
        }
        concurrency.clamp(1, config.max_concurrency.max(1))
    }

    /// Starts a run with at most `concurrency` tasks in flight.
    pub fn session(&self, concurrency: usize) -> Session {
        Session::new(self, concurrency)
    }

    /// Runs `tasks` with at most `concurrency` in flight and waits for all
    /// dispatched tasks to finish.
    pub async fn run<I>(&self, tasks: I, concurrency: usize) -> RunSummary
    where
        I: IntoIterator<Item = CrawlTask>,
    {
        let mut session = Session::new(self, concurrency);
        for task in tasks {
            if !session.dispatch(task).await {
                break;
            }
        }
        session.finish().await
    }

    /// Starts a queued run fed through the returned [`TaskSender`].
    ///
    /// Producers block once `queue_depth` undispatched tasks are waiting. The
    /// run ends when every sender is dropped (or a stop is requested) and all
    /// dispatched tasks have finished.
    pub fn queue(&self, concurrency: usize) -> (TaskSender, JoinHandle<RunSummary>) {
        let (tx, mut rx) = mpsc::channel::<CrawlTask>(self.config.queue_depth.max(1));
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            let mut session = Session::new(&scheduler, concurrency);
            while let Some(task) = rx.recv().await {
                if !session.dispatch(task).await {
                    break;
                }
            }
            // Reject producers still waiting on a stopped run.
            rx.close();
            session.finish().await
        });
        (TaskSender { tx }, handle)
    }

    /// Depth- and concurrency-bounded expansion (e.g. sub-index discovery).
    ///
    /// `expand` returns the children of one node. Nodes are expanded level by
    /// level, at most `concurrency` at a time, down to `max_depth` levels
    /// below `roots`. Returns every distinct node discovered below the roots;
    /// each branch returns an owned list that is merged here.
    pub async fn expand<T, F, Fut>(
        &self,
        roots: Vec<T>,
        max_depth: usize,
        concurrency: usize,
        expand: F,
    ) -> Vec<T>
    where
        T: Clone + Eq + Hash,
        F: Fn(&T) -> Fut,
        Fut: Future<Output = Vec<T>>,
    {
        let mut seen: HashSet<T> = roots.iter().cloned().collect();
        let mut discovered = Vec::new();
        let mut frontier = roots;

        for _ in 0..max_depth {
            if frontier.is_empty() || self.controller.is_stop_requested() {
                break;
            }
            let children: Vec<Vec<T>> = futures::stream::iter(frontier.iter().map(&expand))
                .buffered(concurrency.max(1))
                .collect()
                .await;

            frontier = children
                .into_iter()
                .flatten()
                .filter(|child| seen.insert(child.clone()))
                .collect();
            discovered.extend(frontier.iter().cloned());
        }
        discovered
    }
}

/// Decrements the in-flight counter when a task ends, panics included.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-progress run: dispatches tasks one at a time under the run's
/// concurrency ceiling.
///
/// `dispatch` returns once the task is actually running, which lets a
/// producer (the crawl driver) wait for one batch to be dispatched before
/// producing the next.
pub struct Session {
    controller: Arc<dyn LoadController>,
    pause_poll: std::time::Duration,
    semaphore: Arc<Semaphore>,
    join_set: JoinSet<()>,
    in_flight: Arc<AtomicUsize>,
    summary: RunSummary,
}

impl Session {
    fn new(scheduler: &Scheduler, concurrency: usize) -> Self {
        Self {
            controller: scheduler.controller.clone(),
            pause_poll: scheduler.config.pause_poll(),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            join_set: JoinSet::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            summary: RunSummary::default(),
        }
    }

    /// Dispatches one task; returns false once a stop was requested.
    pub async fn dispatch(&mut self, task: CrawlTask) -> bool {
        if self.controller.is_stop_requested() {
            self.summary.skipped += 1;
            return false;
        }
        self.hold_while_paused().await;

        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            self.summary.skipped += 1;
            return false;
        };
        // The wait for a slot may have outlived a pause or stop request.
        self.hold_while_paused().await;
        if self.controller.is_stop_requested() {
            self.summary.skipped += 1;
            return false;
        }

        self.reap_finished();

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.summary.max_in_flight = self.summary.max_in_flight.max(now_in_flight);
        let guard = InFlightGuard(self.in_flight.clone());
        let ctx = TaskContext {
            controller: self.controller.clone(),
            index: self.summary.dispatched,
        };
        self.summary.dispatched += 1;

        let CrawlTask { label, run } = task;
        tracing::trace!(task = %label, "Dispatching task");
        self.join_set.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            run(ctx).await;
        });
        true
    }

    async fn hold_while_paused(&self) {
        if self.controller.is_pause_requested() {
            tracing::debug!("Dispatch paused by load controller");
            self.controller.wait_while_paused(self.pause_poll).await;
        }
    }

    fn reap_finished(&mut self) {
        while let Some(result) = self.join_set.try_join_next() {
            self.record(result);
        }
    }

    fn record(&mut self, result: Result<(), tokio::task::JoinError>) {
        match result {
            Ok(()) => self.summary.completed += 1,
            Err(e) if e.is_panic() => {
                tracing::error!(error = %e, "Crawl task panicked");
                self.summary.panicked += 1;
            }
            Err(e) => tracing::warn!(error = %e, "Crawl task cancelled"),
        }
    }

    /// Waits for every dispatched task to finish.
    pub async fn finish(mut self) -> RunSummary {
        while let Some(result) = self.join_set.join_next().await {
            self.record(result);
        }
        self.summary
    }
}
