//! Batch completer: coalesces state transitions and flushes them in
//! sub-batches, amortizing database round-trips across many concurrent
//! workers.
//!
//! A single flush task wakes on a short tick. Small backlogs are allowed to
//! accumulate for a few ticks before flushing; large backlogs flush
//! immediately. Once the backlog saturates, acceptance parks callers until a
//! flush drains it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::completer::{
    JobCompleter, JobUpdate, StateCell, SubscribeChan, SubscribeChanSlot, publish,
};
use crate::database::executor::{Executor, JobTransition};
use crate::database::models::JobState;
use crate::database::retry::with_executor_retries;
use crate::stats::JobStatistics;
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct BatchCompleterConfig {
    /// Base period of the flush loop.
    pub tick_interval: Duration,
    /// Pending-set size at which a flush fires on the next tick instead of
    /// waiting to accumulate more work.
    pub flush_threshold: usize,
    /// Number of non-empty ticks a below-threshold backlog waits before
    /// flushing anyway.
    pub max_idle_ticks: u32,
    /// Maximum transitions per database call.
    pub sub_batch_max_size: usize,
    /// Pending-set size at which acceptance parks callers.
    pub max_backlog: usize,
    /// Suppress retry backoff sleeps. Test-only tuning knob.
    pub disable_sleep: bool,
}

impl Default for BatchCompleterConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            flush_threshold: 100,
            max_idle_ticks: 5,
            sub_batch_max_size: 2_000,
            max_backlog: 10_000,
            disable_sleep: false,
        }
    }
}

/// The latest transition accepted for a job, paired with its statistics.
/// At most one of these is pending per job id at any time.
struct PendingCompletion {
    transition: JobTransition,
    stats: JobStatistics,
}

struct BatchInner {
    exec: Arc<dyn Executor>,
    config: BatchCompleterConfig,
    subscribe_tx: SubscribeChanSlot,
    state: StateCell,
    /// Latest pending transition per job id.
    pending: Mutex<HashMap<i64, PendingCompletion>>,
    /// Mirror of `pending.len()`, readable without the map lock.
    pending_count: AtomicUsize,
    /// Wakes callers parked on backlog pressure after each flush pass.
    backlog_notify: Notify,
    /// Edge signal: pending set became non-empty.
    work_notify: Notify,
    /// True once the current cycle's flush loop is up.
    started_tx: watch::Sender<bool>,
    /// Stop signal for the current cycle's flush loop and parked callers.
    shutdown: Mutex<CancellationToken>,
    /// Token handed to executor retries. Never cancelled by `stop`, so
    /// shutdown drain writes always run to completion.
    retry_cancel: CancellationToken,
    disable_sleep: AtomicBool,
}

pub struct BatchCompleter {
    inner: Arc<BatchInner>,
    flush_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BatchCompleter {
    pub fn new(exec: Arc<dyn Executor>, subscribe_chan: SubscribeChan) -> Self {
        Self::with_config(exec, subscribe_chan, BatchCompleterConfig::default())
    }

    pub fn with_config(
        exec: Arc<dyn Executor>,
        subscribe_chan: SubscribeChan,
        config: BatchCompleterConfig,
    ) -> Self {
        let (started_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(BatchInner {
                exec,
                disable_sleep: AtomicBool::new(config.disable_sleep),
                config,
                subscribe_tx: SubscribeChanSlot::new(subscribe_chan),
                state: StateCell::new(),
                pending: Mutex::new(HashMap::new()),
                pending_count: AtomicUsize::new(0),
                backlog_notify: Notify::new(),
                work_notify: Notify::new(),
                started_tx,
                shutdown: Mutex::new(CancellationToken::new()),
                retry_cancel: CancellationToken::new(),
            }),
            flush_handle: Mutex::new(None),
        }
    }

    /// Ambient cancellation signal for in-flight retry loops.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.retry_cancel.clone()
    }

    /// Suppress retry backoff sleeps. Test-only tuning knob.
    pub fn disable_sleep(&self, disable: bool) {
        self.inner.disable_sleep.store(disable, Ordering::SeqCst);
    }
}

impl BatchInner {
    /// Swap out the pending set and persist it, one sub-batch per database
    /// call. Returns false when there was nothing to do.
    async fn flush(self: &Arc<Self>) -> bool {
        let batch = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return false;
            }
            self.pending_count.store(0, Ordering::SeqCst);
            std::mem::take(&mut *pending)
        };

        debug!("Flushing {} job state updates", batch.len());

        // Each target state carries a different parameter shape, so the
        // batch is partitioned by state before slicing into sub-batches.
        let mut by_state: HashMap<JobState, Vec<PendingCompletion>> = HashMap::new();
        for (_, completion) in batch {
            by_state
                .entry(completion.transition.state)
                .or_default()
                .push(completion);
        }

        let subscribe_tx = self.subscribe_tx.sender();
        let disable_sleep = self.disable_sleep.load(Ordering::SeqCst);

        for (state, completions) in by_state {
            for chunk in completions.chunks(self.config.sub_batch_max_size) {
                let transitions: Arc<Vec<JobTransition>> =
                    Arc::new(chunk.iter().map(|c| c.transition.clone()).collect());
                let mut stats_by_id: HashMap<i64, JobStatistics> = chunk
                    .iter()
                    .map(|c| (c.transition.id, c.stats.clone()))
                    .collect();

                let result = with_executor_retries(&self.retry_cancel, disable_sleep, || {
                    let exec = Arc::clone(&self.exec);
                    let transitions = Arc::clone(&transitions);
                    async move { exec.job_set_state_if_running_many(&transitions).await }
                })
                .await;

                match result {
                    Ok(rows) => {
                        if let Some(tx) = &subscribe_tx {
                            let updates: Vec<JobUpdate> = rows
                                .into_iter()
                                .map(|job| {
                                    let stats =
                                        stats_by_id.remove(&job.id).unwrap_or_default();
                                    JobUpdate { job, stats }
                                })
                                .collect();
                            publish(tx, updates).await;
                        }
                    }
                    Err(err) => {
                        // A failed sub-batch must not poison its siblings;
                        // the affected jobs stay running for the rescuer.
                        error!(
                            "Failed to persist a sub-batch of {} {} job updates: {}",
                            chunk.len(),
                            state,
                            err
                        );
                    }
                }
            }
        }

        self.backlog_notify.notify_waiters();
        true
    }

    async fn run_flush_loop(self: Arc<Self>, shutdown: CancellationToken) {
        // send_replace: the value must update even while nobody subscribes.
        self.started_tx.send_replace(true);
        debug!("Flush loop started");

        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut idle_ticks = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                // Edge signal from acceptance; the tick below decides when
                // the new work actually flushes.
                _ = self.work_notify.notified() => {}

                _ = interval.tick() => {
                    let num_pending = self.pending_count.load(Ordering::SeqCst);
                    if num_pending == 0 {
                        continue;
                    }

                    idle_ticks += 1;
                    if num_pending >= self.config.flush_threshold
                        || idle_ticks >= self.config.max_idle_ticks
                    {
                        self.flush().await;
                        idle_ticks = 0;
                    }
                }
            }
        }

        // Drain whatever is left, bypassing the accumulation wait. No new
        // work can arrive: acceptance was gated off before this token fired.
        while self.flush().await {}

        debug!("Flush loop stopped");
    }
}

#[async_trait::async_trait]
impl JobCompleter for BatchCompleter {
    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.subscribe_tx.is_set() {
            return Err(Error::SubscribeChanMissing);
        }
        inner.state.start()?;

        inner.pending.lock().clear();
        inner.pending_count.store(0, Ordering::SeqCst);
        inner.started_tx.send_replace(false);

        let shutdown = CancellationToken::new();
        *inner.shutdown.lock() = shutdown.clone();

        let handle = tokio::spawn(Arc::clone(inner).run_flush_loop(shutdown));
        *self.flush_handle.lock() = Some(handle);

        Ok(())
    }

    async fn wait_started(&self) {
        let mut rx = self.inner.started_tx.subscribe();
        let _ = rx.wait_for(|started| *started).await;
    }

    async fn job_set_state_if_running(
        &self,
        stats: JobStatistics,
        transition: JobTransition,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.state.ensure_running()?;

        let shutdown = inner.shutdown.lock().clone();

        // Backlog pressure: park until a flush drains below the limit. A
        // parked caller's own insert may transiently overshoot, bounding the
        // pending set at max_backlog plus the number of parked callers.
        loop {
            if inner.pending_count.load(Ordering::SeqCst) < inner.config.max_backlog {
                break;
            }

            let notified = inner.backlog_notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a flush between the two cannot
            // slip by unseen.
            notified.as_mut().enable();
            if inner.pending_count.load(Ordering::SeqCst) < inner.config.max_backlog {
                break;
            }

            debug!("Completion backlog full; waiting for a flush");
            tokio::select! {
                // Shutdown takes precedence over a concurrent flush wakeup.
                biased;
                _ = shutdown.cancelled() => return Err(Error::Canceled),
                _ = &mut notified => {}
            }
        }

        inner.state.with_running(|| {
            let mut pending = inner.pending.lock();
            let was_empty = pending.is_empty();
            pending.insert(transition.id, PendingCompletion { transition, stats });
            inner.pending_count.store(pending.len(), Ordering::SeqCst);
            if was_empty {
                inner.work_notify.notify_one();
            }
        })
    }

    async fn stop(&self) {
        let inner = &self.inner;
        if !inner.state.begin_stop() {
            return;
        }

        // Gate acceptance off first, then stop the loop; its final drain
        // therefore sees every accepted transition.
        inner.shutdown.lock().cancel();

        let handle = self.flush_handle.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            error!("Flush loop task failed to join: {}", err);
        }

        drop(inner.subscribe_tx.take());
        inner.started_tx.send_replace(false);

        // Parked callers were already woken by the cancelled token; cover
        // any that raced the cancel.
        inner.backlog_notify.notify_waiters();
    }

    fn reset_subscribe_chan(&self, chan: SubscribeChan) -> Result<()> {
        if self.inner.state.current() == crate::completer::CompleterState::Running {
            return Err(Error::SubscribeChanInUse);
        }
        self.inner.subscribe_tx.set(chan);
        Ok(())
    }
}
