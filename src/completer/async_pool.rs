//! Async completer: dispatches each transition to a bounded pool of
//! completion tasks.
//!
//! Acceptance and persistence are decoupled: `job_set_state_if_running`
//! returns as soon as a concurrency permit is acquired, and a spawned task
//! carries the retry loop. Permit acquisition is the sole backpressure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::completer::{
    JobCompleter, JobUpdate, StateCell, SubscribeChan, SubscribeChanSlot, publish,
};
use crate::database::executor::{Executor, JobTransition};
use crate::database::retry::with_executor_retries;
use crate::stats::JobStatistics;
use crate::{Error, Result};

/// How long `stop` waits before logging that completion tasks are still
/// draining. Tasks are never aborted.
const STOP_DRAIN_WARN_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AsyncCompleterConfig {
    /// Maximum number of in-flight database calls.
    pub concurrency: usize,
    /// Suppress retry backoff sleeps. Test-only tuning knob.
    pub disable_sleep: bool,
}

impl Default for AsyncCompleterConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            disable_sleep: false,
        }
    }
}

pub struct AsyncCompleter {
    exec: Arc<dyn Executor>,
    subscribe_tx: SubscribeChanSlot,
    state: StateCell,
    cancel: CancellationToken,
    disable_sleep: AtomicBool,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl AsyncCompleter {
    pub fn new(exec: Arc<dyn Executor>, subscribe_chan: SubscribeChan) -> Self {
        Self::with_config(exec, subscribe_chan, AsyncCompleterConfig::default())
    }

    pub fn with_config(
        exec: Arc<dyn Executor>,
        subscribe_chan: SubscribeChan,
        config: AsyncCompleterConfig,
    ) -> Self {
        Self {
            exec,
            subscribe_tx: SubscribeChanSlot::new(subscribe_chan),
            state: StateCell::new(),
            cancel: CancellationToken::new(),
            disable_sleep: AtomicBool::new(config.disable_sleep),
            semaphore: Arc::new(Semaphore::new(config.concurrency)),
            tracker: TaskTracker::new(),
        }
    }

    /// Ambient cancellation signal: cancelling this token makes in-flight
    /// retry loops fail terminally instead of backing off.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Suppress retry backoff sleeps. Test-only tuning knob.
    pub fn disable_sleep(&self, disable: bool) {
        self.disable_sleep.store(disable, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl JobCompleter for AsyncCompleter {
    async fn start(&self) -> Result<()> {
        if !self.subscribe_tx.is_set() {
            return Err(Error::SubscribeChanMissing);
        }
        self.state.start()?;
        // A previous cycle's drain closed the tracker.
        self.tracker.reopen();
        Ok(())
    }

    async fn job_set_state_if_running(
        &self,
        stats: JobStatistics,
        transition: JobTransition,
    ) -> Result<()> {
        self.state.ensure_running()?;

        // Sole backpressure: parks the caller while `concurrency` tasks are
        // in flight. The permit travels into the task and frees a slot only
        // once persistence has finished.
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Canceled)?;

        let exec = Arc::clone(&self.exec);
        let cancel = self.cancel.clone();
        let disable_sleep = self.disable_sleep.load(Ordering::SeqCst);
        let tx = self.subscribe_tx.sender();

        // Spawning under the state lock pins the Running -> Stopped flip:
        // every accepted task is visible to the drain in `stop`.
        self.state.with_running(|| {
            self.tracker.spawn(async move {
                let _permit = permit;

                let result = with_executor_retries(&cancel, disable_sleep, || {
                    let exec = Arc::clone(&exec);
                    let transition = transition.clone();
                    async move { exec.job_set_state_if_running_many(&[transition]).await }
                })
                .await;

                match result {
                    Ok(rows) => {
                        if let Some(tx) = tx {
                            let updates = rows
                                .into_iter()
                                .map(|job| JobUpdate {
                                    job,
                                    stats: stats.clone(),
                                })
                                .collect();
                            publish(&tx, updates).await;
                        }
                    }
                    Err(err) => {
                        error!(
                            "Failed to persist state {} for job {}: {}",
                            transition.state, transition.id, err
                        );
                    }
                }
            });
        })?;

        Ok(())
    }

    async fn stop(&self) {
        if !self.state.begin_stop() {
            return;
        }

        self.tracker.close();
        if tokio::time::timeout(STOP_DRAIN_WARN_AFTER, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Completion tasks still in flight after {:?}; continuing to wait",
                STOP_DRAIN_WARN_AFTER
            );
            self.tracker.wait().await;
        }

        drop(self.subscribe_tx.take());
    }

    fn reset_subscribe_chan(&self, chan: SubscribeChan) -> Result<()> {
        if self.state.current() == crate::completer::CompleterState::Running {
            return Err(Error::SubscribeChanInUse);
        }
        self.subscribe_tx.set(chan);
        Ok(())
    }
}
