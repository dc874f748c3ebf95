//! Inline completer: persists each transition synchronously on the caller.
//!
//! Useful for tests and for worker pools that execute one job at a time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::completer::{
    JobCompleter, JobUpdate, StateCell, SubscribeChan, SubscribeChanSlot, publish,
};
use crate::database::executor::{Executor, JobTransition};
use crate::database::retry::with_executor_retries;
use crate::stats::JobStatistics;
use crate::{Error, Result};

pub struct InlineCompleter {
    exec: Arc<dyn Executor>,
    subscribe_tx: SubscribeChanSlot,
    state: StateCell,
    cancel: CancellationToken,
    disable_sleep: AtomicBool,
    in_flight: AtomicUsize,
    idle_notify: Notify,
}

impl InlineCompleter {
    pub fn new(exec: Arc<dyn Executor>, subscribe_chan: SubscribeChan) -> Self {
        Self {
            exec,
            subscribe_tx: SubscribeChanSlot::new(subscribe_chan),
            state: StateCell::new(),
            cancel: CancellationToken::new(),
            disable_sleep: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle_notify: Notify::new(),
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

/// Keeps `stop` honest: any call counted here is waited on before the
/// subscribe channel closes.
struct InFlightGuard<'a> {
    completer: &'a InlineCompleter,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.completer.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.completer.idle_notify.notify_waiters();
        }
    }
}

#[async_trait::async_trait]
impl JobCompleter for InlineCompleter {
    async fn start(&self) -> Result<()> {
        if !self.subscribe_tx.is_set() {
            return Err(Error::SubscribeChanMissing);
        }
        self.state.start()
    }

    async fn job_set_state_if_running(
        &self,
        stats: JobStatistics,
        transition: JobTransition,
    ) -> Result<()> {
        // Count before the state check so a concurrent `stop` waits for any
        // call that passes it.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard { completer: self };

        self.state.ensure_running()?;

        let disable_sleep = self.disable_sleep.load(Ordering::SeqCst);
        let rows = with_executor_retries(&self.cancel, disable_sleep, || {
            let exec = Arc::clone(&self.exec);
            let transition = transition.clone();
            async move { exec.job_set_state_if_running_many(&[transition]).await }
        })
        .await?;

        // Zero rows means the job already left `running`; nothing to publish.
        if let Some(tx) = self.subscribe_tx.sender() {
            let updates = rows
                .into_iter()
                .map(|job| JobUpdate {
                    job,
                    stats: stats.clone(),
                })
                .collect();
            publish(&tx, updates).await;
        }

        Ok(())
    }

    async fn stop(&self) {
        if !self.state.begin_stop() {
            return;
        }

        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            let notified = self.idle_notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a wakeup between the two
            // cannot be lost.
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completer::testing::MockExecutor;
    use crate::database::models::JobState;
    use crate::database::retry::MAX_ATTEMPTS;
    use chrono::Utc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_returns_error_after_retries_exhausted() {
        let exec = Arc::new(MockExecutor::with_set_state_fn(|transitions| {
            Box::pin(async move {
                assert_eq!(transitions.len(), 1);
                assert_eq!(transitions[0].id, 1);
                Err(Error::Database("an error from the executor".to_string()))
            })
        }));

        let (tx, mut rx) = mpsc::channel(10);
        let completer = InlineCompleter::new(exec.clone(), tx);
        completer.disable_sleep(true);
        completer.start().await.unwrap();

        let result = completer
            .job_set_state_if_running(
                JobStatistics::default(),
                JobTransition::completed(1, Utc::now()),
            )
            .await;

        assert!(matches!(result, Err(Error::Database(_))));
        assert_eq!(exec.calls(), MAX_ATTEMPTS);

        completer.stop().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publishes_updates_on_success() {
        let exec = Arc::new(MockExecutor::new());
        let (tx, mut rx) = mpsc::channel(10);
        let completer = InlineCompleter::new(exec, tx);
        completer.start().await.unwrap();

        for id in 0..4 {
            completer
                .job_set_state_if_running(
                    JobStatistics::default(),
                    JobTransition::completed(id, Utc::now()),
                )
                .await
                .unwrap();
        }

        completer.stop().await;

        let mut updated_ids = Vec::new();
        while let Some(updates) = rx.recv().await {
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].job.state, JobState::Completed);
            updated_ids.push(updates[0].job.id);
        }
        updated_ids.sort_unstable();
        assert_eq!(updated_ids, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_terminal_error_surfaces_after_one_call() {
        let exec = Arc::new(MockExecutor::with_set_state_fn(|_| {
            Box::pin(async { Err(Error::Canceled) })
        }));
        let (tx, _rx) = mpsc::channel(10);
        let completer = InlineCompleter::new(exec.clone(), tx);
        completer.disable_sleep(true);
        completer.start().await.unwrap();

        let result = completer
            .job_set_state_if_running(
                JobStatistics::default(),
                JobTransition::completed(1, Utc::now()),
            )
            .await;

        assert!(matches!(result, Err(Error::Canceled)));
        assert_eq!(exec.calls(), 1);

        completer.stop().await;
    }

    #[tokio::test]
    async fn test_rejects_calls_when_not_running() {
        let exec = Arc::new(MockExecutor::new());
        let (tx, _rx) = mpsc::channel(10);
        let completer = InlineCompleter::new(exec.clone(), tx);

        let result = completer
            .job_set_state_if_running(
                JobStatistics::default(),
                JobTransition::completed(1, Utc::now()),
            )
            .await;
        assert!(matches!(result, Err(Error::NotRunning)));

        completer.start().await.unwrap();
        completer.stop().await;

        let result = completer
            .job_set_state_if_running(
                JobStatistics::default(),
                JobTransition::completed(1, Utc::now()),
            )
            .await;
        assert!(matches!(result, Err(Error::NotRunning)));
        assert_eq!(exec.calls(), 0);
    }

    #[tokio::test]
    async fn test_double_start_errors() {
        let exec = Arc::new(MockExecutor::new());
        let (tx, _rx) = mpsc::channel(10);
        let completer = InlineCompleter::new(exec, tx);

        completer.start().await.unwrap();
        assert!(matches!(completer.start().await, Err(Error::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_reset_subscribe_chan_rejected_while_running() {
        let exec = Arc::new(MockExecutor::new());
        let (tx, _rx) = mpsc::channel(10);
        let completer = InlineCompleter::new(exec, tx);
        completer.start().await.unwrap();

        let (tx2, _rx2) = mpsc::channel(10);
        assert!(matches!(
            completer.reset_subscribe_chan(tx2),
            Err(Error::SubscribeChanInUse)
        ));
    }
}
