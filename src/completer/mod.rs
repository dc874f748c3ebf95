//! Job completion: durably applying terminal state transitions emitted by
//! workers, with subscriber fan-out.
//!
//! Three variants share the [`JobCompleter`] trait:
//!
//! - [`InlineCompleter`]: runs each update synchronously on the caller.
//! - [`AsyncCompleter`]: dispatches updates to a semaphore-bounded task pool.
//! - [`BatchCompleter`]: coalesces updates and flushes them in batches.
//!
//! All variants funnel persistence through a single batched executor
//! operation wrapped in the shared retry loop, and publish applied updates
//! on a subscribe channel they own between `start` and `stop`.

pub mod async_pool;
pub mod batch;
pub mod inline;

pub use async_pool::{AsyncCompleter, AsyncCompleterConfig};
pub use batch::{BatchCompleter, BatchCompleterConfig};
pub use inline::InlineCompleter;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::database::models::JobRow;
use crate::stats::JobStatistics;
use crate::{Error, Result};

/// A successfully applied update: the authoritative post-update row plus the
/// worker-gathered statistics that accompanied its transition.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub job: JobRow,
    pub stats: JobStatistics,
}

/// Outbound fan-out channel. Each message is a non-empty batch of applied
/// updates. The completer owns the sender between `start` and `stop` and
/// drops it exactly once at the end of `stop`, closing the channel.
pub type SubscribeChan = mpsc::Sender<Vec<JobUpdate>>;

/// The capability set shared by all completer variants.
#[async_trait]
pub trait JobCompleter: Send + Sync {
    /// Begin accepting transitions. Errors if already running or if no
    /// subscribe channel is set.
    async fn start(&self) -> Result<()>;

    /// Resolve once the completer is ready to do work. The batch variant's
    /// flush loop signals this; the other variants are ready as soon as
    /// `start` returns.
    async fn wait_started(&self) {}

    /// Accept one state transition for a job believed to be running, along
    /// with its statistics payload.
    async fn job_set_state_if_running(
        &self,
        stats: JobStatistics,
        transition: crate::database::JobTransition,
    ) -> Result<()>;

    /// Stop accepting transitions, drain everything already accepted, then
    /// close the subscribe channel. Blocking; idempotent within a cycle.
    async fn stop(&self);

    /// Install a fresh subscribe channel for the next start/stop cycle.
    /// Valid only while the completer is not running.
    fn reset_subscribe_chan(&self, chan: SubscribeChan) -> Result<()>;
}

/// Lifecycle states. Only `Running` accepts transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleterState {
    Unstarted,
    Running,
    Stopped,
}

/// Mutex-guarded lifecycle cell.
///
/// `with_running` runs a short closure under the state lock, guaranteeing no
/// accept can interleave with the `Running -> Stopped` flip. Closures must
/// not block or await.
pub(crate) struct StateCell {
    state: Mutex<CompleterState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(CompleterState::Unstarted),
        }
    }

    pub(crate) fn current(&self) -> CompleterState {
        *self.state.lock()
    }

    /// `Unstarted | Stopped -> Running`.
    pub(crate) fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            CompleterState::Running => Err(Error::AlreadyStarted),
            CompleterState::Unstarted | CompleterState::Stopped => {
                *state = CompleterState::Running;
                Ok(())
            }
        }
    }

    /// `Running -> Stopped`. Returns false if not running (stop is then a
    /// no-op).
    pub(crate) fn begin_stop(&self) -> bool {
        let mut state = self.state.lock();
        if *state == CompleterState::Running {
            *state = CompleterState::Stopped;
            true
        } else {
            false
        }
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if *self.state.lock() == CompleterState::Running {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Run `f` under the state lock if currently running.
    pub(crate) fn with_running<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let state = self.state.lock();
        if *state == CompleterState::Running {
            Ok(f())
        } else {
            Err(Error::NotRunning)
        }
    }
}

/// Holder for the subscribe channel sender owned by a completer.
pub(crate) struct SubscribeChanSlot {
    tx: Mutex<Option<SubscribeChan>>,
}

impl SubscribeChanSlot {
    pub(crate) fn new(chan: SubscribeChan) -> Self {
        Self {
            tx: Mutex::new(Some(chan)),
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Clone the sender for a publish. Publishers hold their own clone so
    /// the channel only closes once every in-flight publish has finished.
    pub(crate) fn sender(&self) -> Option<SubscribeChan> {
        self.tx.lock().clone()
    }

    pub(crate) fn set(&self, chan: SubscribeChan) {
        *self.tx.lock() = Some(chan);
    }

    /// Remove and drop the held sender, closing the channel once all
    /// publisher clones are gone.
    pub(crate) fn take(&self) -> Option<SubscribeChan> {
        self.tx.lock().take()
    }
}

/// Deliver a batch of updates to subscribers. Blocks when the channel buffer
/// is full; a dropped receiver discards the batch.
pub(crate) async fn publish(chan: &SubscribeChan, updates: Vec<JobUpdate>) {
    if updates.is_empty() {
        return;
    }
    if chan.send(updates).await.is_err() {
        debug!("Subscriber receiver dropped; discarding job updates");
    }
}
