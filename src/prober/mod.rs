//! Bounded-concurrency probe runner.
//!
//! A [`ProbeGroup`] owns any number of probe tasks, admits at most `limit` of
//! them at a time and folds their outcomes into a single running total. Only
//! [`ProbeGroup::collect`] touches the total and the last error; workers talk
//! to it purely by sending their outcome over a channel.

pub mod speed;
pub mod transfer;

use crate::error::{ProbeError, Result};
use crate::types::BytesTransferred;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::debug;

/// Receiving end of the incremental totals stream.
pub type Incremental = mpsc::UnboundedReceiver<BytesTransferred>;

pub struct ProbeGroup {
    limit: usize,
    // Starts with no permits; `collect` opens the `limit` admission slots.
    admission: Arc<Semaphore>,
    workers: JoinSet<()>,
    outcomes_tx: mpsc::UnboundedSender<Result<BytesTransferred>>,
    outcomes_rx: mpsc::UnboundedReceiver<Result<BytesTransferred>>,
    incremental: Option<mpsc::UnboundedSender<BytesTransferred>>,
    submitted: usize,
}

impl ProbeGroup {
    /// Creates an idle group admitting at most `limit` tasks at once.
    ///
    /// # Panics
    ///
    /// If `limit` is zero.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "probe group concurrency must be positive");
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            limit,
            admission: Arc::new(Semaphore::new(0)),
            workers: JoinSet::new(),
            outcomes_tx,
            outcomes_rx,
            incremental: None,
            submitted: 0,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Registers one probe. The future is not polled until it is admitted,
    /// which happens no earlier than [`collect`](Self::collect).
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit<F>(&mut self, probe: F)
    where
        F: Future<Output = Result<BytesTransferred>> + Send + 'static,
    {
        let admission = Arc::clone(&self.admission);
        let outcomes = self.outcomes_tx.clone();
        self.submitted += 1;

        self.workers.spawn(async move {
            // The semaphore only closes once every outcome has been read.
            let Ok(_slot) = admission.acquire_owned().await else {
                return;
            };
            let outcome = probe.await;
            // The slot is released after the outcome has been handed over.
            let _ = outcomes.send(outcome);
        });
    }

    /// Requests the stream of cumulative totals. Each successful, non-empty
    /// transfer pushes the new total; the stream ends when `collect` finalizes.
    /// Without this call no incremental totals are produced.
    pub fn stream(&mut self) -> Incremental {
        let (tx, rx) = mpsc::unbounded_channel();
        self.incremental = Some(tx);
        rx
    }

    /// Runs every submitted probe to completion and returns the total bytes
    /// transferred.
    ///
    /// Partial success is success: the error from the most recent failure is
    /// only returned when the total stays at zero. A group with nothing
    /// submitted fails with [`ProbeError::EmptyWorkload`].
    pub async fn collect(self) -> Result<BytesTransferred> {
        let ProbeGroup {
            limit,
            admission,
            mut workers,
            outcomes_tx,
            mut outcomes_rx,
            incremental,
            submitted,
        } = self;

        // An empty group can only report a meaningless zero.
        if submitted == 0 {
            return Err(ProbeError::EmptyWorkload);
        }

        debug!(submitted, limit, "collecting probe group");

        // Each worker holds its own sender, so the loop below ends once all
        // of them have reported (or gone away).
        drop(outcomes_tx);
        admission.add_permits(limit);

        let mut total: BytesTransferred = 0;
        let mut last_err: Option<ProbeError> = None;
        let mut failed = 0usize;

        while let Some(outcome) = outcomes_rx.recv().await {
            match outcome {
                Ok(bytes) => {
                    total += bytes;
                    if bytes > 0 {
                        if let Some(inc) = &incremental {
                            // A consumer that stopped listening must not stall the run.
                            let _ = inc.send(total);
                        }
                    }
                }
                Err(e) => {
                    debug!(error = %e, "probe task failed");
                    failed += 1;
                    last_err = Some(e);
                }
            }
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    std::panic::resume_unwind(e.into_panic());
                }
            }
        }
        admission.close();
        drop(incremental);

        debug!(total, failed, "probe group finished");

        if total > 0 {
            Ok(total)
        } else {
            Err(last_err.unwrap_or(ProbeError::NoTasksSucceeded))
        }
    }
}
