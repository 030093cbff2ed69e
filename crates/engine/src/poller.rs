//! Completion detection through the shared-storage sentinel.
//!
//! The poller is level-triggered: it sleeps, checks whether the sentinel
//! object exists and parses, and repeats until the record appears, the
//! monotonic deadline passes, or the cancellation token fires.

use std::{sync::Arc, time::Duration};

use cvmstep_storage::{ObjectStore, StorageError};
use cvmstep_types::SentinelRecord;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a wait for the sentinel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Found(SentinelRecord),
    TimedOut { waited: Duration },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CompletionPoller {
    store: Arc<dyn ObjectStore>,
    interval: Duration,
    max_consecutive_errors: u32,
}

impl CompletionPoller {
    pub fn new(store: Arc<dyn ObjectStore>, interval: Duration, max_consecutive_errors: u32) -> Self {
        Self {
            store,
            interval,
            max_consecutive_errors: max_consecutive_errors.max(1),
        }
    }

    /// Wait for the sentinel at `sentinel_key` for at most `timeout`.
    ///
    /// A sentinel that fails to parse is treated as not yet written. Storage
    /// errors are tolerated until `max_consecutive_errors` happen in a row,
    /// at which point the last one is returned.
    pub async fn wait_for(
        &self,
        sentinel_key: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, StorageError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut consecutive_errors = 0u32;
        let mut checks = 0u32;

        info!(sentinel_key, timeout_s = timeout.as_secs(), interval_s = self.interval.as_secs(), "waiting for sentinel");
        loop {
            let now = Instant::now();
            if now >= deadline {
                let waited = now.duration_since(started);
                warn!(sentinel_key, checks, waited_s = waited.as_secs(), "sentinel did not appear before the deadline");
                return Ok(PollOutcome::TimedOut { waited });
            }

            let nap = self.interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(sentinel_key, checks, "sentinel wait cancelled");
                    return Ok(PollOutcome::Cancelled);
                }
                _ = sleep(nap) => {}
            }

            checks += 1;
            match self.check(sentinel_key).await {
                Ok(Some(record)) => {
                    info!(sentinel_key, checks, exit_code = record.exit_code, "sentinel found");
                    return Ok(PollOutcome::Found(record));
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    debug!(sentinel_key, checks, "sentinel not present yet");
                }
                Err(error) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.max_consecutive_errors {
                        return Err(error);
                    }
                    warn!(sentinel_key, consecutive_errors, error = %error, "sentinel check failed; will retry");
                }
            }
        }
    }

    async fn check(&self, sentinel_key: &str) -> Result<Option<SentinelRecord>, StorageError> {
        let Some(bytes) = self.store.get(sentinel_key).await? else {
            return Ok(None);
        };
        match SentinelRecord::from_slice(&bytes) {
            Ok(record) if record.key == sentinel_key => Ok(Some(record)),
            Ok(record) => {
                warn!(sentinel_key, recorded_key = %record.key, "sentinel names a different invocation; ignoring it");
                Ok(None)
            }
            Err(error) => {
                warn!(sentinel_key, error = %error, "sentinel present but unreadable; treating as incomplete");
                Ok(None)
            }
        }
    }
}
