//! Identity feeds
//!
//! Batch mode issues for a listed set of identities one at a time, in list
//! order, and stops at the first failure unless told to keep going.
//!
//! Watch mode dispatches every applied service account to its own task. Tasks
//! for the same identity are serialized through a per-identity lock, so two
//! issuances never read-modify-write the same secret at once. Distinct
//! identities run concurrently up to the configured limit. A failed issuance
//! is logged and counted; it never ends the watch.

use std::sync::Arc;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::controller::{IssuanceOrchestrator, IssuanceOutcome};
use crate::identity::Identity;
use crate::{Error, Result};

/// A change to a service account
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityEvent {
    /// Created, updated or seen during the initial list
    Applied(Identity),
    /// Deleted. Its secret is kept.
    Deleted(Identity),
}

/// Counts of what a feed did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeedSummary {
    /// Certificates issued
    pub issued: usize,
    /// Identities outside the allow-list
    pub skipped: usize,
    /// Issuances that failed
    pub failed: usize,
}

type TaskResult = (Identity, Result<IssuanceOutcome>);

/// Feeds identities to the orchestrator
pub struct IdentityFeeder {
    orchestrator: Arc<IssuanceOrchestrator>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    permits: Arc<Semaphore>,
}

impl IdentityFeeder {
    /// Create a feeder; concurrency is bounded by the orchestrator's config
    pub fn new(orchestrator: Arc<IssuanceOrchestrator>) -> Self {
        let permits = Arc::new(Semaphore::new(
            orchestrator.config().max_concurrent_issuances.max(1),
        ));
        Self {
            orchestrator,
            locks: Arc::new(DashMap::new()),
            permits,
        }
    }

    /// Issue for each identity in order.
    ///
    /// The first failure is returned at once unless `keep_going` is set, in
    /// which case it is logged and counted.
    pub async fn run_batch(
        &self,
        identities: impl IntoIterator<Item = Identity>,
        keep_going: bool,
    ) -> Result<FeedSummary> {
        let mut summary = FeedSummary::default();

        for identity in identities {
            match self.orchestrator.issue(&identity).await {
                Ok(outcome) => summary.record(&outcome),
                Err(e) if keep_going => {
                    error!(identity = %identity, error = %e, "issuance failed, continuing");
                    summary.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            issued = summary.issued,
            skipped = summary.skipped,
            failed = summary.failed,
            "batch complete"
        );
        Ok(summary)
    }

    /// Issue for every applied identity until the stream ends.
    ///
    /// Stream errors are logged and skipped. Returns once the stream has ended
    /// and every dispatched issuance has finished.
    pub async fn run_watch<S>(&self, events: S) -> FeedSummary
    where
        S: Stream<Item = Result<IdentityEvent>>,
    {
        let mut events = std::pin::pin!(events);
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut summary = FeedSummary::default();

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(Ok(IdentityEvent::Applied(identity))) => {
                        if self.orchestrator.config().allows_namespace(identity.namespace()) {
                            self.dispatch(&mut tasks, identity);
                        } else {
                            debug!(identity = %identity, "namespace not in allow-list, skipping");
                            summary.skipped += 1;
                        }
                    }
                    Some(Ok(IdentityEvent::Deleted(identity))) => {
                        info!(identity = %identity, "service account deleted, keeping its secret");
                        release_lock(&self.locks, &identity.to_string());
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "service account watch error");
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    summary.record_task(joined);
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            summary.record_task(joined);
        }

        info!(
            issued = summary.issued,
            skipped = summary.skipped,
            failed = summary.failed,
            "watch ended"
        );
        summary
    }

    fn dispatch(&self, tasks: &mut JoinSet<TaskResult>, identity: Identity) {
        let key = identity.to_string();
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let locks = self.locks.clone();
        let permits = self.permits.clone();
        let orchestrator = self.orchestrator.clone();

        tasks.spawn(async move {
            let result = {
                let _serialized = lock.lock_owned().await;
                match permits.acquire_owned().await {
                    Ok(_permit) => orchestrator.issue(&identity).await,
                    Err(_) => Err(Error::config("issuance limiter closed")),
                }
            };
            release_lock(&locks, &key);
            (identity, result)
        });
    }
}

/// Drop an identity's lock once no queued or running task holds it
fn release_lock(locks: &DashMap<String, Arc<Mutex<()>>>, key: &str) {
    locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
}

impl FeedSummary {
    fn record(&mut self, outcome: &IssuanceOutcome) {
        match outcome {
            IssuanceOutcome::Issued(_) => self.issued += 1,
            IssuanceOutcome::Skipped => self.skipped += 1,
        }
    }

    fn record_task(&mut self, joined: std::result::Result<TaskResult, JoinError>) {
        match joined {
            Ok((_, Ok(outcome))) => self.record(&outcome),
            Ok((identity, Err(e))) => {
                error!(identity = %identity, error = %e, "issuance failed");
                self.failed += 1;
            }
            Err(e) => {
                error!(error = %e, "issuance task did not complete");
                self.failed += 1;
            }
        }
    }
}
