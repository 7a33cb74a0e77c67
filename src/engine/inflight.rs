// Per-path request coalescing: one upstream fetch per artifact, any number of waiters.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::path::NormalizedPath;

/// How one fetch cycle ended. Every waiter on the cycle sees the same value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Promoted into the cache; waiters read it from there.
    Cached { length: u64 },
    /// Every mirror was tried and none had the artifact.
    NotFound,
    /// Upstream succeeded but the cache entry could not be written; the body
    /// is held in memory so every waiter still gets the artifact.
    Uncached(Bytes),
    /// The leader went away without reporting a result.
    Aborted,
}

impl FetchOutcome {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cached { .. } => "cached",
            Self::NotFound => "not_found",
            Self::Uncached(_) => "uncached",
            Self::Aborted => "aborted",
        }
    }
}

pub type SharedOutcome = Shared<BoxFuture<'static, FetchOutcome>>;

type Entries = Arc<Mutex<HashMap<NormalizedPath, SharedOutcome>>>;

pub enum Join {
    /// First request for the path; must drive the fetch and publish its result.
    Leader(LeaderHandle),
    /// A fetch is already running; await its result.
    Follower(SharedOutcome),
}

#[derive(Clone, Default)]
pub struct InFlightRegistry {
    entries: Entries,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, path: &NormalizedPath) -> Join {
        let mut entries = self.entries.lock();
        if let Some(outcome) = entries.get(path) {
            return Join::Follower(outcome.clone());
        }

        let (tx, rx) = oneshot::channel();
        let outcome = rx
            .map(|result| result.unwrap_or(FetchOutcome::Aborted))
            .boxed()
            .shared();
        entries.insert(path.clone(), outcome.clone());

        Join::Leader(LeaderHandle {
            path: path.clone(),
            entries: Arc::clone(&self.entries),
            tx: Some(tx),
            outcome,
        })
    }

    /// Number of paths currently being fetched.
    pub fn in_flight(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Publishing side of an in-flight fetch.
///
/// Dropping it without calling [`LeaderHandle::publish`] resolves all waiters
/// with [`FetchOutcome::Aborted`].
pub struct LeaderHandle {
    path: NormalizedPath,
    entries: Entries,
    tx: Option<oneshot::Sender<FetchOutcome>>,
    outcome: SharedOutcome,
}

impl LeaderHandle {
    pub fn path(&self) -> &NormalizedPath {
        &self.path
    }

    /// The result the leader's own request should wait on.
    pub fn outcome(&self) -> SharedOutcome {
        self.outcome.clone()
    }

    pub fn publish(mut self, outcome: FetchOutcome) {
        self.resolve(outcome);
    }

    fn resolve(&mut self, outcome: FetchOutcome) {
        if let Some(tx) = self.tx.take() {
            // Remove first: a request arriving after this point starts a new cycle.
            self.entries.lock().remove(&self.path);
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for LeaderHandle {
    fn drop(&mut self) {
        self.resolve(FetchOutcome::Aborted);
    }
}
