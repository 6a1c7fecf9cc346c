//! Deduplication of concurrent fetches for the same key

use cdr_types::DeploymentUnit;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) type FetchOutcome = Option<Arc<DeploymentUnit>>;

type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Fetches currently running, one per key
pub(crate) struct InFlight<K> {
    fetches: DashMap<K, (u64, SharedFetch)>,
    next_token: AtomicU64,
}

impl<K> InFlight<K>
where
    K: Eq + Hash + Clone,
{
    pub(crate) fn new() -> Self {
        Self {
            fetches: DashMap::new(),
            next_token: AtomicU64::new(0),
        }
    }

    /// Await the fetch running for `key`, starting one with `start` if none is.
    ///
    /// The map shard lock is released before the future is polled.
    pub(crate) async fn run<F>(&self, key: K, start: F) -> FetchOutcome
    where
        F: FnOnce() -> BoxFuture<'static, FetchOutcome>,
    {
        let (token, fetch) = match self.fetches.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let fetch = start().shared();
                entry.insert((token, fetch.clone()));
                (token, fetch)
            }
        };

        let outcome = fetch.await;
        self.fetches.remove_if(&key, |_, (t, _)| *t == token);
        outcome
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.fetches.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdr_types::DeploymentMode;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let in_flight = Arc::new(InFlight::<String>::new());
        let started = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let in_flight = in_flight.clone();
            let started = started.clone();
            handles.push(tokio::spawn(async move {
                in_flight
                    .run("Task1".to_string(), move || {
                        started.fetch_add(1, Ordering::SeqCst);
                        async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Some(DeploymentUnit::builder(DeploymentMode::Shared, "Task1", "v1").build())
                        }
                        .boxed()
                    })
                    .await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().context_id());
        }

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(in_flight.len(), 0);
    }
}
