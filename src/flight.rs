//! At most one in-flight operation per key; late callers await the same result.

use crate::error::RepoResult;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;

type SharedResult<T> = Shared<BoxFuture<'static, RepoResult<T>>>;

struct Flight<T: Clone> {
    future: SharedResult<T>,
    waiters: usize,
}

pub struct SingleFlight<T: Clone> {
    inflight: Mutex<HashMap<String, Flight<T>>>,
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `make()` unless an operation for `key` is already running, in which
    /// case the caller waits for that one instead.
    ///
    /// The work is driven by whoever is polling. When the last waiter gives up
    /// before completion the operation is dropped, which cancels its I/O.
    pub async fn run<F, Fut>(&self, key: &str, make: F) -> RepoResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RepoResult<T>> + Send + 'static,
    {
        let future = {
            let mut inflight = self.inflight.lock();
            match inflight.get_mut(key) {
                Some(flight) => {
                    debug!("Joining in-flight operation for {}", key);
                    flight.waiters += 1;
                    flight.future.clone()
                }
                None => {
                    let future = make().boxed().shared();
                    inflight.insert(
                        key.to_string(),
                        Flight {
                            future: future.clone(),
                            waiters: 1,
                        },
                    );
                    future
                }
            }
        };

        let _guard = Waiter {
            owner: self,
            key,
            future: future.clone(),
        };
        future.await
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inflight.lock().contains_key(key)
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.inflight.lock().len())
            .finish()
    }
}

// Unregisters the flight once it has produced a value or nobody is left waiting.
struct Waiter<'a, T: Clone> {
    owner: &'a SingleFlight<T>,
    key: &'a str,
    future: SharedResult<T>,
}

impl<T: Clone> Drop for Waiter<'_, T> {
    fn drop(&mut self) {
        let mut inflight = self.owner.inflight.lock();
        let Some(flight) = inflight.get_mut(self.key) else {
            return;
        };
        if !flight.future.ptr_eq(&self.future) {
            return;
        }
        flight.waiters = flight.waiters.saturating_sub(1);
        if flight.waiters == 0 || self.future.peek().is_some() {
            inflight.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepoError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let flight = SingleFlight::<usize>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let calls = (0..10).map(|_| {
            let runs = runs.clone();
            flight.run("apt-ubuntu-jammy", move || async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(runs.fetch_add(1, Ordering::SeqCst) + 1)
            })
        });
        let results = futures::future::join_all(calls).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| r.as_ref().unwrap() == &1));
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_and_not_remembered() {
        let flight = SingleFlight::<usize>::new();
        let (a, b) = tokio::join!(
            flight.run("npm", || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(RepoError::ParseError("bad".into()))
            }),
            flight.run("npm", || async { Ok(7) }),
        );
        assert_eq!(a.unwrap_err(), RepoError::ParseError("bad".into()));
        assert_eq!(b.unwrap_err(), RepoError::ParseError("bad".into()));

        // the failure is not cached; a new call runs again
        assert_eq!(flight.run("npm", || async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_different_keys_run_independently() {
        let flight = SingleFlight::<&'static str>::new();
        let (a, b) = tokio::join!(
            flight.run("a", || async { Ok("first") }),
            flight.run("b", || async { Ok("second") }),
        );
        assert_eq!(a.unwrap(), "first");
        assert_eq!(b.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_remaining_waiter_finishes_after_leader_times_out() {
        let flight = SingleFlight::<usize>::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let (leader, follower) = tokio::join!(
            tokio::time::timeout(
                Duration::from_millis(5),
                flight.run("brew", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    Ok(42)
                }),
            ),
            flight.run("brew", || async { Ok(0) }),
        );
        assert!(leader.is_err());
        assert_eq!(follower.unwrap(), 42);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flight.is_in_flight("brew"));
    }

    #[tokio::test]
    async fn test_abandoned_operation_is_dropped() {
        let flight = SingleFlight::<usize>::new();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            flight.run("dnf", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(!flight.is_in_flight("dnf"));

        assert_eq!(flight.run("dnf", || async { Ok(2) }).await.unwrap(), 2);
    }
}
