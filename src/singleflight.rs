//! Keyed single-flight: at most one execution of the same work in flight.
//!
//! Concurrent callers with the same key coalesce onto one leader; followers
//! observe the leader's outcome (success or error). Nothing is cached past
//! the in-flight window — the next caller after completion runs fresh. The
//! batch executor uses this to turn N simultaneous cold starts of one
//! provider into a single start.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::watch;

/// Outcome shared between the leader and its followers. Errors travel as
/// rendered messages so the result is cheaply cloneable.
pub type SharedOutcome = Result<Value, String>;

type Slot = watch::Receiver<Option<SharedOutcome>>;

#[derive(Default)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<String, Slot>>,
}

/// Removes the in-flight key when the leader finishes or is cancelled, so a
/// dropped leader never wedges future callers.
struct KeyGuard<'a> {
    flight: &'a SingleFlight,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.flight
            .inflight
            .lock()
            .expect("single-flight lock poisoned")
            .remove(&self.key);
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Execute `work` for `key`, coalescing with any execution already in
    /// flight under the same key.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> SharedOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = crate::Result<Value>>,
    {
        let role = {
            let mut inflight = self.inflight.lock().expect("single-flight lock poisoned");
            match inflight.get(key) {
                Some(rx) => Err(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    Ok(tx)
                }
            }
        };

        match role {
            Ok(tx) => {
                let guard = KeyGuard {
                    flight: self,
                    key: key.to_string(),
                };
                let outcome = work().await.map_err(|e| e.to_string());
                drop(guard);
                let _ = tx.send(Some(outcome.clone()));
                outcome
            }
            Err(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(value) => value.clone().expect("waited for Some"),
                Err(_) => Err("single-flight leader was cancelled".to_string()),
            },
        }
    }

    /// Number of keys currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .expect("single-flight lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_coalesce_to_one_execution() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let flight = flight.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("key", || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({"started": true}))
                    })
                    .await
            }));
        }

        for handle in handles {
            let outcome = handle.await.expect("join");
            assert_eq!(outcome.expect("success")["started"], true);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(flight.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_followers_observe_leader_error() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let flight = flight.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run("key", || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(crate::error::HangarError::ProviderStart(
                            "p".to_string(),
                            "spawn failed".to_string(),
                        ))
                    })
                    .await
            }));
        }

        for handle in handles {
            let outcome = handle.await.expect("join");
            assert!(outcome.unwrap_err().contains("spawn failed"));
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_result_not_cached_past_flight() {
        let flight = SingleFlight::new();
        let executions = AtomicUsize::new(0);

        for _ in 0..3 {
            let outcome = flight
                .run("key", || async {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(1))
                })
                .await;
            assert!(outcome.is_ok());
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_distinct_keys_run_independently() {
        let flight = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for key in ["a", "b", "c"] {
            let flight = flight.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(key, || async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok(json!(key))
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("success");
        }
        assert_eq!(executions.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_leader_unblocks_followers() {
        let flight = Arc::new(SingleFlight::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run("key", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(json!(null))
                    })
                    .await
            })
        };
        // Let the leader register, then kill it mid-flight.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let follower = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.run("key", || async { Ok(json!(null)) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();

        let outcome = follower.await.expect("join");
        assert!(outcome.unwrap_err().contains("cancelled"));
        assert_eq!(flight.inflight_count(), 0);
    }
}
