//! Two-level semaphore concurrency control for tool invocations.
//!
//! A global semaphore bounds total in-flight calls; per-provider semaphores
//! bound each provider. Acquisition is always global-first then provider,
//! which keeps the two levels deadlock-free; release happens in the reverse
//! order when the permit is dropped. Zero means unlimited at either level.
//!
//! The manager is shared across batches — that is what gives cross-batch
//! backpressure that a per-batch worker cap alone cannot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Running counters exposed through `stats()` and the health surface.
#[derive(Default)]
struct ConcurrencyMetrics {
    inflight: AtomicI64,
    queued_total: AtomicU64,
    wait_total_us: AtomicU64,
    acquisitions: AtomicU64,
}

/// Scoped pair of permits for one invocation.
///
/// Field order is release order: the provider slot frees before the global
/// slot.
pub struct ConcurrencyPermit {
    _provider: Option<OwnedSemaphorePermit>,
    _global: Option<OwnedSemaphorePermit>,
    release: Arc<dyn Fn() + Send + Sync>,
    /// Time spent waiting for both slots.
    pub waited: Duration,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        (self.release)();
    }
}

/// Global + per-provider semaphore manager.
pub struct ConcurrencyManager {
    global_limit: usize,
    default_provider_limit: usize,
    global: Option<Arc<Semaphore>>,
    providers: Mutex<HashMap<String, Option<Arc<Semaphore>>>>,
    limits: Mutex<HashMap<String, usize>>,
    metrics: Arc<ConcurrencyMetrics>,
    per_provider_inflight: Arc<Mutex<HashMap<String, i64>>>,
}

impl ConcurrencyManager {
    /// Create a manager; a zero limit disables that level.
    pub fn new(global_limit: usize, default_provider_limit: usize) -> Self {
        tracing::info!(
            global_limit = %limit_str(global_limit),
            default_provider_limit = %limit_str(default_provider_limit),
            "concurrency manager initialized"
        );
        ConcurrencyManager {
            global_limit,
            default_provider_limit,
            global: (global_limit > 0).then(|| Arc::new(Semaphore::new(global_limit))),
            providers: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
            metrics: Arc::new(ConcurrencyMetrics::default()),
            per_provider_inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn global_limit(&self) -> usize {
        self.global_limit
    }

    /// Effective limit for a provider (0 = unlimited).
    pub fn provider_limit(&self, provider_id: &str) -> usize {
        self.limits
            .lock()
            .expect("limits lock poisoned")
            .get(provider_id)
            .copied()
            .unwrap_or(self.default_provider_limit)
    }

    /// Set a provider's limit, replacing its semaphore.
    ///
    /// Calls currently holding permits on the old semaphore release into it
    /// and complete normally; only future acquisitions see the new limit.
    pub fn set_provider_limit(&self, provider_id: &str, limit: usize) {
        self.limits
            .lock()
            .expect("limits lock poisoned")
            .insert(provider_id.to_string(), limit);
        self.providers
            .lock()
            .expect("providers lock poisoned")
            .insert(
                provider_id.to_string(),
                (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
            );
        tracing::debug!(
            provider = %provider_id,
            limit = %limit_str(limit),
            "provider concurrency limit set"
        );
    }

    fn provider_semaphore(&self, provider_id: &str) -> Option<Arc<Semaphore>> {
        let limit = self.provider_limit(provider_id);
        let mut providers = self.providers.lock().expect("providers lock poisoned");
        providers
            .entry(provider_id.to_string())
            .or_insert_with(|| (limit > 0).then(|| Arc::new(Semaphore::new(limit))))
            .clone()
    }

    /// Acquire a global slot then a provider slot, reporting the wait.
    ///
    /// If provider acquisition fails after the global slot was taken (the
    /// semaphore was closed), the global slot is released before returning.
    pub async fn acquire(&self, provider_id: &str) -> ConcurrencyPermit {
        let wait_start = Instant::now();
        let mut had_to_wait = false;

        let global = match &self.global {
            None => None,
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    had_to_wait = true;
                    tracing::debug!(
                        provider = %provider_id,
                        global_limit = self.global_limit,
                        "waiting for global concurrency slot"
                    );
                    // Semaphore is never closed while the manager lives.
                    Some(
                        sem.clone()
                            .acquire_owned()
                            .await
                            .expect("global semaphore closed"),
                    )
                }
            },
        };

        let provider = match self.provider_semaphore(provider_id) {
            None => None,
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    had_to_wait = true;
                    tracing::debug!(
                        provider = %provider_id,
                        provider_limit = self.provider_limit(provider_id),
                        "waiting for provider concurrency slot"
                    );
                    match sem.clone().acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            // Drop the global permit rather than hold it for
                            // a provider slot that can never arrive.
                            drop(global);
                            panic!("provider semaphore closed while acquiring");
                        }
                    }
                }
            },
        };

        let waited = wait_start.elapsed();
        self.metrics.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .wait_total_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        if had_to_wait {
            self.metrics.queued_total.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.inflight.fetch_add(1, Ordering::SeqCst);
        {
            let mut per = self
                .per_provider_inflight
                .lock()
                .expect("inflight lock poisoned");
            *per.entry(provider_id.to_string()).or_insert(0) += 1;
        }

        let metrics = self.metrics.clone();
        let per_provider = self.per_provider_inflight.clone();
        let id = provider_id.to_string();
        ConcurrencyPermit {
            _provider: provider,
            _global: global,
            release: Arc::new(move || {
                metrics.inflight.fetch_sub(1, Ordering::SeqCst);
                let mut per = per_provider.lock().expect("inflight lock poisoned");
                if let Some(count) = per.get_mut(&id) {
                    *count -= 1;
                }
            }),
            waited,
        }
    }

    /// Current in-flight call count.
    pub fn inflight(&self) -> i64 {
        self.metrics.inflight.load(Ordering::SeqCst)
    }

    /// Current in-flight count for one provider.
    pub fn inflight_for(&self, provider_id: &str) -> i64 {
        self.per_provider_inflight
            .lock()
            .expect("inflight lock poisoned")
            .get(provider_id)
            .copied()
            .unwrap_or(0)
    }

    /// Limits and counters snapshot for the health surface.
    pub fn stats(&self) -> serde_json::Value {
        let limits = self.limits.lock().expect("limits lock poisoned");
        let overrides: HashMap<&str, serde_json::Value> = limits
            .iter()
            .map(|(id, limit)| (id.as_str(), serde_json::json!(limit_str(*limit))))
            .collect();
        let acquisitions = self.metrics.acquisitions.load(Ordering::Relaxed);
        let wait_total_us = self.metrics.wait_total_us.load(Ordering::Relaxed);
        serde_json::json!({
            "global_limit": limit_str(self.global_limit),
            "default_provider_limit": limit_str(self.default_provider_limit),
            "provider_overrides": overrides,
            "inflight": self.inflight(),
            "queued_total": self.metrics.queued_total.load(Ordering::Relaxed),
            "avg_wait_ms": if acquisitions > 0 {
                (wait_total_us as f64 / acquisitions as f64) / 1000.0
            } else {
                0.0
            },
        })
    }
}

fn limit_str(limit: usize) -> String {
    if limit == 0 {
        "unlimited".to_string()
    } else {
        limit.to_string()
    }
}
