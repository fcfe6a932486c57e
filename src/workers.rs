//! Background workers: idle reaping and periodic health checks.
//!
//! Each worker is a long-lived task on a fixed period with cooperative
//! shutdown through a cancellation token. Iteration always walks a fresh
//! snapshot of the registry, so providers added or removed mid-loop are
//! tolerated; a failure on one provider is logged and never breaks the
//! sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::continuation::ResponseCache;
use crate::provider::ProviderState;
use crate::registry::ProviderRegistry;

/// Default period of the GC (idle-reap) worker.
pub const GC_INTERVAL: Duration = Duration::from_secs(30);

/// Default period of the health-check worker.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the idle-reap loop: every `interval`, shut down providers idle past
/// their TTL and purge expired continuations.
pub fn spawn_gc_worker(
    registry: Arc<ProviderRegistry>,
    cache: Arc<ResponseCache>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_s = interval.as_secs(), "gc worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    tracing::info!("gc worker stopped");
                    return;
                }
            }

            for provider in registry.get_all().await {
                if provider.maybe_shutdown_idle().await {
                    tracing::debug!(provider = %provider.id(), "idle provider reaped");
                }
            }
            cache.purge_expired();
        }
    })
}

/// Spawn the health-check loop: every `interval`, probe each READY provider.
pub fn spawn_health_worker(
    registry: Arc<ProviderRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(interval_s = interval.as_secs(), "health worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => {
                    tracing::info!("health worker stopped");
                    return;
                }
            }

            for provider in registry.get_all().await {
                if provider.state().await != ProviderState::Ready {
                    continue;
                }
                if !provider.health_check().await {
                    tracing::warn!(provider = %provider.id(), "periodic health check failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::provider::Provider;
    use crate::test_util::echo_provider_spec;

    async fn registry_with_started_provider(idle_ttl_s: u64) -> Arc<ProviderRegistry> {
        let mut spec = echo_provider_spec();
        spec.idle_ttl_s = idle_ttl_s;
        let registry = Arc::new(ProviderRegistry::new());
        let provider = Arc::new(Provider::new("p", spec, Arc::new(EventBus::new())));
        provider.ensure_ready().await.expect("starts");
        registry.add(provider).await.expect("add");
        registry
    }

    #[tokio::test]
    async fn test_gc_worker_reaps_idle_provider_and_stops_on_cancel() {
        let registry = registry_with_started_provider(0).await;
        let cache = Arc::new(ResponseCache::new(Duration::from_millis(10)));
        cache.store("b", 0, &serde_json::json!({"k": 1}));
        let cancel = CancellationToken::new();

        let handle = spawn_gc_worker(
            registry.clone(),
            cache.clone(),
            Duration::from_millis(100),
            cancel.clone(),
        );

        // idle_ttl 0 means the provider goes down on the first sweep after
        // one second of idleness.
        tokio::time::sleep(Duration::from_millis(1300)).await;
        let provider = registry.get("p").await.unwrap();
        assert_eq!(provider.state().await, ProviderState::Cold);
        assert!(cache.is_empty(), "expired continuation purged by the sweep");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker exits on cancel")
            .expect("join");
    }

    #[tokio::test]
    async fn test_health_worker_probes_ready_providers() {
        let registry = registry_with_started_provider(3600).await;
        let cancel = CancellationToken::new();
        let handle = spawn_health_worker(registry.clone(), Duration::from_millis(50), cancel.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let provider = registry.get("p").await.unwrap();
        // The echo responder answers probes, so the provider stays READY.
        assert_eq!(provider.state().await, ProviderState::Ready);
        let status = provider.status().await;
        assert!(status["health"]["total_successes"].as_u64().unwrap() > 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker exits on cancel")
            .expect("join");
        provider.shutdown("test").await;
    }

    #[tokio::test]
    async fn test_workers_tolerate_registry_changes() {
        let registry = Arc::new(ProviderRegistry::new());
        let cancel = CancellationToken::new();
        let handle = spawn_health_worker(registry.clone(), Duration::from_millis(30), cancel.clone());

        // Add and remove providers while the loop runs.
        for i in 0..3 {
            let provider = Arc::new(Provider::new(
                format!("p{i}"),
                echo_provider_spec(),
                Arc::new(EventBus::new()),
            ));
            registry.add(provider).await.expect("add");
            tokio::time::sleep(Duration::from_millis(40)).await;
            registry.remove(&format!("p{i}")).await;
        }

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker exits on cancel")
            .expect("join");
    }
}
