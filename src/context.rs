//! Application context: one value holding the process-wide collaborators.
//!
//! Constructed once at startup by [`bootstrap`] and passed explicitly —
//! there are no ambient globals. One event bus, one command bus, one query
//! bus, one concurrency manager, one response cache per process.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchExecutor;
use crate::bus::{register_default_handlers, CommandBus, QueryBus};
use crate::concurrency::ConcurrencyManager;
use crate::config::HangarConfig;
use crate::continuation::ResponseCache;
use crate::events::EventBus;
use crate::guard::RateLimiter;
use crate::handlers::{
    AlertEventHandler, AuditEventHandler, LoggingEventHandler, MetricsEventHandler,
};
use crate::registry::ProviderRegistry;
use crate::workers::{spawn_gc_worker, spawn_health_worker, GC_INTERVAL, HEALTH_CHECK_INTERVAL};

/// Capacity of the in-memory audit buffer.
const AUDIT_BUFFER_CAPACITY: usize = 1000;

/// Process-wide wiring, built once from config.
pub struct AppContext {
    pub config: HangarConfig,
    pub registry: Arc<ProviderRegistry>,
    pub events: Arc<EventBus>,
    pub command_bus: Arc<CommandBus>,
    pub query_bus: Arc<QueryBus>,
    pub concurrency: Arc<ConcurrencyManager>,
    pub cache: Arc<ResponseCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsEventHandler>,
    pub audit: Arc<AuditEventHandler>,
    pub executor: Arc<BatchExecutor>,
}

/// Build the full runtime from validated config: event subscribers, the
/// provider registry, CQRS handlers, concurrency limits, and the batch
/// executor.
pub fn bootstrap(config: HangarConfig) -> crate::Result<Arc<AppContext>> {
    let events = Arc::new(EventBus::new());

    let metrics = Arc::new(MetricsEventHandler::new());
    let audit = Arc::new(AuditEventHandler::new(AUDIT_BUFFER_CAPACITY));
    events.subscribe_all(Arc::new(LoggingEventHandler));
    events.subscribe_all(metrics.clone());
    events.subscribe_all(Arc::new(AlertEventHandler));
    events.subscribe_all(audit.clone());
    tracing::info!("event handlers registered: logging, metrics, alert, audit");

    let registry = Arc::new(ProviderRegistry::from_config(&config, events.clone())?);

    let command_bus = Arc::new(CommandBus::new());
    let query_bus = Arc::new(QueryBus::new());
    register_default_handlers(&command_bus, &query_bus, registry.clone())?;

    let concurrency = Arc::new(ConcurrencyManager::new(
        config.concurrency.global_limit,
        config.concurrency.default_provider_limit,
    ));
    for (provider_id, limit) in &config.concurrency.provider_limits {
        concurrency.set_provider_limit(provider_id, *limit);
    }

    let cache = Arc::new(ResponseCache::new(Duration::from_secs(
        config.continuation.ttl_s,
    )));
    let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));

    let executor = Arc::new(BatchExecutor::new(
        registry.clone(),
        command_bus.clone(),
        events.clone(),
        concurrency.clone(),
        cache.clone(),
    ));

    tracing::info!(
        providers = config.providers.len(),
        rate_limit_rps = config.rate_limit.requests_per_second,
        burst_size = config.rate_limit.burst_size,
        "hangar runtime wired"
    );

    Ok(Arc::new(AppContext {
        config,
        registry,
        events,
        command_bus,
        query_bus,
        concurrency,
        cache,
        rate_limiter,
        metrics,
        audit,
        executor,
    }))
}

impl AppContext {
    /// Start the GC and health-check workers on their default periods.
    pub fn spawn_workers(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            spawn_gc_worker(
                self.registry.clone(),
                self.cache.clone(),
                GC_INTERVAL,
                cancel.child_token(),
            ),
            spawn_health_worker(
                self.registry.clone(),
                HEALTH_CHECK_INTERVAL,
                cancel.child_token(),
            ),
        ]
    }

    /// Stop every provider; used during process shutdown.
    pub async fn shutdown_all_providers(&self) {
        for provider in self.registry.get_all().await {
            provider.shutdown("shutdown").await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Command, CommandKind};

    #[test]
    fn test_bootstrap_empty_config() {
        let ctx = bootstrap(HangarConfig::default()).expect("bootstrap");
        assert_eq!(ctx.events.subscriber_count(), 4);
        assert!(ctx.command_bus.has_handler(CommandKind::StartProvider));
        assert!(ctx.command_bus.has_handler(CommandKind::ShutdownIdleProviders));
    }

    #[tokio::test]
    async fn test_bootstrap_registers_providers_and_limits() {
        let config = HangarConfig::from_yaml(
            r#"
providers:
  math:
    mode: subprocess
    command: ["sh", "-c", "cat"]
concurrency:
  global_limit: 5
  default_provider_limit: 2
  provider_limits:
    math: 1
"#,
        )
        .expect("config");
        let ctx = bootstrap(config).expect("bootstrap");

        assert!(ctx.registry.exists("math").await);
        assert_eq!(ctx.concurrency.global_limit(), 5);
        assert_eq!(ctx.concurrency.provider_limit("math"), 1);
        assert_eq!(ctx.concurrency.provider_limit("other"), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_invalid_config() {
        let mut config = HangarConfig::default();
        config
            .providers
            .insert("bad".to_string(), crate::config::ProviderSpec::default());
        // Subprocess mode with no command fails validation inside bootstrap.
        assert!(bootstrap(config).is_err());
    }

    #[tokio::test]
    async fn test_workers_spawn_and_cancel() {
        let ctx = bootstrap(HangarConfig::default()).expect("bootstrap");
        let cancel = CancellationToken::new();
        let handles = ctx.spawn_workers(&cancel);
        assert_eq!(handles.len(), 2);
        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("worker exits")
                .expect("join");
        }
    }

    #[tokio::test]
    async fn test_command_flow_through_context() {
        let config = HangarConfig::from_yaml(
            r#"
providers:
  math:
    mode: subprocess
    command: ["sh", "-c", "i=1; while read -r line; do printf '{\"jsonrpc\":\"2.0\",\"id\":%d,\"result\":{\"tools\":[]}}\n' \"$i\"; i=$((i+1)); done"]
"#,
        )
        .expect("config");
        let ctx = bootstrap(config).expect("bootstrap");
        let result = ctx
            .command_bus
            .send(Command::StartProvider {
                provider_id: "math".to_string(),
            })
            .await
            .expect("start");
        assert_eq!(result["state"], "ready");
        ctx.shutdown_all_providers().await;
    }
}
