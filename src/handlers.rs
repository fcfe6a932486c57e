//! Event subscribers: logging, metrics, audit, alerting.
//!
//! These bridge domain events to observability without the domain knowing
//! about any of them. Subscribers must stay cheap — they run inline on the
//! publisher's path.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::events::{DomainEvent, EventHandler, EventPayload};

/// Logs every domain event as a structured tracing record.
pub struct LoggingEventHandler;

impl EventHandler for LoggingEventHandler {
    fn handle(&self, event: &DomainEvent) -> crate::Result<()> {
        tracing::info!(
            event = event.kind().as_str(),
            subject = event.payload.subject(),
            payload = %event.to_json(),
            "domain event"
        );
        Ok(())
    }
}

/// Per-provider counters derived from the event stream.
#[derive(Debug, Default, Clone)]
pub struct ProviderMetrics {
    pub total_invocations: u64,
    pub successful_invocations: u64,
    pub failed_invocations: u64,
    pub total_duration_ms: f64,
    pub health_checks_passed: u64,
    pub health_checks_failed: u64,
    pub degradation_count: u64,
    pub cold_starts: u64,
    pub cold_start_total_ms: f64,
}

impl ProviderMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_invocations == 0 {
            return 100.0;
        }
        self.successful_invocations as f64 / self.total_invocations as f64 * 100.0
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.successful_invocations == 0 {
            return 0.0;
        }
        self.total_duration_ms / self.successful_invocations as f64
    }
}

/// Collects per-provider metrics from domain events.
#[derive(Default)]
pub struct MetricsEventHandler {
    metrics: Mutex<HashMap<String, ProviderMetrics>>,
}

impl MetricsEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, provider_id: &str) -> Option<ProviderMetrics> {
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .get(provider_id)
            .cloned()
    }

    /// Metrics for every provider seen so far, as JSON for the health
    /// surface.
    pub fn to_json(&self) -> Value {
        let metrics = self.metrics.lock().expect("metrics lock poisoned");
        let providers: HashMap<&str, Value> = metrics
            .iter()
            .map(|(id, m)| {
                (
                    id.as_str(),
                    json!({
                        "total_invocations": m.total_invocations,
                        "success_rate": m.success_rate(),
                        "average_latency_ms": m.average_latency_ms(),
                        "health_checks_passed": m.health_checks_passed,
                        "health_checks_failed": m.health_checks_failed,
                        "degradation_count": m.degradation_count,
                        "cold_starts": m.cold_starts,
                    }),
                )
            })
            .collect();
        json!(providers)
    }
}

impl EventHandler for MetricsEventHandler {
    fn handle(&self, event: &DomainEvent) -> crate::Result<()> {
        let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
        match &event.payload {
            EventPayload::ProviderStarted {
                provider_id,
                startup_duration_ms,
                ..
            } => {
                let entry = metrics.entry(provider_id.clone()).or_default();
                entry.cold_starts += 1;
                entry.cold_start_total_ms += startup_duration_ms;
            }
            EventPayload::ToolInvocationRequested { provider_id, .. } => {
                metrics.entry(provider_id.clone()).or_default().total_invocations += 1;
            }
            EventPayload::ToolInvocationCompleted {
                provider_id,
                duration_ms,
                ..
            } => {
                let entry = metrics.entry(provider_id.clone()).or_default();
                entry.successful_invocations += 1;
                entry.total_duration_ms += duration_ms;
            }
            EventPayload::ToolInvocationFailed { provider_id, .. } => {
                metrics.entry(provider_id.clone()).or_default().failed_invocations += 1;
            }
            EventPayload::HealthCheckPassed { provider_id, .. } => {
                metrics.entry(provider_id.clone()).or_default().health_checks_passed += 1;
            }
            EventPayload::HealthCheckFailed { provider_id, .. } => {
                metrics.entry(provider_id.clone()).or_default().health_checks_failed += 1;
            }
            EventPayload::ProviderDegraded { provider_id, .. } => {
                metrics.entry(provider_id.clone()).or_default().degradation_count += 1;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Size-bounded in-memory record of recent events.
///
/// Persistence of the audit trail is a concern for an external subscriber;
/// this buffer backs the diagnostic surface only.
pub struct AuditEventHandler {
    capacity: usize,
    records: Mutex<VecDeque<Value>>,
}

impl AuditEventHandler {
    pub fn new(capacity: usize) -> Self {
        AuditEventHandler {
            capacity,
            records: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent events, oldest first.
    pub fn recent(&self, max: usize) -> Vec<Value> {
        let records = self.records.lock().expect("audit lock poisoned");
        records.iter().rev().take(max).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventHandler for AuditEventHandler {
    fn handle(&self, event: &DomainEvent) -> crate::Result<()> {
        let mut records = self.records.lock().expect("audit lock poisoned");
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(event.to_json());
        Ok(())
    }
}

/// Raises log-level alerts for events an operator should see immediately.
pub struct AlertEventHandler;

impl EventHandler for AlertEventHandler {
    fn handle(&self, event: &DomainEvent) -> crate::Result<()> {
        match &event.payload {
            EventPayload::ProviderDegraded {
                provider_id,
                consecutive_failures,
                reason,
                ..
            } => {
                tracing::warn!(
                    provider = %provider_id,
                    consecutive_failures,
                    reason = %reason,
                    "ALERT: provider degraded"
                );
            }
            EventPayload::ProviderStateChanged {
                provider_id,
                new_state,
                ..
            } if *new_state == "dead" => {
                tracing::warn!(provider = %provider_id, "ALERT: provider dead");
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, EventKind};
    use std::sync::Arc;

    fn completed(provider: &str, duration_ms: f64) -> EventPayload {
        EventPayload::ToolInvocationCompleted {
            provider_id: provider.to_string(),
            tool_name: "t".to_string(),
            correlation_id: "c".to_string(),
            duration_ms,
            result_size_bytes: 10,
        }
    }

    fn requested(provider: &str) -> EventPayload {
        EventPayload::ToolInvocationRequested {
            provider_id: provider.to_string(),
            tool_name: "t".to_string(),
            correlation_id: "c".to_string(),
        }
    }

    #[test]
    fn test_metrics_tracks_invocations_and_latency() {
        let handler = Arc::new(MetricsEventHandler::new());
        let bus = EventBus::new();
        bus.subscribe_all(handler.clone());

        bus.publish(requested("math"));
        bus.publish(completed("math", 10.0));
        bus.publish(requested("math"));
        bus.publish(completed("math", 30.0));
        bus.publish(requested("math"));
        bus.publish(EventPayload::ToolInvocationFailed {
            provider_id: "math".to_string(),
            tool_name: "t".to_string(),
            correlation_id: "c".to_string(),
            error_message: "boom".to_string(),
            error_type: "ToolInvocationError".to_string(),
        });

        let metrics = handler.snapshot("math").expect("metrics exist");
        assert_eq!(metrics.total_invocations, 3);
        assert_eq!(metrics.successful_invocations, 2);
        assert_eq!(metrics.failed_invocations, 1);
        assert!((metrics.average_latency_ms() - 20.0).abs() < 0.001);
        assert!((metrics.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn test_metrics_counts_degradations_and_health_checks() {
        let handler = MetricsEventHandler::new();
        let event = DomainEvent::new(EventPayload::ProviderDegraded {
            provider_id: "p".to_string(),
            consecutive_failures: 3,
            total_failures: 5,
            reason: "r".to_string(),
        });
        handler.handle(&event).unwrap();
        handler
            .handle(&DomainEvent::new(EventPayload::HealthCheckFailed {
                provider_id: "p".to_string(),
                consecutive_failures: 1,
                error_message: "e".to_string(),
            }))
            .unwrap();

        let metrics = handler.snapshot("p").unwrap();
        assert_eq!(metrics.degradation_count, 1);
        assert_eq!(metrics.health_checks_failed, 1);
        assert_eq!(metrics.success_rate(), 100.0, "no invocations yet");
    }

    #[test]
    fn test_audit_ring_buffer_bounded() {
        let handler = AuditEventHandler::new(3);
        for i in 0..5 {
            handler
                .handle(&DomainEvent::new(EventPayload::ProviderStopped {
                    provider_id: format!("p{i}"),
                    reason: "test".to_string(),
                }))
                .unwrap();
        }
        assert_eq!(handler.len(), 3);
        let recent = handler.recent(10);
        assert_eq!(recent[0]["provider_id"], "p2");
        assert_eq!(recent[2]["provider_id"], "p4");
    }

    #[test]
    fn test_alert_handler_never_fails() {
        let handler = AlertEventHandler;
        let event = DomainEvent::new(EventPayload::ProviderStateChanged {
            provider_id: "p".to_string(),
            old_state: "ready",
            new_state: "dead",
        });
        assert!(handler.handle(&event).is_ok());
        assert_eq!(event.kind(), EventKind::ProviderStateChanged);
    }
}
