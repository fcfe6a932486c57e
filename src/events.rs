//! Domain events and the in-process event bus.
//!
//! Aggregates publish an event for every externally visible state change;
//! subscribers (logging, metrics, audit, alerts) observe them without the
//! domain depending on any of them. Delivery is synchronous and in
//! registration order, so events published by one aggregate arrive in the
//! order they were emitted. A failing subscriber is logged and skipped —
//! it never aborts delivery to the others.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

/// Discriminant for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ProviderStarted,
    ProviderStopped,
    ProviderStateChanged,
    ProviderDegraded,
    ProviderIdleDetected,
    HealthCheckPassed,
    HealthCheckFailed,
    ToolInvocationRequested,
    ToolInvocationCompleted,
    ToolInvocationFailed,
    BatchInvocationRequested,
    BatchInvocationCompleted,
    BatchCallCompleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ProviderStarted => "provider_started",
            EventKind::ProviderStopped => "provider_stopped",
            EventKind::ProviderStateChanged => "provider_state_changed",
            EventKind::ProviderDegraded => "provider_degraded",
            EventKind::ProviderIdleDetected => "provider_idle_detected",
            EventKind::HealthCheckPassed => "health_check_passed",
            EventKind::HealthCheckFailed => "health_check_failed",
            EventKind::ToolInvocationRequested => "tool_invocation_requested",
            EventKind::ToolInvocationCompleted => "tool_invocation_completed",
            EventKind::ToolInvocationFailed => "tool_invocation_failed",
            EventKind::BatchInvocationRequested => "batch_invocation_requested",
            EventKind::BatchInvocationCompleted => "batch_invocation_completed",
            EventKind::BatchCallCompleted => "batch_call_completed",
        }
    }
}

/// Event payloads. Every variant carries its provider id or batch id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    ProviderStarted {
        provider_id: String,
        mode: String,
        tools_count: usize,
        startup_duration_ms: f64,
    },
    ProviderStopped {
        provider_id: String,
        reason: String,
    },
    ProviderStateChanged {
        provider_id: String,
        old_state: &'static str,
        new_state: &'static str,
    },
    ProviderDegraded {
        provider_id: String,
        consecutive_failures: u32,
        total_failures: u64,
        reason: String,
    },
    ProviderIdleDetected {
        provider_id: String,
        idle_duration_s: f64,
        last_used_at: f64,
    },
    HealthCheckPassed {
        provider_id: String,
        duration_ms: f64,
    },
    HealthCheckFailed {
        provider_id: String,
        consecutive_failures: u32,
        error_message: String,
    },
    ToolInvocationRequested {
        provider_id: String,
        tool_name: String,
        correlation_id: String,
    },
    ToolInvocationCompleted {
        provider_id: String,
        tool_name: String,
        correlation_id: String,
        duration_ms: f64,
        result_size_bytes: usize,
    },
    ToolInvocationFailed {
        provider_id: String,
        tool_name: String,
        correlation_id: String,
        error_message: String,
        error_type: String,
    },
    BatchInvocationRequested {
        batch_id: String,
        call_count: usize,
        providers: Vec<String>,
        max_concurrency: usize,
        timeout_s: f64,
        fail_fast: bool,
    },
    BatchInvocationCompleted {
        batch_id: String,
        total: usize,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
        elapsed_ms: f64,
    },
    BatchCallCompleted {
        batch_id: String,
        call_id: String,
        call_index: usize,
        provider_id: String,
        tool_name: String,
        success: bool,
        elapsed_ms: f64,
        error_type: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::ProviderStarted { .. } => EventKind::ProviderStarted,
            EventPayload::ProviderStopped { .. } => EventKind::ProviderStopped,
            EventPayload::ProviderStateChanged { .. } => EventKind::ProviderStateChanged,
            EventPayload::ProviderDegraded { .. } => EventKind::ProviderDegraded,
            EventPayload::ProviderIdleDetected { .. } => EventKind::ProviderIdleDetected,
            EventPayload::HealthCheckPassed { .. } => EventKind::HealthCheckPassed,
            EventPayload::HealthCheckFailed { .. } => EventKind::HealthCheckFailed,
            EventPayload::ToolInvocationRequested { .. } => EventKind::ToolInvocationRequested,
            EventPayload::ToolInvocationCompleted { .. } => EventKind::ToolInvocationCompleted,
            EventPayload::ToolInvocationFailed { .. } => EventKind::ToolInvocationFailed,
            EventPayload::BatchInvocationRequested { .. } => EventKind::BatchInvocationRequested,
            EventPayload::BatchInvocationCompleted { .. } => EventKind::BatchInvocationCompleted,
            EventPayload::BatchCallCompleted { .. } => EventKind::BatchCallCompleted,
        }
    }

    /// The id this event is about — provider id, or batch id for batch events.
    pub fn subject(&self) -> &str {
        match self {
            EventPayload::ProviderStarted { provider_id, .. }
            | EventPayload::ProviderStopped { provider_id, .. }
            | EventPayload::ProviderStateChanged { provider_id, .. }
            | EventPayload::ProviderDegraded { provider_id, .. }
            | EventPayload::ProviderIdleDetected { provider_id, .. }
            | EventPayload::HealthCheckPassed { provider_id, .. }
            | EventPayload::HealthCheckFailed { provider_id, .. }
            | EventPayload::ToolInvocationRequested { provider_id, .. }
            | EventPayload::ToolInvocationCompleted { provider_id, .. }
            | EventPayload::ToolInvocationFailed { provider_id, .. }
            | EventPayload::BatchCallCompleted { provider_id, .. } => provider_id,
            EventPayload::BatchInvocationRequested { batch_id, .. }
            | EventPayload::BatchInvocationCompleted { batch_id, .. } => batch_id,
        }
    }
}

/// A published domain event with its emission timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct DomainEvent {
    pub occurred_at: f64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl DomainEvent {
    pub fn new(payload: EventPayload) -> Self {
        let occurred_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        DomainEvent {
            occurred_at,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Handler for published events.
///
/// A returned error is logged by the bus; it does not stop delivery.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DomainEvent) -> crate::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&DomainEvent) -> crate::Result<()> + Send + Sync,
{
    fn handle(&self, event: &DomainEvent) -> crate::Result<()> {
        self(event)
    }
}

struct Subscription {
    filter: Option<EventKind>,
    handler: Arc<dyn EventHandler>,
}

/// Publish/subscribe bus for domain events.
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single event kind.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .push(Subscription {
                filter: Some(kind),
                handler,
            });
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        self.subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .push(Subscription {
                filter: None,
                handler,
            });
    }

    /// Publish fire-and-forget: deliver to matching subscribers in
    /// registration order.
    pub fn publish(&self, payload: EventPayload) {
        let event = DomainEvent::new(payload);
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscriptions = self.subscriptions.lock().expect("event bus lock poisoned");
            subscriptions
                .iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(event.kind()))
                .map(|s| s.handler.clone())
                .collect()
        };

        for handler in handlers {
            if let Err(e) = handler.handle(&event) {
                tracing::warn!(
                    event = event.kind().as_str(),
                    error = %e,
                    "event handler failed; continuing delivery"
                );
            }
        }
    }

    /// Number of registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .lock()
            .expect("event bus lock poisoned")
            .len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Collects every delivered event for assertions.
    pub struct CollectingHandler {
        pub events: Mutex<Vec<DomainEvent>>,
    }

    impl CollectingHandler {
        pub fn new() -> Arc<Self> {
            Arc::new(CollectingHandler {
                events: Mutex::new(Vec::new()),
            })
        }

        pub fn kinds(&self) -> Vec<EventKind> {
            self.events
                .lock()
                .expect("collector lock")
                .iter()
                .map(|e| e.kind())
                .collect()
        }
    }

    impl EventHandler for CollectingHandler {
        fn handle(&self, event: &DomainEvent) -> crate::Result<()> {
            self.events.lock().expect("collector lock").push(event.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CollectingHandler;
    use super::*;
    use crate::error::HangarError;

    fn stopped(provider: &str) -> EventPayload {
        EventPayload::ProviderStopped {
            provider_id: provider.to_string(),
            reason: "test".to_string(),
        }
    }

    #[test]
    fn test_subscribe_all_receives_every_kind() {
        let bus = EventBus::new();
        let collector = CollectingHandler::new();
        bus.subscribe_all(collector.clone());

        bus.publish(stopped("a"));
        bus.publish(EventPayload::HealthCheckPassed {
            provider_id: "a".to_string(),
            duration_ms: 1.0,
        });

        assert_eq!(
            collector.kinds(),
            vec![EventKind::ProviderStopped, EventKind::HealthCheckPassed]
        );
    }

    #[test]
    fn test_subscribe_filters_by_kind() {
        let bus = EventBus::new();
        let collector = CollectingHandler::new();
        bus.subscribe(EventKind::ProviderStopped, collector.clone());

        bus.publish(stopped("a"));
        bus.publish(EventPayload::HealthCheckPassed {
            provider_id: "a".to_string(),
            duration_ms: 1.0,
        });

        assert_eq!(collector.kinds(), vec![EventKind::ProviderStopped]);
    }

    #[test]
    fn test_failing_handler_does_not_abort_delivery() {
        let bus = EventBus::new();
        bus.subscribe_all(Arc::new(|_: &DomainEvent| -> crate::Result<()> {
            Err(HangarError::Transport("x".into(), "boom".into()))
        }));
        let collector = CollectingHandler::new();
        bus.subscribe_all(collector.clone());

        bus.publish(stopped("a"));

        assert_eq!(collector.kinds(), vec![EventKind::ProviderStopped]);
    }

    #[test]
    fn test_delivery_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe_all(Arc::new(move |_: &DomainEvent| -> crate::Result<()> {
                order.lock().expect("order lock").push(tag);
                Ok(())
            }));
        }

        bus.publish(stopped("a"));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_event_carries_subject_and_timestamp() {
        let event = DomainEvent::new(stopped("math"));
        assert_eq!(event.payload.subject(), "math");
        assert!(event.occurred_at > 0.0);
        let json = event.to_json();
        assert_eq!(json["event"], "provider_stopped");
        assert_eq!(json["provider_id"], "math");
    }
}
