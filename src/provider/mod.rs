//! Provider aggregate — the lifecycle state machine around one managed
//! MCP provider process.
//!
//! The aggregate owns the provider's identity and launch config, its health
//! tracker, its tool catalog, and (while READY) the live RPC client. All
//! mutation happens under one async lock; the lock is released around the
//! actual tool-call RPC so the multiplexing client can serve concurrent
//! callers, and re-acquired to record the outcome.
//!
//! Every state change goes through `transition_locked`, which validates the
//! edge against the lifecycle table, bumps the aggregate version, and emits
//! exactly one `ProviderStateChanged`.

pub mod catalog;
pub mod health;
pub mod state;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::ProviderSpec;
use crate::error::HangarError;
use crate::events::{EventBus, EventPayload};
use crate::launch::spawn_provider;
use crate::rpc::{RpcClient, MCP_PROTOCOL_VERSION};

pub use catalog::{ToolCatalog, ToolSchema};
pub use health::HealthTracker;
pub use state::ProviderState;

/// Timeout for the `initialize` and `tools/list` handshake calls.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for catalog refreshes and health-check probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct ProviderInner {
    state: ProviderState,
    version: u64,
    health: HealthTracker,
    catalog: ToolCatalog,
    client: Option<Arc<RpcClient>>,
    meta: serde_json::Map<String, Value>,
    last_used: Option<Instant>,
    last_used_unix: f64,
}

/// A managed provider: config plus the locked mutable lifecycle state.
pub struct Provider {
    id: String,
    spec: ProviderSpec,
    events: Arc<EventBus>,
    inner: Mutex<ProviderInner>,
}

impl Provider {
    pub fn new(id: impl Into<String>, spec: ProviderSpec, events: Arc<EventBus>) -> Self {
        let health = HealthTracker::new(spec.max_consecutive_failures);
        Provider {
            id: id.into(),
            spec,
            events,
            inner: Mutex::new(ProviderInner {
                state: ProviderState::Cold,
                version: 0,
                health,
                catalog: ToolCatalog::new(),
                client: None,
                meta: serde_json::Map::new(),
                last_used: None,
                last_used_unix: 0.0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> &'static str {
        self.spec.mode.as_str()
    }

    pub fn description(&self) -> Option<&str> {
        self.spec.description.as_deref()
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    pub async fn state(&self) -> ProviderState {
        self.inner.lock().await.state
    }

    pub async fn version(&self) -> u64 {
        self.inner.lock().await.version
    }

    /// Circuit-breaker probe used by the batch executor before any attempt.
    pub async fn should_degrade(&self) -> bool {
        self.inner.lock().await.health.should_degrade()
    }

    /// Ensure the provider is READY with a live client, starting it if
    /// necessary.
    ///
    /// A dead client discovered on the fast path moves the provider to DEAD
    /// and the restart proceeds within the same call. A degraded provider
    /// whose backoff has not elapsed fails with `CannotStartProvider`.
    pub async fn ensure_ready(&self) -> crate::Result<()> {
        let mut inner = self.inner.lock().await;
        self.ensure_ready_locked(&mut inner).await
    }

    async fn ensure_ready_locked(&self, inner: &mut ProviderInner) -> crate::Result<()> {
        if inner.state == ProviderState::Ready {
            match &inner.client {
                Some(client) if client.is_alive() => return Ok(()),
                _ => {
                    tracing::warn!(provider = %self.id, "client died while READY");
                    self.transition_locked(inner, ProviderState::Dead)?;
                    inner.client = None;
                }
            }
        }

        if inner.state == ProviderState::Degraded && !inner.health.can_retry() {
            return Err(HangarError::CannotStartProvider {
                provider: self.id.clone(),
                retry_in_s: inner.health.time_until_retry(),
            });
        }

        if matches!(
            inner.state,
            ProviderState::Cold | ProviderState::Dead | ProviderState::Degraded
        ) {
            self.start_locked(inner).await?;
        }
        Ok(())
    }

    /// Spawn the child and run the MCP handshake (must hold the lock).
    async fn start_locked(&self, inner: &mut ProviderInner) -> crate::Result<()> {
        let started = Instant::now();
        self.transition_locked(inner, ProviderState::Initializing)?;

        match self.handshake(inner).await {
            Ok(()) => {
                self.transition_locked(inner, ProviderState::Ready)?;
                inner.health.record_success();
                self.touch(inner);

                let startup_duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.events.publish(EventPayload::ProviderStarted {
                    provider_id: self.id.clone(),
                    mode: self.mode().to_string(),
                    tools_count: inner.catalog.count(),
                    startup_duration_ms,
                });
                tracing::info!(
                    provider = %self.id,
                    mode = %self.mode(),
                    tools = inner.catalog.count(),
                    cold_start_ms = %format!("{startup_duration_ms:.0}"),
                    "provider started"
                );
                Ok(())
            }
            Err(e) => {
                self.handle_start_failure_locked(inner, &e).await;
                Err(e)
            }
        }
    }

    /// Spawn + `initialize` + `tools/list`, installing the client on success.
    async fn handshake(&self, inner: &mut ProviderInner) -> crate::Result<()> {
        let client = Arc::new(spawn_provider(&self.id, &self.spec).await.map_err(
            |e| match e {
                HangarError::ProviderStart(_, _) => e,
                other => HangarError::ProviderStart(self.id.clone(), other.to_string()),
            },
        )?);
        // Installed immediately so a failure path can close it.
        inner.client = Some(client.clone());

        let init_resp = client
            .call(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "hangar", "version": env!("CARGO_PKG_VERSION")},
                }),
                HANDSHAKE_TIMEOUT,
            )
            .await
            .map_err(|e| self.start_error(&client, "init_failed", &e.to_string()))?;
        if let Some(message) = init_resp.error_message() {
            return Err(self.start_error(&client, "init_failed", &message));
        }

        let tools_resp = client
            .call("tools/list", json!({}), HANDSHAKE_TIMEOUT)
            .await
            .map_err(|e| self.start_error(&client, "tools_list_failed", &e.to_string()))?;
        if let Some(message) = tools_resp.error_message() {
            return Err(self.start_error(&client, "tools_list_failed", &message));
        }

        inner
            .catalog
            .update_from_list(&tools_resp.result.unwrap_or(Value::Null));

        inner.meta = serde_json::Map::new();
        inner.meta.insert(
            "init_result".to_string(),
            init_resp.result.unwrap_or(Value::Null),
        );
        inner
            .meta
            .insert("tools_count".to_string(), json!(inner.catalog.count()));
        inner
            .meta
            .insert("started_at".to_string(), json!(unix_now()));
        Ok(())
    }

    fn start_error(&self, client: &RpcClient, stage: &str, message: &str) -> HangarError {
        // The stderr tail is the only trace of why a child died mid-handshake.
        let stderr = client.stderr_tail(10);
        let detail = if stderr.is_empty() {
            format!("{stage}: {message}")
        } else {
            format!("{stage}: {message}; stderr: {stderr}")
        };
        HangarError::ProviderStart(self.id.clone(), detail)
    }

    /// Close the partial client and settle into DEGRADED or DEAD (must hold
    /// the lock).
    async fn handle_start_failure_locked(&self, inner: &mut ProviderInner, error: &HangarError) {
        if let Some(client) = inner.client.take() {
            client.close().await;
        }
        inner.health.record_failure();

        if inner.health.should_degrade() {
            if self
                .transition_locked(inner, ProviderState::Degraded)
                .is_ok()
            {
                tracing::warn!(
                    provider = %self.id,
                    failures = inner.health.consecutive_failures(),
                    "provider degraded"
                );
                self.events.publish(EventPayload::ProviderDegraded {
                    provider_id: self.id.clone(),
                    consecutive_failures: inner.health.consecutive_failures(),
                    total_failures: inner.health.total_failures(),
                    reason: error.to_string(),
                });
            }
        } else {
            let _ = self.transition_locked(inner, ProviderState::Dead);
        }

        tracing::error!(provider = %self.id, error = %error, "provider start failed");
    }

    /// Invoke a tool, ensuring readiness first.
    ///
    /// The catalog is refreshed at most once when the tool is unknown. A
    /// protocol-level `error` payload counts as an invocation failure and is
    /// surfaced as `ToolInvocation`; transport errors keep their own kinds
    /// and advance the circuit.
    pub async fn invoke_tool(
        &self,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> crate::Result<Value> {
        let correlation_id = Uuid::new_v4().to_string();

        let client = {
            let mut inner = self.inner.lock().await;
            self.ensure_ready_locked(&mut inner).await?;

            if !inner.catalog.has(tool_name) {
                self.refresh_tools_locked(&mut inner).await;
            }
            if !inner.catalog.has(tool_name) {
                return Err(HangarError::ToolNotFound {
                    provider: self.id.clone(),
                    tool: tool_name.to_string(),
                });
            }

            inner.health.record_invocation();
            self.events.publish(EventPayload::ToolInvocationRequested {
                provider_id: self.id.clone(),
                tool_name: tool_name.to_string(),
                correlation_id: correlation_id.clone(),
            });

            inner
                .client
                .clone()
                .ok_or_else(|| HangarError::ClientDead(self.id.clone(), "no client".to_string()))?
        };

        let started = Instant::now();
        let outcome = client
            .call(
                "tools/call",
                json!({"name": tool_name, "arguments": arguments}),
                timeout,
            )
            .await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut inner = self.inner.lock().await;
        match outcome {
            Ok(resp) => {
                if let Some(message) = resp.error_message() {
                    inner.health.record_invocation_failure();
                    let error_code = resp
                        .error
                        .as_ref()
                        .map(|e| e.code.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    self.events.publish(EventPayload::ToolInvocationFailed {
                        provider_id: self.id.clone(),
                        tool_name: tool_name.to_string(),
                        correlation_id,
                        error_message: message.clone(),
                        error_type: error_code,
                    });
                    return Err(HangarError::ToolInvocation(
                        self.id.clone(),
                        format!("tool_error: {message}"),
                    ));
                }

                inner.health.record_success();
                self.touch(&mut inner);
                let result = resp.result.unwrap_or(Value::Null);
                let result_size_bytes = result.to_string().len();
                self.events.publish(EventPayload::ToolInvocationCompleted {
                    provider_id: self.id.clone(),
                    tool_name: tool_name.to_string(),
                    correlation_id: correlation_id.clone(),
                    duration_ms,
                    result_size_bytes,
                });
                tracing::debug!(
                    provider = %self.id,
                    tool = %tool_name,
                    correlation_id = %correlation_id,
                    "tool invoked"
                );
                Ok(result)
            }
            Err(e) => {
                inner.health.record_failure();
                self.events.publish(EventPayload::ToolInvocationFailed {
                    provider_id: self.id.clone(),
                    tool_name: tool_name.to_string(),
                    correlation_id: correlation_id.clone(),
                    error_message: e.to_string(),
                    error_type: e.kind().to_string(),
                });
                tracing::error!(
                    provider = %self.id,
                    tool = %tool_name,
                    correlation_id = %correlation_id,
                    error = %e,
                    "tool invocation failed"
                );
                Err(e)
            }
        }
    }

    /// Refresh the catalog from `tools/list` (must hold the lock).
    async fn refresh_tools_locked(&self, inner: &mut ProviderInner) {
        let Some(client) = inner.client.clone() else {
            return;
        };
        if !client.is_alive() {
            return;
        }
        match client.call("tools/list", json!({}), PROBE_TIMEOUT).await {
            Ok(resp) if resp.error.is_none() => {
                inner
                    .catalog
                    .update_from_list(&resp.result.unwrap_or(Value::Null));
                inner.version += 1;
            }
            Ok(resp) => {
                tracing::warn!(
                    provider = %self.id,
                    error = %resp.error_message().unwrap_or_default(),
                    "tool refresh failed"
                );
            }
            Err(e) => {
                tracing::warn!(provider = %self.id, error = %e, "tool refresh failed");
            }
        }
    }

    /// Active health probe; only meaningful in READY. Returns true if
    /// healthy.
    pub async fn health_check(&self) -> bool {
        let client = {
            let mut inner = self.inner.lock().await;
            if inner.state != ProviderState::Ready {
                return false;
            }
            match &inner.client {
                Some(client) if client.is_alive() => client.clone(),
                _ => {
                    let _ = self.transition_locked(&mut inner, ProviderState::Dead);
                    inner.client = None;
                    return false;
                }
            }
        };

        let started = Instant::now();
        let outcome = client.call("tools/list", json!({}), PROBE_TIMEOUT).await;

        let mut inner = self.inner.lock().await;
        let failure = match outcome {
            Ok(resp) => resp.error_message(),
            Err(e) => Some(e.to_string()),
        };

        match failure {
            None => {
                inner.health.record_success();
                self.events.publish(EventPayload::HealthCheckPassed {
                    provider_id: self.id.clone(),
                    duration_ms: started.elapsed().as_secs_f64() * 1000.0,
                });
                true
            }
            Some(message) => {
                inner.health.record_failure();
                self.events.publish(EventPayload::HealthCheckFailed {
                    provider_id: self.id.clone(),
                    consecutive_failures: inner.health.consecutive_failures(),
                    error_message: message.clone(),
                });
                tracing::warn!(provider = %self.id, error = %message, "health check failed");

                if inner.health.should_degrade()
                    && inner.state == ProviderState::Ready
                    && self
                        .transition_locked(&mut inner, ProviderState::Degraded)
                        .is_ok()
                {
                    self.events.publish(EventPayload::ProviderDegraded {
                        provider_id: self.id.clone(),
                        consecutive_failures: inner.health.consecutive_failures(),
                        total_failures: inner.health.total_failures(),
                        reason: "health_check_failures".to_string(),
                    });
                }
                false
            }
        }
    }

    /// Shut down iff READY and idle past the TTL. Returns true when a
    /// shutdown was performed.
    pub async fn maybe_shutdown_idle(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != ProviderState::Ready {
            return false;
        }
        let Some(last_used) = inner.last_used else {
            return false;
        };
        let idle = last_used.elapsed();
        if idle.as_secs() <= self.spec.idle_ttl_s {
            return false;
        }

        self.events.publish(EventPayload::ProviderIdleDetected {
            provider_id: self.id.clone(),
            idle_duration_s: idle.as_secs_f64(),
            last_used_at: inner.last_used_unix,
        });
        tracing::info!(
            provider = %self.id,
            idle_s = %format!("{:.1}", idle.as_secs_f64()),
            "idle provider shutdown"
        );
        self.shutdown_locked(&mut inner, "idle").await;
        true
    }

    /// Explicit shutdown.
    pub async fn shutdown(&self, reason: &str) {
        let mut inner = self.inner.lock().await;
        self.shutdown_locked(&mut inner, reason).await;
    }

    async fn shutdown_locked(&self, inner: &mut ProviderInner, reason: &str) {
        if let Some(client) = inner.client.take() {
            client.close().await;
        }
        inner.catalog.clear();
        inner.meta.clear();

        // DEAD has no edge to COLD in the lifecycle table; a stopped dead
        // provider stays DEAD until the next restart attempt.
        if inner.state.can_transition_to(ProviderState::Cold) {
            let _ = self.transition_locked(inner, ProviderState::Cold);
        } else if inner.state != ProviderState::Cold {
            inner.version += 1;
        }

        self.events.publish(EventPayload::ProviderStopped {
            provider_id: self.id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Validated state transition (must hold the lock). Self-transitions are
    /// no-ops; every real transition bumps the version and emits exactly one
    /// `ProviderStateChanged`.
    fn transition_locked(&self, inner: &mut ProviderInner, to: ProviderState) -> crate::Result<()> {
        if inner.state == to {
            return Ok(());
        }
        state::check_transition(&self.id, inner.state, to)?;

        let old_state = inner.state;
        inner.state = to;
        inner.version += 1;
        self.events.publish(EventPayload::ProviderStateChanged {
            provider_id: self.id.clone(),
            old_state: old_state.as_str(),
            new_state: to.as_str(),
        });
        Ok(())
    }

    fn touch(&self, inner: &mut ProviderInner) {
        inner.last_used = Some(Instant::now());
        inner.last_used_unix = unix_now();
        inner.version += 1;
    }

    /// Cached tool names.
    pub async fn tool_names(&self) -> Vec<String> {
        self.inner.lock().await.catalog.names()
    }

    /// Cached tool schemas.
    pub async fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.inner.lock().await.catalog.schemas()
    }

    /// Status snapshot for list/details output.
    pub async fn status(&self) -> Value {
        let inner = self.inner.lock().await;
        let alive = inner
            .client
            .as_ref()
            .map(|c| c.is_alive())
            .unwrap_or(false);
        json!({
            "provider": self.id,
            "state": inner.state.as_str(),
            "alive": alive,
            "mode": self.mode(),
            "description": self.spec.description,
            "version": inner.version,
            "tools_cached": inner.catalog.names(),
            "health": inner.health.to_json(),
            "meta": Value::Object(inner.meta.clone()),
        })
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
