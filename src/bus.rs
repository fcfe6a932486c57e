//! Command and query buses — the in-process mediator between the tool
//! surface and the provider aggregates.
//!
//! Commands represent intent to change state; queries are side-effect-free
//! reads. Each variant has exactly one handler, registered under its tag in
//! a static registry; dispatching an unregistered variant fails with
//! `NoHandler`. Handlers block on provider operations and return plain JSON
//! so the surface can serialize them untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::error::HangarError;
use crate::provider::ProviderState;
use crate::registry::ProviderRegistry;

/// Intent to change system state. Imperative names: StartProvider, not
/// ProviderStarted.
#[derive(Debug, Clone)]
pub enum Command {
    StartProvider {
        provider_id: String,
    },
    StopProvider {
        provider_id: String,
        reason: String,
    },
    InvokeTool {
        provider_id: String,
        tool_name: String,
        arguments: Value,
        timeout: Duration,
    },
    HealthCheck {
        provider_id: String,
    },
    ShutdownIdleProviders,
}

/// Registry tag for a command variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    StartProvider,
    StopProvider,
    InvokeTool,
    HealthCheck,
    ShutdownIdleProviders,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::StartProvider { .. } => CommandKind::StartProvider,
            Command::StopProvider { .. } => CommandKind::StopProvider,
            Command::InvokeTool { .. } => CommandKind::InvokeTool,
            Command::HealthCheck { .. } => CommandKind::HealthCheck,
            Command::ShutdownIdleProviders => CommandKind::ShutdownIdleProviders,
        }
    }
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::StartProvider => "StartProvider",
            CommandKind::StopProvider => "StopProvider",
            CommandKind::InvokeTool => "InvokeTool",
            CommandKind::HealthCheck => "HealthCheck",
            CommandKind::ShutdownIdleProviders => "ShutdownIdleProviders",
        }
    }
}

/// Side-effect-free read of system state.
#[derive(Debug, Clone)]
pub enum Query {
    ListProviders { state_filter: Option<String> },
    GetProvider { provider_id: String },
    GetProviderTools { provider_id: String },
}

/// Registry tag for a query variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    ListProviders,
    GetProvider,
    GetProviderTools,
}

impl Query {
    pub fn kind(&self) -> QueryKind {
        match self {
            Query::ListProviders { .. } => QueryKind::ListProviders,
            Query::GetProvider { .. } => QueryKind::GetProvider,
            Query::GetProviderTools { .. } => QueryKind::GetProviderTools,
        }
    }
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::ListProviders => "ListProviders",
            QueryKind::GetProvider => "GetProvider",
            QueryKind::GetProviderTools => "GetProviderTools",
        }
    }
}

/// Handler for one command variant.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: Command) -> BoxFuture<'_, crate::Result<Value>>;
}

/// Handler for one query variant. Must be side-effect-free.
pub trait QueryHandler: Send + Sync {
    fn handle(&self, query: Query) -> BoxFuture<'_, crate::Result<Value>>;
}

/// Routes each command to the single handler registered for its tag.
#[derive(Default)]
pub struct CommandBus {
    handlers: Mutex<HashMap<CommandKind, Arc<dyn CommandHandler>>>,
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; at most one per command kind.
    pub fn register(&self, kind: CommandKind, handler: Arc<dyn CommandHandler>) -> crate::Result<()> {
        let mut handlers = self.handlers.lock().expect("command bus lock poisoned");
        if handlers.contains_key(&kind) {
            return Err(HangarError::InvalidConfig(
                kind.as_str().to_string(),
                "handler already registered".to_string(),
            ));
        }
        handlers.insert(kind, handler);
        tracing::debug!(command = kind.as_str(), "command handler registered");
        Ok(())
    }

    pub fn has_handler(&self, kind: CommandKind) -> bool {
        self.handlers
            .lock()
            .expect("command bus lock poisoned")
            .contains_key(&kind)
    }

    /// Dispatch a command to its handler.
    pub async fn send(&self, command: Command) -> crate::Result<Value> {
        let kind = command.kind();
        let handler = self
            .handlers
            .lock()
            .expect("command bus lock poisoned")
            .get(&kind)
            .cloned()
            .ok_or(HangarError::NoHandler(kind.as_str()))?;
        tracing::debug!(command = kind.as_str(), "dispatching command");
        handler.handle(command).await
    }
}

/// Routes each query to the single handler registered for its tag.
#[derive(Default)]
pub struct QueryBus {
    handlers: Mutex<HashMap<QueryKind, Arc<dyn QueryHandler>>>,
}

impl QueryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; at most one per query kind.
    pub fn register(&self, kind: QueryKind, handler: Arc<dyn QueryHandler>) -> crate::Result<()> {
        let mut handlers = self.handlers.lock().expect("query bus lock poisoned");
        if handlers.contains_key(&kind) {
            return Err(HangarError::InvalidConfig(
                kind.as_str().to_string(),
                "handler already registered".to_string(),
            ));
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    /// Dispatch a query to its handler.
    pub async fn execute(&self, query: Query) -> crate::Result<Value> {
        let kind = query.kind();
        let handler = self
            .handlers
            .lock()
            .expect("query bus lock poisoned")
            .get(&kind)
            .cloned()
            .ok_or(HangarError::NoHandler(kind.as_str()))?;
        handler.handle(query).await
    }
}

// ---------------------------------------------------------------------------
// Default handlers
// ---------------------------------------------------------------------------

struct StartProviderHandler {
    registry: Arc<ProviderRegistry>,
}

impl CommandHandler for StartProviderHandler {
    fn handle(&self, command: Command) -> BoxFuture<'_, crate::Result<Value>> {
        Box::pin(async move {
            let Command::StartProvider { provider_id } = command else {
                return Err(HangarError::NoHandler("StartProvider"));
            };
            let provider = require_provider(&self.registry, &provider_id).await?;
            provider.ensure_ready().await?;
            Ok(json!({
                "provider": provider_id,
                "state": provider.state().await.as_str(),
                "tools": provider.tool_names().await,
            }))
        })
    }
}

struct StopProviderHandler {
    registry: Arc<ProviderRegistry>,
}

impl CommandHandler for StopProviderHandler {
    fn handle(&self, command: Command) -> BoxFuture<'_, crate::Result<Value>> {
        Box::pin(async move {
            let Command::StopProvider {
                provider_id,
                reason,
            } = command
            else {
                return Err(HangarError::NoHandler("StopProvider"));
            };
            let provider = require_provider(&self.registry, &provider_id).await?;
            provider.shutdown(&reason).await;
            Ok(json!({
                "provider": provider_id,
                "stopped": true,
                "reason": reason,
            }))
        })
    }
}

struct InvokeToolHandler {
    registry: Arc<ProviderRegistry>,
}

impl CommandHandler for InvokeToolHandler {
    fn handle(&self, command: Command) -> BoxFuture<'_, crate::Result<Value>> {
        Box::pin(async move {
            let Command::InvokeTool {
                provider_id,
                tool_name,
                arguments,
                timeout,
            } = command
            else {
                return Err(HangarError::NoHandler("InvokeTool"));
            };
            let provider = require_provider(&self.registry, &provider_id).await?;
            provider.invoke_tool(&tool_name, arguments, timeout).await
        })
    }
}

struct HealthCheckHandler {
    registry: Arc<ProviderRegistry>,
}

impl CommandHandler for HealthCheckHandler {
    fn handle(&self, command: Command) -> BoxFuture<'_, crate::Result<Value>> {
        Box::pin(async move {
            let Command::HealthCheck { provider_id } = command else {
                return Err(HangarError::NoHandler("HealthCheck"));
            };
            let provider = require_provider(&self.registry, &provider_id).await?;
            let healthy = provider.health_check().await;
            Ok(json!({"provider": provider_id, "healthy": healthy}))
        })
    }
}

struct ShutdownIdleProvidersHandler {
    registry: Arc<ProviderRegistry>,
}

impl CommandHandler for ShutdownIdleProvidersHandler {
    fn handle(&self, command: Command) -> BoxFuture<'_, crate::Result<Value>> {
        Box::pin(async move {
            let Command::ShutdownIdleProviders = command else {
                return Err(HangarError::NoHandler("ShutdownIdleProviders"));
            };
            let mut stopped = Vec::new();
            for provider in self.registry.get_all().await {
                if provider.maybe_shutdown_idle().await {
                    stopped.push(provider.id().to_string());
                }
            }
            Ok(json!({"shutdown": stopped}))
        })
    }
}

struct ListProvidersHandler {
    registry: Arc<ProviderRegistry>,
}

impl QueryHandler for ListProvidersHandler {
    fn handle(&self, query: Query) -> BoxFuture<'_, crate::Result<Value>> {
        Box::pin(async move {
            let Query::ListProviders { state_filter } = query else {
                return Err(HangarError::NoHandler("ListProviders"));
            };
            let filter = match state_filter.as_deref() {
                None => None,
                Some(s) => Some(ProviderState::parse(s).ok_or_else(|| {
                    HangarError::Validation {
                        field: "state_filter".to_string(),
                        message: format!("unknown state '{s}'"),
                    }
                })?),
            };

            let mut providers = Vec::new();
            for provider in self.registry.get_all().await {
                if let Some(filter) = filter {
                    if provider.state().await != filter {
                        continue;
                    }
                }
                providers.push(provider.status().await);
            }
            Ok(json!({"providers": providers}))
        })
    }
}

struct GetProviderHandler {
    registry: Arc<ProviderRegistry>,
}

impl QueryHandler for GetProviderHandler {
    fn handle(&self, query: Query) -> BoxFuture<'_, crate::Result<Value>> {
        Box::pin(async move {
            let Query::GetProvider { provider_id } = query else {
                return Err(HangarError::NoHandler("GetProvider"));
            };
            let provider = require_provider(&self.registry, &provider_id).await?;
            Ok(provider.status().await)
        })
    }
}

struct GetProviderToolsHandler {
    registry: Arc<ProviderRegistry>,
}

impl QueryHandler for GetProviderToolsHandler {
    fn handle(&self, query: Query) -> BoxFuture<'_, crate::Result<Value>> {
        Box::pin(async move {
            let Query::GetProviderTools { provider_id } = query else {
                return Err(HangarError::NoHandler("GetProviderTools"));
            };
            let provider = require_provider(&self.registry, &provider_id).await?;
            let tools: Vec<Value> = provider
                .tool_schemas()
                .await
                .into_iter()
                .map(|schema| serde_json::to_value(schema).unwrap_or(Value::Null))
                .collect();
            Ok(json!({"provider": provider_id, "tools": tools}))
        })
    }
}

async fn require_provider(
    registry: &ProviderRegistry,
    provider_id: &str,
) -> crate::Result<Arc<crate::provider::Provider>> {
    registry
        .get(provider_id)
        .await
        .ok_or_else(|| HangarError::ProviderNotFound(provider_id.to_string()))
}

/// Register the default handler set on both buses.
pub fn register_default_handlers(
    command_bus: &CommandBus,
    query_bus: &QueryBus,
    registry: Arc<ProviderRegistry>,
) -> crate::Result<()> {
    command_bus.register(
        CommandKind::StartProvider,
        Arc::new(StartProviderHandler {
            registry: registry.clone(),
        }),
    )?;
    command_bus.register(
        CommandKind::StopProvider,
        Arc::new(StopProviderHandler {
            registry: registry.clone(),
        }),
    )?;
    command_bus.register(
        CommandKind::InvokeTool,
        Arc::new(InvokeToolHandler {
            registry: registry.clone(),
        }),
    )?;
    command_bus.register(
        CommandKind::HealthCheck,
        Arc::new(HealthCheckHandler {
            registry: registry.clone(),
        }),
    )?;
    command_bus.register(
        CommandKind::ShutdownIdleProviders,
        Arc::new(ShutdownIdleProvidersHandler {
            registry: registry.clone(),
        }),
    )?;

    query_bus.register(
        QueryKind::ListProviders,
        Arc::new(ListProvidersHandler {
            registry: registry.clone(),
        }),
    )?;
    query_bus.register(
        QueryKind::GetProvider,
        Arc::new(GetProviderHandler {
            registry: registry.clone(),
        }),
    )?;
    query_bus.register(
        QueryKind::GetProviderTools,
        Arc::new(GetProviderToolsHandler { registry }),
    )?;

    tracing::info!("command and query handlers registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::provider::Provider;
    use crate::test_util::echo_provider_spec;

    async fn wired_buses() -> (CommandBus, QueryBus, Arc<ProviderRegistry>) {
        let registry = Arc::new(ProviderRegistry::new());
        registry
            .add(Arc::new(Provider::new(
                "math",
                echo_provider_spec(),
                Arc::new(EventBus::new()),
            )))
            .await
            .expect("add");
        let command_bus = CommandBus::new();
        let query_bus = QueryBus::new();
        register_default_handlers(&command_bus, &query_bus, registry.clone()).expect("register");
        (command_bus, query_bus, registry)
    }

    #[tokio::test]
    async fn test_unregistered_command_fails_with_no_handler() {
        let bus = CommandBus::new();
        let err = bus
            .send(Command::StartProvider {
                provider_id: "x".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HangarError::NoHandler("StartProvider")));
    }

    #[tokio::test]
    async fn test_double_registration_rejected() {
        let (command_bus, _query_bus, registry) = wired_buses().await;
        let err = command_bus
            .register(
                CommandKind::StartProvider,
                Arc::new(StartProviderHandler { registry }),
            )
            .unwrap_err();
        assert!(matches!(err, HangarError::InvalidConfig(_, _)));
    }

    #[tokio::test]
    async fn test_start_then_invoke_then_stop() {
        let (command_bus, _query_bus, _registry) = wired_buses().await;

        let started = command_bus
            .send(Command::StartProvider {
                provider_id: "math".to_string(),
            })
            .await
            .expect("start");
        assert_eq!(started["state"], "ready");

        let result = command_bus
            .send(Command::InvokeTool {
                provider_id: "math".to_string(),
                tool_name: "echo".to_string(),
                arguments: json!({"a": 1}),
                timeout: Duration::from_secs(5),
            })
            .await
            .expect("invoke");
        assert!(result.get("tools").is_some());

        let stopped = command_bus
            .send(Command::StopProvider {
                provider_id: "math".to_string(),
                reason: "user_request".to_string(),
            })
            .await
            .expect("stop");
        assert_eq!(stopped["stopped"], true);
    }

    #[tokio::test]
    async fn test_unknown_provider_surfaces_not_found() {
        let (command_bus, query_bus, _registry) = wired_buses().await;
        let err = command_bus
            .send(Command::StartProvider {
                provider_id: "ghost".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HangarError::ProviderNotFound(id) if id == "ghost"));

        let err = query_bus
            .execute(Query::GetProvider {
                provider_id: "ghost".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HangarError::ProviderNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_providers_with_state_filter() {
        let (command_bus, query_bus, _registry) = wired_buses().await;

        let all = query_bus
            .execute(Query::ListProviders { state_filter: None })
            .await
            .expect("list");
        assert_eq!(all["providers"].as_array().unwrap().len(), 1);
        assert_eq!(all["providers"][0]["state"], "cold");

        let ready = query_bus
            .execute(Query::ListProviders {
                state_filter: Some("ready".to_string()),
            })
            .await
            .expect("list ready");
        assert!(ready["providers"].as_array().unwrap().is_empty());

        command_bus
            .send(Command::StartProvider {
                provider_id: "math".to_string(),
            })
            .await
            .expect("start");
        let ready = query_bus
            .execute(Query::ListProviders {
                state_filter: Some("ready".to_string()),
            })
            .await
            .expect("list ready");
        assert_eq!(ready["providers"].as_array().unwrap().len(), 1);

        let err = query_bus
            .execute(Query::ListProviders {
                state_filter: Some("warm".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HangarError::Validation { .. }));

        command_bus
            .send(Command::StopProvider {
                provider_id: "math".to_string(),
                reason: "test".to_string(),
            })
            .await
            .expect("stop");
    }

    #[tokio::test]
    async fn test_get_provider_tools_after_start() {
        let (command_bus, query_bus, _registry) = wired_buses().await;
        command_bus
            .send(Command::StartProvider {
                provider_id: "math".to_string(),
            })
            .await
            .expect("start");

        let tools = query_bus
            .execute(Query::GetProviderTools {
                provider_id: "math".to_string(),
            })
            .await
            .expect("tools");
        let list = tools["tools"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "echo");

        command_bus
            .send(Command::StopProvider {
                provider_id: "math".to_string(),
                reason: "test".to_string(),
            })
            .await
            .expect("stop");
    }

    #[tokio::test]
    async fn test_shutdown_idle_providers_command() {
        let (command_bus, _query_bus, _registry) = wired_buses().await;
        let result = command_bus
            .send(Command::ShutdownIdleProviders)
            .await
            .expect("gc");
        assert!(result["shutdown"].as_array().unwrap().is_empty());
    }
}
