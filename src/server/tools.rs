//! The hangar_* gateway tools: thin dispatchers onto the command/query
//! buses and the batch executor.
//!
//! Every tool applies rate limiting and input validation first, and every
//! failure maps to the stable envelope `{error, type, details}` so clients
//! never see a raw error chain.

use std::time::Duration;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::batch::{
    validate_batch, BatchOptions, CallRequest, CallSpec, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_TIMEOUT_S, MAX_ATTEMPTS_LIMIT, MAX_CONCURRENCY_LIMIT, MAX_TIMEOUT_S,
};
use crate::bus::{Command, Query};
use crate::context::AppContext;
use crate::error::HangarError;
use crate::guard;

/// Map any error to the stable tool payload.
pub fn error_envelope(error: &HangarError) -> Value {
    json!({
        "error": error.to_string(),
        "type": error.kind(),
        "details": {},
    })
}

fn field_str<'a>(arguments: &'a Value, field: &str) -> crate::Result<&'a str> {
    arguments
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| HangarError::Validation {
            field: field.to_string(),
            message: "required string field".to_string(),
        })
}

/// Tool definitions advertised through `tools/list`.
pub fn tool_definitions() -> Vec<Value> {
    let provider_arg = json!({
        "type": "object",
        "properties": {"provider": {"type": "string", "description": "Provider id"}},
        "required": ["provider"],
    });

    vec![
        json!({
            "name": "hangar_list",
            "description": "List all providers with state, health, and cached tools. Optional state filter: cold, initializing, ready, degraded, dead.",
            "inputSchema": {
                "type": "object",
                "properties": {"state": {"type": "string"}},
            },
        }),
        json!({
            "name": "hangar_start",
            "description": "Explicitly start a provider and discover its tools.",
            "inputSchema": provider_arg,
        }),
        json!({
            "name": "hangar_stop",
            "description": "Explicitly stop a provider.",
            "inputSchema": provider_arg,
        }),
        json!({
            "name": "hangar_tools",
            "description": "Get detailed tool schemas for a provider, starting it if needed.",
            "inputSchema": provider_arg,
        }),
        json!({
            "name": "hangar_details",
            "description": "Get full status details for one provider.",
            "inputSchema": provider_arg,
        }),
        json!({
            "name": "hangar_warm",
            "description": "Pre-warm providers without invoking any tool.",
            "inputSchema": {
                "type": "object",
                "properties": {"providers": {"type": "array", "items": {"type": "string"}}},
                "required": ["providers"],
            },
        }),
        json!({
            "name": "hangar_call",
            "description": "Invoke tools on providers, single or batch, in parallel. The main entry point.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "calls": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "provider": {"type": "string"},
                                "tool": {"type": "string"},
                                "arguments": {"type": "object"},
                                "timeout": {"type": "number"},
                            },
                            "required": ["provider", "tool"],
                        },
                    },
                    "max_concurrency": {"type": "integer", "minimum": 1, "maximum": 20, "default": 10},
                    "timeout": {"type": "number", "minimum": 1, "maximum": 300, "default": 60},
                    "fail_fast": {"type": "boolean", "default": false},
                    "max_attempts": {"type": "integer", "minimum": 1, "maximum": 10, "default": 1},
                },
                "required": ["calls"],
            },
        }),
        json!({
            "name": "hangar_fetch_continuation",
            "description": "Fetch full or remaining content from a truncated batch response.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "continuation_id": {"type": "string"},
                    "offset": {"type": "integer", "minimum": 0, "default": 0},
                    "limit": {"type": "integer", "minimum": 1, "default": 500000},
                },
                "required": ["continuation_id"],
            },
        }),
        json!({
            "name": "hangar_delete_continuation",
            "description": "Delete a cached continuation to free resources.",
            "inputSchema": {
                "type": "object",
                "properties": {"continuation_id": {"type": "string"}},
                "required": ["continuation_id"],
            },
        }),
        json!({
            "name": "hangar_health",
            "description": "Registry-wide health: provider counts by state, rate limiting, concurrency.",
            "inputSchema": {"type": "object", "properties": {}},
        }),
    ]
}

/// Dispatch one gateway tool call. Always returns a JSON value; failures
/// come back as the error envelope.
pub async fn dispatch_tool(ctx: &AppContext, name: &str, arguments: &Value) -> Value {
    let outcome = match name {
        "hangar_list" => hangar_list(ctx, arguments).await,
        "hangar_start" => hangar_start(ctx, arguments).await,
        "hangar_stop" => hangar_stop(ctx, arguments).await,
        "hangar_tools" => hangar_tools(ctx, arguments).await,
        "hangar_details" => hangar_details(ctx, arguments).await,
        "hangar_warm" => hangar_warm(ctx, arguments).await,
        "hangar_call" => return hangar_call(ctx, arguments).await,
        "hangar_fetch_continuation" => hangar_fetch_continuation(ctx, arguments),
        "hangar_delete_continuation" => hangar_delete_continuation(ctx, arguments),
        "hangar_health" => hangar_health(ctx).await,
        _ => Err(HangarError::Validation {
            field: "tool".to_string(),
            message: format!("unknown tool '{name}'"),
        }),
    };

    match outcome {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(tool = %name, error = %e, error_type = e.kind(), "gateway tool failed");
            error_envelope(&e)
        }
    }
}

async fn hangar_list(ctx: &AppContext, arguments: &Value) -> crate::Result<Value> {
    ctx.rate_limiter.check("hangar_list")?;
    let state_filter = arguments
        .get("state")
        .and_then(Value::as_str)
        .map(str::to_string);
    ctx.query_bus
        .execute(Query::ListProviders { state_filter })
        .await
}

async fn hangar_start(ctx: &AppContext, arguments: &Value) -> crate::Result<Value> {
    let provider = field_str(arguments, "provider")?;
    guard::validate_provider_id(provider)?;
    ctx.rate_limiter.check(&format!("hangar_start:{provider}"))?;
    ctx.command_bus
        .send(Command::StartProvider {
            provider_id: provider.to_string(),
        })
        .await
}

async fn hangar_stop(ctx: &AppContext, arguments: &Value) -> crate::Result<Value> {
    let provider = field_str(arguments, "provider")?;
    guard::validate_provider_id(provider)?;
    ctx.rate_limiter.check(&format!("hangar_stop:{provider}"))?;
    ctx.command_bus
        .send(Command::StopProvider {
            provider_id: provider.to_string(),
            reason: "user_request".to_string(),
        })
        .await
}

async fn hangar_tools(ctx: &AppContext, arguments: &Value) -> crate::Result<Value> {
    let provider = field_str(arguments, "provider")?;
    guard::validate_provider_id(provider)?;
    ctx.rate_limiter.check(&format!("hangar_tools:{provider}"))?;

    // Ensure the catalog is populated before reading it.
    ctx.command_bus
        .send(Command::StartProvider {
            provider_id: provider.to_string(),
        })
        .await?;
    ctx.query_bus
        .execute(Query::GetProviderTools {
            provider_id: provider.to_string(),
        })
        .await
}

async fn hangar_details(ctx: &AppContext, arguments: &Value) -> crate::Result<Value> {
    let provider = field_str(arguments, "provider")?;
    guard::validate_provider_id(provider)?;
    ctx.rate_limiter.check(&format!("hangar_details:{provider}"))?;
    ctx.query_bus
        .execute(Query::GetProvider {
            provider_id: provider.to_string(),
        })
        .await
}

async fn hangar_warm(ctx: &AppContext, arguments: &Value) -> crate::Result<Value> {
    let providers = arguments
        .get("providers")
        .and_then(Value::as_array)
        .ok_or_else(|| HangarError::Validation {
            field: "providers".to_string(),
            message: "required array of provider ids".to_string(),
        })?;
    ctx.rate_limiter.check("hangar_warm")?;

    let mut warmed = Map::new();
    for entry in providers {
        let Some(provider) = entry.as_str() else {
            return Err(HangarError::Validation {
                field: "providers".to_string(),
                message: "provider ids must be strings".to_string(),
            });
        };
        guard::validate_provider_id(provider)?;
        let outcome = ctx
            .command_bus
            .send(Command::StartProvider {
                provider_id: provider.to_string(),
            })
            .await;
        match outcome {
            Ok(status) => warmed.insert(provider.to_string(), status),
            Err(e) => warmed.insert(provider.to_string(), error_envelope(&e)),
        };
    }
    Ok(json!({"providers": warmed}))
}

/// Batch invocation: clamp, validate eagerly, then hand off to the
/// executor. Validation failures return a dedicated envelope and never
/// reach execution.
async fn hangar_call(ctx: &AppContext, arguments: &Value) -> Value {
    let batch_id = Uuid::new_v4().to_string();

    if let Err(e) = ctx.rate_limiter.check("hangar_call") {
        return error_envelope(&e);
    }

    let calls: Vec<CallRequest> = match arguments.get("calls") {
        Some(raw) => match serde_json::from_value(raw.clone()) {
            Ok(calls) => calls,
            Err(e) => {
                return error_envelope(&HangarError::Validation {
                    field: "calls".to_string(),
                    message: format!("malformed calls array: {e}"),
                })
            }
        },
        None => {
            return error_envelope(&HangarError::Validation {
                field: "calls".to_string(),
                message: "required array field".to_string(),
            })
        }
    };

    let max_concurrency = arguments
        .get("max_concurrency")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_CONCURRENCY as u64) as usize;
    let timeout_s = arguments
        .get("timeout")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_TIMEOUT_S);
    let fail_fast = arguments
        .get("fail_fast")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let max_attempts = arguments
        .get("max_attempts")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    // Clamp to documented ranges rather than rejecting.
    let max_concurrency = max_concurrency.clamp(1, MAX_CONCURRENCY_LIMIT);
    let timeout_s = timeout_s.clamp(1.0, MAX_TIMEOUT_S);
    let max_attempts = max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT);

    tracing::info!(
        batch_id = %batch_id,
        calls = calls.len(),
        max_concurrency,
        timeout_s,
        fail_fast,
        max_attempts,
        "hangar_call requested"
    );

    if calls.is_empty() {
        return json!({
            "batch_id": batch_id,
            "success": true,
            "total": 0,
            "succeeded": 0,
            "failed": 0,
            "cancelled": 0,
            "elapsed_ms": 0.0,
            "results": [],
        });
    }

    let issues = validate_batch(&calls, &ctx.registry).await;
    if !issues.is_empty() {
        tracing::warn!(
            batch_id = %batch_id,
            issues = issues.len(),
            "hangar_call validation failed"
        );
        return json!({
            "batch_id": batch_id,
            "success": false,
            "error": "Validation failed",
            "validation_errors": issues,
        });
    }

    let specs: Vec<CallSpec> = calls
        .into_iter()
        .enumerate()
        .map(|(index, call)| CallSpec {
            index,
            call_id: Uuid::new_v4().to_string(),
            provider: call.provider,
            tool: call.tool,
            arguments: call.arguments,
            timeout_s: call.timeout,
            max_attempts,
        })
        .collect();

    let result = ctx
        .executor
        .execute(
            &batch_id,
            specs,
            BatchOptions {
                max_concurrency,
                global_timeout: Duration::from_secs_f64(timeout_s),
                fail_fast,
            },
        )
        .await;

    serde_json::to_value(&result).unwrap_or_else(|_| {
        error_envelope(&HangarError::Validation {
            field: "result".to_string(),
            message: "batch result serialization failed".to_string(),
        })
    })
}

fn hangar_fetch_continuation(ctx: &AppContext, arguments: &Value) -> crate::Result<Value> {
    ctx.rate_limiter.check("hangar_fetch_continuation")?;
    let continuation_id = field_str(arguments, "continuation_id")?;
    if !continuation_id.starts_with("cont_") {
        return Err(HangarError::Validation {
            field: "continuation_id".to_string(),
            message: "must start with 'cont_'".to_string(),
        });
    }
    let offset = arguments
        .get("offset")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    let limit = arguments.get("limit").and_then(Value::as_u64).unwrap_or(0) as usize;

    let retrieval = ctx.cache.retrieve(continuation_id, offset, limit);
    if !retrieval.found {
        return Ok(json!({
            "found": false,
            "error": "Continuation not found (may have expired)",
        }));
    }
    Ok(json!({
        "found": true,
        "data": retrieval.data,
        "total_size_bytes": retrieval.total_size_bytes,
        "offset": retrieval.offset,
        "has_more": retrieval.has_more,
        "complete": retrieval.complete,
    }))
}

fn hangar_delete_continuation(ctx: &AppContext, arguments: &Value) -> crate::Result<Value> {
    ctx.rate_limiter.check("hangar_delete_continuation")?;
    let continuation_id = field_str(arguments, "continuation_id")?;
    let deleted = ctx.cache.delete(continuation_id);
    Ok(json!({
        "deleted": deleted,
        "continuation_id": continuation_id,
    }))
}

async fn hangar_health(ctx: &AppContext) -> crate::Result<Value> {
    ctx.rate_limiter.check("hangar_health")?;

    let mut by_state: Map<String, Value> = Map::new();
    for provider in ctx.registry.get_all().await {
        let state = provider.state().await.as_str();
        let count = by_state.get(state).and_then(Value::as_u64).unwrap_or(0);
        by_state.insert(state.to_string(), json!(count + 1));
    }

    Ok(json!({
        "status": "healthy",
        "providers": {
            "total": ctx.registry.count().await,
            "by_state": by_state,
        },
        "security": {
            "rate_limiting": ctx.rate_limiter.stats(),
        },
        "concurrency": ctx.concurrency.stats(),
        "metrics": ctx.metrics.to_json(),
    }))
}
