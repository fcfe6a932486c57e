//! Batch invocation models, limits, and eager validation.
//!
//! `hangar_call` accepts a list of call requests plus batch-wide options;
//! everything is validated up front so a malformed batch never reaches the
//! executor.

pub mod executor;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::guard;
use crate::registry::ProviderRegistry;

pub use executor::{BatchExecutor, BatchOptions};

/// Default parallel workers per batch.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Upper clamp for per-batch workers.
pub const MAX_CONCURRENCY_LIMIT: usize = 20;

/// Default batch timeout in seconds.
pub const DEFAULT_TIMEOUT_S: f64 = 60.0;

/// Upper clamp for the batch timeout in seconds.
pub const MAX_TIMEOUT_S: f64 = 300.0;

/// Upper clamp for attempts per call (including the first).
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Maximum calls accepted in one batch.
pub const MAX_CALLS_PER_BATCH: usize = 100;

/// Per-call inline result budget; larger results spill to the continuation
/// cache.
pub const MAX_RESPONSE_SIZE_BYTES: usize = 1024 * 1024;

/// Whole-batch budget across successful results.
pub const MAX_TOTAL_RESPONSE_SIZE_BYTES: usize = 4 * 1024 * 1024;

/// One call as submitted by the client.
#[derive(Debug, Clone, Deserialize)]
pub struct CallRequest {
    pub provider: String,
    pub tool: String,
    #[serde(default = "empty_object")]
    pub arguments: Value,
    pub timeout: Option<f64>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// One call as executed: indexed, identified, and clamped.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub index: usize,
    pub call_id: String,
    pub provider: String,
    pub tool: String,
    pub arguments: Value,
    pub timeout_s: Option<f64>,
    pub max_attempts: u32,
}

/// Attempt accounting attached to results of retried calls.
#[derive(Debug, Clone, Serialize)]
pub struct RetryMetadata {
    pub attempts: u32,
    pub retries: Vec<String>,
    pub total_time_ms: f64,
}

/// Outcome of one call within a batch.
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub index: usize,
    pub call_id: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_metadata: Option<RetryMetadata>,
}

impl CallResult {
    pub fn success(index: usize, call_id: String, result: Value, elapsed_ms: f64) -> Self {
        CallResult {
            index,
            call_id,
            success: true,
            result: Some(result),
            error: None,
            error_type: None,
            elapsed_ms,
            truncated: false,
            truncated_reason: None,
            original_size_bytes: None,
            continuation_id: None,
            retry_metadata: None,
        }
    }

    pub fn failure(
        index: usize,
        call_id: String,
        error: impl Into<String>,
        error_type: impl Into<String>,
        elapsed_ms: f64,
    ) -> Self {
        CallResult {
            index,
            call_id,
            success: false,
            result: None,
            error: Some(error.into()),
            error_type: Some(error_type.into()),
            elapsed_ms,
            truncated: false,
            truncated_reason: None,
            original_size_bytes: None,
            continuation_id: None,
            retry_metadata: None,
        }
    }
}

/// Aggregate outcome of a batch.
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub success: bool,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed_ms: f64,
    pub results: Vec<CallResult>,
}

/// One field-level problem found during eager validation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationIssue {
    pub index: usize,
    pub field: String,
    pub message: String,
}

/// Validate a whole batch before execution.
///
/// Checks batch size, each call's provider id / tool name / arguments /
/// timeout, and that every referenced provider is registered. Returns every
/// problem found, not just the first.
pub async fn validate_batch(
    calls: &[CallRequest],
    registry: &ProviderRegistry,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if calls.len() > MAX_CALLS_PER_BATCH {
        issues.push(ValidationIssue {
            index: 0,
            field: "calls".to_string(),
            message: format!(
                "batch size {} exceeds maximum of {MAX_CALLS_PER_BATCH}",
                calls.len()
            ),
        });
        return issues;
    }

    for (index, call) in calls.iter().enumerate() {
        if let Err(e) = guard::validate_provider_id(&call.provider) {
            issues.push(issue_from(index, "provider", e));
        } else if !registry.exists(&call.provider).await {
            issues.push(ValidationIssue {
                index,
                field: "provider".to_string(),
                message: format!("unknown provider '{}'", call.provider),
            });
        }
        if let Err(e) = guard::validate_tool_name(&call.tool) {
            issues.push(issue_from(index, "tool", e));
        }
        if let Err(e) = guard::validate_arguments(&call.arguments) {
            issues.push(issue_from(index, "arguments", e));
        }
        if let Some(timeout) = call.timeout {
            if let Err(e) = guard::validate_timeout(timeout) {
                issues.push(issue_from(index, "timeout", e));
            }
        }
    }

    issues
}

fn issue_from(index: usize, field: &str, error: crate::error::HangarError) -> ValidationIssue {
    ValidationIssue {
        index,
        field: field.to_string(),
        message: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::provider::Provider;
    use crate::test_util::echo_provider_spec;
    use serde_json::json;
    use std::sync::Arc;

    async fn registry_with_math() -> ProviderRegistry {
        let registry = ProviderRegistry::new();
        registry
            .add(Arc::new(Provider::new(
                "math",
                echo_provider_spec(),
                Arc::new(EventBus::new()),
            )))
            .await
            .expect("add");
        registry
    }

    fn call(provider: &str, tool: &str) -> CallRequest {
        CallRequest {
            provider: provider.to_string(),
            tool: tool.to_string(),
            arguments: json!({}),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_valid_batch_has_no_issues() {
        let registry = registry_with_math().await;
        let issues = validate_batch(&[call("math", "add")], &registry).await;
        assert!(issues.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_provider_is_a_validation_issue() {
        let registry = registry_with_math().await;
        let issues = validate_batch(&[call("ghost", "add")], &registry).await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "provider");
        assert!(issues[0].message.contains("unknown provider"));
    }

    #[tokio::test]
    async fn test_all_problems_reported_with_indices() {
        let registry = registry_with_math().await;
        let calls = vec![
            call("math", "add"),
            CallRequest {
                provider: "bad id".to_string(),
                tool: "no/slash".to_string(),
                arguments: json!([1]),
                timeout: Some(0.0),
            },
        ];
        let issues = validate_batch(&calls, &registry).await;
        let fields: Vec<(usize, &str)> = issues
            .iter()
            .map(|i| (i.index, i.field.as_str()))
            .collect();
        assert_eq!(
            fields,
            vec![
                (1, "provider"),
                (1, "tool"),
                (1, "arguments"),
                (1, "timeout")
            ]
        );
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected() {
        let registry = registry_with_math().await;
        let calls: Vec<CallRequest> = (0..MAX_CALLS_PER_BATCH + 1)
            .map(|_| call("math", "add"))
            .collect();
        let issues = validate_batch(&calls, &registry).await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].field, "calls");
    }

    #[test]
    fn test_call_request_defaults_empty_arguments() {
        let request: CallRequest =
            serde_json::from_value(json!({"provider": "math", "tool": "add"})).expect("parse");
        assert_eq!(request.arguments, json!({}));
        assert!(request.timeout.is_none());
    }

    #[test]
    fn test_call_result_serialization_omits_empty_extras() {
        let result = CallResult::success(0, "id".to_string(), json!(3), 1.5);
        let value = serde_json::to_value(&result).expect("serialize");
        assert_eq!(value["success"], true);
        assert!(value.get("truncated").is_none());
        assert!(value.get("continuation_id").is_none());
        assert!(value.get("retry_metadata").is_none());
    }
}
