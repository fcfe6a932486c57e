//! Request guarding for the tool surface: token-bucket rate limiting and
//! input validation.
//!
//! Every externally supplied field is validated before any provider work
//! happens; a failed validation bypasses execution entirely.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::time::Instant;

use regex::Regex;
use serde_json::Value;

use crate::config::RateLimitConfig;
use crate::error::HangarError;

/// Shape shared by provider ids and tool names.
pub static PROVIDER_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").expect("static pattern compiles"));

/// Maximum serialized size of a tool-call argument object.
const MAX_ARGUMENTS_BYTES: usize = 256 * 1024;

/// Maximum nesting depth of a tool-call argument object.
const MAX_ARGUMENTS_DEPTH: usize = 32;

/// Maximum per-call timeout in seconds.
pub const MAX_TIMEOUT_S: f64 = 300.0;

fn invalid(field: &str, message: impl Into<String>) -> HangarError {
    HangarError::Validation {
        field: field.to_string(),
        message: message.into(),
    }
}

/// Validate a provider id: nonempty, bounded, `[A-Za-z0-9_.-]` only.
pub fn validate_provider_id(provider: &str) -> crate::Result<()> {
    if provider.chars().any(char::is_control) {
        return Err(invalid("provider", "control characters are not allowed"));
    }
    if !PROVIDER_ID_PATTERN.is_match(provider) {
        return Err(invalid(
            "provider",
            "must be 1-64 characters of [A-Za-z0-9_.-]",
        ));
    }
    Ok(())
}

/// Validate a tool name; same shape as provider ids.
pub fn validate_tool_name(tool: &str) -> crate::Result<()> {
    if tool.chars().any(char::is_control) {
        return Err(invalid("tool", "control characters are not allowed"));
    }
    if !PROVIDER_ID_PATTERN.is_match(tool) {
        return Err(invalid("tool", "must be 1-64 characters of [A-Za-z0-9_.-]"));
    }
    Ok(())
}

/// Validate a tool-call argument value: a JSON object of bounded size and
/// depth whose strings carry no control characters.
pub fn validate_arguments(arguments: &Value) -> crate::Result<()> {
    if !arguments.is_object() {
        return Err(invalid("arguments", "must be a JSON object"));
    }

    let serialized = serde_json::to_string(arguments)
        .map_err(|e| invalid("arguments", format!("not serializable: {e}")))?;
    if serialized.len() > MAX_ARGUMENTS_BYTES {
        return Err(invalid(
            "arguments",
            format!(
                "serialized size {} exceeds limit of {} bytes",
                serialized.len(),
                MAX_ARGUMENTS_BYTES
            ),
        ));
    }

    check_value(arguments, 0)
}

fn check_value(value: &Value, depth: usize) -> crate::Result<()> {
    if depth > MAX_ARGUMENTS_DEPTH {
        return Err(invalid(
            "arguments",
            format!("nesting deeper than {MAX_ARGUMENTS_DEPTH} levels"),
        ));
    }
    match value {
        Value::String(s) => {
            // Tab and newline are legitimate in tool payloads; everything
            // else in the C0 range is rejected.
            if s.chars()
                .any(|c| c.is_control() && c != '\n' && c != '\r' && c != '\t')
            {
                return Err(invalid("arguments", "control characters in string value"));
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                check_value(item, depth + 1)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                if key.chars().any(char::is_control) {
                    return Err(invalid("arguments", "control characters in object key"));
                }
                check_value(item, depth + 1)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Validate a per-call timeout: finite, positive, at most 300s.
pub fn validate_timeout(timeout_s: f64) -> crate::Result<()> {
    if !timeout_s.is_finite() {
        return Err(invalid("timeout", "must be finite"));
    }
    if timeout_s <= 0.0 {
        return Err(invalid("timeout", "must be greater than zero"));
    }
    if timeout_s > MAX_TIMEOUT_S {
        return Err(invalid(
            "timeout",
            format!("must be at most {MAX_TIMEOUT_S}s"),
        ));
    }
    Ok(())
}

/// Outcome of a token-bucket consume attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-key token-bucket rate limiter.
///
/// Each key holds up to `burst_size` tokens, refilled continuously at
/// `requests_per_second`. A consume takes one token; when the bucket is
/// empty the request is disallowed and the caller surfaces
/// [`HangarError::RateLimitExceeded`].
pub struct RateLimiter {
    requests_per_second: f64,
    burst_size: u32,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        RateLimiter {
            requests_per_second: config.requests_per_second.max(0.001),
            burst_size: config.burst_size.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`, refilling the bucket first.
    pub fn consume(&self, key: &str) -> RateLimitDecision {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let now = Instant::now();
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.burst_size as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * self.requests_per_second).min(self.burst_size as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            RateLimitDecision {
                allowed: true,
                limit: self.burst_size,
                remaining: bucket.tokens.floor() as u32,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                limit: self.burst_size,
                remaining: 0,
            }
        }
    }

    /// Consume a token or fail with `RateLimitExceeded`.
    pub fn check(&self, key: &str) -> crate::Result<()> {
        let decision = self.consume(key);
        if decision.allowed {
            Ok(())
        } else {
            tracing::warn!(key = %key, limit = decision.limit, "rate limit exceeded");
            Err(HangarError::RateLimitExceeded {
                limit: decision.limit,
                window_s: 1,
            })
        }
    }

    /// Snapshot of limiter configuration and tracked keys, for health output.
    pub fn stats(&self) -> serde_json::Value {
        let buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        serde_json::json!({
            "requests_per_second": self.requests_per_second,
            "burst_size": self.burst_size,
            "tracked_keys": buckets.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_id_valid_shapes() {
        assert!(validate_provider_id("math").is_ok());
        assert!(validate_provider_id("my-provider_1.2").is_ok());
        assert!(validate_provider_id(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_provider_id_invalid_shapes() {
        assert!(validate_provider_id("").is_err());
        assert!(validate_provider_id("has space").is_err());
        assert!(validate_provider_id("tab\there").is_err());
        assert!(validate_provider_id(&"a".repeat(65)).is_err());
        assert!(validate_provider_id("semi;colon").is_err());
    }

    #[test]
    fn test_tool_name_validation() {
        assert!(validate_tool_name("add").is_ok());
        assert!(validate_tool_name("files.read_v2").is_ok());
        assert!(validate_tool_name("no/slash").is_err());
    }

    #[test]
    fn test_arguments_must_be_object() {
        assert!(validate_arguments(&json!({"a": 1})).is_ok());
        assert!(validate_arguments(&json!([1, 2])).is_err());
        assert!(validate_arguments(&json!("string")).is_err());
        assert!(validate_arguments(&json!(null)).is_err());
    }

    #[test]
    fn test_arguments_allow_benign_whitespace() {
        assert!(validate_arguments(&json!({"text": "line one\nline two\ttabbed"})).is_ok());
    }

    #[test]
    fn test_arguments_reject_control_chars() {
        assert!(validate_arguments(&json!({"text": "null\u{0000}byte"})).is_err());
        assert!(validate_arguments(&json!({"esc\u{001b}key": "v"})).is_err());
    }

    #[test]
    fn test_arguments_depth_bounded() {
        let mut value = json!({"leaf": 1});
        for _ in 0..40 {
            value = json!({ "nested": value });
        }
        assert!(validate_arguments(&value).is_err());
    }

    #[test]
    fn test_timeout_bounds() {
        assert!(validate_timeout(1.0).is_ok());
        assert!(validate_timeout(300.0).is_ok());
        assert!(validate_timeout(0.0).is_err());
        assert!(validate_timeout(-1.0).is_err());
        assert!(validate_timeout(300.1).is_err());
        assert!(validate_timeout(f64::INFINITY).is_err());
        assert!(validate_timeout(f64::NAN).is_err());
    }

    fn limiter(rps: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            requests_per_second: rps,
            burst_size: burst,
        })
    }

    #[test]
    fn test_rate_limiter_allows_burst_then_blocks() {
        let rl = limiter(0.001, 3);
        assert!(rl.consume("k").allowed);
        assert!(rl.consume("k").allowed);
        assert!(rl.consume("k").allowed);
        let decision = rl.consume("k");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 3);
    }

    #[test]
    fn test_rate_limiter_keys_are_independent() {
        let rl = limiter(0.001, 1);
        assert!(rl.consume("a").allowed);
        assert!(!rl.consume("a").allowed);
        assert!(rl.consume("b").allowed);
    }

    #[test]
    fn test_rate_limiter_refills_over_time() {
        let rl = limiter(1000.0, 2);
        assert!(rl.consume("k").allowed);
        assert!(rl.consume("k").allowed);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(rl.consume("k").allowed, "bucket should refill at 1000 rps");
    }

    #[test]
    fn test_check_maps_to_error() {
        let rl = limiter(0.001, 1);
        assert!(rl.check("k").is_ok());
        let err = rl.check("k").unwrap_err();
        assert!(matches!(err, HangarError::RateLimitExceeded { limit: 1, .. }));
    }
}
