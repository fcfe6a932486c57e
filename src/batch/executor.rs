//! Batch execution engine.
//!
//! Every call in a batch is spawned at once; backpressure comes from the
//! shared concurrency manager's semaphores plus a per-batch worker cap of
//! `min(max_concurrency, global_limit)`. There is no wave chunking — the
//! moment a fast call frees its slot, the next queued call proceeds.
//!
//! Workers check the batch cancel signal at each pipeline boundary. The
//! collector enforces the global deadline and fail-fast: unfinished slots
//! are filled with `TimeoutError` after the deadline and `CancellationError`
//! after a fail-fast cancel. In-flight RPCs are never cancelled mid-call;
//! their own per-call timeouts bound them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::batch::{
    BatchResult, CallResult, CallSpec, RetryMetadata, MAX_RESPONSE_SIZE_BYTES,
    MAX_TOTAL_RESPONSE_SIZE_BYTES,
};
use crate::bus::{Command, CommandBus};
use crate::concurrency::ConcurrencyManager;
use crate::continuation::ResponseCache;
use crate::events::{EventBus, EventPayload};
use crate::provider::ProviderState;
use crate::registry::ProviderRegistry;
use crate::singleflight::SingleFlight;

/// First retry delay.
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Retry delay cap.
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(2);

/// Batch-wide execution options, already clamped by the surface.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub max_concurrency: usize,
    pub global_timeout: Duration,
    pub fail_fast: bool,
}

struct CallContext {
    batch_id: String,
    registry: Arc<ProviderRegistry>,
    command_bus: Arc<CommandBus>,
    concurrency: Arc<ConcurrencyManager>,
    cache: Arc<ResponseCache>,
    single_flight: Arc<SingleFlight>,
    cancel: CancellationToken,
    started: Instant,
    global_timeout: Duration,
}

impl CallContext {
    fn remaining(&self) -> Duration {
        self.global_timeout.saturating_sub(self.started.elapsed())
    }
}

/// Executes batches of tool calls in parallel under shared limits.
pub struct BatchExecutor {
    registry: Arc<ProviderRegistry>,
    command_bus: Arc<CommandBus>,
    events: Arc<EventBus>,
    concurrency: Arc<ConcurrencyManager>,
    cache: Arc<ResponseCache>,
    single_flight: Arc<SingleFlight>,
    active_batches: AtomicUsize,
}

impl BatchExecutor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        command_bus: Arc<CommandBus>,
        events: Arc<EventBus>,
        concurrency: Arc<ConcurrencyManager>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        BatchExecutor {
            registry,
            command_bus,
            events,
            concurrency,
            cache,
            single_flight: Arc::new(SingleFlight::new()),
            active_batches: AtomicUsize::new(0),
        }
    }

    /// Number of batches currently executing.
    pub fn active_batches(&self) -> usize {
        self.active_batches.load(Ordering::SeqCst)
    }

    /// Execute a batch, returning results in input order.
    pub async fn execute(
        &self,
        batch_id: &str,
        calls: Vec<CallSpec>,
        options: BatchOptions,
    ) -> BatchResult {
        let started = Instant::now();
        let total = calls.len();
        if total == 0 {
            return BatchResult {
                batch_id: batch_id.to_string(),
                success: true,
                total: 0,
                succeeded: 0,
                failed: 0,
                cancelled: 0,
                elapsed_ms: 0.0,
                results: Vec::new(),
            };
        }

        self.active_batches.fetch_add(1, Ordering::SeqCst);

        let global_limit = self.concurrency.global_limit();
        let effective_workers = if global_limit > 0 {
            options.max_concurrency.min(global_limit)
        } else {
            options.max_concurrency
        }
        .max(1);

        let mut providers: Vec<String> = calls.iter().map(|c| c.provider.clone()).collect();
        providers.sort();
        providers.dedup();
        self.events.publish(EventPayload::BatchInvocationRequested {
            batch_id: batch_id.to_string(),
            call_count: total,
            providers: providers.clone(),
            max_concurrency: options.max_concurrency,
            timeout_s: options.global_timeout.as_secs_f64(),
            fail_fast: options.fail_fast,
        });
        tracing::debug!(
            batch_id = %batch_id,
            calls = total,
            effective_workers,
            providers = providers.len(),
            "batch dispatch start"
        );

        let cancel = CancellationToken::new();
        let ctx = Arc::new(CallContext {
            batch_id: batch_id.to_string(),
            registry: self.registry.clone(),
            command_bus: self.command_bus.clone(),
            concurrency: self.concurrency.clone(),
            cache: self.cache.clone(),
            single_flight: self.single_flight.clone(),
            cancel: cancel.clone(),
            started,
            global_timeout: options.global_timeout,
        });

        // All calls are submitted immediately; the worker-cap semaphore plus
        // the shared concurrency manager provide backpressure.
        let worker_cap = Arc::new(Semaphore::new(effective_workers));
        let (tx, mut rx) = mpsc::unbounded_channel::<CallResult>();
        let call_meta: Vec<(String, String, String)> = calls
            .iter()
            .map(|c| (c.call_id.clone(), c.provider.clone(), c.tool.clone()))
            .collect();

        for call in calls {
            let ctx = ctx.clone();
            let worker_cap = worker_cap.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _worker = worker_cap
                    .acquire_owned()
                    .await
                    .expect("worker cap semaphore closed");
                let result = execute_call(&ctx, call).await;
                let _ = tx.send(result);
            });
        }
        drop(tx);

        let mut results: Vec<Option<CallResult>> = (0..total).map(|_| None).collect();
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut deadline_hit = false;
        let deadline = started + options.global_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(result)) => {
                    let index = result.index;
                    let (call_id, provider, tool) = &call_meta[index];
                    self.events.publish(EventPayload::BatchCallCompleted {
                        batch_id: batch_id.to_string(),
                        call_id: call_id.clone(),
                        call_index: index,
                        provider_id: provider.clone(),
                        tool_name: tool.clone(),
                        success: result.success,
                        elapsed_ms: result.elapsed_ms,
                        error_type: result.error_type.clone(),
                    });

                    let was_success = result.success;
                    if was_success {
                        succeeded += 1;
                    } else {
                        failed += 1;
                    }
                    results[index] = Some(result);

                    if !was_success && options.fail_fast {
                        tracing::debug!(
                            batch_id = %batch_id,
                            failed_index = index,
                            "fail-fast triggered"
                        );
                        cancel.cancel();
                        break;
                    }
                    if succeeded + failed == total {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        batch_id = %batch_id,
                        timeout_s = options.global_timeout.as_secs_f64(),
                        "batch global timeout"
                    );
                    deadline_hit = true;
                    cancel.cancel();
                    break;
                }
            }
        }

        // Fill unfinished slots. Detached workers keep draining into the
        // closed channel; their per-call timeouts bound them.
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut cancelled = 0usize;
        let mut final_results = Vec::with_capacity(total);
        for (index, slot) in results.into_iter().enumerate() {
            match slot {
                Some(result) => final_results.push(result),
                None => {
                    cancelled += 1;
                    let (call_id, _, _) = &call_meta[index];
                    let result = if deadline_hit {
                        CallResult::failure(
                            index,
                            call_id.clone(),
                            "Global timeout exceeded",
                            "TimeoutError",
                            elapsed_ms,
                        )
                    } else {
                        CallResult::failure(
                            index,
                            call_id.clone(),
                            "Cancelled",
                            "CancellationError",
                            elapsed_ms,
                        )
                    };
                    final_results.push(result);
                }
            }
        }

        apply_batch_truncation(&self.cache, batch_id, &mut final_results);

        let success = failed == 0 && cancelled == 0;
        self.events.publish(EventPayload::BatchInvocationCompleted {
            batch_id: batch_id.to_string(),
            total,
            succeeded,
            failed,
            cancelled,
            elapsed_ms,
        });
        tracing::info!(
            batch_id = %batch_id,
            total,
            succeeded,
            failed,
            cancelled,
            elapsed_ms = %format!("{elapsed_ms:.1}"),
            "batch completed"
        );

        self.active_batches.fetch_sub(1, Ordering::SeqCst);

        BatchResult {
            batch_id: batch_id.to_string(),
            success,
            total,
            succeeded,
            failed,
            cancelled,
            elapsed_ms,
            results: final_results,
        }
    }
}

/// Per-call pipeline: cancellation and deadline gates, provider resolution,
/// circuit check, single-flight cold start, slot acquisition, invocation
/// with retry, truncation.
async fn execute_call(ctx: &CallContext, call: CallSpec) -> CallResult {
    let call_start = Instant::now();
    let elapsed_ms = |start: Instant| start.elapsed().as_secs_f64() * 1000.0;

    if ctx.cancel.is_cancelled() {
        return CallResult::failure(
            call.index,
            call.call_id,
            "Cancelled before execution",
            "CancellationError",
            0.0,
        );
    }

    let remaining = ctx.remaining();
    if remaining.is_zero() {
        return CallResult::failure(
            call.index,
            call.call_id,
            "Global timeout exceeded",
            "TimeoutError",
            0.0,
        );
    }

    let Some(provider) = ctx.registry.get(&call.provider).await else {
        return CallResult::failure(
            call.index,
            call.call_id,
            format!("Provider '{}' not found", call.provider),
            "ProviderNotFoundError",
            elapsed_ms(call_start),
        );
    };

    // Circuit breaker: no attempt when health says degrade.
    if provider.should_degrade().await {
        return CallResult::failure(
            call.index,
            call.call_id,
            "Circuit breaker open (too many consecutive failures)",
            "CircuitBreakerOpen",
            elapsed_ms(call_start),
        );
    }

    // Cold start through the single-flight so N concurrent calls produce
    // one start.
    if provider.state().await == ProviderState::Cold {
        let provider_id = call.provider.clone();
        let command_bus = ctx.command_bus.clone();
        let outcome = ctx
            .single_flight
            .run(&call.provider, || async move {
                command_bus
                    .send(Command::StartProvider { provider_id })
                    .await
            })
            .await;
        if let Err(message) = outcome {
            return CallResult::failure(
                call.index,
                call.call_id,
                format!("Failed to start provider: {message}"),
                "ProviderStartError",
                elapsed_ms(call_start),
            );
        }
    }

    if ctx.cancel.is_cancelled() {
        return CallResult::failure(
            call.index,
            call.call_id,
            "Cancelled after cold start",
            "CancellationError",
            elapsed_ms(call_start),
        );
    }

    // Acquire global + provider slots; this is where backpressure happens.
    let permit = tokio::select! {
        permit = ctx.concurrency.acquire(&call.provider) => permit,
        _ = ctx.cancel.cancelled() => {
            return CallResult::failure(
                call.index,
                call.call_id,
                "Cancelled while queued",
                "CancellationError",
                elapsed_ms(call_start),
            );
        }
        _ = tokio::time::sleep(ctx.remaining()) => {
            return CallResult::failure(
                call.index,
                call.call_id,
                "Global timeout exceeded",
                "TimeoutError",
                elapsed_ms(call_start),
            );
        }
    };
    if permit.waited > Duration::from_millis(10) {
        tracing::debug!(
            batch_id = %ctx.batch_id,
            call_id = %call.call_id,
            provider = %call.provider,
            wait_ms = %format!("{:.1}", permit.waited.as_secs_f64() * 1000.0),
            "concurrency slot wait"
        );
    }

    let result = invoke_with_retry(ctx, &call, call_start).await;
    drop(permit);
    result
}

/// Invocation with bounded, jittered exponential-backoff retry for
/// transient errors. Runs while concurrency slots are held.
async fn invoke_with_retry(ctx: &CallContext, call: &CallSpec, call_start: Instant) -> CallResult {
    let retrying = call.max_attempts > 1;
    let mut attempt_kinds: Vec<String> = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let remaining = ctx.remaining();
        if remaining.is_zero() {
            let mut result = CallResult::failure(
                call.index,
                call.call_id.clone(),
                "Global timeout exceeded",
                "TimeoutError",
                call_start.elapsed().as_secs_f64() * 1000.0,
            );
            result.retry_metadata = retry_metadata(retrying, attempt, &attempt_kinds, call_start);
            return result;
        }
        let effective_timeout = match call.timeout_s {
            Some(t) => Duration::from_secs_f64(t).min(remaining),
            None => remaining,
        };

        let outcome = ctx
            .command_bus
            .send(Command::InvokeTool {
                provider_id: call.provider.clone(),
                tool_name: call.tool.clone(),
                arguments: call.arguments.clone(),
                timeout: effective_timeout,
            })
            .await;

        match outcome {
            Ok(value) => {
                let mut result = CallResult::success(
                    call.index,
                    call.call_id.clone(),
                    value,
                    call_start.elapsed().as_secs_f64() * 1000.0,
                );
                result.retry_metadata =
                    retry_metadata(retrying, attempt, &attempt_kinds, call_start);
                truncate_oversized(
                    &ctx.cache,
                    &ctx.batch_id,
                    &mut result,
                    MAX_RESPONSE_SIZE_BYTES,
                    "response_size_exceeded",
                );
                return result;
            }
            Err(e) => {
                attempt_kinds.push(e.kind().to_string());
                let out_of_attempts = attempt >= call.max_attempts;
                if !retrying || out_of_attempts || !e.is_transient() || ctx.cancel.is_cancelled() {
                    tracing::debug!(
                        batch_id = %ctx.batch_id,
                        call_id = %call.call_id,
                        provider = %call.provider,
                        tool = %call.tool,
                        error = %e,
                        attempts = attempt,
                        "batch call failed"
                    );
                    let mut result = CallResult::failure(
                        call.index,
                        call.call_id.clone(),
                        e.to_string(),
                        e.kind(),
                        call_start.elapsed().as_secs_f64() * 1000.0,
                    );
                    result.retry_metadata =
                        retry_metadata(retrying, attempt, &attempt_kinds, call_start);
                    return result;
                }

                let backoff = retry_backoff(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ctx.cancel.cancelled() => {
                        let mut result = CallResult::failure(
                            call.index,
                            call.call_id.clone(),
                            "Cancelled during retry backoff",
                            "CancellationError",
                            call_start.elapsed().as_secs_f64() * 1000.0,
                        );
                        result.retry_metadata =
                            retry_metadata(retrying, attempt, &attempt_kinds, call_start);
                        return result;
                    }
                }
            }
        }
    }
}

fn retry_metadata(
    retrying: bool,
    attempts: u32,
    attempt_kinds: &[String],
    call_start: Instant,
) -> Option<RetryMetadata> {
    retrying.then(|| RetryMetadata {
        attempts,
        retries: attempt_kinds.to_vec(),
        total_time_ms: call_start.elapsed().as_secs_f64() * 1000.0,
    })
}

fn retry_backoff(attempt: u32) -> Duration {
    let base = RETRY_BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(RETRY_BACKOFF_MAX);
    base.mul_f64(1.0 + rand::thread_rng().gen_range(0.0..0.25))
}

/// Spill an oversized successful result into the continuation cache.
fn truncate_oversized(
    cache: &ResponseCache,
    batch_id: &str,
    result: &mut CallResult,
    budget: usize,
    reason: &str,
) {
    if !result.success || result.truncated {
        return;
    }
    let Some(value) = &result.result else {
        return;
    };
    let size = value.to_string().len();
    if size <= budget {
        return;
    }

    let continuation_id = cache.store(batch_id, result.index, value);
    tracing::warn!(
        batch_id = %batch_id,
        call_index = result.index,
        size_bytes = size,
        limit_bytes = budget,
        reason = %reason,
        "batch call result truncated"
    );
    result.truncated = true;
    result.truncated_reason = Some(reason.to_string());
    result.original_size_bytes = Some(size);
    result.continuation_id = Some(continuation_id);
    result.result = None;
}

/// Batch-level pass: once the running total of successful result sizes
/// crosses the whole-batch budget, remaining oversized results spill too.
fn apply_batch_truncation(cache: &ResponseCache, batch_id: &str, results: &mut [CallResult]) {
    let mut running_total = 0usize;
    for result in results.iter_mut() {
        if !result.success || result.truncated {
            continue;
        }
        let Some(value) = &result.result else {
            continue;
        };
        let size = value.to_string().len();
        if running_total + size > MAX_TOTAL_RESPONSE_SIZE_BYTES {
            truncate_oversized(cache, batch_id, result, 0, "batch_size_exceeded");
        } else {
            running_total += size;
        }
    }
}
