/*!
 * @file function_evaluator.rs
 * @brief Function Evaluator (C6): sandboxed JavaScript for `$function`
 *
 * Each function body runs in a fresh `boa_engine::Context` with no ambient
 * capabilities — no network, no filesystem, no timers beyond the engine's
 * built-ins (spec §4.6 Concurrency contract). Bodies are cached by the
 * first 16 hex characters of their SHA-256 digest so repeated calls to the
 * same function across rows reuse the compiled source instead of
 * re-parsing it per row.
 */

use std::sync::Arc;

use boa_engine::{Context, JsError, JsValue, Source};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

use crate::error::{RelayError, Result};
use crate::expr::FunctionCall;

/// A cached, parseable function body. `boa_engine::Context` itself isn't
/// `Send`, so the cache stores source text and compiles fresh per call
/// (cheap relative to the I/O this replaces) while still deduping batches
/// by body identity.
#[derive(Clone)]
struct CachedFunction {
    source: Arc<String>,
}

pub struct FunctionEvaluator {
    enabled: bool,
    cache: Mutex<LruCache<String, CachedFunction>>,
}

impl FunctionEvaluator {
    pub fn new(enabled: bool, cache_capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Self {
            enabled,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Execute one call. Missing sandbox capability is a diagnostic error
    /// identifying the operator, per spec §4.6 Failure modes: refuse, don't
    /// silently fall back.
    pub fn execute(&self, call: &FunctionCall, args: &[JsonValue]) -> Result<JsonValue> {
        if !self.enabled {
            return Err(RelayError::bad_value(
                "$function requires the sandboxed JavaScript evaluator, which is disabled",
            ));
        }
        let cached = self.cached_source(call);
        run_in_sandbox(&cached.source, args)
    }

    /// Group calls by function body and run each group as one batch
    /// (spec §4.6 Batching). A per-element evaluation exception is returned
    /// positionally as a `{ "__error": message }` object so the rest of the
    /// batch still completes.
    pub fn execute_batch(&self, call: &FunctionCall, arg_tuples: &[Vec<JsonValue>]) -> Result<Vec<JsonValue>> {
        if !self.enabled {
            return Err(RelayError::bad_value(
                "$function requires the sandboxed JavaScript evaluator, which is disabled",
            ));
        }
        let cached = self.cached_source(call);
        Ok(arg_tuples
            .iter()
            .map(|args| {
                run_in_sandbox(&cached.source, args).unwrap_or_else(|e| {
                    serde_json::json!({ "__error": e.to_string() })
                })
            })
            .collect())
    }

    fn cached_source(&self, call: &FunctionCall) -> CachedFunction {
        let key = call.content_hash();
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(&key) {
            return existing.clone();
        }
        let entry = CachedFunction {
            source: Arc::new(call.body.clone()),
        };
        cache.put(key, entry.clone());
        entry
    }
}

fn run_in_sandbox(source: &str, args: &[JsonValue]) -> Result<JsonValue> {
    let mut context = Context::default();

    let args_literal = serde_json::to_string(args)
        .map_err(|e| RelayError::internal_error(format!("failed to serialize $function args: {e}")))?;
    let invocation = format!("({source})(...({args_literal}))");

    let result = context
        .eval(Source::from_bytes(&invocation))
        .map_err(|e: JsError| RelayError::bad_value(format!("$function evaluation failed: {e}")))?;

    js_value_to_json(&result, &mut context)
}

fn js_value_to_json(value: &JsValue, context: &mut Context) -> Result<JsonValue> {
    let json_text = context
        .global_object()
        .get(boa_engine::js_string!("JSON"), context)
        .ok()
        .and_then(|json_obj| json_obj.as_object().cloned())
        .and_then(|json_obj| json_obj.get(boa_engine::js_string!("stringify"), context).ok())
        .and_then(|f| f.as_callable().cloned())
        .and_then(|f| f.call(&JsValue::undefined(), &[value.clone()], context).ok())
        .and_then(|v| v.as_string().map(|s| s.to_std_string_escaped()));

    match json_text {
        Some(text) if !text.is_empty() => serde_json::from_str(&text)
            .map_err(|e| RelayError::internal_error(format!("failed to parse $function result: {e}"))),
        _ => Ok(JsonValue::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FunctionEvaluatorConfig;

    fn evaluator() -> FunctionEvaluator {
        let config = FunctionEvaluatorConfig::default();
        FunctionEvaluator::new(config.enabled, config.cache_capacity)
    }

    fn call(body: &str) -> FunctionCall {
        FunctionCall {
            body: body.to_string(),
            field_args: vec![],
            literal_args: vec![],
            arg_count: 1,
        }
    }

    #[test]
    fn executes_a_simple_function() {
        let evaluator = evaluator();
        let result = evaluator
            .execute(&call("function(x) { return x + 1; }"), &[serde_json::json!(41)])
            .unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[test]
    fn disabled_evaluator_refuses_rather_than_falling_back() {
        let evaluator = FunctionEvaluator::new(false, 16);
        let err = evaluator
            .execute(&call("function(x) { return x; }"), &[serde_json::json!(1)])
            .unwrap_err();
        assert_eq!(err.code(), crate::error::code::BAD_VALUE);
    }

    #[test]
    fn batch_isolates_a_failing_element() {
        let evaluator = evaluator();
        let results = evaluator
            .execute_batch(
                &call("function(x) { if (x === 0) { throw new Error('boom'); } return x * 2; }"),
                &[vec![serde_json::json!(1)], vec![serde_json::json!(0)], vec![serde_json::json!(3)]],
            )
            .unwrap();
        assert_eq!(results[0], serde_json::json!(2));
        assert!(results[1].get("__error").is_some());
        assert_eq!(results[2], serde_json::json!(6));
    }

    #[test]
    fn repeated_calls_reuse_the_cached_body() {
        let evaluator = evaluator();
        let f = call("function(x) { return x; }");
        let hash_before = f.content_hash();
        evaluator.execute(&f, &[serde_json::json!(1)]).unwrap();
        evaluator.execute(&f, &[serde_json::json!(2)]).unwrap();
        assert_eq!(evaluator.cache.lock().len(), 1);
        assert_eq!(hash_before.len(), 16);
    }
}
