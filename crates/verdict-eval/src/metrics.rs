//! Counters and timers collected when instrumentation is enabled.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;

pub const VIRTUAL_CACHE_HIT: &str = "eval_op_virtual_cache_hit";
pub const VIRTUAL_CACHE_MISS: &str = "eval_op_virtual_cache_miss";
pub const BASE_CACHE_HIT: &str = "eval_op_base_cache_hit";
pub const BASE_CACHE_MISS: &str = "eval_op_base_cache_miss";
pub const RULE_INDEX: &str = "eval_op_rule_index";
pub const BUILTIN_CALL: &str = "eval_op_builtin_call";
pub const SAVE_UNIFY: &str = "partial_op_save_unify";
pub const COPY_PROPAGATION: &str = "partial_op_copy_propagation";
pub const QUERY_EVAL: &str = "query_eval";
pub const PARTIAL_EVAL: &str = "query_partial_eval";

#[derive(Debug, Default)]
struct Inner {
    counters: BTreeMap<String, u64>,
    timers: BTreeMap<String, Duration>,
}

/// Metrics sink shared between runs.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_incr(&self, name: &str) {
        *self.inner.lock().counters.entry(name.to_string()).or_default() += 1;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.inner.lock().counters.get(name).copied().unwrap_or(0)
    }

    pub fn timer_add(&self, name: &str, elapsed: Duration) {
        *self.inner.lock().timers.entry(name.to_string()).or_default() += elapsed;
    }

    pub fn timer(&self, name: &str) -> Duration {
        self.inner.lock().timers.get(name).copied().unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.counters.clear();
        inner.timers.clear();
    }

    /// `{"counter_<name>": n, "timer_<name>_ns": ns}`
    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock();
        let mut out = serde_json::Map::new();
        for (name, n) in &inner.counters {
            out.insert(format!("counter_{name}"), (*n).into());
        }
        for (name, d) in &inner.timers {
            out.insert(format!("timer_{name}_ns"), (d.as_nanos() as u64).into());
        }
        serde_json::Value::Object(out)
    }
}
