//! Query facade
//!
//! ```no_run
//! use std::sync::Arc;
//! use verdict_eval::Query;
//! use verdict_lang::{parse_body, Compiler};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = Compiler::new()
//!     .with_source("package policy\nallow { input.x > 1 }")?
//!     .compile()?;
//! let results = Query::new(policy, parse_body("data.policy.allow = x")?)
//!     .with_input_json(&serde_json::json!({"x": 2}))
//!     .run()?;
//! assert_eq!(results.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info_span, warn};
use verdict_lang::{Body, CompiledPolicy, Expr, Module, Ref, Term, Var};
use verdict_storage::{Storage, Transaction, TransactionParams};

use crate::builtins::{BuiltinCache, BuiltinRegistry};
use crate::cancel::Cancel;
use crate::config::EvalConfig;
use crate::copyprop::CopyPropagator;
use crate::error::EvalError;
use crate::eval::{Env, Eval};
use crate::metrics::{self, Metrics};
use crate::tracer::QueryTracer;

/// Bindings of the query's user-visible vars for one solution.
pub type QueryResult = BTreeMap<Var, Term>;

/// Output of partial evaluation: residual queries, any of which may hold,
/// plus the support modules they refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialResult {
    pub queries: Vec<Body>,
    pub support: Vec<Module>,
}

impl PartialResult {
    /// Residual queries rendered one per line, for logs and tests.
    pub fn render(&self) -> Vec<String> {
        self.queries.iter().map(ToString::to_string).collect()
    }
}

#[derive(Debug, Serialize)]
struct RunSummary {
    results: usize,
    elapsed_ns: u128,
}

#[derive(Clone)]
pub struct Query {
    policy: Arc<CompiledPolicy>,
    body: Body,
    input: Option<Term>,
    store: Option<Arc<dyn Storage>>,
    txn: Option<Transaction>,
    cancel: Option<Cancel>,
    tracers: Vec<Arc<dyn QueryTracer>>,
    metrics: Option<Arc<Metrics>>,
    builtins: Arc<BuiltinRegistry>,
    config: EvalConfig,
}

impl Query {
    pub fn new(policy: Arc<CompiledPolicy>, body: Body) -> Self {
        Query {
            policy,
            body,
            input: None,
            store: None,
            txn: None,
            cancel: None,
            tracers: vec![],
            metrics: None,
            builtins: Arc::new(BuiltinRegistry::with_defaults()),
            config: EvalConfig::default(),
        }
    }

    pub fn with_input(mut self, input: Term) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_input_json(self, input: &serde_json::Value) -> Self {
        self.with_input(Term::from_json(input))
    }

    /// Read base documents from `store`. Without an explicit transaction a
    /// read transaction is opened for each run.
    pub fn with_store(mut self, store: Arc<dyn Storage>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_transaction(mut self, txn: Transaction) -> Self {
        self.txn = Some(txn);
        self
    }

    pub fn with_cancel(mut self, cancel: Cancel) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn QueryTracer>) -> Self {
        self.tracers.push(tracer);
        self
    }

    /// Metrics sink; counters are only recorded with instrumentation on.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_instrumentation(mut self, yes: bool) -> Self {
        self.config.instrument = yes;
        self
    }

    pub fn with_builtins(mut self, builtins: Arc<BuiltinRegistry>) -> Self {
        self.builtins = builtins;
        self
    }

    pub fn with_unknowns<S: Into<String>>(mut self, unknowns: impl IntoIterator<Item = S>) -> Self {
        self.config.unknowns = unknowns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_partial_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.partial_namespace = namespace.into();
        self
    }

    pub fn with_disable_inlining<S: Into<String>>(mut self, refs: impl IntoIterator<Item = S>) -> Self {
        self.config.disable_inlining = refs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shallow_inlining(mut self, yes: bool) -> Self {
        self.config.shallow_inlining = yes;
        self
    }

    pub fn with_indexing(mut self, yes: bool) -> Self {
        self.config.indexing = yes;
        self
    }

    pub fn with_config(mut self, config: EvalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    /// Call `f` once per solution, in evaluation order. An error from `f`
    /// stops evaluation and is returned as is.
    pub fn iter(&self, mut f: impl FnMut(&QueryResult) -> Result<(), EvalError>) -> Result<(), EvalError> {
        let _span = info_span!("query_eval", query = %self.body).entered();
        let start = Instant::now();
        let body = self.policy.compile_query(&self.body);
        let vars = visible_vars(&body);
        let mut count = 0usize;

        self.with_eval(false, |ev| {
            let root = ev.root_frame();
            ev.eval_body(&body, &root, &mut |ev| {
                let mut row = QueryResult::new();
                for v in &vars {
                    let value = ev.bindings.plug(&Term::var(v.name()), root.bindings);
                    if !value.is_var() {
                        row.insert(v.clone(), value);
                    }
                }
                count += 1;
                f(&row)
            })
        })?;

        self.record(metrics::QUERY_EVAL, start, count);
        Ok(())
    }

    /// Every solution, in evaluation order.
    pub fn run(&self) -> Result<Vec<QueryResult>, EvalError> {
        let mut out = vec![];
        self.iter(|row| {
            out.push(row.clone());
            Ok(())
        })?;
        Ok(out)
    }

    /// Evaluate with the configured unknowns left open, producing the
    /// residual queries under which the query would succeed.
    pub fn partial_run(&self) -> Result<PartialResult, EvalError> {
        let _span = info_span!("query_partial_eval", query = %self.body).entered();
        let start = Instant::now();
        let unknowns = parse_refs(&self.config.unknowns)?;
        let disabled = parse_refs(&self.config.disable_inlining)?;
        let body = self.policy.compile_query(&self.body);
        let live = visible_vars(&body);
        let shallow = self.config.shallow_inlining;

        let out = self.with_eval(true, |ev| {
            ev.inlining.shallow = shallow;
            ev.inlining.push_disable(disabled, false);
            ev.save_set.push_refs(unknowns);
            let root = ev.root_frame();
            let mut queries = vec![];
            ev.eval_body(&body, &root, &mut |ev| {
                let mut residual = ev.save_stack.plug_query(&ev.bindings, root.bindings);
                for (var, value, frame) in ev.bindings.frame_bindings(root.bindings) {
                    let value = ev.bindings.plug_namespaced(&value, frame, root.bindings);
                    residual.push(Expr::equality(Term::var(var.name()), value));
                }
                if !shallow {
                    residual = ev.copy_propagate(&CopyPropagator::new(live.iter().cloned()), &residual);
                }
                queries.push(if residual.is_empty() { Body::truthy() } else { Body::new(residual) });
                Ok(())
            })?;
            Ok(PartialResult {
                queries,
                support: ev.support.list(),
            })
        })?;

        debug!(queries = out.queries.len(), support = out.support.len(), "partial evaluation finished");
        self.record(metrics::PARTIAL_EVAL, start, out.queries.len());
        Ok(out)
    }

    /// Set up the run state (transaction, caches, evaluator) and hand it to `f`.
    fn with_eval<T>(&self, partial: bool, f: impl FnOnce(&mut Eval<'_>) -> Result<T, EvalError>) -> Result<T, EvalError> {
        let opened = match (&self.store, &self.txn) {
            (Some(store), None) => Some(store.new_transaction(TransactionParams::read())?),
            _ => None,
        };
        let builtin_cache = BuiltinCache::default();
        let result = {
            let store = match (&self.store, self.txn.as_ref().or(opened.as_ref())) {
                (Some(store), Some(txn)) => Some((store.as_ref(), txn)),
                _ => None,
            };
            let env = Env {
                policy: &self.policy,
                store,
                builtins: &self.builtins,
                builtin_cache: &builtin_cache,
                cancel: self.cancel.as_ref(),
                tracers: &self.tracers,
                metrics: self.metrics.as_deref().filter(|_| self.config.instrument),
                indexing: self.config.indexing,
                namespace: &self.config.partial_namespace,
            };
            let mut ev = Eval::new(env, self.input.clone(), partial);
            f(&mut ev)
        };
        if let Err(err @ EvalError::Conflict { .. }) = &result {
            warn!(error = %err, "evaluation conflict");
        }
        if let (Some(store), Some(txn)) = (&self.store, opened) {
            store.abort(txn);
        }
        result
    }

    fn record(&self, timer: &str, start: Instant, results: usize) {
        let summary = RunSummary {
            results,
            elapsed_ns: start.elapsed().as_nanos(),
        };
        debug!(summary = %serde_json::to_string(&summary).unwrap_or_default(), "{timer}");
        if let Some(m) = self.metrics.as_deref().filter(|_| self.config.instrument) {
            m.timer_add(timer, start.elapsed());
        }
    }
}

/// Vars a caller can see: everything but roots, wildcards and generated
/// names.
fn visible_vars(body: &Body) -> Vec<Var> {
    body.vars()
        .into_iter()
        .filter(|v| !v.is_root() && !v.is_generated())
        .collect()
}

fn parse_refs(texts: &[String]) -> Result<Vec<Ref>, EvalError> {
    texts
        .iter()
        .map(|t| Ref::parse_dotted(t).ok_or_else(|| EvalError::InvalidRef(t.clone())))
        .collect()
}
