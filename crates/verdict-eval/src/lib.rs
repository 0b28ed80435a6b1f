//! Verdict: query evaluation over policies and JSON documents
//!
//! Evaluates ad-hoc queries against a compiled policy, an `input` document
//! and base documents read from a [`verdict_storage::Storage`].
//!
//! Key pieces:
//! 1. **Unification**: two-sided unification over terms in separate frames,
//!    with exact undo on backtracking (`bindings`)
//! 2. **Document resolution**: refs walk the rule tree, then base documents
//!    or rule values (`resolve`)
//! 3. **Rule evaluation**: complete, partial set/object and function rules
//!    with else chains, defaults and conflict detection (`rules`)
//! 4. **Caching**: base documents per run, virtual documents per `with` scope
//! 5. **Partial evaluation**: unknowns are saved instead of evaluated,
//!    producing residual queries and support rules (`save`, `copyprop`)
//!
//! ## Module Organization
//!
//! - `query`: the public facade (`Query::run`, `iter`, `partial_run`)
//! - `eval`: expression evaluation, unification, calls, negation, `with`
//! - `builtins`: built-in registry and the standard functions

mod bindings;
pub mod builtins;
mod cache;
pub mod cancel;
pub mod config;
mod copyprop;
pub mod error;
mod eval;
pub mod metrics;
mod query;
mod resolve;
mod rules;
mod save;
pub mod tracer;

pub use builtins::{Builtin, BuiltinContext, BuiltinRegistry};
pub use cancel::Cancel;
pub use config::EvalConfig;
pub use error::EvalError;
pub use metrics::Metrics;
pub use query::{PartialResult, Query, QueryResult};
pub use tracer::{BufferTracer, Event, Op, QueryTracer};

#[cfg(test)]
mod tests;
