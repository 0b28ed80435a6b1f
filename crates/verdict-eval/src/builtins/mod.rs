//! Built-in functions
//!
//! A built-in receives its plugged, ground operands and reports each
//! result through a callback; it may report zero, one or many results.
//! The callback runs the rest of the evaluation. Errors the callback
//! returns belong to the caller and pass through untouched; errors the
//! built-in raises itself are attributed to its name and call location by
//! [`dispatch`].

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;
use verdict_lang::{Location, Term};

use crate::cancel::Cancel;
use crate::error::EvalError;
use crate::tracer::QueryTracer;

mod operators;
mod strings;

pub type BuiltinFn = Arc<
    dyn Fn(&BuiltinContext<'_>, &[Term], &mut dyn FnMut(Term) -> Result<(), EvalError>) -> Result<(), EvalError>
        + Send
        + Sync,
>;

/// Values a built-in may memoize for the rest of one run.
#[derive(Debug, Default)]
pub struct BuiltinCache {
    entries: RefCell<AHashMap<String, Term>>,
}

impl BuiltinCache {
    pub fn get(&self, key: &str) -> Option<Term> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn put(&self, key: impl Into<String>, value: Term) {
        self.entries.borrow_mut().insert(key.into(), value);
    }
}

/// What a built-in can see of the evaluation calling it.
pub struct BuiltinContext<'a> {
    pub location: Option<Location>,
    pub cancel: Option<&'a Cancel>,
    pub cache: &'a BuiltinCache,
    /// Tracers active for the run, in registration order.
    pub tracers: &'a [Arc<dyn QueryTracer>],
    pub query_id: u64,
    pub parent_id: u64,
}

impl BuiltinContext<'_> {
    pub fn check_cancel(&self) -> Result<(), EvalError> {
        match self.cancel {
            Some(c) if c.is_cancelled() => Err(EvalError::Cancelled),
            _ => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct Builtin {
    pub name: String,
    /// Number of input operands; a call with one extra operand captures
    /// the result in it.
    pub arity: usize,
    pub func: BuiltinFn,
}

impl fmt::Debug for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builtin")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

impl Builtin {
    pub fn new<F>(name: impl Into<String>, arity: usize, func: F) -> Self
    where
        F: Fn(&BuiltinContext<'_>, &[Term], &mut dyn FnMut(Term) -> Result<(), EvalError>) -> Result<(), EvalError>
            + Send
            + Sync
            + 'static,
    {
        Builtin {
            name: name.into(),
            arity,
            func: Arc::new(func),
        }
    }

    /// A deterministic built-in producing exactly one result.
    pub fn function<F>(name: impl Into<String>, arity: usize, func: F) -> Self
    where
        F: Fn(&[Term]) -> Result<Term, EvalError> + Send + Sync + 'static,
    {
        Builtin::new(name, arity, move |_, args, out| out(func(args)?))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuiltinRegistry {
    table: AHashMap<String, Builtin>,
}

impl BuiltinRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every standard built-in.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        operators::register(&mut registry);
        strings::register(&mut registry);
        registry
    }

    pub fn register(&mut self, builtin: Builtin) {
        self.table.insert(builtin.name.clone(), builtin);
    }

    pub fn get(&self, name: &str) -> Option<&Builtin> {
        self.table.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.table.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Invoke `builtin`, keeping errors from `k` apart from the built-in's own.
pub(crate) fn dispatch(
    builtin: &Builtin,
    ctx: &BuiltinContext<'_>,
    args: &[Term],
    k: &mut dyn FnMut(Term) -> Result<(), EvalError>,
) -> Result<(), EvalError> {
    let mut halted: Option<EvalError> = None;
    let result = (builtin.func)(ctx, args, &mut |out| match k(out) {
        Ok(()) => Ok(()),
        Err(err) => {
            halted = Some(err);
            Err(EvalError::Internal("evaluation halted".into()))
        }
    });
    match (result, halted) {
        (_, Some(err)) => Err(err),
        (Ok(()), None) => Ok(()),
        (Err(err), None) => Err(err.attribute(&builtin.name, ctx.location)),
    }
}

// ----------------------------------------------------------------------------
// Operand helpers shared by the built-in modules
// ----------------------------------------------------------------------------

pub(crate) fn type_name(t: &Term) -> &'static str {
    use verdict_lang::Value;
    match &t.value {
        Value::Null => "null",
        Value::Boolean(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
        Value::Set(_) => "set",
        _ => "unknown",
    }
}

pub(crate) fn expect_number(name: &str, args: &[Term], pos: usize) -> Result<verdict_lang::Number, EvalError> {
    args[pos]
        .as_number()
        .ok_or_else(|| EvalError::type_error(name, pos + 1, format!("must be number but got {}", type_name(&args[pos]))))
}

pub(crate) fn expect_string<'a>(name: &str, args: &'a [Term], pos: usize) -> Result<&'a str, EvalError> {
    args[pos]
        .as_str()
        .ok_or_else(|| EvalError::type_error(name, pos + 1, format!("must be string but got {}", type_name(&args[pos]))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(cache: &BuiltinCache) -> BuiltinContext<'_> {
        BuiltinContext {
            location: Some(Location::new(3, 7)),
            cancel: None,
            cache,
            tracers: &[],
            query_id: 0,
            parent_id: 0,
        }
    }

    #[test]
    fn builtin_errors_are_attributed_continuation_errors_are_not() {
        let cache = BuiltinCache::default();
        let failing = Builtin::function("boom", 0, |_| Err(EvalError::builtin("nope")));
        let err = dispatch(&failing, &ctx(&cache), &[], &mut |_| Ok(())).expect_err("builtin error");
        assert_eq!(
            err,
            EvalError::Builtin {
                name: "boom".into(),
                location: Some(Location::new(3, 7)),
                message: "nope".into()
            }
        );

        let ok = Builtin::function("one", 0, |_| Ok(Term::int(1)));
        let err = dispatch(&ok, &ctx(&cache), &[], &mut |_| Err(EvalError::conflict("later", None)))
            .expect_err("continuation error");
        assert_eq!(err, EvalError::conflict("later", None));
    }

    #[test]
    fn type_errors_get_the_call_location() {
        let registry = BuiltinRegistry::with_defaults();
        let plus = registry.get("plus").expect("plus");
        let cache = BuiltinCache::default();
        let err = dispatch(plus, &ctx(&cache), &[Term::string("a"), Term::int(1)], &mut |_| Ok(()))
            .expect_err("type error");
        match err {
            EvalError::Type {
                builtin,
                position,
                location,
                ..
            } => {
                assert_eq!(builtin, "plus");
                assert_eq!(position, 1);
                assert_eq!(location, Some(Location::new(3, 7)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
