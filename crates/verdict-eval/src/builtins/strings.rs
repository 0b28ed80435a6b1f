//! String and regex built-ins.

use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use parking_lot::Mutex;
use regex::Regex;
use verdict_lang::{Term, Value};

use super::{expect_number, expect_string, type_name, Builtin, BuiltinRegistry};
use crate::error::EvalError;

/// Compiled patterns shared by every run in the process.
fn regex_cache() -> &'static Mutex<AHashMap<String, Arc<Regex>>> {
    static CACHE: OnceLock<Mutex<AHashMap<String, Arc<Regex>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(AHashMap::new()))
}

fn compiled(pattern: &str) -> Result<Arc<Regex>, EvalError> {
    if let Some(re) = regex_cache().lock().get(pattern) {
        return Ok(re.clone());
    }
    let re = Arc::new(Regex::new(pattern).map_err(|e| EvalError::builtin(e.to_string()))?);
    regex_cache().lock().insert(pattern.to_string(), re.clone());
    Ok(re)
}

pub(super) fn register(r: &mut BuiltinRegistry) {
    r.register(Builtin::function("concat", 2, |args| {
        let sep = expect_string("concat", args, 0)?;
        let items: Vec<&Term> = match &args[1].value {
            Value::Array(items) => items.iter().collect(),
            Value::Set(set) => set.iter().collect(),
            _ => {
                return Err(EvalError::type_error(
                    "concat",
                    2,
                    format!("must be one of {{array, set}} but got {}", type_name(&args[1])),
                ))
            }
        };
        let parts = items
            .iter()
            .map(|t| {
                t.as_str()
                    .ok_or_else(|| EvalError::type_error("concat", 2, "must contain strings only"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Term::string(parts.join(sep)))
    }));

    fn contains(a: &str, b: &str) -> bool {
        a.contains(b)
    }
    fn startswith(a: &str, b: &str) -> bool {
        a.starts_with(b)
    }
    fn endswith(a: &str, b: &str) -> bool {
        a.ends_with(b)
    }
    for (name, f) in [
        ("contains", contains as fn(&str, &str) -> bool),
        ("startswith", startswith),
        ("endswith", endswith),
    ] {
        r.register(Builtin::function(name, 2, move |args| {
            Ok(Term::boolean(f(expect_string(name, args, 0)?, expect_string(name, args, 1)?)))
        }));
    }

    r.register(Builtin::function("lower", 1, |args| Ok(Term::string(expect_string("lower", args, 0)?.to_lowercase()))));
    r.register(Builtin::function("upper", 1, |args| Ok(Term::string(expect_string("upper", args, 0)?.to_uppercase()))));
    r.register(Builtin::function("trim_space", 1, |args| Ok(Term::string(expect_string("trim_space", args, 0)?.trim()))));
    r.register(Builtin::function("trim", 2, |args| {
        let cutset: Vec<char> = expect_string("trim", args, 1)?.chars().collect();
        Ok(Term::string(expect_string("trim", args, 0)?.trim_matches(cutset.as_slice())))
    }));
    r.register(Builtin::function("split", 2, |args| {
        let (s, sep) = (expect_string("split", args, 0)?, expect_string("split", args, 1)?);
        Ok(Term::array(s.split(sep).map(Term::string).collect()))
    }));
    r.register(Builtin::function("replace", 3, |args| {
        let s = expect_string("replace", args, 0)?;
        Ok(Term::string(s.replace(expect_string("replace", args, 1)?, expect_string("replace", args, 2)?)))
    }));
    r.register(Builtin::function("indexof", 2, |args| {
        let (s, needle) = (expect_string("indexof", args, 0)?, expect_string("indexof", args, 1)?);
        let idx = s.find(needle).map(|byte| s[..byte].chars().count() as i64).unwrap_or(-1);
        Ok(Term::int(idx))
    }));
    r.register(Builtin::function("substring", 3, |args| {
        let s = expect_string("substring", args, 0)?;
        let offset = int("substring", args, 1)?;
        let length = int("substring", args, 2)?;
        if offset < 0 {
            return Err(EvalError::builtin("negative offset"));
        }
        let chars = s.chars().skip(offset as usize);
        let out: String = if length < 0 { chars.collect() } else { chars.take(length as usize).collect() };
        Ok(Term::string(out))
    }));

    r.register(Builtin::new("regex.match", 2, |ctx, args, out| {
        let (pattern, value) = (expect_string("regex.match", args, 0)?, expect_string("regex.match", args, 1)?);
        let key = format!("regex.match/{pattern}/{value}");
        let result = match ctx.cache.get(&key) {
            Some(hit) => hit,
            None => {
                let hit = Term::boolean(compiled(pattern)?.is_match(value));
                ctx.cache.put(key, hit.clone());
                hit
            }
        };
        out(result)
    }));
}

fn int(name: &str, args: &[Term], pos: usize) -> Result<i64, EvalError> {
    expect_number(name, args, pos)?
        .as_i64()
        .ok_or_else(|| EvalError::type_error(name, pos + 1, "must be an integer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::{dispatch, BuiltinCache, BuiltinContext};

    fn call(name: &str, args: Vec<Term>) -> Result<Term, EvalError> {
        let registry = BuiltinRegistry::with_defaults();
        let cache = BuiltinCache::default();
        let ctx = BuiltinContext {
            location: None,
            cancel: None,
            cache: &cache,
            tracers: &[],
            query_id: 0,
            parent_id: 0,
        };
        let mut out = None;
        dispatch(registry.get(name).expect("registered"), &ctx, &args, &mut |t| {
            out = Some(t);
            Ok(())
        })?;
        Ok(out.expect("one result"))
    }

    fn s(x: &str) -> Term {
        Term::string(x)
    }

    #[test]
    fn string_functions() {
        let words = Term::array(vec![s("a"), s("b")]);
        assert_eq!(call("concat", vec![s(","), words]).expect("concat"), s("a,b"));
        assert_eq!(call("startswith", vec![s("alice"), s("al")]).expect("sw"), Term::boolean(true));
        assert_eq!(call("upper", vec![s("abc")]).expect("upper"), s("ABC"));
        assert_eq!(call("indexof", vec![s("héllo"), s("l")]).expect("indexof"), Term::int(2));
        assert_eq!(call("substring", vec![s("abcdef"), Term::int(1), Term::int(3)]).expect("sub"), s("bcd"));
        assert_eq!(call("trim", vec![s("--x--"), s("-")]).expect("trim"), s("x"));
        assert!(matches!(
            call("lower", vec![Term::int(1)]),
            Err(EvalError::Type { position: 1, .. })
        ));
    }

    #[test]
    fn regex_match_uses_shared_cache() {
        assert_eq!(call("regex.match", vec![s("^a+$"), s("aaa")]).expect("match"), Term::boolean(true));
        assert_eq!(call("regex.match", vec![s("^a+$"), s("ab")]).expect("match"), Term::boolean(false));
        assert!(regex_cache().lock().contains_key("^a+$"));
        assert!(matches!(call("regex.match", vec![s("("), s("x")]), Err(EvalError::Builtin { .. })));
    }
}
