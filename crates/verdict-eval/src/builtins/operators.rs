//! Comparison, arithmetic, set, aggregate, type and collection built-ins.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use verdict_lang::{Number, Term, Value};

use super::{expect_number, type_name, Builtin, BuiltinRegistry};
use crate::error::EvalError;

pub(super) fn register(r: &mut BuiltinRegistry) {
    for (name, op) in [
        ("equal", Ordering::is_eq as fn(Ordering) -> bool),
        ("neq", Ordering::is_ne),
        ("lt", Ordering::is_lt),
        ("gt", Ordering::is_gt),
        ("lte", Ordering::is_le),
        ("gte", Ordering::is_ge),
    ] {
        r.register(Builtin::function(name, 2, move |args| {
            Ok(Term::boolean(op(args[0].cmp(&args[1]))))
        }));
    }

    r.register(Builtin::function("plus", 2, |args| arith("plus", args, |a, b| Some(a.checked_add(b)))));
    r.register(Builtin::function("mul", 2, |args| arith("mul", args, |a, b| Some(a.checked_mul(b)))));
    r.register(Builtin::function("div", 2, |args| arith("div", args, Number::checked_div)));
    r.register(Builtin::function("rem", 2, |args| arith("rem", args, Number::checked_rem)));
    r.register(Builtin::function("minus", 2, |args| match (&args[0].value, &args[1].value) {
        (Value::Set(a), Value::Set(b)) => Ok(Term::set(a.difference(b).cloned())),
        _ => arith("minus", args, |a, b| Some(a.checked_sub(b))),
    }));
    r.register(Builtin::function("abs", 1, |args| {
        let n = expect_number("abs", args, 0)?;
        Ok(Term::number(match n {
            Number::Int(i) => i.checked_abs().map(Number::Int).unwrap_or_else(|| Number::from_f64((i as f64).abs())),
            Number::Float(f) => Number::from_f64(f.abs()),
        }))
    }));
    for (name, f) in [
        ("round", f64::round as fn(f64) -> f64),
        ("ceil", f64::ceil),
        ("floor", f64::floor),
    ] {
        r.register(Builtin::function(name, 1, move |args| {
            Ok(Term::number(Number::from_f64(f(expect_number(name, args, 0)?.as_f64()))))
        }));
    }

    r.register(Builtin::function("and", 2, |args| {
        let (a, b) = (set("and", args, 0)?, set("and", args, 1)?);
        Ok(Term::set(a.intersection(b).cloned()))
    }));
    r.register(Builtin::function("or", 2, |args| {
        let (a, b) = (set("or", args, 0)?, set("or", args, 1)?);
        Ok(Term::set(a.union(b).cloned()))
    }));

    r.register(Builtin::function("count", 1, |args| {
        let n = match &args[0].value {
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            Value::Object(obj) => obj.len(),
            Value::Set(set) => set.len(),
            _ => {
                return Err(EvalError::type_error(
                    "count",
                    1,
                    format!("must be one of {{array, object, set, string}} but got {}", type_name(&args[0])),
                ))
            }
        };
        Ok(Term::int(n as i64))
    }));
    r.register(Builtin::function("sum", 1, |args| {
        let ns = numbers("sum", &args[0])?;
        Ok(Term::number(ns.into_iter().fold(Number::Int(0), Number::checked_add)))
    }));
    r.register(Builtin::function("product", 1, |args| {
        let ns = numbers("product", &args[0])?;
        Ok(Term::number(ns.into_iter().fold(Number::Int(1), Number::checked_mul)))
    }));
    r.register(Builtin::new("max", 1, |_, args, out| match collection("max", &args[0])?.into_iter().max() {
        Some(t) => out(t),
        None => Ok(()),
    }));
    r.register(Builtin::new("min", 1, |_, args, out| match collection("min", &args[0])?.into_iter().min() {
        Some(t) => out(t),
        None => Ok(()),
    }));
    r.register(Builtin::function("sort", 1, |args| {
        let mut items = collection("sort", &args[0])?;
        items.sort();
        Ok(Term::array(items))
    }));

    for (name, kind) in [
        ("is_null", "null"),
        ("is_boolean", "boolean"),
        ("is_number", "number"),
        ("is_string", "string"),
        ("is_array", "array"),
        ("is_object", "object"),
        ("is_set", "set"),
    ] {
        r.register(Builtin::function(name, 1, move |args| Ok(Term::boolean(type_name(&args[0]) == kind))));
    }
    r.register(Builtin::function("type_name", 1, |args| Ok(Term::string(type_name(&args[0])))));
    r.register(Builtin::function("to_number", 1, |args| {
        let n = match &args[0].value {
            Value::Null => Number::Int(0),
            Value::Boolean(b) => Number::Int(i64::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => match s.parse::<i64>() {
                Ok(i) => Number::Int(i),
                Err(_) => s
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Number::from_f64)
                    .ok_or_else(|| EvalError::builtin(format!("invalid syntax: {s:?}")))?,
            },
            _ => {
                return Err(EvalError::type_error(
                    "to_number",
                    1,
                    format!("must be one of {{null, boolean, number, string}} but got {}", type_name(&args[0])),
                ))
            }
        };
        Ok(Term::number(n))
    }));

    r.register(Builtin::function("object.get", 3, |args| {
        let Value::Object(obj) = &args[0].value else {
            return Err(EvalError::type_error("object.get", 1, format!("must be object but got {}", type_name(&args[0]))));
        };
        let found = match &args[1].value {
            // An array key is a path into nested objects.
            Value::Array(path) => path.iter().try_fold(&args[0], |node, key| node.get(key)),
            _ => obj.get(&args[1]),
        };
        Ok(found.cloned().unwrap_or_else(|| args[2].clone()))
    }));
    r.register(Builtin::function("object.keys", 1, |args| match &args[0].value {
        Value::Object(obj) => Ok(Term::set(obj.keys().cloned())),
        _ => Err(EvalError::type_error("object.keys", 1, format!("must be object but got {}", type_name(&args[0])))),
    }));
    r.register(Builtin::function("array.concat", 2, |args| {
        let mut items = array("array.concat", args, 0)?.to_vec();
        items.extend(array("array.concat", args, 1)?.iter().cloned());
        Ok(Term::array(items))
    }));
    r.register(Builtin::function("array.slice", 3, |args| {
        let items = array("array.slice", args, 0)?;
        let clamp = |pos: usize| -> Result<usize, EvalError> {
            let n = expect_number("array.slice", args, pos)?
                .as_i64()
                .ok_or_else(|| EvalError::type_error("array.slice", pos + 1, "must be an integer"))?;
            Ok(n.clamp(0, items.len() as i64) as usize)
        };
        let (start, end) = (clamp(1)?, clamp(2)?);
        Ok(Term::array(if start < end { items[start..end].to_vec() } else { vec![] }))
    }));
    r.register(Builtin::function("numbers.range", 2, |args| {
        let bound = |pos: usize| -> Result<i64, EvalError> {
            expect_number("numbers.range", args, pos)?
                .as_i64()
                .ok_or_else(|| EvalError::type_error("numbers.range", pos + 1, "must be an integer"))
        };
        let (a, b) = (bound(0)?, bound(1)?);
        let items: Vec<Term> = if a <= b {
            (a..=b).map(Term::int).collect()
        } else {
            (b..=a).rev().map(Term::int).collect()
        };
        Ok(Term::array(items))
    }));

    // `x in xs`
    r.register(Builtin::function("internal.member_2", 2, |args| {
        let x = &args[0];
        let found = match &args[1].value {
            Value::Array(items) => items.contains(x),
            Value::Set(set) => set.contains(x),
            Value::Object(obj) => obj.values().any(|v| v == x),
            _ => false,
        };
        Ok(Term::boolean(found))
    }));
}

fn arith(name: &str, args: &[Term], f: impl Fn(Number, Number) -> Option<Number>) -> Result<Term, EvalError> {
    let (a, b) = (expect_number(name, args, 0)?, expect_number(name, args, 1)?);
    f(a, b)
        .map(Term::number)
        .ok_or_else(|| EvalError::builtin(if name == "rem" { "modulo by zero or non-integer" } else { "divide by zero" }))
}

fn set<'a>(name: &str, args: &'a [Term], pos: usize) -> Result<&'a BTreeSet<Term>, EvalError> {
    match &args[pos].value {
        Value::Set(s) => Ok(s),
        _ => Err(EvalError::type_error(name, pos + 1, format!("must be set but got {}", type_name(&args[pos])))),
    }
}

fn array<'a>(name: &str, args: &'a [Term], pos: usize) -> Result<&'a [Term], EvalError> {
    match &args[pos].value {
        Value::Array(items) => Ok(items.as_slice()),
        _ => Err(EvalError::type_error(name, pos + 1, format!("must be array but got {}", type_name(&args[pos])))),
    }
}

fn collection(name: &str, t: &Term) -> Result<Vec<Term>, EvalError> {
    match &t.value {
        Value::Array(items) => Ok(items.to_vec()),
        Value::Set(set) => Ok(set.iter().cloned().collect()),
        _ => Err(EvalError::type_error(name, 1, format!("must be one of {{array, set}} but got {}", type_name(t)))),
    }
}

fn numbers(name: &str, t: &Term) -> Result<Vec<Number>, EvalError> {
    collection(name, t)?
        .iter()
        .map(|x| {
            x.as_number()
                .ok_or_else(|| EvalError::type_error(name, 1, format!("must contain numbers but got {}", type_name(x))))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::{dispatch, BuiltinCache, BuiltinContext};
    use verdict_lang::parse_term;

    fn call(name: &str, args: &[&str]) -> Result<Vec<Term>, EvalError> {
        let registry = BuiltinRegistry::with_defaults();
        let builtin = registry.get(name).expect("registered");
        let cache = BuiltinCache::default();
        let ctx = BuiltinContext {
            location: None,
            cancel: None,
            cache: &cache,
            tracers: &[],
            query_id: 0,
            parent_id: 0,
        };
        let args: Vec<Term> = args.iter().map(|a| parse_term(a).expect("term")).collect();
        let mut out = vec![];
        dispatch(builtin, &ctx, &args, &mut |t| {
            out.push(t);
            Ok(())
        })?;
        Ok(out)
    }

    fn one(name: &str, args: &[&str]) -> String {
        let out = call(name, args).expect("call");
        assert_eq!(out.len(), 1, "{name}");
        out[0].to_string()
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(one("plus", &["1", "1"]), "2");
        assert_eq!(one("div", &["7", "2"]), "3.5");
        assert_eq!(one("rem", &["7", "2"]), "1");
        assert_eq!(one("lt", &["1", "\"a\""]), "true");
        assert_eq!(one("minus", &["{1, 2, 3}", "{2}"]), "{1, 3}");
        assert!(matches!(call("div", &["1", "0"]), Err(EvalError::Builtin { .. })));
    }

    #[test]
    fn aggregates() {
        assert_eq!(one("count", &["\"héllo\""]), "5");
        assert_eq!(one("sum", &["[1, 2, 3.5]"]), "6.5");
        assert_eq!(one("max", &["{3, 1, 2}"]), "3");
        assert!(call("max", &["[]"]).expect("call").is_empty());
        assert_eq!(one("sort", &["{\"b\", \"a\"}"]), "[\"a\", \"b\"]");
        assert!(matches!(call("count", &["1"]), Err(EvalError::Type { position: 1, .. })));
    }

    #[test]
    fn collections_and_membership() {
        assert_eq!(one("object.get", &["{\"a\": {\"b\": 1}}", "[\"a\", \"b\"]", "0"]), "1");
        assert_eq!(one("object.get", &["{\"a\": 1}", "\"z\"", "0"]), "0");
        assert_eq!(one("array.slice", &["[1, 2, 3, 4]", "1", "9"]), "[2, 3, 4]");
        assert_eq!(one("internal.member_2", &["2", "[1, 2]"]), "true");
        assert_eq!(one("internal.member_2", &["2", "{\"a\": 3}"]), "false");
        assert_eq!(one("numbers.range", &["3", "1"]), "[3, 2, 1]");
        assert_eq!(one("to_number", &["\"2.5\""]), "2.5");
    }
}
