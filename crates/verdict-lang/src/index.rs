//! Rule index
//!
//! Given a rule-tree node, return the rules the evaluator has to try.
//! [`lookup`] drops rules whose body contains a top-level
//! `input.<path> == <constant>` test that the current input refutes;
//! [`all_rules`] returns everything (partial evaluation must not filter,
//! the input is not known yet).

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::ast::{Expr, Rule, RuleId, RuleKind, OP_EQ};
use crate::compile::RuleTreeNode;
use crate::term::{Ref, Term, INPUT_ROOT};

/// Candidate rules for one document path.
#[derive(Debug, Clone)]
pub struct IndexResult {
    pub kind: RuleKind,
    /// Non-default rules in declaration order.
    pub rules: Vec<Arc<Rule>>,
    pub else_map: BTreeMap<RuleId, Vec<Arc<Rule>>>,
    pub default: Option<Arc<Rule>>,
}

impl IndexResult {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.default.is_none()
    }

    pub fn else_chain(&self, rule: &Rule) -> &[Arc<Rule>] {
        self.else_map.get(&rule.id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Supplies the current value at an `input` path, if it is known.
pub trait ValueResolver {
    /// `None` when the value is unknown or undefined.
    fn resolve(&self, path: &Ref) -> Option<Term>;
}

impl<F> ValueResolver for F
where
    F: Fn(&Ref) -> Option<Term>,
{
    fn resolve(&self, path: &Ref) -> Option<Term> {
        self(path)
    }
}

pub fn all_rules(node: &RuleTreeNode) -> Option<IndexResult> {
    build(node, |_| true)
}

pub fn lookup(node: &RuleTreeNode, resolver: &dyn ValueResolver) -> Option<IndexResult> {
    build(node, |rule| {
        let keep = node.else_map.contains_key(&rule.id) || !refuted(rule, resolver);
        if !keep {
            trace!(rule = rule.id.0, "index excluded rule");
        }
        keep
    })
}

fn build(node: &RuleTreeNode, mut keep: impl FnMut(&Rule) -> bool) -> Option<IndexResult> {
    let kind = node.kind()?;
    let mut result = IndexResult {
        kind,
        rules: vec![],
        else_map: BTreeMap::new(),
        default: None,
    };
    for rule in &node.rules {
        if rule.default {
            result.default = Some(rule.clone());
        } else if keep(rule) {
            if let Some(chain) = node.else_map.get(&rule.id) {
                result.else_map.insert(rule.id, chain.clone());
            }
            result.rules.push(rule.clone());
        }
    }
    Some(result)
}

fn refuted(rule: &Rule, resolver: &dyn ValueResolver) -> bool {
    rule.body.iter().any(|expr| match constant_test(expr) {
        Some((path, expected)) => matches!(resolver.resolve(path), Some(actual) if actual != *expected),
        None => false,
    })
}

/// `input.a.b == "x"` (either side, `==` or `=`) as `(input.a.b, "x")`.
fn constant_test(expr: &Expr) -> Option<(&Ref, &Term)> {
    if expr.negated || !expr.with.is_empty() {
        return None;
    }
    let op = expr.operator_name()?;
    if op != "equal" && op != OP_EQ {
        return None;
    }
    let [a, b] = expr.operands() else {
        return None;
    };
    let input_path = |t: &Term| {
        t.as_ref()
            .filter(|r| r.is_rooted_at(INPUT_ROOT) && r.len() > 1 && r.is_ground_path())
            .cloned()
    };
    let is_scalar_const = |t: &Term| t.is_scalar();
    match (a.as_ref(), b.as_ref()) {
        (Some(r), _) if input_path(a).is_some() && is_scalar_const(b) => Some((r, b)),
        (_, Some(r)) if input_path(b).is_some() && is_scalar_const(a) => Some((r, a)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::Compiler;

    fn policy() -> Arc<crate::compile::CompiledPolicy> {
        Compiler::new()
            .with_source(
                r#"
                package p
                default allow = false
                allow { input.user == "alice" }
                allow { "bob" = input.user }
                allow { input.admin }
                role = "a" { input.user == "carol" } else = "b"
                "#,
            )
            .and_then(Compiler::compile)
            .expect("compile")
    }

    fn user(name: &'static str) -> impl Fn(&Ref) -> Option<Term> {
        move |r: &Ref| (r.to_string() == "input.user").then(|| Term::string(name))
    }

    #[test]
    fn lookup_filters_refuted_constant_tests() {
        let policy = policy();
        let path = Ref::parse_dotted("data.p.allow").expect("path");
        let result = policy.lookup(&path, &user("alice")).expect("rules");
        let bodies: Vec<_> = result.rules.iter().map(|r| r.body.to_string()).collect();
        assert_eq!(bodies, vec!["input.user == \"alice\"", "input.admin"]);
        assert!(result.default.is_some());

        let result = policy.lookup(&path, &|_: &Ref| -> Option<Term> { None }).expect("rules");
        assert_eq!(result.rules.len(), 3);
    }

    #[test]
    fn rules_with_else_chains_are_never_filtered() {
        let policy = policy();
        let path = Ref::parse_dotted("data.p.role").expect("path");
        let result = policy.lookup(&path, &user("dave")).expect("rules");
        assert_eq!(result.rules.len(), 1);
        assert_eq!(result.else_chain(&result.rules[0]).len(), 1);
        assert_eq!(policy.all_rules(&path).map(|r| r.rules.len()), Some(1));
    }
}
