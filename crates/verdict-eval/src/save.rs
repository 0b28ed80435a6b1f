//! Partial evaluation state
//!
//! ```text
//!   SaveSet        what is unknown: ref prefixes and (frame, var) pairs
//!   SaveStack      residual expressions recorded along the current branch,
//!                  one layer per nested query being collected
//!   SaveSupport    support rules generated so far, grouped by package
//!   InliningControl  refs that must never be inlined
//! ```

use std::collections::BTreeMap;

use verdict_lang::{Expr, ExprTerms, Module, Ref, Rule, Term, Value, Var};

use crate::bindings::{BindingStore, BindingsId};

// ============================================================================
// Save set
// ============================================================================

#[derive(Debug, Default)]
struct SaveLayer {
    refs: Vec<Ref>,
    vars: Vec<(Var, BindingsId)>,
}

#[derive(Debug, Default)]
pub struct SaveSet {
    layers: Vec<SaveLayer>,
}

impl SaveSet {
    pub fn push_refs(&mut self, refs: Vec<Ref>) {
        self.layers.push(SaveLayer { refs, vars: vec![] });
    }

    pub fn push_vars(&mut self, vars: Vec<(Var, BindingsId)>) {
        self.layers.push(SaveLayer { refs: vec![], vars });
    }

    pub fn pop(&mut self) {
        self.layers.pop();
    }

    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.refs.is_empty() && l.vars.is_empty())
    }

    /// Whether the plugged ref may read an unknown document.
    pub fn contains_ref(&self, r: &Ref) -> bool {
        self.layers.iter().flat_map(|l| &l.refs).any(|u| overlaps(u, r))
    }

    pub fn contains_var(&self, v: &Var, frame: BindingsId) -> bool {
        self.layers
            .iter()
            .flat_map(|l| &l.vars)
            .any(|(x, f)| x == v && *f == frame)
    }

    /// Unknown vars, namespaced as they appear in residual output.
    pub fn vars_namespaced(&self, caller: BindingsId) -> Vec<Var> {
        let mut out: Vec<Var> = self
            .layers
            .iter()
            .flat_map(|l| &l.vars)
            .map(|(v, f)| if *f == caller { v.clone() } else { Var::new(format!("{v}{}", f.index())) })
            .collect();
        out.sort();
        out.dedup();
        out
    }
}

/// Two refs overlap when one could be a prefix of the other. Non-ground
/// segments match anything.
pub(crate) fn overlaps(a: &Ref, b: &Ref) -> bool {
    a.0.iter()
        .zip(b.0.iter())
        .all(|(x, y)| x == y || !x.is_ground() || !y.is_ground())
}

// ============================================================================
// Save stack
// ============================================================================

/// A residual expression and the frames its terms belong to. Plugging is
/// deferred until the branch completes so later bindings are included.
#[derive(Debug, Clone)]
pub struct SavedExpr {
    pub expr: Expr,
    frames: Option<(BindingsId, BindingsId)>,
}

impl SavedExpr {
    pub fn new(expr: Expr, a: BindingsId, b: BindingsId) -> Self {
        SavedExpr {
            expr,
            frames: Some((a, b)),
        }
    }

    /// An expression that is already plugged.
    pub fn plugged(expr: Expr) -> Self {
        SavedExpr { expr, frames: None }
    }

    pub fn plug(&self, bindings: &BindingStore, caller: BindingsId) -> Expr {
        let Some((a, b)) = self.frames else {
            return self.expr.clone();
        };
        if a != b && self.expr.is_equality() {
            if let ExprTerms::Call(terms) = &self.expr.terms {
                let mut out = self.expr.clone();
                out.terms = ExprTerms::Call(vec![
                    terms[0].clone(),
                    bindings.plug_namespaced(&terms[1], a, caller),
                    bindings.plug_namespaced(&terms[2], b, caller),
                ]);
                return out;
            }
        }
        bindings.plug_expr(&self.expr, a, caller)
    }
}

#[derive(Debug)]
pub struct SaveStack {
    stack: Vec<Vec<SavedExpr>>,
}

impl Default for SaveStack {
    fn default() -> Self {
        SaveStack { stack: vec![vec![]] }
    }
}

impl SaveStack {
    pub fn push(&mut self, saved: SavedExpr) {
        if let Some(top) = self.stack.last_mut() {
            top.push(saved);
        }
    }

    pub fn pop(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.pop();
        }
    }

    pub fn push_query(&mut self, query: Vec<SavedExpr>) {
        self.stack.push(query);
    }

    pub fn pop_query(&mut self) -> Vec<SavedExpr> {
        if self.stack.len() > 1 {
            self.stack.pop().unwrap_or_default()
        } else {
            std::mem::take(&mut self.stack[0])
        }
    }

    pub fn peek_query(&self) -> &[SavedExpr] {
        self.stack.last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn plug_query(&self, bindings: &BindingStore, caller: BindingsId) -> Vec<Expr> {
        self.peek_query().iter().map(|s| s.plug(bindings, caller)).collect()
    }
}

// ============================================================================
// Support rules
// ============================================================================

#[derive(Debug, Default)]
pub struct SaveSupport {
    modules: BTreeMap<String, Module>,
}

impl SaveSupport {
    /// Add `rule` at `path` (`data.<namespace>...<name>`). The rule takes
    /// its name from the last path segment. A rule equal to one already
    /// recorded at the same path is dropped, so repeated generation of a
    /// path never duplicates its rules. Returns whether the rule was added.
    pub fn insert(&mut self, path: &Ref, mut rule: Rule) -> bool {
        let Some((name, package)) = split_path(path) else {
            return false;
        };
        rule.head.name = name;
        let rules = &mut self
            .modules
            .entry(package.to_string())
            .or_insert_with(|| Module::new(package))
            .rules;
        if rules.iter().any(|r| same_rule(r, &rule)) {
            return false;
        }
        rules.push(rule);
        true
    }

    pub fn exists(&self, path: &Ref) -> bool {
        let Some((name, package)) = split_path(path) else {
            return false;
        };
        self.modules
            .get(&package.to_string())
            .map(|m| m.rules.iter().any(|r| r.head.name == name))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<Module> {
        self.modules.values().cloned().collect()
    }
}

/// Equality ignoring ids and source locations.
fn same_rule(a: &Rule, b: &Rule) -> bool {
    a.default == b.default
        && a.head.name == b.head.name
        && a.head.args == b.head.args
        && a.head.key == b.head.key
        && a.head.value == b.head.value
        && a.body == b.body
}

fn split_path(path: &Ref) -> Option<(String, Ref)> {
    let name = path.0.last()?.as_str()?.to_string();
    (path.len() > 2).then(|| (name, path.prefix(path.len() - 1)))
}

// ============================================================================
// Inlining control
// ============================================================================

#[derive(Debug, Default)]
struct DisableLayer {
    refs: Vec<Ref>,
    /// Pushed by a `with` modifier rather than by configuration.
    from_with: bool,
}

#[derive(Debug, Default)]
pub struct InliningControl {
    pub shallow: bool,
    layers: Vec<DisableLayer>,
}

impl InliningControl {
    pub fn push_disable(&mut self, refs: Vec<Ref>, from_with: bool) {
        self.layers.push(DisableLayer { refs, from_with });
    }

    pub fn pop_disable(&mut self) {
        self.layers.pop();
    }

    pub fn disabled(&self, r: &Ref, ignore_with: bool) -> bool {
        self.layers
            .iter()
            .filter(|l| !(ignore_with && l.from_with))
            .flat_map(|l| &l.refs)
            .any(|d| d.has_prefix(r) || r.has_prefix(d))
    }
}

/// Residual bodies of a negated expression can be inlined as their
/// complement only when every positive expression's vars are already safe
/// and no operand nests refs or calls. The cross product of complements is
/// capped at `limit` bodies.
pub(crate) fn can_inline_negation(safe: &[Var], queries: &[Vec<Expr>], limit: usize) -> bool {
    let mut size: usize = 1;
    for query in queries {
        size = size.saturating_mul(query.len());
        for expr in query {
            if nests_refs_or_calls(expr) || !expr.with.is_empty() {
                return false;
            }
            if !expr.negated && expr.free_vars().iter().any(|v| !safe.contains(v)) {
                return false;
            }
        }
    }
    size <= limit
}

fn nests_refs_or_calls(expr: &Expr) -> bool {
    let operands: Vec<&Term> = match &expr.terms {
        ExprTerms::Term(t) => vec![t],
        ExprTerms::Call(_) => expr.operands().iter().collect(),
        ExprTerms::SomeDecl(_) => vec![],
    };
    operands.into_iter().any(|t| {
        let inner: Vec<&Term> = match &t.value {
            Value::Ref(r) => r.0.iter().skip(1).collect(),
            _ => vec![t],
        };
        inner.into_iter().any(|x| {
            let mut found = false;
            x.walk(&mut |y| {
                if matches!(y.value, Value::Ref(_) | Value::Call(_)) {
                    found = true;
                }
                found || y.is_comprehension()
            });
            found
        })
    })
}

/// Every way of picking one expression from each query, complemented.
pub(crate) fn complemented_product(queries: &[Vec<Expr>]) -> Vec<Vec<Expr>> {
    let mut out = vec![vec![]];
    for query in queries {
        let mut next = Vec::with_capacity(out.len() * query.len());
        for prefix in &out {
            for expr in query {
                let mut row: Vec<Expr> = prefix.clone();
                row.push(expr.complement());
                next.push(row);
            }
        }
        out = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdict_lang::parse_body;

    fn r(s: &str) -> Ref {
        Ref::parse_dotted(s).expect("ref")
    }

    fn exprs(s: &str) -> Vec<Expr> {
        parse_body(s).expect("body").to_vec()
    }

    #[test]
    fn ref_overlap_is_prefix_in_either_direction() {
        let mut set = SaveSet::default();
        set.push_refs(vec![r("input.user")]);
        assert!(set.contains_ref(&r("input.user.name")));
        assert!(set.contains_ref(&r("input")));
        assert!(!set.contains_ref(&r("input.resource")));
        set.pop();
        assert!(!set.contains_ref(&r("input.user")));
    }

    #[test]
    fn support_rules_group_by_package() {
        let mut support = SaveSupport::default();
        let path = r("data.partial.p.allow");
        assert!(!support.exists(&path));
        let rule = Rule::new(verdict_lang::Head::new("", Some(Term::boolean(true))), exprs("input.x > 1").into());
        let other = Rule::new(verdict_lang::Head::new("", Some(Term::boolean(true))), exprs("input.y > 1").into());
        assert!(support.insert(&path, rule));
        assert!(support.insert(&path, other));
        assert!(support.exists(&path));
        let modules = support.list();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].package, r("data.partial.p"));
        assert_eq!(modules[0].rules.len(), 2);
        assert_eq!(modules[0].rules[0].head.name, "allow");
    }

    #[test]
    fn repeated_support_rules_are_recorded_once() {
        let mut support = SaveSupport::default();
        let path = r("data.partial.p.allow");
        let rule = Rule::new(verdict_lang::Head::new("", Some(Term::boolean(true))), exprs("input.x > 1").into());
        let mut relocated = rule.clone();
        relocated.head.name = "other".into();
        assert!(support.insert(&path, rule.clone()));
        assert!(!support.insert(&path, rule.clone()));
        assert!(!support.insert(&path, relocated));
        assert!(support.insert(&r("data.partial.p.deny"), rule));
        let modules = support.list();
        assert_eq!(modules[0].rules.len(), 2);
    }

    #[test]
    fn inlining_respects_with_layers() {
        let mut ic = InliningControl::default();
        ic.push_disable(vec![r("data.p")], true);
        assert!(ic.disabled(&r("data.p.q"), false));
        assert!(!ic.disabled(&r("data.p.q"), true));
        ic.pop_disable();
        assert!(!ic.disabled(&r("data.p.q"), false));
    }

    #[test]
    fn negation_inlining_limit() {
        let two = exprs("input.a == 1; input.b == 2");
        let queries = vec![two.clone(), two.clone(), two.clone(), two.clone()];
        assert!(can_inline_negation(&[], &queries, 16));
        let queries = vec![two.clone(), two.clone(), two.clone(), two.clone(), two];
        assert!(!can_inline_negation(&[], &queries, 16));
    }

    #[test]
    fn negation_inlining_rejects_unsafe_vars() {
        let q = vec![exprs("x = input.a")];
        assert!(!can_inline_negation(&[], &q, 16));
        assert!(can_inline_negation(&[Var::new("x")], &q, 16));
        let nested = vec![exprs("count(input.a[input.i]) > 1")];
        assert!(!can_inline_negation(&[], &nested, 16));
    }

    #[test]
    fn product_complements_each_choice() {
        let a = exprs("input.a == 1; input.b == 2");
        let c = exprs("input.c == 3");
        let product = complemented_product(&[a, c]);
        let rendered: Vec<String> = product
            .iter()
            .map(|q| q.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))
            .collect();
        assert_eq!(
            rendered,
            vec!["not input.a == 1; not input.c == 3", "not input.b == 2; not input.c == 3"]
        );
    }
}
