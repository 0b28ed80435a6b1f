//! Module compilation
//!
//! ```text
//!   Module ──► resolve names ──► localize comprehension vars ──► RuleTree
//!    (AST)     (rule names,        (`x := ...` inside a           (data.<pkg>.<rule>
//!               import aliases)     closure becomes __localN__)    keyed nodes)
//! ```
//!
//! The evaluator only ever sees compiled rules: every reference to a rule
//! of the same package or to an import alias has been rewritten into a
//! `data` ref, every rule carries a unique [`RuleId`], and each rule-tree
//! node knows its rules, default and else chains.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::ast::{Body, Expr, ExprTerms, Module, Rule, RuleId, RuleKind, With, OP_ASSIGN};
use crate::index::{self, IndexResult, ValueResolver};
use crate::parser::{parse_module, ParseError};
use crate::term::{
    ArrayComprehension, Location, ObjectComprehension, Ref, SetComprehension, Term, Value, Var,
    DATA_ROOT,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{path}: conflicting rule kinds ({first} and {second}) at {location}")]
    KindConflict {
        path: String,
        first: RuleKind,
        second: RuleKind,
        location: Location,
    },

    #[error("{path}: multiple default rules at {location}")]
    MultipleDefaults { path: String, location: Location },

    #[error("{path}: function arity mismatch at {location}")]
    ArityMismatch { path: String, location: Location },

    #[error("{path}: rules cannot be defined both at and below this path")]
    PathConflict { path: String },
}

// ============================================================================
// Rule tree
// ============================================================================

/// One node of the rule tree. Nodes holding rules are leaves.
#[derive(Debug, Clone)]
pub struct RuleTreeNode {
    pub key: Term,
    /// Rules defined at this path in declaration order, default included.
    pub rules: Vec<Arc<Rule>>,
    /// Else chain of each rule that has one, in declaration order.
    pub else_map: BTreeMap<RuleId, Vec<Arc<Rule>>>,
    pub children: BTreeMap<Term, RuleTreeNode>,
}

impl RuleTreeNode {
    fn new(key: Term) -> Self {
        RuleTreeNode {
            key,
            rules: vec![],
            else_map: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    pub fn child(&self, key: &Term) -> Option<&RuleTreeNode> {
        self.children.get(key)
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    pub fn kind(&self) -> Option<RuleKind> {
        self.rules.first().map(|r| r.kind())
    }
}

/// Rule tree rooted at `data`.
#[derive(Debug, Clone)]
pub struct RuleTree {
    root: RuleTreeNode,
}

impl RuleTree {
    pub fn root(&self) -> &RuleTreeNode {
        &self.root
    }

    /// Node at `path` (segments below `data`).
    pub fn node(&self, path: &[Term]) -> Option<&RuleTreeNode> {
        path.iter().try_fold(&self.root, |node, key| node.child(key))
    }

    fn node_mut(&mut self, path: &[Term]) -> &mut RuleTreeNode {
        let mut node = &mut self.root;
        for key in path {
            node = node
                .children
                .entry(key.clone())
                .or_insert_with(|| RuleTreeNode::new(key.clone()));
        }
        node
    }
}

// ============================================================================
// Compiled policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    tree: RuleTree,
    modules: Vec<Module>,
}

impl CompiledPolicy {
    /// A policy with no rules.
    pub fn empty() -> Arc<Self> {
        Arc::new(CompiledPolicy {
            tree: RuleTree {
                root: RuleTreeNode::new(Term::var(DATA_ROOT)),
            },
            modules: vec![],
        })
    }

    pub fn rule_tree(&self) -> &RuleTree {
        &self.tree
    }

    /// Compiled modules, in the order they were added.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Rules at `path` that the current input cannot statically exclude.
    pub fn lookup(&self, path: &Ref, resolver: &dyn ValueResolver) -> Option<IndexResult> {
        index::lookup(self.tree.node(data_segments(path)?)?, resolver)
    }

    /// Every rule at `path`, unfiltered.
    pub fn all_rules(&self, path: &Ref) -> Option<IndexResult> {
        index::all_rules(self.tree.node(data_segments(path)?)?)
    }

    /// Prepare an ad-hoc query body for evaluation.
    pub fn compile_query(&self, body: &Body) -> Body {
        compile_query(body)
    }
}

fn data_segments(path: &Ref) -> Option<&[Term]> {
    path.is_rooted_at(DATA_ROOT).then(|| &path.0[1..])
}

/// Localize comprehension-declared vars in a query body.
pub fn compile_query(body: &Body) -> Body {
    let mut localizer = Localizer::default();
    Body::new(body.iter().map(|e| localizer.expr(e)).collect())
}

// ============================================================================
// Compiler
// ============================================================================

#[derive(Debug, Default)]
pub struct Compiler {
    modules: Vec<Module>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, module: Module) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_source(self, source: &str) -> Result<Self, CompileError> {
        Ok(self.with_module(parse_module(source)?))
    }

    pub fn compile(self) -> Result<Arc<CompiledPolicy>, CompileError> {
        let mut tree = RuleTree {
            root: RuleTreeNode::new(Term::var(DATA_ROOT)),
        };
        let mut next_id = 0u32;
        let mut modules = Vec::with_capacity(self.modules.len());

        for module in self.modules {
            let module = Scope::new(&module).compile(module, &mut next_id);
            for rule in &module.rules {
                let mut path = module.package.0[1..].to_vec();
                path.push(Term::string(&rule.head.name));
                let node = tree.node_mut(&path);
                let mut chain = vec![];
                let mut next = rule.else_rule.as_deref();
                while let Some(e) = next {
                    chain.push(Arc::new(e.clone()));
                    next = e.else_rule.as_deref();
                }
                if !chain.is_empty() {
                    node.else_map.insert(rule.id, chain);
                }
                node.rules.push(Arc::new(rule.clone()));
            }
            modules.push(module);
        }

        check_node(&tree.root, &Ref(vec![Term::var(DATA_ROOT)]))?;
        debug!(modules = modules.len(), rules = next_id, "compiled policy");
        Ok(Arc::new(CompiledPolicy { tree, modules }))
    }
}

fn check_node(node: &RuleTreeNode, path: &Ref) -> Result<(), CompileError> {
    if node.has_rules() {
        if !node.children.is_empty() {
            return Err(CompileError::PathConflict {
                path: path.to_string(),
            });
        }
        let first = &node.rules[0];
        let mut defaults = 0;
        for rule in &node.rules {
            let location = rule.location.unwrap_or_default();
            if rule.kind() != first.kind() {
                return Err(CompileError::KindConflict {
                    path: path.to_string(),
                    first: first.kind(),
                    second: rule.kind(),
                    location,
                });
            }
            if rule.head.args.len() != first.head.args.len() {
                return Err(CompileError::ArityMismatch {
                    path: path.to_string(),
                    location,
                });
            }
            if rule.default {
                defaults += 1;
                if defaults > 1 {
                    return Err(CompileError::MultipleDefaults {
                        path: path.to_string(),
                        location,
                    });
                }
            }
        }
    }
    for (key, child) in &node.children {
        check_node(child, &path.append(key.clone()))?;
    }
    Ok(())
}

// ============================================================================
// Name resolution
// ============================================================================

/// Names visible inside one module.
struct Scope {
    package: Ref,
    rules: BTreeSet<String>,
    imports: BTreeMap<String, Ref>,
}

impl Scope {
    fn new(module: &Module) -> Self {
        Scope {
            package: module.package.clone(),
            rules: module.rules.iter().map(|r| r.head.name.clone()).collect(),
            imports: module
                .imports
                .iter()
                .filter_map(|i| Some((i.name()?, i.path.clone())))
                .collect(),
        }
    }

    fn compile(&self, mut module: Module, next_id: &mut u32) -> Module {
        module.rules = std::mem::take(&mut module.rules)
            .into_iter()
            .map(|r| self.rule(r, next_id))
            .collect();
        module
    }

    fn rule(&self, mut rule: Rule, next_id: &mut u32) -> Rule {
        let declared = declared_vars(&rule);
        let mut localizer = Localizer::default();
        let mut fix = |t: &Term| localizer.term(&self.term(t, &declared));

        rule.head.key = rule.head.key.as_ref().map(&mut fix);
        rule.head.value = rule.head.value.as_ref().map(&mut fix);
        let mut body: Vec<Expr> = rule.body.iter().map(|e| self.expr(e, &declared)).collect();

        rule.id = RuleId(*next_id);
        // Head terms that need evaluation move into the body.
        let mut hoist = |slot: &mut Option<Term>, name: &str| {
            if let Some(t) = slot.as_ref().filter(|t| t.has_dynamic()) {
                let var = Term::var(format!("__{name}{}__", rule.id.0)).with_location(t.location);
                body.push(Expr::equality(var.clone(), t.clone()).with_location(t.location));
                *slot = Some(var);
            }
        };
        hoist(&mut rule.head.key, "key");
        hoist(&mut rule.head.value, "value");
        rule.body = Body::new(body.iter().map(|e| localizer.expr(e)).collect());

        *next_id += 1;
        rule.else_rule = rule.else_rule.map(|e| Box::new(self.rule(*e, next_id)));
        rule
    }

    fn expr(&self, expr: &Expr, declared: &BTreeSet<Var>) -> Expr {
        let terms = match &expr.terms {
            ExprTerms::Term(t) => ExprTerms::Term(self.term(t, declared)),
            ExprTerms::Call(terms) => match self.term(&Term::new(Value::Call(terms.clone())), declared).value {
                Value::Call(terms) => ExprTerms::Call(terms),
                _ => ExprTerms::Call(terms.clone()),
            },
            ExprTerms::SomeDecl(vars) => ExprTerms::SomeDecl(vars.clone()),
        };
        Expr {
            terms,
            with: expr
                .with
                .iter()
                .map(|w| With {
                    target: w.target.clone(),
                    value: self.term(&w.value, declared),
                })
                .collect(),
            ..expr.clone()
        }
    }

    fn var(&self, v: &Var, declared: &BTreeSet<Var>) -> Option<Ref> {
        if declared.contains(v) || v.is_root() || v.is_generated() {
            return None;
        }
        if self.rules.contains(v.name()) {
            return Some(self.package.append(Term::string(v.name())));
        }
        self.imports.get(v.name()).cloned()
    }

    fn term(&self, t: &Term, declared: &BTreeSet<Var>) -> Term {
        let value = match &t.value {
            Value::Var(v) => match self.var(v, declared) {
                Some(r) => Value::Ref(r),
                None => return t.clone(),
            },
            Value::Ref(r) => {
                let mut terms: Vec<Term> = r.0.iter().map(|x| self.term(x, declared)).collect();
                if let Some(Value::Ref(head)) = terms.first().map(|h| h.value.clone()) {
                    let mut spliced = head.0;
                    spliced.extend(terms.drain(1..));
                    terms = spliced;
                }
                Value::Ref(Ref(terms))
            }
            Value::Call(terms) => {
                let operator = match terms.first().and_then(Term::as_ref) {
                    Some(op) => self.operator(op, declared),
                    None => return t.clone(),
                };
                let mut out = vec![Term::reference(operator).with_location(terms[0].location)];
                out.extend(terms[1..].iter().map(|x| self.term(x, declared)));
                Value::Call(out)
            }
            Value::Array(items) => Value::Array(Arc::new(items.iter().map(|x| self.term(x, declared)).collect())),
            Value::Set(items) => Value::Set(Arc::new(items.iter().map(|x| self.term(x, declared)).collect())),
            Value::Object(obj) => Value::Object(Arc::new(
                obj.iter()
                    .map(|(k, v)| (self.term(k, declared), self.term(v, declared)))
                    .collect(),
            )),
            Value::ArrayComprehension(c) => Value::ArrayComprehension(Box::new(ArrayComprehension {
                term: self.term(&c.term, declared),
                body: self.body(&c.body, declared),
            })),
            Value::SetComprehension(c) => Value::SetComprehension(Box::new(SetComprehension {
                term: self.term(&c.term, declared),
                body: self.body(&c.body, declared),
            })),
            Value::ObjectComprehension(c) => Value::ObjectComprehension(Box::new(ObjectComprehension {
                key: self.term(&c.key, declared),
                value: self.term(&c.value, declared),
                body: self.body(&c.body, declared),
            })),
            _ => return t.clone(),
        };
        Term {
            value,
            location: t.location,
        }
    }

    fn body(&self, body: &Body, declared: &BTreeSet<Var>) -> Body {
        Body::new(body.iter().map(|e| self.expr(e, declared)).collect())
    }

    /// `f(x)` calling a rule of this package, or `alias.f(x)` through an import.
    fn operator(&self, op: &Ref, declared: &BTreeSet<Var>) -> Ref {
        match op.head_var() {
            Some(v) if op.len() == 1 && self.rules.contains(v.name()) && !declared.contains(v) => {
                self.package.append(Term::string(v.name()))
            }
            Some(v) if !declared.contains(v) => match self.imports.get(v.name()) {
                Some(path) => path.concat(&op.0[1..]),
                None => op.clone(),
            },
            _ => op.clone(),
        }
    }
}

/// Vars a rule declares itself: arguments, `:=` targets and `some` vars.
fn declared_vars(rule: &Rule) -> BTreeSet<Var> {
    let mut out = BTreeSet::new();
    for arg in &rule.head.args {
        out.extend(arg.vars());
    }
    collect_declared(&rule.body, &mut out);
    out
}

fn collect_declared(body: &Body, out: &mut BTreeSet<Var>) {
    for expr in body.iter() {
        out.extend(top_level_declared(expr));
        expr.walk_terms(&mut |t| {
            match &t.value {
                Value::ArrayComprehension(c) => collect_declared(&c.body, out),
                Value::SetComprehension(c) => collect_declared(&c.body, out),
                Value::ObjectComprehension(c) => collect_declared(&c.body, out),
                _ => return false,
            }
            true
        });
    }
}

fn top_level_declared(expr: &Expr) -> BTreeSet<Var> {
    match &expr.terms {
        ExprTerms::SomeDecl(vars) => vars.iter().filter_map(|t| t.as_var().cloned()).collect(),
        ExprTerms::Call(_) if expr.operator_name().as_deref() == Some(OP_ASSIGN) => {
            expr.operands().first().map(Term::vars).unwrap_or_default()
        }
        _ => BTreeSet::new(),
    }
}

// ============================================================================
// Comprehension locals
// ============================================================================

/// Renames vars declared inside comprehension bodies to `__localN__`.
/// Comprehension bodies share their enclosing frame, so a local `x`
/// must not capture an outer `x`.
#[derive(Default)]
struct Localizer {
    next: usize,
}

impl Localizer {
    fn expr(&mut self, expr: &Expr) -> Expr {
        let terms = match &expr.terms {
            ExprTerms::Term(t) => ExprTerms::Term(self.term(t)),
            ExprTerms::Call(terms) => {
                let mut out = vec![terms[0].clone()];
                out.extend(terms[1..].iter().map(|t| self.term(t)));
                ExprTerms::Call(out)
            }
            ExprTerms::SomeDecl(vars) => ExprTerms::SomeDecl(vars.clone()),
        };
        Expr {
            terms,
            with: expr
                .with
                .iter()
                .map(|w| With {
                    target: w.target.clone(),
                    value: self.term(&w.value),
                })
                .collect(),
            ..expr.clone()
        }
    }

    fn body(&mut self, body: &Body) -> Body {
        Body::new(body.iter().map(|e| self.expr(e)).collect())
    }

    fn term(&mut self, t: &Term) -> Term {
        let value = match &t.value {
            Value::Ref(r) => Value::Ref(Ref(r.0.iter().map(|x| self.term(x)).collect())),
            Value::Call(terms) => {
                let mut out = vec![terms[0].clone()];
                out.extend(terms[1..].iter().map(|x| self.term(x)));
                Value::Call(out)
            }
            Value::Array(items) => Value::Array(Arc::new(items.iter().map(|x| self.term(x)).collect())),
            Value::Set(items) => Value::Set(Arc::new(items.iter().map(|x| self.term(x)).collect())),
            Value::Object(obj) => Value::Object(Arc::new(
                obj.iter().map(|(k, v)| (self.term(k), self.term(v))).collect(),
            )),
            Value::ArrayComprehension(c) => {
                let inner = ArrayComprehension {
                    term: self.term(&c.term),
                    body: self.body(&c.body),
                };
                let mut rename = self.renaming(&inner.body);
                Value::ArrayComprehension(Box::new(ArrayComprehension {
                    term: inner.term.map_vars(&mut rename),
                    body: inner.body.map_vars(&mut rename),
                }))
            }
            Value::SetComprehension(c) => {
                let inner = SetComprehension {
                    term: self.term(&c.term),
                    body: self.body(&c.body),
                };
                let mut rename = self.renaming(&inner.body);
                Value::SetComprehension(Box::new(SetComprehension {
                    term: inner.term.map_vars(&mut rename),
                    body: inner.body.map_vars(&mut rename),
                }))
            }
            Value::ObjectComprehension(c) => {
                let inner = ObjectComprehension {
                    key: self.term(&c.key),
                    value: self.term(&c.value),
                    body: self.body(&c.body),
                };
                let mut rename = self.renaming(&inner.body);
                Value::ObjectComprehension(Box::new(ObjectComprehension {
                    key: inner.key.map_vars(&mut rename),
                    value: inner.value.map_vars(&mut rename),
                    body: inner.body.map_vars(&mut rename),
                }))
            }
            _ => return t.clone(),
        };
        Term {
            value,
            location: t.location,
        }
    }

    fn renaming(&mut self, body: &Body) -> impl FnMut(&Var) -> Option<Term> {
        let mut names: BTreeMap<Var, Term> = BTreeMap::new();
        for expr in body.iter() {
            for v in top_level_declared(expr) {
                if !names.contains_key(&v) && !v.is_wildcard() {
                    names.insert(v, Term::var(format!("__local{}__", self.next)));
                    self.next += 1;
                }
            }
        }
        move |v: &Var| names.get(v).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(sources: &[&str]) -> Result<Arc<CompiledPolicy>, CompileError> {
        sources
            .iter()
            .try_fold(Compiler::new(), |c, s| c.with_source(s))?
            .compile()
    }

    fn path(s: &str) -> Ref {
        Ref::parse_dotted(s).expect("path")
    }

    struct NoInput;

    impl ValueResolver for NoInput {
        fn resolve(&self, _: &Ref) -> Option<Term> {
            None
        }
    }

    #[test]
    fn builds_rule_tree_by_package_path() {
        let policy = compile(&[r#"
            package app.rbac
            default allow = false
            allow { input.user == "admin" }
            roles[r] { r := input.roles[_] }
        "#])
        .expect("compile");
        let node = policy
            .rule_tree()
            .node(&[Term::string("app"), Term::string("rbac"), Term::string("allow")])
            .expect("node");
        assert_eq!(node.rules.len(), 2);
        assert_eq!(node.kind(), Some(RuleKind::Complete));

        let result = policy.lookup(&path("data.app.rbac.allow"), &NoInput).expect("lookup");
        assert_eq!(result.rules.len(), 1);
        assert!(result.default.is_some());
        let roles = policy.all_rules(&path("data.app.rbac.roles")).expect("roles");
        assert_eq!(roles.kind, RuleKind::PartialSet);
    }

    #[test]
    fn rejects_conflicting_kinds_and_defaults() {
        let err = compile(&["package p\np { true }\np[x] { x := 1 }"]).expect_err("kinds");
        assert!(matches!(err, CompileError::KindConflict { .. }), "{err}");

        let err = compile(&["package p\ndefault p = 1\ndefault p = 2"]).expect_err("defaults");
        assert!(matches!(err, CompileError::MultipleDefaults { .. }), "{err}");

        let err = compile(&["package p\nf(x) = 1 { true }\nf(x, y) = 2 { true }"]).expect_err("arity");
        assert!(matches!(err, CompileError::ArityMismatch { .. }), "{err}");

        let err = compile(&["package a\nb = 1", "package a.b\nc = 2"]).expect_err("paths");
        assert!(matches!(err, CompileError::PathConflict { .. }), "{err}");
    }

    #[test]
    fn resolves_rule_names_and_imports() {
        let policy = compile(&[r#"
            package p
            import data.roles as r
            is_admin { r[input.user].admin }
            allow { is_admin }
            double(x) = y { y := x * 2 }
            four { double(2) == 4 }
            shadow { is_admin := 1 }
        "#])
        .expect("compile");
        let module = &policy.modules()[0];
        let body = |name: &str| {
            module
                .rules
                .iter()
                .find(|r| r.head.name == name)
                .map(|r| r.body.to_string())
                .unwrap_or_default()
        };
        assert_eq!(body("is_admin"), "data.roles[input.user].admin");
        assert_eq!(body("allow"), "data.p.is_admin");
        assert_eq!(body("four"), "data.p.double(2) == 4");
        assert_eq!(body("shadow"), "is_admin := 1");
    }

    #[test]
    fn localizes_comprehension_declarations() {
        let policy = compile(&[r#"
            package p
            xs = [x | x := input.items[_]]
            ys { x := 1; [x | some x in input.items] }
        "#])
        .expect("compile");
        let rules = &policy.modules()[0].rules;
        let xs = rules[0].head.value.as_ref().expect("value").to_string();
        assert_eq!(xs, "[__local0__ | __local0__ := input.items[$0]]");
        // The outer `x` stays; the comprehension's own `x` is renamed.
        let ys = rules[1].body.to_string();
        assert!(ys.starts_with("x := 1; [__local"), "{ys}");
        assert!(!ys.contains("[x |"), "{ys}");
    }

    #[test]
    fn assigns_unique_ids_across_else_chains() {
        let policy = compile(&[r#"
            package p
            grade = "a" { input.score > 90 } else = "b" { input.score > 80 } else = "c"
            other = 1
        "#])
        .expect("compile");
        let result = policy.all_rules(&path("data.p.grade")).expect("grade");
        let primary = &result.rules[0];
        let chain = result.else_map.get(&primary.id).expect("chain");
        let ids: BTreeSet<_> = std::iter::once(primary.id).chain(chain.iter().map(|r| r.id)).collect();
        assert_eq!(ids.len(), 3);
        let other = policy.all_rules(&path("data.p.other")).expect("other");
        assert!(!ids.contains(&other.rules[0].id));
    }

    #[test]
    fn moves_dynamic_head_terms_into_the_body() {
        let policy = compile(&["package p\nuser = input.user { true }\nnames[lower(n)] { n := input.names[_] }"])
            .expect("compile");
        let rules = &policy.modules()[0].rules;
        assert_eq!(rules[0].head.value, Some(Term::var("__value0__")));
        assert_eq!(rules[0].body.to_string(), "true; __value0__ = input.user");
        assert_eq!(rules[1].head.key, Some(Term::var("__key1__")));
        assert!(rules[1].body.to_string().ends_with("__key1__ = lower(n)"));
    }
}
