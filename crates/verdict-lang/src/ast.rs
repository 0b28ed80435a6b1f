//! Policy AST: expressions, bodies, rules and modules.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use crate::term::{Location, Ref, Term, Value, Var};

// ============================================================================
// Operators
// ============================================================================

pub const OP_EQ: &str = "eq";
pub const OP_ASSIGN: &str = "assign";
pub const OP_MEMBER: &str = "internal.member_2";

/// Infix operators and the built-in names they compile to.
pub const INFIX_OPERATORS: &[(&str, &str)] = &[
    ("==", "equal"),
    ("!=", "neq"),
    ("<=", "lte"),
    (">=", "gte"),
    ("<", "lt"),
    (">", "gt"),
    ("+", "plus"),
    ("-", "minus"),
    ("*", "mul"),
    ("/", "div"),
    ("%", "rem"),
    ("&", "and"),
    ("|", "or"),
    ("=", OP_EQ),
    (":=", OP_ASSIGN),
    ("in", OP_MEMBER),
];

pub fn infix_symbol(name: &str) -> Option<&'static str> {
    INFIX_OPERATORS
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(sym, _)| *sym)
}

/// Operator ref for a built-in name (`array.concat` -> `array.concat`).
pub fn operator_ref(name: &str) -> Ref {
    let mut parts = name.split('.');
    let head = parts.next().unwrap_or(name);
    let mut terms = vec![Term::var(head)];
    terms.extend(parts.map(Term::string));
    Ref(terms)
}

pub(crate) fn fmt_call(f: &mut fmt::Formatter<'_>, terms: &[Term]) -> fmt::Result {
    let Some(op) = terms.first() else {
        return Ok(());
    };
    let operands = &terms[1..];
    if let Some(sym) = infix_symbol(&op.to_string()) {
        match operands.len() {
            2 => return write!(f, "{} {} {}", operands[0], sym, operands[1]),
            3 if !matches!(sym, "=" | ":=" | "==" | "!=" | "<" | ">" | "<=" | ">=" | "in") => {
                return write!(
                    f,
                    "{} = {} {} {}",
                    operands[2], operands[0], sym, operands[1]
                )
            }
            _ => {}
        }
    }
    write!(f, "{op}(")?;
    for (i, t) in operands.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{t}")?;
    }
    f.write_str(")")
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExprTerms {
    /// A single term that must be defined and not `false`.
    Term(Term),
    /// Operator ref followed by operands.
    Call(Vec<Term>),
    /// `some x, y` declaration; always succeeds.
    SomeDecl(Vec<Term>),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct With {
    pub target: Term,
    pub value: Term,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub index: usize,
    pub negated: bool,
    pub generated: bool,
    pub terms: ExprTerms,
    pub with: Vec<With>,
    pub location: Option<Location>,
}

impl Expr {
    fn key(&self) -> (bool, &ExprTerms, &[With]) {
        (self.negated, &self.terms, &self.with)
    }

    pub fn new(terms: ExprTerms) -> Self {
        Expr {
            index: 0,
            negated: false,
            generated: false,
            terms,
            with: vec![],
            location: None,
        }
    }

    pub fn term(t: Term) -> Self {
        Expr::new(ExprTerms::Term(t))
    }

    pub fn call(operator: &str, operands: Vec<Term>) -> Self {
        let mut terms = Vec::with_capacity(operands.len() + 1);
        terms.push(Term::reference(operator_ref(operator)));
        terms.extend(operands);
        Expr::new(ExprTerms::Call(terms))
    }

    pub fn equality(a: Term, b: Term) -> Self {
        Expr::call(OP_EQ, vec![a, b])
    }

    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    pub fn operator(&self) -> Option<&Ref> {
        match &self.terms {
            ExprTerms::Call(terms) => terms.first().and_then(Term::as_ref),
            _ => None,
        }
    }

    pub fn operator_name(&self) -> Option<String> {
        self.operator().map(|r| r.to_string())
    }

    pub fn operands(&self) -> &[Term] {
        match &self.terms {
            ExprTerms::Call(terms) if !terms.is_empty() => &terms[1..],
            _ => &[],
        }
    }

    /// `a = b` or `a := b`; both unify.
    pub fn is_equality(&self) -> bool {
        matches!(self.operator_name().as_deref(), Some(OP_EQ) | Some(OP_ASSIGN))
            && self.operands().len() == 2
    }

    pub fn is_call(&self) -> bool {
        matches!(self.terms, ExprTerms::Call(_))
    }

    pub fn complement(&self) -> Expr {
        let mut cpy = self.clone();
        cpy.negated = !cpy.negated;
        cpy
    }

    pub fn no_with(&self) -> Expr {
        let mut cpy = self.clone();
        cpy.with.clear();
        cpy
    }

    pub fn vars(&self) -> BTreeSet<Var> {
        let mut out = BTreeSet::new();
        self.walk_terms(&mut |t| {
            if let Value::Var(v) = &t.value {
                out.insert(v.clone());
            }
            false
        });
        out
    }

    /// Variables outside closures and outside call operators.
    pub fn free_vars(&self) -> BTreeSet<Var> {
        let mut out = BTreeSet::new();
        let mut visit = |t: &Term| {
            t.walk(&mut |t| match &t.value {
                Value::Var(v) => {
                    if !v.is_root() {
                        out.insert(v.clone());
                    }
                    false
                }
                _ => t.is_comprehension(),
            })
        };
        match &self.terms {
            ExprTerms::Term(t) => visit(t),
            ExprTerms::Call(terms) => terms.iter().skip(1).for_each(&mut visit),
            ExprTerms::SomeDecl(_) => {}
        }
        out
    }

    pub fn contains_closures(&self) -> bool {
        let mut found = false;
        self.walk_terms(&mut |t| {
            if t.is_comprehension() {
                found = true;
            }
            found
        });
        found
    }

    pub fn map_vars(&self, f: &mut dyn FnMut(&Var) -> Option<Term>) -> Expr {
        let terms = match &self.terms {
            ExprTerms::Term(t) => ExprTerms::Term(t.map_vars(f)),
            ExprTerms::Call(terms) => {
                let mut out = Vec::with_capacity(terms.len());
                out.push(terms[0].clone());
                out.extend(terms[1..].iter().map(|t| t.map_vars(f)));
                ExprTerms::Call(out)
            }
            ExprTerms::SomeDecl(vars) => ExprTerms::SomeDecl(vars.iter().map(|t| t.map_vars(f)).collect()),
        };
        Expr {
            terms,
            with: self
                .with
                .iter()
                .map(|w| With {
                    target: w.target.clone(),
                    value: w.value.map_vars(f),
                })
                .collect(),
            ..self.clone()
        }
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Expr {}

impl PartialOrd for Expr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("not ")?;
        }
        match &self.terms {
            ExprTerms::Term(t) => write!(f, "{t}")?,
            ExprTerms::Call(terms) => fmt_call(f, terms)?,
            ExprTerms::SomeDecl(vars) => {
                f.write_str("some ")?;
                for (i, v) in vars.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
            }
        }
        for w in &self.with {
            write!(f, " with {} as {}", w.target, w.value)?;
        }
        Ok(())
    }
}

// ============================================================================
// Body
// ============================================================================

/// Conjunction of expressions; cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Body(Arc<[Expr]>);

impl Body {
    pub fn new(mut exprs: Vec<Expr>) -> Self {
        for (i, e) in exprs.iter_mut().enumerate() {
            e.index = i;
        }
        Body(Arc::from(exprs))
    }

    /// Body consisting of the single expression `true`.
    pub fn truthy() -> Self {
        Body::new(vec![Expr::term(Term::boolean(true))])
    }

    pub fn to_vec(&self) -> Vec<Expr> {
        self.0.to_vec()
    }

    pub fn vars(&self) -> BTreeSet<Var> {
        self.0.iter().flat_map(|e| e.vars()).collect()
    }

    pub fn map_vars(&self, f: &mut dyn FnMut(&Var) -> Option<Term>) -> Body {
        Body::new(self.0.iter().map(|e| e.map_vars(f)).collect())
    }
}

impl Deref for Body {
    type Target = [Expr];

    fn deref(&self) -> &[Expr] {
        &self.0
    }
}

impl From<Vec<Expr>> for Body {
    fn from(exprs: Vec<Expr>) -> Self {
        Body::new(exprs)
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Rules and modules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleKind {
    Complete,
    PartialSet,
    PartialObject,
    Function,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RuleKind::Complete => "complete",
            RuleKind::PartialSet => "partial set",
            RuleKind::PartialObject => "partial object",
            RuleKind::Function => "function",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub name: String,
    pub args: Vec<Term>,
    pub key: Option<Term>,
    pub value: Option<Term>,
    pub location: Option<Location>,
}

impl Head {
    pub fn new(name: impl Into<String>, value: Option<Term>) -> Self {
        Head {
            name: name.into(),
            args: vec![],
            key: None,
            value,
            location: None,
        }
    }

    pub fn vars(&self) -> BTreeSet<Var> {
        let mut out = BTreeSet::new();
        for t in self.args.iter().chain(self.key.iter()).chain(self.value.iter()) {
            out.extend(t.vars());
        }
        out
    }
}

/// Compiler-assigned rule identity, unique within one compiled policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub default: bool,
    pub head: Head,
    pub body: Body,
    pub else_rule: Option<Box<Rule>>,
    pub location: Option<Location>,
}

impl Rule {
    pub fn new(head: Head, body: Body) -> Self {
        Rule {
            id: RuleId::default(),
            default: false,
            head,
            body,
            else_rule: None,
            location: None,
        }
    }

    pub fn kind(&self) -> RuleKind {
        if !self.head.args.is_empty() {
            return RuleKind::Function;
        }
        match (&self.head.key, &self.head.value) {
            (Some(_), Some(_)) => RuleKind::PartialObject,
            (Some(_), None) => RuleKind::PartialSet,
            _ => RuleKind::Complete,
        }
    }

    /// Value produced by the head (`true` when omitted on complete rules).
    pub fn head_value(&self) -> Term {
        self.head
            .value
            .clone()
            .or_else(|| self.head.key.clone())
            .unwrap_or_else(|| Term::boolean(true))
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default {
            f.write_str("default ")?;
        }
        f.write_str(&self.head.name)?;
        if !self.head.args.is_empty() {
            f.write_str("(")?;
            for (i, a) in self.head.args.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{a}")?;
            }
            f.write_str(")")?;
        }
        if let Some(key) = &self.head.key {
            write!(f, "[{key}]")?;
        }
        match &self.head.value {
            Some(v) if !(self.head.key.is_none() && matches!(v.value, Value::Boolean(true))) => {
                write!(f, " = {v}")?
            }
            _ => {}
        }
        if !self.default {
            write!(f, " {{ {} }}", self.body)?;
        }
        let mut next = self.else_rule.as_deref();
        while let Some(e) = next {
            f.write_str(" else")?;
            if let Some(v) = &e.head.value {
                write!(f, " = {v}")?;
            }
            write!(f, " {{ {} }}", e.body)?;
            next = e.else_rule.as_deref();
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub path: Ref,
    pub alias: Option<String>,
}

impl Import {
    /// Name the import binds inside the module.
    pub fn name(&self) -> Option<String> {
        self.alias.clone().or_else(|| {
            self.path.0.last().and_then(|t| match &t.value {
                Value::String(s) => Some(s.to_string()),
                Value::Var(v) => Some(v.name().to_string()),
                _ => None,
            })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// `data.<package path>`
    pub package: Ref,
    pub imports: Vec<Import>,
    pub rules: Vec<Rule>,
}

impl Module {
    pub fn new(package: Ref) -> Self {
        Module {
            package,
            imports: vec![],
            rules: vec![],
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pkg = Ref(self.package.0[1..].to_vec());
        let pkg = match pkg.0.first() {
            Some(first) => {
                let mut terms = vec![Term::var(first.as_str().unwrap_or_default())];
                terms.extend(pkg.0[1..].iter().cloned());
                Ref(terms)
            }
            None => pkg,
        };
        writeln!(f, "package {pkg}")?;
        for import in &self.imports {
            write!(f, "\nimport {}", import.path)?;
            if let Some(alias) = &import.alias {
                write!(f, " as {alias}")?;
            }
        }
        for rule in &self.rules {
            write!(f, "\n{rule}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_display_uses_infix_symbols() {
        let gt = Expr::call("gt", vec![Term::reference(Ref::from_path("input", &["x"])), Term::int(1)]);
        assert_eq!(gt.to_string(), "input.x > 1");

        let plus = Expr::call("plus", vec![Term::int(1), Term::int(1), Term::var("x")]);
        assert_eq!(plus.to_string(), "x = 1 + 1");

        let count = Expr::call("count", vec![Term::var("xs"), Term::var("n")]);
        assert_eq!(count.complement().to_string(), "not count(xs, n)");
    }

    #[test]
    fn rule_kind_follows_head_shape() {
        let mut head = Head::new("p", None);
        assert_eq!(Rule::new(head.clone(), Body::truthy()).kind(), RuleKind::Complete);
        head.key = Some(Term::var("x"));
        assert_eq!(Rule::new(head.clone(), Body::truthy()).kind(), RuleKind::PartialSet);
        head.value = Some(Term::var("y"));
        assert_eq!(Rule::new(head.clone(), Body::truthy()).kind(), RuleKind::PartialObject);
        head.key = None;
        head.args = vec![Term::var("a")];
        assert_eq!(Rule::new(head, Body::truthy()).kind(), RuleKind::Function);
    }

    #[test]
    fn expr_equality_ignores_location_and_index() {
        let a = Expr::equality(Term::var("x"), Term::int(1)).with_location(Some(Location::new(1, 1)));
        let mut b = Expr::equality(Term::var("x"), Term::int(1));
        b.index = 3;
        assert_eq!(a, b);
        assert!(a.is_equality());
    }
}
