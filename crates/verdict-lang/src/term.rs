//! Term algebra
//!
//! Every value the evaluator touches is a [`Term`]: a [`Value`] plus an
//! optional source [`Location`]. The set of value variants is closed; the
//! evaluator matches on it exhaustively.
//!
//! Notes:
//! - Equality, ordering and hashing of terms ignore the location.
//! - Composite payloads sit behind `Arc` so cloning a term (which the
//!   evaluator does constantly while dereferencing bindings) is cheap.
//! - `Number` keeps integers exact and falls back to `f64`; `1 == 1.0`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ast::{Body, Expr, ExprTerms};

/// Names of the two global root documents.
pub const INPUT_ROOT: &str = "input";
pub const DATA_ROOT: &str = "data";

// ============================================================================
// Location
// ============================================================================

/// Source position of a term, expression or rule (1-based).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub row: u32,
    pub col: u32,
}

impl Location {
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.row, self.col)
    }
}

// ============================================================================
// Number
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Build a number from a float, collapsing integral values to `Int`.
    pub fn from_f64(f: f64) -> Self {
        if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
            Number::Int(f as i64)
        } else {
            Number::Float(f)
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    /// Integer view, if the number is integral.
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Number::Int(i) => Some(i),
            Number::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Some(f as i64),
            Number::Float(_) => None,
        }
    }

    pub fn checked_add(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_add(b)
                .map(Number::Int)
                .unwrap_or_else(|| Number::from_f64(a as f64 + b as f64)),
            (a, b) => Number::from_f64(a.as_f64() + b.as_f64()),
        }
    }

    pub fn checked_sub(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_sub(b)
                .map(Number::Int)
                .unwrap_or_else(|| Number::from_f64(a as f64 - b as f64)),
            (a, b) => Number::from_f64(a.as_f64() - b.as_f64()),
        }
    }

    pub fn checked_mul(self, other: Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a
                .checked_mul(b)
                .map(Number::Int)
                .unwrap_or_else(|| Number::from_f64(a as f64 * b as f64)),
            (a, b) => Number::from_f64(a.as_f64() * b.as_f64()),
        }
    }

    /// Division; `None` on division by zero.
    pub fn checked_div(self, other: Number) -> Option<Number> {
        if other.as_f64() == 0.0 {
            return None;
        }
        match (self, other) {
            (Number::Int(a), Number::Int(b)) if a.checked_rem(b) == Some(0) => Some(
                a.checked_div(b)
                    .map(Number::Int)
                    .unwrap_or_else(|| Number::from_f64(a as f64 / b as f64)),
            ),
            (a, b) => Some(Number::from_f64(a.as_f64() / b.as_f64())),
        }
    }

    /// Remainder over integers; `None` for non-integral operands or zero.
    pub fn checked_rem(self, other: Number) -> Option<Number> {
        let (a, b) = (self.as_i64()?, other.as_i64()?);
        if b == 0 {
            return None;
        }
        // i64::MIN % -1 overflows; its remainder is 0.
        Some(Number::Int(a.checked_rem(b).unwrap_or(0)))
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Number {}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Number {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(b),
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                a.partial_cmp(&b).unwrap_or_else(|| a.total_cmp(&b))
            }
        }
    }
}

impl Hash for Number {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.as_i64() {
            Some(i) => i.hash(state),
            None => self.as_f64().to_bits().hash(state),
        }
    }
}

impl From<i64> for Number {
    fn from(i: i64) -> Self {
        Number::Int(i)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{i}"),
            Number::Float(x) => write!(f, "{x}"),
        }
    }
}

// ============================================================================
// Var / Ref
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Var(pub Arc<str>);

impl Var {
    pub fn new(name: impl AsRef<str>) -> Self {
        Var(Arc::from(name.as_ref()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Vars introduced by the parser for `_`.
    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with('$')
    }

    /// Vars introduced by the parser, compiler or evaluator.
    pub fn is_generated(&self) -> bool {
        self.0.starts_with("__") || self.is_wildcard()
    }

    pub fn is_root(&self) -> bool {
        &*self.0 == INPUT_ROOT || &*self.0 == DATA_ROOT
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered sequence of terms; the head selects the root document.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ref(pub Vec<Term>);

impl Ref {
    pub fn new(terms: Vec<Term>) -> Self {
        Ref(terms)
    }

    /// `data.a.b` style ref from a root var and string segments.
    pub fn from_path<S: AsRef<str>>(root: &str, path: &[S]) -> Self {
        let mut terms = Vec::with_capacity(path.len() + 1);
        terms.push(Term::var(root));
        terms.extend(path.iter().map(|s| Term::string(s.as_ref())));
        Ref(terms)
    }

    /// Parse a dotted ref such as `input.user.name`.
    pub fn parse_dotted(text: &str) -> Option<Self> {
        let mut parts = text.split('.');
        let head = parts.next().filter(|s| !s.is_empty())?;
        let mut terms = vec![Term::var(head)];
        for part in parts {
            if part.is_empty() {
                return None;
            }
            terms.push(Term::string(part));
        }
        Some(Ref(terms))
    }

    pub fn head(&self) -> Option<&Term> {
        self.0.first()
    }

    pub fn head_var(&self) -> Option<&Var> {
        match self.0.first().map(|t| &t.value) {
            Some(Value::Var(v)) => Some(v),
            _ => None,
        }
    }

    pub fn is_rooted_at(&self, root: &str) -> bool {
        self.head_var().map(|v| v.name() == root).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_prefix(&self, prefix: &Ref) -> bool {
        prefix.0.len() <= self.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    pub fn prefix(&self, n: usize) -> Ref {
        Ref(self.0[..n.min(self.0.len())].to_vec())
    }

    pub fn append(&self, term: Term) -> Ref {
        let mut terms = self.0.clone();
        terms.push(term);
        Ref(terms)
    }

    pub fn concat(&self, suffix: &[Term]) -> Ref {
        let mut terms = self.0.clone();
        terms.extend_from_slice(suffix);
        Ref(terms)
    }

    /// Longest prefix whose segments (after the head) are ground.
    pub fn ground_prefix(&self) -> Ref {
        let mut end = self.0.len().min(1);
        for (i, t) in self.0.iter().enumerate().skip(1) {
            if !t.is_ground() {
                break;
            }
            end = i + 1;
        }
        Ref(self.0[..end].to_vec())
    }

    /// All segments after the head are ground.
    pub fn is_ground_path(&self) -> bool {
        self.0.iter().skip(1).all(Term::is_ground)
    }

    /// String segments after the head, if every segment is a string.
    pub fn string_path(&self) -> Option<Vec<String>> {
        self.0
            .iter()
            .skip(1)
            .map(|t| match &t.value {
                Value::String(s) => Some(s.to_string()),
                _ => None,
            })
            .collect()
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(head) = self.0.first() else {
            return Ok(());
        };
        match &head.value {
            Value::Var(v) => write!(f, "{v}")?,
            _ => write!(f, "({head})")?,
        }
        for seg in &self.0[1..] {
            match &seg.value {
                Value::String(s) if is_identifier(s) => write!(f, ".{s}")?,
                _ => write!(f, "[{seg}]")?,
            }
        }
        Ok(())
    }
}

pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ============================================================================
// Comprehensions
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArrayComprehension {
    pub term: Term,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetComprehension {
    pub term: Term,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectComprehension {
    pub key: Term,
    pub value: Term,
    pub body: Body,
}

// ============================================================================
// Value / Term
// ============================================================================

pub type Object = BTreeMap<Term, Term>;
pub type Set = BTreeSet<Term>;

/// Closed set of term variants. Variant order is the sort order across kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(Number),
    String(Arc<str>),
    Var(Var),
    Ref(Ref),
    Array(Arc<Vec<Term>>),
    Object(Arc<Object>),
    Set(Arc<Set>),
    ArrayComprehension(Box<ArrayComprehension>),
    SetComprehension(Box<SetComprehension>),
    ObjectComprehension(Box<ObjectComprehension>),
    /// Operator application `f(a, b)`; only valid inside expressions.
    Call(Vec<Term>),
}

#[derive(Debug, Clone)]
pub struct Term {
    pub value: Value,
    pub location: Option<Location>,
}

impl PartialEq for Term {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Term {}

impl PartialOrd for Term {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Term {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl Hash for Term {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state)
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Term {
            value,
            location: None,
        }
    }
}

impl Term {
    pub fn new(value: Value) -> Self {
        value.into()
    }

    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    pub fn null() -> Self {
        Value::Null.into()
    }

    pub fn boolean(b: bool) -> Self {
        Value::Boolean(b).into()
    }

    pub fn number(n: Number) -> Self {
        Value::Number(n).into()
    }

    pub fn int(i: i64) -> Self {
        Value::Number(Number::Int(i)).into()
    }

    pub fn string(s: impl AsRef<str>) -> Self {
        Value::String(Arc::from(s.as_ref())).into()
    }

    pub fn var(name: impl AsRef<str>) -> Self {
        Value::Var(Var::new(name)).into()
    }

    pub fn reference(r: Ref) -> Self {
        Value::Ref(r).into()
    }

    pub fn array(items: Vec<Term>) -> Self {
        Value::Array(Arc::new(items)).into()
    }

    pub fn object(pairs: impl IntoIterator<Item = (Term, Term)>) -> Self {
        Value::Object(Arc::new(pairs.into_iter().collect())).into()
    }

    pub fn set(items: impl IntoIterator<Item = Term>) -> Self {
        Value::Set(Arc::new(items.into_iter().collect())).into()
    }

    pub fn call(operator: Ref, mut operands: Vec<Term>) -> Self {
        operands.insert(0, Term::reference(operator));
        Value::Call(operands).into()
    }

    pub fn as_var(&self) -> Option<&Var> {
        match &self.value {
            Value::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ref(&self) -> Option<&Ref> {
        match &self.value {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<Number> {
        match &self.value {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self.value, Value::Var(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(
            self.value,
            Value::Null | Value::Boolean(_) | Value::Number(_) | Value::String(_)
        )
    }

    pub fn is_comprehension(&self) -> bool {
        matches!(
            self.value,
            Value::ArrayComprehension(_) | Value::SetComprehension(_) | Value::ObjectComprehension(_)
        )
    }

    pub fn is_false(&self) -> bool {
        matches!(self.value, Value::Boolean(false))
    }

    /// No variables anywhere inside (refs always contain their head var).
    pub fn is_ground(&self) -> bool {
        match &self.value {
            Value::Null | Value::Boolean(_) | Value::Number(_) | Value::String(_) => true,
            Value::Var(_) | Value::Ref(_) | Value::Call(_) => false,
            Value::ArrayComprehension(_) | Value::SetComprehension(_) | Value::ObjectComprehension(_) => {
                false
            }
            Value::Array(items) => items.iter().all(Term::is_ground),
            Value::Object(obj) => obj.iter().all(|(k, v)| k.is_ground() && v.is_ground()),
            Value::Set(set) => set.iter().all(Term::is_ground),
        }
    }

    /// Ground and free of anything that needs evaluation.
    pub fn is_constant(&self) -> bool {
        self.is_ground()
    }

    /// A term that must be evaluated (directly, or inside a composite)
    /// before it can be compared structurally.
    pub fn has_dynamic(&self) -> bool {
        match &self.value {
            Value::Ref(_) | Value::Call(_) => true,
            Value::ArrayComprehension(_) | Value::SetComprehension(_) | Value::ObjectComprehension(_) => {
                true
            }
            Value::Array(items) => items.iter().any(Term::has_dynamic),
            Value::Object(obj) => obj.iter().any(|(k, v)| k.has_dynamic() || v.has_dynamic()),
            Value::Set(set) => set.iter().any(Term::has_dynamic),
            _ => false,
        }
    }

    /// Pre-order walk; returning `true` from `f` skips the children.
    pub fn walk(&self, f: &mut dyn FnMut(&Term) -> bool) {
        if f(self) {
            return;
        }
        match &self.value {
            Value::Ref(r) => r.0.iter().for_each(|t| t.walk(f)),
            Value::Array(items) => items.iter().for_each(|t| t.walk(f)),
            Value::Object(obj) => obj.iter().for_each(|(k, v)| {
                k.walk(f);
                v.walk(f);
            }),
            Value::Set(set) => set.iter().for_each(|t| t.walk(f)),
            // The operator is a name, not a term to evaluate.
            Value::Call(terms) => terms.iter().skip(1).for_each(|t| t.walk(f)),
            Value::ArrayComprehension(c) => {
                c.term.walk(f);
                walk_body(&c.body, f);
            }
            Value::SetComprehension(c) => {
                c.term.walk(f);
                walk_body(&c.body, f);
            }
            Value::ObjectComprehension(c) => {
                c.key.walk(f);
                c.value.walk(f);
                walk_body(&c.body, f);
            }
            _ => {}
        }
    }

    /// Variables occurring in the term, including those inside closures.
    pub fn vars(&self) -> BTreeSet<Var> {
        let mut out = BTreeSet::new();
        self.walk(&mut |t| {
            if let Value::Var(v) = &t.value {
                out.insert(v.clone());
            }
            false
        });
        out
    }

    /// Replace variables per `f`, rebuilding composites.
    pub fn map_vars(&self, f: &mut dyn FnMut(&Var) -> Option<Term>) -> Term {
        let value = match &self.value {
            Value::Var(v) => return f(v).unwrap_or_else(|| self.clone()),
            Value::Ref(r) => {
                let mut terms: Vec<Term> = r.0.iter().map(|t| t.map_vars(f)).collect();
                // Substituting a ref for the head var splices the ref.
                if let Some(Value::Ref(inner)) = terms.first().map(|t| t.value.clone()) {
                    let mut spliced = inner.0.clone();
                    spliced.extend(terms.drain(1..));
                    terms = spliced;
                }
                Value::Ref(Ref(terms))
            }
            Value::Array(items) => Value::Array(Arc::new(items.iter().map(|t| t.map_vars(f)).collect())),
            Value::Object(obj) => Value::Object(Arc::new(
                obj.iter().map(|(k, v)| (k.map_vars(f), v.map_vars(f))).collect(),
            )),
            Value::Set(set) => Value::Set(Arc::new(set.iter().map(|t| t.map_vars(f)).collect())),
            Value::Call(terms) => Value::Call(
                terms
                    .iter()
                    .enumerate()
                    .map(|(i, t)| if i == 0 { t.clone() } else { t.map_vars(f) })
                    .collect(),
            ),
            Value::ArrayComprehension(c) => Value::ArrayComprehension(Box::new(ArrayComprehension {
                term: c.term.map_vars(f),
                body: c.body.map_vars(f),
            })),
            Value::SetComprehension(c) => Value::SetComprehension(Box::new(SetComprehension {
                term: c.term.map_vars(f),
                body: c.body.map_vars(f),
            })),
            Value::ObjectComprehension(c) => Value::ObjectComprehension(Box::new(ObjectComprehension {
                key: c.key.map_vars(f),
                value: c.value.map_vars(f),
                body: c.body.map_vars(f),
            })),
            other => other.clone(),
        };
        Term {
            value,
            location: self.location,
        }
    }

    // ------------------------------------------------------------------
    // JSON conversion
    // ------------------------------------------------------------------

    pub fn from_json(value: &serde_json::Value) -> Term {
        match value {
            serde_json::Value::Null => Term::null(),
            serde_json::Value::Bool(b) => Term::boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Term::int(i),
                None => Term::number(Number::from_f64(n.as_f64().unwrap_or(f64::NAN))),
            },
            serde_json::Value::String(s) => Term::string(s),
            serde_json::Value::Array(items) => Term::array(items.iter().map(Term::from_json).collect()),
            serde_json::Value::Object(obj) => {
                Term::object(obj.iter().map(|(k, v)| (Term::string(k), Term::from_json(v))))
            }
        }
    }

    /// JSON view of a ground term. Sets become arrays, non-string object
    /// keys are rendered with their term syntax.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match &self.value {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(Number::Int(i)) => serde_json::Value::from(*i),
            Value::Number(Number::Float(f)) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Term::to_json).collect::<Option<_>>()?)
            }
            Value::Set(set) => {
                serde_json::Value::Array(set.iter().map(Term::to_json).collect::<Option<_>>()?)
            }
            Value::Object(obj) => {
                let mut out = serde_json::Map::new();
                for (k, v) in obj.iter() {
                    let key = match &k.value {
                        Value::String(s) => s.to_string(),
                        _ if k.is_ground() => k.to_string(),
                        _ => return None,
                    };
                    out.insert(key, v.to_json()?);
                }
                serde_json::Value::Object(out)
            }
            _ => return None,
        })
    }

    /// Look up a child of a composite by key (index for arrays, member for sets).
    pub fn get(&self, key: &Term) -> Option<&Term> {
        match &self.value {
            Value::Object(obj) => obj.get(key),
            Value::Array(items) => {
                let idx = key.as_number()?.as_i64()?;
                usize::try_from(idx).ok().and_then(|i| items.get(i))
            }
            Value::Set(set) => set.get(key),
            _ => None,
        }
    }
}

fn walk_body(body: &Body, f: &mut dyn FnMut(&Term) -> bool) {
    for expr in body.iter() {
        expr.walk_terms(f);
    }
}

impl Expr {
    pub fn walk_terms(&self, f: &mut dyn FnMut(&Term) -> bool) {
        match &self.terms {
            ExprTerms::Term(t) => t.walk(f),
            ExprTerms::Call(terms) => terms.iter().skip(1).for_each(|t| t.walk(f)),
            ExprTerms::SomeDecl(vars) => vars.iter().for_each(|t| t.walk(f)),
        }
        for w in &self.with {
            w.target.walk(f);
            w.value.walk(f);
        }
    }
}

/// Deep-merge two objects; `None` when a key holds unequal non-object values.
pub fn merge_objects(a: &Object, b: &Object) -> Option<Object> {
    let mut out = a.clone();
    for (k, v) in b.iter() {
        match out.get(k).cloned() {
            None => {
                out.insert(k.clone(), v.clone());
            }
            Some(existing) => match (&existing.value, &v.value) {
                (Value::Object(x), Value::Object(y)) => {
                    let merged = merge_objects(x, y)?;
                    out.insert(k.clone(), Term::new(Value::Object(Arc::new(merged))));
                }
                _ if existing == *v => {}
                _ => return None,
            },
        }
    }
    Some(out)
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Value::Null => f.write_str("null"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{}", serde_json::Value::String(s.to_string())),
            Value::Var(v) => write!(f, "{v}"),
            Value::Ref(r) => write!(f, "{r}"),
            Value::Array(items) => {
                f.write_str("[")?;
                write_joined(f, items.iter())?;
                f.write_str("]")
            }
            Value::Object(obj) => {
                f.write_str("{")?;
                for (i, (k, v)) in obj.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Set(set) if set.is_empty() => f.write_str("set()"),
            Value::Set(set) => {
                f.write_str("{")?;
                write_joined(f, set.iter())?;
                f.write_str("}")
            }
            Value::ArrayComprehension(c) => write!(f, "[{} | {}]", c.term, c.body),
            Value::SetComprehension(c) => write!(f, "{{{} | {}}}", c.term, c.body),
            Value::ObjectComprehension(c) => write!(f, "{{{}: {} | {}}}", c.key, c.value, c.body),
            Value::Call(terms) => crate::ast::fmt_call(f, terms),
        }
    }
}

fn write_joined<'a>(f: &mut fmt::Formatter<'_>, items: impl Iterator<Item = &'a Term>) -> fmt::Result {
    for (i, t) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{t}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_compare_across_representations() {
        assert_eq!(Number::Int(1), Number::Float(1.0));
        assert!(Number::Int(1) < Number::Float(1.5));
        assert_eq!(Number::from_f64(2.0), Number::Int(2));
        assert_eq!(Number::Int(7).checked_div(Number::Int(2)), Some(Number::Float(3.5)));
        assert_eq!(Number::Int(7).checked_rem(Number::Int(0)), None);
        assert_eq!(Number::Int(i64::MIN).checked_rem(Number::Int(-1)), Some(Number::Int(0)));
        assert_eq!(
            Number::Int(i64::MIN).checked_div(Number::Int(-1)),
            Some(Number::from_f64(-(i64::MIN as f64)))
        );
    }

    #[test]
    fn term_order_follows_variant_order() {
        let mut terms = vec![
            Term::string("a"),
            Term::int(1),
            Term::null(),
            Term::boolean(true),
            Term::array(vec![]),
        ];
        terms.sort();
        assert_eq!(
            terms.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
            vec!["null", "true", "1", "\"a\"", "[]"]
        );
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let doc = serde_json::json!({"a": [1, 2.5, "x"], "b": {"c": null}});
        let term = Term::from_json(&doc);
        assert!(term.is_ground());
        assert_eq!(term.to_json(), Some(doc));
    }

    #[test]
    fn ref_display_uses_brackets_for_non_identifiers() {
        let r = Ref::new(vec![
            Term::var("data"),
            Term::string("a"),
            Term::string("b-c"),
            Term::var("x"),
            Term::int(0),
        ]);
        assert_eq!(r.to_string(), "data.a[\"b-c\"][x][0]");
        assert_eq!(r.ground_prefix().to_string(), "data.a[\"b-c\"]");
    }

    #[test]
    fn substituting_a_ref_for_a_ref_head_splices() {
        let t = Term::reference(Ref::new(vec![Term::var("x"), Term::string("y")]));
        let out = t.map_vars(&mut |v| {
            (v.name() == "x").then(|| Term::reference(Ref::from_path("input", &["a"])))
        });
        assert_eq!(out.to_string(), "input.a.y");
    }

    #[test]
    fn merge_objects_detects_conflicts() {
        let a: Object = [(Term::string("k"), Term::int(1))].into_iter().collect();
        let b: Object = [(Term::string("k"), Term::int(2))].into_iter().collect();
        let c: Object = [(Term::string("j"), Term::int(2))].into_iter().collect();
        assert!(merge_objects(&a, &b).is_none());
        assert_eq!(merge_objects(&a, &c).map(|o| o.len()), Some(2));
    }
}
