//! Policy source parser
//!
//! A `nom` parser for the policy subset the compiler accepts:
//!
//! ```text
//! package app.rbac
//!
//! import data.roles as r
//!
//! default allow = false
//!
//! allow { input.user == "admin" }
//! allow if { some g in input.groups; r[g].admin }
//!
//! grants[x] { x := input.grants[_] }
//! labels[k] = v { some k, v in input.labels }
//! f(x) = y { y := x * 2 } else = 0 { true }
//! names := {n | n := input.users[_].name}
//! ```
//!
//! Literals in a body are separated by `;` or newlines; inside brackets
//! newlines are plain whitespace. `_` becomes a fresh wildcard var `$N`.

use std::cell::Cell;

use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char as pchar, digit1, one_of},
    combinator::{opt, recognize},
    sequence::{pair, tuple},
    IResult,
};
use thiserror::Error;

use crate::ast::{
    operator_ref, Body, Expr, ExprTerms, Head, Import, Module, Rule, With, INFIX_OPERATORS,
    OP_ASSIGN, OP_EQ,
};
use crate::term::{
    ArrayComprehension, Location, Number, ObjectComprehension, Ref, SetComprehension, Term, Value,
    DATA_ROOT,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("parse error at {location}: {message}")]
    Syntax { location: Location, message: String },
}

const KEYWORDS: &[&str] = &[
    "not", "with", "as", "some", "default", "else", "package", "import", "if", "contains", "in",
    "true", "false", "null",
];

/// Parse a policy module.
pub fn parse_module(source: &str) -> Result<Module, ParseError> {
    Parser::new(source).module()
}

/// Parse a query body such as `x := input.a; x > 1`.
pub fn parse_body(source: &str) -> Result<Body, ParseError> {
    let p = Parser::new(source);
    let (rest, body) = p.finish_pair(p.body_exprs(source), "expected a query body")?;
    p.expect_eof(rest)?;
    Ok(body)
}

/// Parse a single term such as `{"a": [1, 2]}`.
pub fn parse_term(source: &str) -> Result<Term, ParseError> {
    let p = Parser::new(source);
    let (rest, term) = p.finish_pair(p.expr(source), "expected a term")?;
    p.expect_eof(rest)?;
    Ok(term)
}

struct Parser<'s> {
    src: &'s str,
    /// Bracket nesting; newlines are whitespace when > 0.
    depth: Cell<usize>,
    /// Set while parsing the first element of a bracketed collection.
    no_union: Cell<bool>,
    wildcards: Cell<u32>,
}

impl<'s> Parser<'s> {
    fn new(src: &'s str) -> Self {
        Parser {
            src,
            depth: Cell::new(0),
            no_union: Cell::new(false),
            wildcards: Cell::new(0),
        }
    }

    fn location(&self, rest: &str) -> Location {
        let offset = self.src.len().saturating_sub(rest.len());
        let consumed = &self.src[..offset];
        let row = consumed.matches('\n').count() + 1;
        let col = consumed.rsplit('\n').next().map(|l| l.chars().count()).unwrap_or(0) + 1;
        Location::new(row as u32, col as u32)
    }

    fn error(&self, rest: &str, message: impl Into<String>) -> ParseError {
        let near: String = rest.chars().take(24).collect();
        ParseError::Syntax {
            location: self.location(rest),
            message: format!("{} near `{}`", message.into(), near.trim_end()),
        }
    }

    fn finish_pair<'a, O>(&self, r: IResult<&'a str, O>, message: &str) -> Result<(&'a str, O), ParseError> {
        r.map_err(|e| match e {
            nom::Err::Error(e) | nom::Err::Failure(e) => self.error(e.input, message),
            nom::Err::Incomplete(_) => self.error("", message),
        })
    }

    fn expect_eof(&self, rest: &str) -> Result<(), ParseError> {
        let rest = skip_all(rest);
        if rest.is_empty() {
            Ok(())
        } else {
            Err(self.error(rest, "unexpected trailing input"))
        }
    }

    fn fail<T>(input: &str) -> IResult<&str, T> {
        Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Verify)))
    }

    // ------------------------------------------------------------------
    // Whitespace
    // ------------------------------------------------------------------

    /// Skip blanks and comments, and newlines when inside brackets.
    fn sp<'a>(&self, mut i: &'a str) -> &'a str {
        let newlines = self.depth.get() > 0;
        loop {
            let trimmed = i.trim_start_matches(|c: char| c == ' ' || c == '\t' || c == '\r' || (newlines && c == '\n'));
            if let Some(comment) = trimmed.strip_prefix('#') {
                i = comment.find('\n').map(|n| &comment[n..]).unwrap_or("");
                continue;
            }
            return trimmed;
        }
    }

    fn nested<'a, O>(&self, f: impl FnOnce() -> IResult<&'a str, O>) -> IResult<&'a str, O> {
        self.depth.set(self.depth.get() + 1);
        let no_union = self.no_union.replace(false);
        let out = f();
        self.no_union.set(no_union);
        self.depth.set(self.depth.get() - 1);
        out
    }

    fn flat<'a, O>(&self, f: impl FnOnce() -> IResult<&'a str, O>) -> IResult<&'a str, O> {
        let saved = self.depth.replace(0);
        let out = f();
        self.depth.set(saved);
        out
    }

    fn sym<'a>(&self, i: &'a str, s: &'static str) -> IResult<&'a str, &'a str> {
        tag(s)(self.sp(i))
    }

    /// `:=` or `=` (but not `==`).
    fn assign_op<'a>(&self, i: &'a str) -> IResult<&'a str, &'a str> {
        let i = self.sp(i);
        if let Some(rest) = i.strip_prefix(":=") {
            return Ok((rest, &i[..2]));
        }
        match i.strip_prefix('=') {
            Some(rest) if !rest.starts_with('=') => Ok((rest, &i[..1])),
            _ => Self::fail(i),
        }
    }

    fn keyword<'a>(&self, i: &'a str, kw: &'static str) -> IResult<&'a str, ()> {
        let i = self.sp(i);
        let (rest, word) = ident(i)?;
        if word == kw {
            Ok((rest, ()))
        } else {
            Self::fail(i)
        }
    }

    // ------------------------------------------------------------------
    // Module level
    // ------------------------------------------------------------------

    fn module(&self) -> Result<Module, ParseError> {
        let i = skip_all(self.src);
        let (i, _) = self.finish_pair(self.keyword(i, "package"), "expected `package`")?;
        let (mut i, path) = self.finish_pair(self.dotted(i), "expected package path")?;
        let mut package = vec![Term::var(DATA_ROOT)];
        package.extend(path.iter().map(Term::string));
        let mut module = Module::new(Ref(package));

        loop {
            i = skip_all(i);
            if i.is_empty() {
                break;
            }
            if let Ok((rest, _)) = self.keyword(i, "import") {
                let (rest, import) = self.finish_pair(self.import(rest), "invalid import")?;
                module.imports.push(import);
                i = rest;
                continue;
            }
            let (rest, rule) = self.finish_pair(self.rule(i), "invalid rule")?;
            module.rules.push(rule);
            i = rest;
        }
        Ok(module)
    }

    fn dotted<'a>(&self, i: &'a str) -> IResult<&'a str, Vec<String>> {
        let (mut i, first) = ident(self.sp(i))?;
        let mut out = vec![first.to_string()];
        while let Ok((rest, _)) = tag::<_, _, nom::error::Error<&str>>(".")(i) {
            let (rest, next) = ident(rest)?;
            out.push(next.to_string());
            i = rest;
        }
        Ok((i, out))
    }

    fn import<'a>(&self, i: &'a str) -> IResult<&'a str, Import> {
        let (i, path) = self.dotted(i)?;
        let mut terms = vec![Term::var(&path[0])];
        terms.extend(path[1..].iter().map(Term::string));
        let (i, alias) = match self.keyword(i, "as") {
            Ok((rest, _)) => {
                let (rest, alias) = ident(self.sp(rest))?;
                (rest, Some(alias.to_string()))
            }
            Err(_) => (i, None),
        };
        Ok((i, Import { path: Ref(terms), alias }))
    }

    fn rule<'a>(&self, i: &'a str) -> IResult<&'a str, Rule> {
        let start = self.sp(i);
        let location = Some(self.location(start));

        if let Ok((i, _)) = self.keyword(start, "default") {
            let (i, name) = ident(self.sp(i))?;
            let (i, _) = self.assign_op(i)?;
            let (i, value) = self.expr(i)?;
            let mut head = Head::new(name, Some(value));
            head.location = location;
            let mut rule = Rule::new(head, Body::truthy());
            rule.default = true;
            rule.location = location;
            return Ok((i, rule));
        }

        let (i, name) = ident(start)?;
        if KEYWORDS.contains(&name) {
            return Self::fail(start);
        }
        let mut head = Head::new(name, None);
        head.location = location;
        let mut i = i;

        if let Ok((rest, _)) = tag::<_, _, nom::error::Error<&str>>("(")(i) {
            let (rest, args) = self.nested(|| self.term_list(rest, ")"))?;
            head.args = args;
            i = rest;
        }
        if let Ok((rest, _)) = tag::<_, _, nom::error::Error<&str>>("[")(i) {
            let (rest, key) = self.nested(|| self.expr(rest))?;
            let (rest, _) = self.nested(|| self.sym(rest, "]"))?;
            head.key = Some(key);
            i = rest;
        } else if let Ok((rest, _)) = self.keyword(i, "contains") {
            let (rest, key) = self.expr(rest)?;
            head.key = Some(key);
            i = rest;
        }
        if let Ok((rest, _)) = self.assign_op(i) {
            let (rest, value) = self.expr(rest)?;
            head.value = Some(value);
            i = rest;
        }
        if head.key.is_none() && head.value.is_none() {
            head.value = Some(Term::boolean(true));
        }

        let (i, body) = self.rule_body(i)?;
        let mut rule = Rule::new(head.clone(), body.unwrap_or_else(Body::truthy));
        rule.location = location;

        // else chain
        let mut elses = vec![];
        let mut i = i;
        while let Ok((rest, _)) = self.keyword(skip_all(i), "else") {
            let else_loc = Some(self.location(rest));
            let (rest, value) = match self.assign_op(rest) {
                Ok((rest, _)) => {
                    let (rest, v) = self.expr(rest)?;
                    (rest, v)
                }
                Err(_) => (rest, Term::boolean(true)),
            };
            let (rest, body) = self.rule_body(rest)?;
            let mut else_head = head.clone();
            else_head.value = Some(value);
            let mut else_rule = Rule::new(else_head, body.unwrap_or_else(Body::truthy));
            else_rule.location = else_loc;
            elses.push(else_rule);
            i = rest;
        }
        let mut chain: Option<Box<Rule>> = None;
        for mut e in elses.into_iter().rev() {
            e.else_rule = chain;
            chain = Some(Box::new(e));
        }
        rule.else_rule = chain;
        Ok((i, rule))
    }

    fn rule_body<'a>(&self, i: &'a str) -> IResult<&'a str, Option<Body>> {
        let i = match self.keyword(i, "if") {
            Ok((rest, _)) => rest,
            Err(_) => i,
        };
        match self.sym(i, "{") {
            Ok((rest, _)) => {
                let (rest, body) = self.flat(|| self.body_exprs(rest))?;
                let (rest, _) = self.sym(skip_all(rest), "}")?;
                Ok((rest, Some(body)))
            }
            Err(_) => Ok((i, None)),
        }
    }

    // ------------------------------------------------------------------
    // Bodies and literals
    // ------------------------------------------------------------------

    fn body_exprs<'a>(&self, i: &'a str) -> IResult<&'a str, Body> {
        let mut exprs = vec![];
        let mut i = skip_all(i);
        loop {
            let (rest, mut lit) = self.literal(i)?;
            exprs.append(&mut lit);
            let rest = self.sp(rest);
            match rest.chars().next() {
                Some(';') | Some('\n') => {
                    let next = skip_all(&rest[1..]);
                    if next.starts_with('}') || next.starts_with(']') || next.is_empty() {
                        i = next;
                        break;
                    }
                    i = next;
                }
                _ => {
                    i = rest;
                    break;
                }
            }
        }
        if exprs.is_empty() {
            return Self::fail(i);
        }
        Ok((i, Body::new(exprs)))
    }

    fn literal<'a>(&self, i: &'a str) -> IResult<&'a str, Vec<Expr>> {
        let start = self.sp(i);
        let location = Some(self.location(start));

        if let Ok((rest, _)) = self.keyword(start, "some") {
            return self.some_decl(rest, location);
        }

        let (i, negated) = match self.keyword(start, "not") {
            Ok((rest, _)) => (rest, true),
            Err(_) => (start, false),
        };
        let (mut i, term) = self.expr(i)?;
        let terms = match term.value {
            Value::Call(terms) => ExprTerms::Call(terms),
            _ => ExprTerms::Term(term),
        };
        let mut expr = Expr::new(terms).with_location(location);
        expr.negated = negated;

        while let Ok((rest, _)) = self.keyword(i, "with") {
            let (rest, target) = self.operand(rest)?;
            let (rest, _) = self.keyword(rest, "as")?;
            let (rest, value) = self.expr(rest)?;
            expr.with.push(With { target, value });
            i = rest;
        }
        Ok((i, vec![expr]))
    }

    /// `some x, y` or `some x in xs` / `some k, v in xs`.
    fn some_decl<'a>(&self, i: &'a str, location: Option<Location>) -> IResult<&'a str, Vec<Expr>> {
        let (mut i, first) = self.operand(i)?;
        let mut vars = vec![first];
        while let Ok((rest, _)) = self.sym(i, ",") {
            let (rest, next) = self.operand(rest)?;
            vars.push(next);
            i = rest;
        }
        if let Ok((rest, _)) = self.keyword(i, "in") {
            let (rest, collection) = self.additive(rest)?;
            let (key, value) = match vars.len() {
                1 => (self.wildcard(), vars[0].clone()),
                2 => (vars[0].clone(), vars[1].clone()),
                _ => return Self::fail(i),
            };
            let decl: Vec<Term> = vars.iter().filter(|t| t.is_var()).cloned().collect();
            let lookup = match collection.value {
                Value::Ref(r) => r.append(key),
                _ => Ref(vec![collection, key]),
            };
            let eq = Expr::equality(Term::reference(lookup), value).with_location(location);
            let some = Expr::new(ExprTerms::SomeDecl(decl)).with_location(location);
            return Ok((rest, vec![some, eq]));
        }
        if vars.iter().any(|v| !v.is_var()) {
            return Self::fail(i);
        }
        Ok((i, vec![Expr::new(ExprTerms::SomeDecl(vars)).with_location(location)]))
    }

    // ------------------------------------------------------------------
    // Expressions (lowest to highest precedence)
    // ------------------------------------------------------------------

    fn expr<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        let (i, lhs) = self.comparison(i)?;
        match self.assign_op(i) {
            Ok((rest, op)) => {
                let (rest, rhs) = self.comparison(rest)?;
                let name = if op == ":=" { OP_ASSIGN } else { OP_EQ };
                Ok((rest, binary(name, lhs, rhs)))
            }
            _ => Ok((i, lhs)),
        }
    }

    fn comparison<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        let (i, lhs) = self.membership(i)?;
        let rest_in = self.sp(i);
        for op in ["==", "!=", "<=", ">=", "<", ">"] {
            if let Some(rest) = rest_in.strip_prefix(op) {
                let (rest, rhs) = self.membership(rest)?;
                return Ok((rest, binary(op_name(op), lhs, rhs)));
            }
        }
        Ok((i, lhs))
    }

    fn membership<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        let (i, lhs) = self.union(i)?;
        match self.keyword(i, "in") {
            Ok((rest, _)) => {
                let (rest, rhs) = self.union(rest)?;
                Ok((rest, binary(op_name("in"), lhs, rhs)))
            }
            Err(_) => Ok((i, lhs)),
        }
    }

    fn union<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        self.left_assoc(i, &["|"], &|i| self.intersection(i))
    }

    fn intersection<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        self.left_assoc(i, &["&"], &|i| self.additive(i))
    }

    fn additive<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        self.left_assoc(i, &["+", "-"], &|i| self.multiplicative(i))
    }

    fn multiplicative<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        self.left_assoc(i, &["*", "/", "%"], &|i| self.unary(i))
    }

    fn left_assoc<'a>(
        &self,
        i: &'a str,
        ops: &[&'static str],
        next: &dyn Fn(&'a str) -> IResult<&'a str, Term>,
    ) -> IResult<&'a str, Term> {
        let (mut i, mut lhs) = next(i)?;
        'outer: loop {
            let rest_in = self.sp(i);
            for op in ops {
                if let Some(rest) = rest_in.strip_prefix(op) {
                    // `||` is not an operator; inside a collection `|` opens a comprehension.
                    if *op == "|" && (rest.starts_with('|') || self.no_union.get()) {
                        break 'outer;
                    }
                    let (rest, rhs) = next(rest)?;
                    lhs = binary(op_name(op), lhs, rhs);
                    i = rest;
                    continue 'outer;
                }
            }
            break;
        }
        Ok((i, lhs))
    }

    fn unary<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        let start = self.sp(i);
        if let Some(rest) = start.strip_prefix('-') {
            if let Ok((rest, n)) = number(rest) {
                let n = match n {
                    Number::Int(i) => Number::Int(-i),
                    Number::Float(f) => Number::Float(-f),
                };
                return Ok((rest, Term::number(n).with_location(Some(self.location(start)))));
            }
            let (rest, t) = self.operand(rest)?;
            return Ok((rest, binary("minus", Term::int(0), t)));
        }
        self.operand(start)
    }

    /// Primary term followed by ref and call suffixes.
    fn operand<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        let start = self.sp(i);
        let location = Some(self.location(start));
        let (mut i, head) = self.primary(start)?;
        let mut segments: Vec<Term> = vec![];

        loop {
            if let Some(rest) = i.strip_prefix('.') {
                let (rest, name) = ident(rest)?;
                segments.push(Term::string(name));
                i = rest;
                continue;
            }
            if let Some(rest) = i.strip_prefix('[') {
                let (rest, index) = self.nested(|| self.expr(rest))?;
                let (rest, _) = self.nested(|| self.sym(rest, "]"))?;
                segments.push(index);
                i = rest;
                continue;
            }
            if let Some(rest) = i.strip_prefix('(') {
                let operator = match (&head.value, segments.iter().all(|s| s.as_str().is_some())) {
                    (Value::Var(_), true) => {
                        let mut terms = vec![head.clone()];
                        terms.extend(segments.drain(..));
                        Ref(terms)
                    }
                    _ => return Self::fail(i),
                };
                let (rest, args) = self.nested(|| self.term_list(rest, ")"))?;
                if operator.to_string() == "set" && args.is_empty() {
                    return Ok((rest, Term::set(vec![]).with_location(location)));
                }
                return Ok((rest, Term::call(operator, args).with_location(location)));
            }
            break;
        }

        if segments.is_empty() {
            return Ok((i, head));
        }
        let mut terms = vec![head];
        terms.extend(segments);
        Ok((i, Term::reference(Ref(terms)).with_location(location)))
    }

    fn primary<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        let location = Some(self.location(i));
        let at = |t: Term| t.with_location(location);

        if let Ok((rest, n)) = number(i) {
            return Ok((rest, at(Term::number(n))));
        }
        if i.starts_with('"') {
            let (rest, s) = string_lit(i)?;
            return Ok((rest, at(Term::string(s))));
        }
        if let Some(rest) = i.strip_prefix('`') {
            let end = rest.find('`').ok_or_else(|| {
                nom::Err::Error(nom::error::Error::new(i, nom::error::ErrorKind::Char))
            })?;
            return Ok((&rest[end + 1..], at(Term::string(&rest[..end]))));
        }
        if let Some(rest) = i.strip_prefix('(') {
            let (rest, t) = self.nested(|| self.expr(rest))?;
            let (rest, _) = self.nested(|| self.sym(rest, ")"))?;
            return Ok((rest, t));
        }
        if let Some(rest) = i.strip_prefix('[') {
            return self.nested(|| self.array(rest)).map(|(r, t)| (r, at(t)));
        }
        if let Some(rest) = i.strip_prefix('{') {
            return self.nested(|| self.brace(rest)).map(|(r, t)| (r, at(t)));
        }

        let (rest, name) = ident(i)?;
        match name {
            "true" => Ok((rest, at(Term::boolean(true)))),
            "false" => Ok((rest, at(Term::boolean(false)))),
            "null" => Ok((rest, at(Term::null()))),
            "_" => Ok((rest, at(self.wildcard()))),
            kw if KEYWORDS.contains(&kw) => Self::fail(i),
            _ => Ok((rest, at(Term::var(name)))),
        }
    }

    fn wildcard(&self) -> Term {
        let n = self.wildcards.get();
        self.wildcards.set(n + 1);
        Term::var(format!("${n}"))
    }

    /// First element of a bracketed collection, where a top-level `|`
    /// introduces a comprehension body instead of a set union.
    fn collection_elem<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        let saved = self.no_union.replace(true);
        let out = self.expr(i);
        self.no_union.set(saved);
        out
    }

    fn comprehension_body<'a>(&self, i: &'a str, close: &'static str) -> IResult<&'a str, Body> {
        let (rest, body) = self.flat(|| self.body_exprs(i))?;
        let (rest, _) = self.sym(skip_all(rest), close)?;
        Ok((rest, body))
    }

    fn array<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        if let Ok((rest, _)) = self.sym(i, "]") {
            return Ok((rest, Term::array(vec![])));
        }
        let (i, first) = self.collection_elem(i)?;
        if let Ok((rest, _)) = self.sym(i, "|") {
            let (rest, body) = self.comprehension_body(rest, "]")?;
            return Ok((
                rest,
                Term::new(Value::ArrayComprehension(Box::new(ArrayComprehension { term: first, body }))),
            ));
        }
        let (i, mut rest_items) = self.continue_list(i, "]")?;
        rest_items.insert(0, first);
        Ok((i, Term::array(rest_items)))
    }

    fn brace<'a>(&self, i: &'a str) -> IResult<&'a str, Term> {
        if let Ok((rest, _)) = self.sym(i, "}") {
            return Ok((rest, Term::object(vec![])));
        }
        let (i, first) = self.collection_elem(i)?;
        if let Ok((rest, _)) = self.sym(i, ":") {
            let (rest, value) = self.collection_elem(rest)?;
            if let Ok((rest, _)) = self.sym(rest, "|") {
                let (rest, body) = self.comprehension_body(rest, "}")?;
                return Ok((
                    rest,
                    Term::new(Value::ObjectComprehension(Box::new(ObjectComprehension {
                        key: first,
                        value,
                        body,
                    }))),
                ));
            }
            let mut pairs = vec![(first, value)];
            let mut i = rest;
            loop {
                if let Ok((rest, _)) = self.sym(i, "}") {
                    return Ok((rest, Term::object(pairs)));
                }
                let (rest, _) = self.sym(i, ",")?;
                if let Ok((rest, _)) = self.sym(rest, "}") {
                    return Ok((rest, Term::object(pairs)));
                }
                let (rest, k) = self.expr(rest)?;
                let (rest, _) = self.sym(rest, ":")?;
                let (rest, v) = self.expr(rest)?;
                pairs.push((k, v));
                i = rest;
            }
        }
        if let Ok((rest, _)) = self.sym(i, "|") {
            let (rest, body) = self.comprehension_body(rest, "}")?;
            return Ok((
                rest,
                Term::new(Value::SetComprehension(Box::new(SetComprehension { term: first, body }))),
            ));
        }
        let (i, mut items) = self.continue_list(i, "}")?;
        items.insert(0, first);
        Ok((i, Term::set(items)))
    }

    /// `, a, b <close>` after a first element.
    fn continue_list<'a>(&self, mut i: &'a str, close: &'static str) -> IResult<&'a str, Vec<Term>> {
        let mut out = vec![];
        loop {
            if let Ok((rest, _)) = self.sym(i, close) {
                return Ok((rest, out));
            }
            let (rest, _) = self.sym(i, ",")?;
            if let Ok((rest, _)) = self.sym(rest, close) {
                return Ok((rest, out));
            }
            let (rest, t) = self.expr(rest)?;
            out.push(t);
            i = rest;
        }
    }

    fn term_list<'a>(&self, i: &'a str, close: &'static str) -> IResult<&'a str, Vec<Term>> {
        if let Ok((rest, _)) = self.sym(i, close) {
            return Ok((rest, vec![]));
        }
        let (i, first) = self.expr(i)?;
        let (i, mut rest) = self.continue_list(i, close)?;
        rest.insert(0, first);
        Ok((i, rest))
    }
}

// ============================================================================
// Lexical helpers
// ============================================================================

fn binary(op: &str, lhs: Term, rhs: Term) -> Term {
    let location = lhs.location;
    Term::call(operator_ref(op), vec![lhs, rhs]).with_location(location)
}

fn op_name(symbol: &str) -> &'static str {
    INFIX_OPERATORS
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, n)| *n)
        .unwrap_or("unknown")
}

/// Skip all whitespace, newlines and comments.
fn skip_all(mut i: &str) -> &str {
    loop {
        let trimmed = i.trim_start();
        if let Some(comment) = trimmed.strip_prefix('#') {
            i = comment.find('\n').map(|n| &comment[n..]).unwrap_or("");
            continue;
        }
        return trimmed;
    }
}

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))(input)
}

fn number(input: &str) -> IResult<&str, Number> {
    let (rest, text) = recognize(tuple((
        digit1,
        opt(pair(pchar('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input)?;
    if rest.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        return Err(nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit)));
    }
    let n = match text.parse::<i64>() {
        Ok(i) => Number::Int(i),
        Err(_) => Number::from_f64(text.parse::<f64>().map_err(|_| {
            nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Float))
        })?),
    };
    Ok((rest, n))
}

fn string_lit(input: &str) -> IResult<&str, String> {
    let err = || nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Char));
    let mut out = String::new();
    let mut chars = input.char_indices().skip(1);
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((&input[idx + 1..], out)),
            '\n' => return Err(err()),
            '\\' => {
                let (_, esc) = chars.next().ok_or_else(err)?;
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    '/' => out.push('/'),
                    'u' => {
                        let hex: String = (0..4).filter_map(|_| chars.next().map(|(_, c)| c)).collect();
                        let code = u32::from_str_radix(&hex, 16).map_err(|_| err())?;
                        out.push(char::from_u32(code).ok_or_else(err)?);
                    }
                    _ => return Err(err()),
                }
            }
            c => out.push(c),
        }
    }
    Err(err())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::RuleKind;

    #[test]
    fn parses_rule_kinds() {
        let module = parse_module(
            r#"
            package policy

            default allow = false
            allow { input.user == "admin" }
            s[x] { x := 1 }
            m[k] = v { k := "a"; v := 1 }
            f(x) = y { y := x + 1 }
            "#,
        )
        .expect("should parse");
        assert_eq!(module.package.to_string(), "data.policy");
        let kinds: Vec<_> = module.rules.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                RuleKind::Complete,
                RuleKind::Complete,
                RuleKind::PartialSet,
                RuleKind::PartialObject,
                RuleKind::Function
            ]
        );
        assert!(module.rules[0].default);
        assert_eq!(module.rules[1].body.to_string(), "input.user == \"admin\"");
        assert_eq!(module.rules[3].body.len(), 2);
    }

    #[test]
    fn parses_else_chains_and_if() {
        let module = parse_module(
            r#"
            package p
            grade = "a" if { input.score > 90 } else = "b" { input.score > 80 } else = "c"
            "#,
        )
        .expect("should parse");
        let rule = &module.rules[0];
        let first = rule.else_rule.as_ref().expect("else");
        let second = first.else_rule.as_ref().expect("second else");
        assert_eq!(first.head.value, Some(Term::string("b")));
        assert_eq!(second.head.value, Some(Term::string("c")));
        assert_eq!(second.body.to_string(), "true");
    }

    #[test]
    fn newlines_separate_literals_outside_brackets() {
        let body = parse_body(
            "x := [1,\n 2]\ny := {\"a\": x}\nnot y.b",
        )
        .expect("should parse");
        assert_eq!(body.len(), 3);
        assert!(body[2].negated);
        assert_eq!(body[2].to_string(), "not y.b");
    }

    #[test]
    fn parses_comprehensions() {
        let t = parse_term("[x | x := input.a[_]; x > 1]").expect("array");
        assert!(matches!(t.value, Value::ArrayComprehension(_)));
        let t = parse_term("{x | some x in input.xs}").expect("set");
        assert!(matches!(t.value, Value::SetComprehension(_)));
        let t = parse_term("{k: v | v := input.m[k]}").expect("object");
        assert!(matches!(t.value, Value::ObjectComprehension(_)));
        let t = parse_term("{1, 2} | {3}").expect("union");
        assert_eq!(t.to_string(), "{1, 2} | {3}");
    }

    #[test]
    fn parses_with_and_some_in() {
        let body = parse_body("some k, v in input.m; data.p.allow with input.user as \"bob\"")
            .expect("should parse");
        assert_eq!(body.len(), 3);
        assert_eq!(body[1].to_string(), "input.m[k] = v");
        assert_eq!(body[2].with.len(), 1);
        assert_eq!(body[2].to_string(), "data.p.allow with input.user as \"bob\"");
    }

    #[test]
    fn wildcards_are_unique() {
        let body = parse_body("input.a[_] = input.b[_]").expect("should parse");
        let vars = body.vars();
        assert!(vars.iter().any(|v| v.name() == "$0"));
        assert!(vars.iter().any(|v| v.name() == "$1"));
    }

    #[test]
    fn reports_location_of_errors() {
        let err = parse_module("package p\n\nallow { input.x == }").expect_err("should fail");
        let ParseError::Syntax { location, .. } = err;
        assert_eq!(location.row, 3);
    }

    #[test]
    fn parses_numbers_strings_and_calls() {
        let t = parse_term(r#"array.concat([-1, 2.5e1], ["a\n", `raw\n`])"#).expect("call");
        let Value::Call(terms) = &t.value else {
            panic!("expected call")
        };
        assert_eq!(terms[0].to_string(), "array.concat");
        assert_eq!(terms[1].to_string(), "[-1, 25]");
        assert_eq!(terms[2].to_string(), "[\"a\\n\", \"raw\\\\n\"]");
    }
}
