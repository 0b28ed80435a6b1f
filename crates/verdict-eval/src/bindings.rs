//! Variable bindings
//!
//! One store per run holds the bindings of every frame (query, rule body,
//! function call). A binding maps `(frame, var)` to a term together with
//! the frame that term must be interpreted in. Every write is recorded on
//! a trail so backtracking restores the store exactly.

use ahash::AHashMap;
use verdict_lang::term::{ArrayComprehension, ObjectComprehension, SetComprehension};
use verdict_lang::{Body, Expr, ExprTerms, Ref, Term, Value, Var, With};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BindingsId(pub(crate) u32);

impl BindingsId {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Trail position to rewind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Undo(usize);

type Slot = (BindingsId, Var);

#[derive(Debug, Default)]
pub struct BindingStore {
    values: AHashMap<Slot, (Term, BindingsId)>,
    trail: Vec<(Slot, Option<(Term, BindingsId)>)>,
    next_frame: u32,
}

impl BindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_frame(&mut self) -> BindingsId {
        let id = BindingsId(self.next_frame);
        self.next_frame += 1;
        id
    }

    /// Hand the most recent frame id back once its evaluation finished.
    pub fn release(&mut self, frame: BindingsId) {
        if frame.0 + 1 == self.next_frame {
            self.next_frame = frame.0;
        }
    }

    pub fn mark(&self) -> Undo {
        Undo(self.trail.len())
    }

    pub fn bind(&mut self, var: &Var, frame: BindingsId, value: Term, value_frame: BindingsId) -> Undo {
        let mark = self.mark();
        let slot = (frame, var.clone());
        let prev = self.values.insert(slot.clone(), (value, value_frame));
        self.trail.push((slot, prev));
        mark
    }

    pub fn undo(&mut self, undo: Undo) {
        while self.trail.len() > undo.0 {
            let Some((slot, prev)) = self.trail.pop() else {
                break;
            };
            match prev {
                Some(v) => {
                    self.values.insert(slot, v);
                }
                None => {
                    self.values.remove(&slot);
                }
            }
        }
    }

    pub fn lookup(&self, var: &Var, frame: BindingsId) -> Option<&(Term, BindingsId)> {
        self.values.get(&(frame, var.clone()))
    }

    /// Follow var-to-term chains until reaching a non-var or an unbound var.
    pub fn apply(&self, term: &Term, frame: BindingsId) -> (Term, BindingsId) {
        let mut current = (term.clone(), frame);
        while let Value::Var(v) = &current.0.value {
            match self.lookup(v, current.1) {
                Some((t, f)) => current = (t.clone(), *f),
                None => break,
            }
        }
        current
    }

    /// Substitute bindings everywhere inside `term`.
    pub fn plug(&self, term: &Term, frame: BindingsId) -> Term {
        self.plug_with(term, frame, None)
    }

    /// Like [`plug`](Self::plug), but unbound vars of frames other than
    /// `caller` are renamed `<name><frame>` so residual output from
    /// different frames cannot collide.
    pub fn plug_namespaced(&self, term: &Term, frame: BindingsId, caller: BindingsId) -> Term {
        self.plug_with(term, frame, Some(caller))
    }

    pub fn plug_expr(&self, expr: &Expr, frame: BindingsId, caller: BindingsId) -> Expr {
        let plug = |t: &Term| self.plug_namespaced(t, frame, caller);
        let terms = match &expr.terms {
            ExprTerms::Term(t) => ExprTerms::Term(plug(t)),
            ExprTerms::Call(terms) => {
                let mut out = vec![terms[0].clone()];
                out.extend(terms[1..].iter().map(plug));
                ExprTerms::Call(out)
            }
            ExprTerms::SomeDecl(vars) => ExprTerms::SomeDecl(vars.iter().map(plug).collect()),
        };
        Expr {
            terms,
            with: expr
                .with
                .iter()
                .map(|w| With {
                    target: w.target.clone(),
                    value: plug(&w.value),
                })
                .collect(),
            ..expr.clone()
        }
    }

    fn plug_with(&self, term: &Term, frame: BindingsId, caller: Option<BindingsId>) -> Term {
        let value = match &term.value {
            Value::Var(v) => {
                return match self.lookup(v, frame) {
                    Some((t, f)) => self.plug_with(t, *f, caller),
                    None => match caller {
                        Some(c) if c != frame && !v.is_root() => {
                            Term::var(format!("{v}{}", frame.0)).with_location(term.location)
                        }
                        _ => term.clone(),
                    },
                };
            }
            Value::Ref(r) => {
                let mut terms: Vec<Term> = r.0.iter().map(|t| self.plug_with(t, frame, caller)).collect();
                if let Some(Value::Ref(head)) = terms.first().map(|h| h.value.clone()) {
                    let mut spliced = head.0;
                    spliced.extend(terms.drain(1..));
                    terms = spliced;
                }
                Value::Ref(Ref(terms))
            }
            Value::Array(items) if !items.iter().all(Term::is_ground) => {
                Value::Array(items.iter().map(|t| self.plug_with(t, frame, caller)).collect::<Vec<_>>().into())
            }
            Value::Object(obj) if !term.is_ground() => Value::Object(
                obj.iter()
                    .map(|(k, v)| (self.plug_with(k, frame, caller), self.plug_with(v, frame, caller)))
                    .collect::<verdict_lang::term::Object>()
                    .into(),
            ),
            Value::Set(set) if !term.is_ground() => Value::Set(
                set.iter()
                    .map(|t| self.plug_with(t, frame, caller))
                    .collect::<verdict_lang::term::Set>()
                    .into(),
            ),
            Value::Call(terms) => {
                let mut out = vec![terms[0].clone()];
                out.extend(terms[1..].iter().map(|t| self.plug_with(t, frame, caller)));
                Value::Call(out)
            }
            Value::ArrayComprehension(c) => Value::ArrayComprehension(Box::new(ArrayComprehension {
                term: self.plug_with(&c.term, frame, caller),
                body: self.plug_body(&c.body, frame, caller),
            })),
            Value::SetComprehension(c) => Value::SetComprehension(Box::new(SetComprehension {
                term: self.plug_with(&c.term, frame, caller),
                body: self.plug_body(&c.body, frame, caller),
            })),
            Value::ObjectComprehension(c) => Value::ObjectComprehension(Box::new(ObjectComprehension {
                key: self.plug_with(&c.key, frame, caller),
                value: self.plug_with(&c.value, frame, caller),
                body: self.plug_body(&c.body, frame, caller),
            })),
            _ => return term.clone(),
        };
        Term {
            value,
            location: term.location,
        }
    }

    fn plug_body(&self, body: &Body, frame: BindingsId, caller: Option<BindingsId>) -> Body {
        Body::new(
            body.iter()
                .map(|e| match caller {
                    Some(c) => self.plug_expr(e, frame, c),
                    None => e.map_vars(&mut |v| {
                        self.lookup(v, frame).map(|(t, f)| self.plug_with(t, *f, None))
                    }),
                })
                .collect(),
        )
    }

    /// Bindings recorded for `frame`, sorted by var name.
    pub fn frame_bindings(&self, frame: BindingsId) -> Vec<(Var, Term, BindingsId)> {
        let mut out: Vec<_> = self
            .values
            .iter()
            .filter(|((f, _), _)| *f == frame)
            .map(|((_, v), (t, tf))| (v.clone(), t.clone(), *tf))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
