//! Core evaluator
//!
//! Evaluation is continuation-passing: every operation receives the rest
//! of the evaluation as a closure and calls it once per solution. Not
//! calling it is failure. Backtracking happens on return, with bindings
//! undone through the binding store's trail.
//!
//! ```text
//!   Query::iter
//!     └─ eval_body ─ eval_expr ─┬─ eval_with ─ eval_step
//!                               └─ eval_step ─┬─ biunify ─ biunify_ref ─ TreeStep / TermStep / VirtualStep
//!                                             ├─ eval_call (built-ins, functions)
//!                                             ├─ eval_not
//!                                             └─ eval_term_expr
//! ```
//!
//! In partial mode anything depending on the save set is recorded on the
//! save stack instead of being evaluated, and the continuation proceeds as
//! if the saved expression had succeeded.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace, Level};
use verdict_lang::term::{Object, Set};
use verdict_lang::{
    Body, CompiledPolicy, Expr, ExprTerms, Head, Location, Ref, Rule, RuleId, RuleTreeNode, Term, Value, Var,
    DATA_ROOT, INPUT_ROOT,
};
use verdict_storage::{Storage, StoragePath, Transaction};

use crate::bindings::{BindingStore, BindingsId};
use crate::builtins::{dispatch, BuiltinCache, BuiltinContext, BuiltinRegistry};
use crate::cache::{BaseCache, VirtualCache};
use crate::cancel::Cancel;
use crate::copyprop::CopyPropagator;
use crate::error::EvalError;
use crate::metrics::{self, Metrics};
use crate::resolve::{TermStep, TreeStep};
use crate::rules;
use crate::save::{can_inline_negation, complemented_product, InliningControl, SaveSet, SaveStack, SaveSupport, SavedExpr};
use crate::tracer::{Event, Op, QueryTracer};

/// Residual bodies of a negated expression are inlined as complements only
/// while their cross product stays at or below this many bodies.
pub(crate) const NEGATION_PRODUCT_LIMIT: usize = 16;

pub(crate) type Cont<'a, 'q> = dyn FnMut(&mut Eval<'q>) -> Result<(), EvalError> + 'a;
pub(crate) type TermCont<'a, 'q> = dyn FnMut(&mut Eval<'q>, Term) -> Result<(), EvalError> + 'a;
pub(crate) type ListCont<'a, 'q> = dyn FnMut(&mut Eval<'q>, Vec<Term>) -> Result<(), EvalError> + 'a;

/// Everything a run reads but never changes.
#[derive(Clone, Copy)]
pub(crate) struct Env<'q> {
    pub policy: &'q CompiledPolicy,
    pub store: Option<(&'q dyn Storage, &'q Transaction)>,
    pub builtins: &'q BuiltinRegistry,
    pub builtin_cache: &'q BuiltinCache,
    pub cancel: Option<&'q Cancel>,
    pub tracers: &'q [Arc<dyn QueryTracer>],
    pub metrics: Option<&'q Metrics>,
    pub indexing: bool,
    pub namespace: &'q str,
}

/// A query being evaluated: its bindings plus ids for tracing.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Frame {
    pub bindings: BindingsId,
    pub query_id: u64,
    pub parent_id: u64,
}

/// `with` state: the effective input, data overrides and the refs whose
/// inlining the modifier disables.
#[derive(Debug, Default)]
pub(crate) struct WithScope {
    input: Option<Term>,
    data: Vec<(Vec<Term>, Term)>,
    disable: Vec<Ref>,
}

pub(crate) struct Eval<'q> {
    pub(crate) env: Env<'q>,
    pub(crate) bindings: BindingStore,
    /// Frame of the top-level query; residual output is namespaced against it.
    pub(crate) caller: BindingsId,
    pub(crate) partial: bool,
    pub(crate) virtual_cache: VirtualCache,
    pub(crate) save_set: SaveSet,
    pub(crate) save_stack: SaveStack,
    pub(crate) support: SaveSupport,
    pub(crate) inlining: InliningControl,
    base_cache: BaseCache,
    input: Option<Term>,
    data_overrides: Vec<(Vec<Term>, Term)>,
    /// Query id and parent query id of each live bindings frame.
    frame_queries: Vec<(u64, u64)>,
    next_query: u64,
    next_var: u64,
}

impl<'q> Eval<'q> {
    pub(crate) fn new(env: Env<'q>, input: Option<Term>, partial: bool) -> Self {
        let mut bindings = BindingStore::new();
        let caller = bindings.new_frame();
        Eval {
            env,
            bindings,
            caller,
            partial,
            virtual_cache: VirtualCache::default(),
            save_set: SaveSet::default(),
            save_stack: SaveStack::default(),
            support: SaveSupport::default(),
            inlining: InliningControl::default(),
            base_cache: BaseCache::default(),
            input,
            data_overrides: vec![],
            frame_queries: vec![(0, 0)],
            next_query: 0,
            next_var: 0,
        }
    }

    /// Frame of the top-level query.
    pub(crate) fn root_frame(&self) -> Frame {
        Frame {
            bindings: self.caller,
            query_id: 0,
            parent_id: 0,
        }
    }

    // ------------------------------------------------------------------------
    // Frames, fresh names, instrumentation
    // ------------------------------------------------------------------------

    /// A frame with its own bindings, for rule and function bodies.
    pub(crate) fn child_frame(&mut self, parent: BindingsId) -> Frame {
        let bindings = self.bindings.new_frame();
        let query_id = self.next_query_id();
        let parent_id = self.query_of(parent);
        let slot = bindings.index() as usize;
        if self.frame_queries.len() <= slot {
            self.frame_queries.resize(slot + 1, (0, 0));
        }
        self.frame_queries[slot] = (query_id, parent_id);
        Frame {
            bindings,
            query_id,
            parent_id,
        }
    }

    /// A frame sharing `parent`'s bindings, for comprehensions and negation.
    pub(crate) fn closure_frame(&mut self, parent: BindingsId) -> Frame {
        Frame {
            bindings: parent,
            query_id: self.next_query_id(),
            parent_id: self.query_of(parent),
        }
    }

    pub(crate) fn release(&mut self, frame: Frame) {
        self.bindings.release(frame.bindings);
    }

    fn query_of(&self, bindings: BindingsId) -> u64 {
        self.frame_ids(bindings).0
    }

    fn frame_ids(&self, bindings: BindingsId) -> (u64, u64) {
        self.frame_queries.get(bindings.index() as usize).copied().unwrap_or_default()
    }

    fn next_query_id(&mut self) -> u64 {
        self.next_query += 1;
        self.next_query
    }

    pub(crate) fn fresh_var(&mut self, prefix: &str) -> Term {
        self.next_var += 1;
        Term::var(format!("__{prefix}{}__", self.next_var))
    }

    pub(crate) fn trace(&self, op: Op, frame: &Frame, node: &dyn Display, location: Option<Location>) {
        if self.env.tracers.is_empty() && !tracing::enabled!(Level::TRACE) {
            return;
        }
        let event = Event {
            op,
            query_id: frame.query_id,
            parent_id: frame.parent_id,
            node: node.to_string(),
            location,
        };
        trace!(op = ?event.op, query = event.query_id, node = %event.node, "eval event");
        for tracer in self.env.tracers.iter().filter(|t| t.enabled()) {
            tracer.trace(&event);
        }
    }

    pub(crate) fn count(&self, name: &str) {
        if let Some(m) = self.env.metrics {
            m.counter_incr(name);
        }
    }

    fn check_cancel(&self) -> Result<(), EvalError> {
        match self.env.cancel {
            Some(c) if c.is_cancelled() => Err(EvalError::Cancelled),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Bodies and expressions
    // ------------------------------------------------------------------------

    pub(crate) fn eval_body(&mut self, body: &Body, frame: &Frame, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        self.trace(Op::Enter, frame, body, None);
        self.eval_expr(body, 0, frame, &mut |ev| {
            ev.trace(Op::Exit, frame, body, None);
            let result = k(ev);
            ev.trace(Op::Redo, frame, body, None);
            result
        })
    }

    fn eval_expr(&mut self, body: &Body, index: usize, frame: &Frame, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        self.check_cancel()?;
        let Some(expr) = body.get(index) else {
            return k(self);
        };
        self.trace(Op::Eval, frame, expr, expr.location);
        let mut defined = false;
        let mut next = |ev: &mut Eval<'q>| {
            defined = true;
            ev.eval_expr(body, index + 1, frame, k)
        };
        if expr.with.is_empty() {
            self.eval_step(expr, frame, &mut next)?;
        } else {
            self.eval_with(expr, frame, &mut next)?;
        }
        if !defined {
            self.trace(Op::Fail, frame, expr, expr.location);
        }
        Ok(())
    }

    fn eval_step(&mut self, expr: &Expr, frame: &Frame, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        if expr.negated {
            return self.eval_not(expr, frame, k);
        }
        let b = frame.bindings;
        match &expr.terms {
            ExprTerms::SomeDecl(_) => k(self),
            ExprTerms::Term(t) => self.eval_term_expr(t, b, k),
            ExprTerms::Call(_) if expr.is_equality() => {
                let ops = expr.operands();
                self.biunify(&ops[0], &ops[1], b, b, k)
            }
            ExprTerms::Call(terms) => self.eval_call(terms, expr.location, b, k),
        }
    }

    /// A bare term succeeds when it is defined and not `false`.
    fn eval_term_expr(&mut self, t: &Term, b: BindingsId, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let rterm = self.fresh_var("term");
        self.biunify(t, &rterm, b, b, &mut |ev| {
            if ev.partial {
                let (value, vb) = ev.bindings.apply(&rterm, b);
                if ev.in_save_set(&value, vb) {
                    return ev.save_expr(Expr::term(rterm.clone()), b, k);
                }
            }
            if ev.bindings.plug(&rterm, b).is_false() {
                return Ok(());
            }
            k(ev)
        })
    }

    // ------------------------------------------------------------------------
    // Negation
    // ------------------------------------------------------------------------

    fn eval_not(&mut self, expr: &Expr, frame: &Frame, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        if self.partial && self.expr_unknown(expr, frame.bindings) {
            return self.eval_not_partial(expr, frame, k);
        }
        let negation = Body::new(vec![expr.complement().no_with()]);
        let child = self.closure_frame(frame.bindings);
        let mut defined = false;
        self.eval_body(&negation, &child, &mut |_| {
            defined = true;
            Ok(())
        })?;
        if defined {
            self.trace(Op::Fail, frame, expr, expr.location);
            return Ok(());
        }
        k(self)
    }

    fn eval_not_partial(&mut self, expr: &Expr, frame: &Frame, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let negation = Body::new(vec![expr.complement().no_with()]);
        let child = self.closure_frame(frame.bindings);
        let caller = self.caller;
        let safe = self.save_set.vars_namespaced(caller);
        let mut live: BTreeSet<Var> = safe.iter().cloned().collect();
        live.extend(self.bindings.plug_expr(&expr.no_with(), frame.bindings, caller).vars());

        self.save_stack.push_query(vec![]);
        let mut queries: Vec<Vec<Expr>> = vec![];
        let result = self.eval_body(&negation, &child, &mut |ev| {
            queries.push(ev.save_stack.plug_query(&ev.bindings, caller));
            Ok(())
        });
        self.save_stack.pop_query();
        result?;

        if queries.is_empty() {
            return k(self);
        }
        let propagate = CopyPropagator::new(live).ensure_non_empty(false);
        let queries: Vec<Vec<Expr>> = queries.iter().map(|q| self.copy_propagate(&propagate, q)).collect();
        // A body with nothing left to check always holds, so the negation cannot.
        if queries.iter().any(Vec::is_empty) {
            return Ok(());
        }

        let with: Vec<_> = self.bindings.plug_expr(expr, frame.bindings, caller).with;
        if can_inline_negation(&safe, &queries, NEGATION_PRODUCT_LIMIT) {
            for row in complemented_product(&queries) {
                let row = row
                    .into_iter()
                    .map(|mut e| {
                        e.with = with.clone();
                        e
                    })
                    .collect();
                self.save_plugged(row, frame, k)?;
            }
            return Ok(());
        }

        let name = format!("__not{}_{}_{}__", frame.query_id, expr.index, child.query_id);
        let path = self.namespace_ref(&Ref(vec![Term::var(DATA_ROOT), Term::string(&name)]));
        let mut body_vars = BTreeSet::new();
        for q in &queries {
            for e in q {
                body_vars.extend(e.vars());
            }
        }
        let args: Vec<Term> = safe.iter().filter(|v| body_vars.contains(*v)).map(|v| Term::var(v.name())).collect();
        for q in queries {
            let mut head = Head::new(name.clone(), Some(Term::boolean(true)));
            head.args = args.clone();
            self.support.insert(&path, Rule::new(head, Body::new(q)));
        }
        let target = Term::reference(path);
        let mut call = if args.is_empty() {
            Expr::term(target)
        } else {
            let mut terms = vec![target];
            terms.extend(args);
            Expr::new(ExprTerms::Call(terms))
        };
        call.negated = true;
        call.with = with;
        call.location = expr.location;
        self.save_plugged(vec![call], frame, k)
    }

    /// Record already-plugged expressions and continue.
    fn save_plugged(&mut self, exprs: Vec<Expr>, frame: &Frame, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let n = exprs.len();
        for e in exprs {
            self.trace(Op::Save, frame, &e, e.location);
            self.save_stack.push(SavedExpr::plugged(e));
        }
        let result = k(self);
        for _ in 0..n {
            self.save_stack.pop();
        }
        result
    }

    // ------------------------------------------------------------------------
    // With modifiers
    // ------------------------------------------------------------------------

    fn eval_with(&mut self, expr: &Expr, frame: &Frame, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let b = frame.bindings;
        if self.partial {
            let unknown = expr.with.iter().any(|w| {
                let target = match w.target.as_ref() {
                    Some(r) => r.clone(),
                    None => Ref(vec![w.target.clone()]),
                };
                self.contains_unknown(&w.value, b) || self.save_set.contains_ref(&target)
            });
            if unknown {
                return self.save_expr(expr.clone(), b, k);
            }
        }
        let mut disable = vec![];
        if self.partial {
            expr.no_with().walk_terms(&mut |t| {
                if let Value::Ref(r) = &t.value {
                    if r.is_rooted_at(DATA_ROOT) {
                        disable.push(r.ground_prefix());
                    }
                }
                false
            });
        }
        let values: Vec<Term> = expr.with.iter().map(|w| w.value.clone()).collect();
        self.resolve_all(&values, 0, vec![], b, &mut |ev, resolved| {
            let scope = ev.with_scope(expr, &resolved, b, disable.clone())?;
            let mut saved = ev.enter_with(scope);
            let result = ev.eval_step(expr, frame, &mut |inner| {
                let active = inner.leave_with(std::mem::take(&mut saved));
                let result = k(inner);
                saved = inner.enter_with(active);
                result
            });
            ev.leave_with(saved);
            result
        })
    }

    fn with_scope(&self, expr: &Expr, values: &[Term], b: BindingsId, disable: Vec<Ref>) -> Result<WithScope, EvalError> {
        let mut input = self.input.clone();
        let mut data = self.data_overrides.clone();
        for (w, v) in expr.with.iter().zip(values) {
            let value = self.bindings.plug(v, b);
            let target = match (&w.target.value, w.target.as_var()) {
                (Value::Ref(r), _) => r.clone(),
                (_, Some(v)) => Ref(vec![Term::var(v.name())]),
                _ => return Err(EvalError::Internal(format!("invalid with target {}", w.target))),
            };
            let path: Vec<Term> = target.0[1..].iter().map(|t| self.bindings.plug(t, b)).collect();
            if target.is_rooted_at(INPUT_ROOT) {
                let base = input.take().unwrap_or_else(|| Term::object([]));
                input = Some(patch(&base, &path, value));
            } else if target.is_rooted_at(DATA_ROOT) {
                data.push((path, value));
            } else {
                return Err(EvalError::Internal(format!("invalid with target {target}")));
            }
        }
        Ok(WithScope { input, data, disable })
    }

    /// Install `scope`, returning the state it replaced.
    fn enter_with(&mut self, scope: WithScope) -> WithScope {
        self.inlining.push_disable(scope.disable.clone(), true);
        self.virtual_cache.push();
        WithScope {
            input: std::mem::replace(&mut self.input, scope.input),
            data: std::mem::replace(&mut self.data_overrides, scope.data),
            disable: scope.disable,
        }
    }

    /// Restore `previous`, returning the scope that was active.
    fn leave_with(&mut self, previous: WithScope) -> WithScope {
        self.inlining.pop_disable();
        self.virtual_cache.pop();
        WithScope {
            input: std::mem::replace(&mut self.input, previous.input),
            data: std::mem::replace(&mut self.data_overrides, previous.data),
            disable: previous.disable,
        }
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    pub(crate) fn eval_call(
        &mut self,
        terms: &[Term],
        location: Option<Location>,
        b: BindingsId,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        let Some(op) = terms[0].as_ref() else {
            return Err(EvalError::Internal(format!("invalid call operator {}", terms[0])));
        };
        if op.is_rooted_at(DATA_ROOT) {
            let policy = self.env.policy;
            return match policy.rule_tree().node(&op.0[1..]) {
                Some(node) if node.has_rules() => rules::eval_func(self, op, node, &terms[1..], location, b, k),
                _ => Ok(()),
            };
        }

        let name = op.to_string();
        let builtins = self.env.builtins;
        let Some(builtin) = builtins.get(&name) else {
            return Err(EvalError::UnknownBuiltin { name, location });
        };
        let operands = &terms[1..];
        let arity = builtin.arity;
        if operands.len() != arity && operands.len() != arity + 1 {
            return Err(EvalError::Builtin {
                name,
                location,
                message: format!("expects {arity} operands, got {}", operands.len()),
            });
        }
        let output = operands.get(arity);

        self.resolve_all(&operands[..arity], 0, vec![], b, &mut |ev, args| {
            if ev.partial && args.iter().any(|a| ev.contains_unknown(a, b)) {
                let mut call = vec![terms[0].clone()];
                call.extend(args);
                call.extend(output.cloned());
                return ev.save_call(call, b, output, k);
            }
            let plugged: Vec<Term> = args.iter().map(|a| ev.bindings.plug(a, b)).collect();
            if let Some(bad) = plugged.iter().find(|a| !a.is_ground()) {
                debug!(builtin = %builtin.name, operand = %bad, "operand not ground, call undefined");
                return Ok(());
            }
            ev.count(metrics::BUILTIN_CALL);
            let (query_id, parent_id) = ev.frame_ids(b);
            let ctx = BuiltinContext {
                location,
                cancel: ev.env.cancel,
                cache: ev.env.builtin_cache,
                tracers: ev.env.tracers,
                query_id,
                parent_id,
            };
            dispatch(builtin, &ctx, &plugged, &mut |result| match output {
                None if result.is_false() => Ok(()),
                None => k(ev),
                Some(out) => ev.biunify(out, &result, b, b, k),
            })
        })
    }

    // ------------------------------------------------------------------------
    // Unification
    // ------------------------------------------------------------------------

    pub(crate) fn biunify(
        &mut self,
        a: &Term,
        b: &Term,
        fa: BindingsId,
        fb: BindingsId,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        let (a, fa) = self.bindings.apply(a, fa);
        let (b, fb) = self.bindings.apply(b, fb);
        let (a, b) = (root_as_ref(a), root_as_ref(b));

        if self.partial && (self.in_save_set(&a, fa) || self.in_save_set(&b, fb)) {
            return self.save_unify(&a, &b, fa, fb, k);
        }

        match (&a.value, &b.value) {
            (Value::Ref(_), _) => return self.biunify_ref(&a, &b, fa, fb, k),
            (_, Value::Ref(_)) => return self.biunify_ref(&b, &a, fb, fa, k),
            (Value::Call(_), _) => return self.resolve_dynamic(&a, fa, &mut |ev, ra| ev.biunify(&ra, &b, fa, fb, k)),
            (_, Value::Call(_)) => return self.resolve_dynamic(&b, fb, &mut |ev, rb| ev.biunify(&a, &rb, fa, fb, k)),
            _ => {}
        }
        if a.is_comprehension() {
            return self.biunify_comprehension(&a, &b, fa, fb, k);
        }
        if b.is_comprehension() {
            return self.biunify_comprehension(&b, &a, fb, fa, k);
        }
        if needs_resolution(&a, &b) {
            return self.resolve_dynamic(&a, fa, &mut |ev, ra| ev.biunify(&ra, &b, fa, fb, k));
        }
        if needs_resolution(&b, &a) {
            return self.resolve_dynamic(&b, fb, &mut |ev, rb| ev.biunify(&a, &rb, fa, fb, k));
        }

        match (&a.value, &b.value) {
            (Value::Var(x), Value::Var(y)) if x == y && fa == fb => k(self),
            (Value::Var(v), _) => {
                let undo = self.bindings.bind(v, fa, b.clone(), fb);
                let result = k(self);
                self.bindings.undo(undo);
                result
            }
            (_, Value::Var(v)) => {
                let undo = self.bindings.bind(v, fb, a.clone(), fa);
                let result = k(self);
                self.bindings.undo(undo);
                result
            }
            (Value::Array(x), Value::Array(y)) => {
                if x.len() != y.len() {
                    return Ok(());
                }
                self.biunify_slices(x, y, 0, fa, fb, k)
            }
            (Value::Object(x), Value::Object(y)) => {
                let (Some(x), Some(y)) = (self.plug_keys(x, fa), self.plug_keys(y, fb)) else {
                    return Ok(());
                };
                let (xs, ys): (Vec<Term>, Vec<Term>) = match pair_values(&x, &y) {
                    Some(pairs) => pairs.into_iter().unzip(),
                    None => return Ok(()),
                };
                self.biunify_slices(&xs, &ys, 0, fa, fb, k)
            }
            (Value::Set(_), Value::Set(_)) => {
                if self.bindings.plug(&a, fa) == self.bindings.plug(&b, fb) {
                    k(self)
                } else {
                    Ok(())
                }
            }
            _ if a == b => k(self),
            _ => Ok(()),
        }
    }

    /// `obj` with every key plugged in `frame`; `None` when a key stays
    /// unbound or two keys collapse into one.
    fn plug_keys(&self, obj: &Object, frame: BindingsId) -> Option<Object> {
        let mut out = Object::new();
        for (key, value) in obj {
            let key = if key.is_ground() { key.clone() } else { self.bindings.plug(key, frame) };
            if !key.is_ground() || out.insert(key, value.clone()).is_some() {
                return None;
            }
        }
        Some(out)
    }

    /// Unify two equally long term lists element by element.
    pub(crate) fn biunify_slices(
        &mut self,
        xs: &[Term],
        ys: &[Term],
        i: usize,
        fa: BindingsId,
        fb: BindingsId,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        if i == xs.len() {
            return k(self);
        }
        self.biunify(&xs[i], &ys[i], fa, fb, &mut |ev| ev.biunify_slices(xs, ys, i + 1, fa, fb, k))
    }

    fn biunify_ref(
        &mut self,
        r: &Term,
        other: &Term,
        fr: BindingsId,
        fo: BindingsId,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        let Value::Ref(path) = &r.value else {
            return Err(EvalError::Internal(format!("expected a reference, got {r}")));
        };
        let head = &path.0[0];
        let start = match head.as_var() {
            Some(v) if v.name() == DATA_ROOT => {
                let root = self.env.policy.rule_tree().root();
                return TreeStep::new(path, fr, other, fo, root).eval(self, k);
            }
            Some(v) if v.name() == INPUT_ROOT => match self.input.clone() {
                Some(input) => (input, fr),
                None => return Ok(()),
            },
            Some(_) => {
                let (t, tb) = self.bindings.apply(head, fr);
                if t.is_var() {
                    return Ok(());
                }
                (t, tb)
            }
            None => (head.clone(), fr),
        };
        TermStep {
            r: path,
            pos: 1,
            bindings: fr,
            term: start.0,
            term_bindings: start.1,
            rterm: other,
            rbindings: fo,
        }
        .eval(self, k)
    }

    fn biunify_comprehension(
        &mut self,
        c: &Term,
        other: &Term,
        fc: BindingsId,
        fo: BindingsId,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        if self.partial && self.contains_unknown(c, fc) {
            return self.biunify_comprehension_partial(c, other, fc, fo, k);
        }
        let value = self.build_comprehension(c, fc)?;
        self.biunify(&value, other, fc, fo, k)
    }

    fn build_comprehension(&mut self, c: &Term, fc: BindingsId) -> Result<Term, EvalError> {
        let frame = self.closure_frame(fc);
        Ok(match &c.value {
            Value::ArrayComprehension(ac) => {
                let mut out = vec![];
                self.eval_body(&ac.body, &frame, &mut |ev| {
                    ev.resolve_dynamic(&ac.term, fc, &mut |ev, t| {
                        out.push(ev.bindings.plug(&t, fc));
                        Ok(())
                    })
                })?;
                Term::array(out)
            }
            Value::SetComprehension(sc) => {
                let mut out = Set::new();
                self.eval_body(&sc.body, &frame, &mut |ev| {
                    ev.resolve_dynamic(&sc.term, fc, &mut |ev, t| {
                        out.insert(ev.bindings.plug(&t, fc));
                        Ok(())
                    })
                })?;
                Term::set(out)
            }
            Value::ObjectComprehension(oc) => {
                let mut out = Object::new();
                let pair = [oc.key.clone(), oc.value.clone()];
                self.eval_body(&oc.body, &frame, &mut |ev| {
                    ev.resolve_all(&pair, 0, vec![], fc, &mut |ev, kv| {
                        let key = ev.bindings.plug(&kv[0], fc);
                        let value = ev.bindings.plug(&kv[1], fc);
                        match out.get(&key) {
                            Some(existing) if *existing != value => {
                                Err(EvalError::conflict("object keys must be unique", c.location))
                            }
                            _ => {
                                out.insert(key, value);
                                Ok(())
                            }
                        }
                    })
                })?;
                Term::object(out)
            }
            _ => return Err(EvalError::Internal(format!("expected a comprehension, got {c}"))),
        })
    }

    /// Evaluate the body of an unknown comprehension partially and save the
    /// amended comprehension. A single residual body replaces the original.
    fn biunify_comprehension_partial(
        &mut self,
        c: &Term,
        other: &Term,
        fc: BindingsId,
        fo: BindingsId,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        let (body, heads) = match &c.value {
            Value::ArrayComprehension(ac) => (&ac.body, vec![&ac.term]),
            Value::SetComprehension(sc) => (&sc.body, vec![&sc.term]),
            Value::ObjectComprehension(oc) => (&oc.body, vec![&oc.key, &oc.value]),
            _ => return Err(EvalError::Internal(format!("expected a comprehension, got {c}"))),
        };
        let caller = self.caller;
        let frame = self.closure_frame(fc);
        self.save_stack.push_query(vec![]);
        let mut queries: Vec<Vec<Expr>> = vec![];
        let result = self.eval_body(body, &frame, &mut |ev| {
            queries.push(ev.save_stack.plug_query(&ev.bindings, caller));
            Ok(())
        });
        self.save_stack.pop_query();
        result?;

        let amended = if queries.len() == 1 {
            let heads: Vec<Term> = heads.iter().map(|t| self.bindings.plug_namespaced(t, fc, caller)).collect();
            let mut live = BTreeSet::new();
            for h in &heads {
                live.extend(h.vars());
            }
            let body = Body::new(self.copy_propagate(&CopyPropagator::new(live), &queries[0]));
            rebuild_comprehension(c, heads, body)
        } else {
            self.bindings.plug_namespaced(c, fc, caller)
        };
        let other_plugged = self.bindings.plug_namespaced(other, fo, caller);
        let unknown = self.unbound_vars(other, fo);
        self.save_stack.push(SavedExpr::plugged(Expr::equality(amended, other_plugged)));
        self.save_set.push_vars(unknown);
        let result = k(self);
        self.save_set.pop();
        self.save_stack.pop();
        result
    }

    // ------------------------------------------------------------------------
    // Dynamic terms
    // ------------------------------------------------------------------------

    /// Evaluate refs, calls and comprehensions inside `term`, passing the
    /// resolved term on. Anything else is passed on unchanged.
    pub(crate) fn resolve_dynamic(&mut self, term: &Term, f: BindingsId, k: &mut TermCont<'_, 'q>) -> Result<(), EvalError> {
        if !is_dynamic(term) {
            return k(self, term.clone());
        }
        match &term.value {
            Value::Var(_) | Value::Ref(_) | Value::ArrayComprehension(_) | Value::SetComprehension(_)
            | Value::ObjectComprehension(_) => {
                let target = root_as_ref(term.clone());
                let out = self.fresh_var("t");
                self.biunify(&target, &out, f, f, &mut |ev| k(ev, out.clone()))
            }
            Value::Call(terms) => {
                let out = self.fresh_var("t");
                let mut call = terms.clone();
                call.push(out.clone());
                self.eval_call(&call, term.location, f, &mut |ev| k(ev, out.clone()))
            }
            Value::Array(items) => self.resolve_all(items, 0, vec![], f, &mut |ev, out| {
                k(ev, Term::array(out).with_location(term.location))
            }),
            Value::Set(items) => {
                let items: Vec<Term> = items.iter().cloned().collect();
                self.resolve_all(&items, 0, vec![], f, &mut |ev, out| k(ev, Term::set(out).with_location(term.location)))
            }
            Value::Object(obj) => {
                let flat: Vec<Term> = obj.iter().flat_map(|(key, v)| [key.clone(), v.clone()]).collect();
                self.resolve_all(&flat, 0, vec![], f, &mut |ev, out| {
                    let pairs = out.chunks(2).map(|kv| (kv[0].clone(), kv[1].clone()));
                    k(ev, Term::object(pairs).with_location(term.location))
                })
            }
            _ => k(self, term.clone()),
        }
    }

    pub(crate) fn resolve_all(
        &mut self,
        items: &[Term],
        i: usize,
        acc: Vec<Term>,
        f: BindingsId,
        k: &mut ListCont<'_, 'q>,
    ) -> Result<(), EvalError> {
        if i == items.len() {
            return k(self, acc);
        }
        self.resolve_dynamic(&items[i], f, &mut |ev, t| {
            let mut next = acc.clone();
            next.push(t);
            ev.resolve_all(items, i + 1, next, f, k)
        })
    }

    // ------------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------------

    pub(crate) fn save_unify(
        &mut self,
        a: &Term,
        b: &Term,
        fa: BindingsId,
        fb: BindingsId,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        self.count(metrics::SAVE_UNIFY);
        let expr = Expr::equality(a.clone(), b.clone());
        debug!(expr = %expr, "save unify");
        self.save_stack.push(SavedExpr::new(expr, fa, fb));
        let mut vars = self.unbound_vars(a, fa);
        vars.extend(self.unbound_vars(b, fb));
        self.save_set.push_vars(vars);
        let result = k(self);
        self.save_set.pop();
        self.save_stack.pop();
        result
    }

    pub(crate) fn save_expr(&mut self, expr: Expr, b: BindingsId, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let mut vars = vec![];
        expr.walk_terms(&mut |t| {
            if t.is_var() {
                vars.extend(self.unbound_vars(t, b));
            }
            false
        });
        self.save_stack.push(SavedExpr::new(expr, b, b));
        self.save_set.push_vars(vars);
        let result = k(self);
        self.save_set.pop();
        self.save_stack.pop();
        result
    }

    /// Save a call; its output operand, if any, becomes unknown.
    pub(crate) fn save_call(
        &mut self,
        terms: Vec<Term>,
        b: BindingsId,
        output: Option<&Term>,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        let vars = output.map(|o| self.unbound_vars(o, b)).unwrap_or_default();
        self.save_stack.push(SavedExpr::new(Expr::new(ExprTerms::Call(terms)), b, b));
        self.save_set.push_vars(vars);
        let result = k(self);
        self.save_set.pop();
        self.save_stack.pop();
        result
    }

    /// Unbound vars of `term` together with the frame each belongs to.
    pub(crate) fn unbound_vars(&self, term: &Term, f: BindingsId) -> Vec<(Var, BindingsId)> {
        let mut out = vec![];
        for v in term.vars() {
            if v.is_root() {
                continue;
            }
            let (t, tf) = self.bindings.apply(&Term::var(v.name()), f);
            match &t.value {
                Value::Var(x) => out.push((x.clone(), tf)),
                _ if !t.is_ground() => out.extend(self.unbound_vars(&t, tf)),
                _ => {}
            }
        }
        out
    }

    pub(crate) fn copy_propagate(&self, propagator: &CopyPropagator, body: &[Expr]) -> Vec<Expr> {
        let start = Instant::now();
        let out = propagator.apply(body);
        if let Some(m) = self.env.metrics {
            m.counter_incr(metrics::COPY_PROPAGATION);
            m.timer_add(metrics::COPY_PROPAGATION, start.elapsed());
        }
        out
    }

    /// `data.<ns>...` for a path under `data`.
    pub(crate) fn namespace_ref(&self, r: &Ref) -> Ref {
        let mut terms = vec![Term::var(DATA_ROOT), Term::string(self.env.namespace)];
        terms.extend(r.0.iter().skip(1).cloned());
        Ref(terms)
    }

    // ------------------------------------------------------------------------
    // Unknown analysis
    // ------------------------------------------------------------------------

    /// Whether `t` (in frame `f`) is, or directly refers to, something in
    /// the save set.
    pub(crate) fn in_save_set(&self, t: &Term, f: BindingsId) -> bool {
        match &t.value {
            Value::Var(v) => self.save_set.contains_var(v, f),
            Value::Ref(r) => match r.head_var() {
                Some(h) if h.is_root() => match self.bindings.plug(t, f).as_ref() {
                    Some(p) => self.save_set.contains_ref(p),
                    None => false,
                },
                Some(_) => {
                    let (head, hf) = self.bindings.apply(&r.0[0], f);
                    match &head.value {
                        Value::Var(v) => self.save_set.contains_var(v, hf),
                        _ => false,
                    }
                }
                None => false,
            },
            Value::Set(items) => items.iter().any(|x| {
                let (x, xf) = self.bindings.apply(x, f);
                self.in_save_set(&x, xf)
            }),
            _ => false,
        }
    }

    /// Whether evaluating `t` could depend on anything unknown, including
    /// through the rules it refers to.
    pub(crate) fn contains_unknown(&self, t: &Term, f: BindingsId) -> bool {
        let (t, f) = self.bindings.apply(t, f);
        match &t.value {
            Value::Var(v) => self.save_set.contains_var(v, f),
            Value::Ref(r) => {
                if self.in_save_set(&t, f) || r.0.iter().skip(1).any(|s| self.contains_unknown(s, f)) {
                    return true;
                }
                match r.head_var() {
                    Some(h) if h.name() == DATA_ROOT => match self.bindings.plug(&t, f).as_ref() {
                        Some(plugged) => self.data_ref_unknown(plugged),
                        None => false,
                    },
                    Some(h) if h.is_root() => false,
                    _ => self.contains_unknown(&r.0[0], f),
                }
            }
            Value::Array(items) => items.iter().any(|x| self.contains_unknown(x, f)),
            Value::Set(items) => items.iter().any(|x| self.contains_unknown(x, f)),
            Value::Object(obj) => obj.iter().any(|(key, v)| self.contains_unknown(key, f) || self.contains_unknown(v, f)),
            Value::Call(terms) => {
                terms[1..].iter().any(|x| self.contains_unknown(x, f))
                    || terms[0]
                        .as_ref()
                        .is_some_and(|op| op.is_rooted_at(DATA_ROOT) && self.data_ref_unknown(op))
            }
            Value::ArrayComprehension(_) | Value::SetComprehension(_) | Value::ObjectComprehension(_) => {
                let mut found = false;
                t.walk(&mut |x| {
                    if !found && !std::ptr::eq(x, &t) && !x.is_comprehension() {
                        found = matches!(x.value, Value::Var(_) | Value::Ref(_) | Value::Call(_))
                            && self.contains_unknown(x, f);
                    }
                    found
                });
                found
            }
            _ => false,
        }
    }

    pub(crate) fn expr_unknown(&self, expr: &Expr, f: BindingsId) -> bool {
        let terms_unknown = match &expr.terms {
            ExprTerms::Term(t) => self.contains_unknown(t, f),
            ExprTerms::Call(terms) => self.contains_unknown(&Term::new(Value::Call(terms.clone())), f),
            ExprTerms::SomeDecl(_) => false,
        };
        terms_unknown || expr.with.iter().any(|w| self.contains_unknown(&w.value, f))
    }

    /// Whether the rules a plugged `data` ref reaches read unknowns.
    pub(crate) fn data_ref_unknown(&self, r: &Ref) -> bool {
        if self.inlining.disabled(&r.ground_prefix(), false) {
            return true;
        }
        let mut visited = BTreeSet::new();
        self.rules_unknown_at(self.env.policy.rule_tree().root(), &r.0[1..], &mut visited)
    }

    fn rules_unknown_at(&self, node: &RuleTreeNode, segs: &[Term], visited: &mut BTreeSet<RuleId>) -> bool {
        if node.has_rules() {
            return node.rules.iter().any(|rule| self.rule_unknown(rule, visited))
                || node.else_map.values().flatten().any(|rule| self.rule_unknown(rule, visited));
        }
        match segs.first() {
            None => node.children.values().any(|c| self.rules_unknown_at(c, &[], visited)),
            Some(s) if s.is_ground() => node
                .child(s)
                .is_some_and(|c| self.rules_unknown_at(c, &segs[1..], visited)),
            Some(_) => node.children.values().any(|c| self.rules_unknown_at(c, &segs[1..], visited)),
        }
    }

    fn rule_unknown(&self, rule: &Rule, visited: &mut BTreeSet<RuleId>) -> bool {
        if !visited.insert(rule.id) {
            return false;
        }
        let mut found = false;
        let mut check = |t: &Term| {
            if found {
                return true;
            }
            found = match &t.value {
                Value::Var(v) if v.name() == INPUT_ROOT => self.save_set.contains_ref(&Ref(vec![t.clone()])),
                Value::Ref(r) if r.is_rooted_at(INPUT_ROOT) => self.save_set.contains_ref(r),
                Value::Ref(r) if r.is_rooted_at(DATA_ROOT) => {
                    self.save_set.contains_ref(r)
                        || self.inlining.disabled(&r.ground_prefix(), false)
                        || self.rules_unknown_at(self.env.policy.rule_tree().root(), &r.0[1..], visited)
                }
                Value::Call(terms) => terms[0].as_ref().is_some_and(|op| {
                    op.is_rooted_at(DATA_ROOT)
                        && (self.inlining.disabled(op, false)
                            || self.rules_unknown_at(self.env.policy.rule_tree().root(), &op.0[1..], visited))
                }),
                _ => false,
            };
            found
        };
        let head = &rule.head;
        for t in head.args.iter().chain(head.key.iter()).chain(head.value.iter()) {
            t.walk(&mut check);
        }
        for expr in rule.body.iter() {
            expr.walk_terms(&mut check);
        }
        if !found {
            if let Some(e) = &rule.else_rule {
                return self.rule_unknown(e, visited);
            }
        }
        found
    }

    // ------------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------------

    /// Base document at a ground path under `data`, after `with` overrides.
    pub(crate) fn resolve_base(&mut self, path: &Ref) -> Result<Option<Term>, EvalError> {
        let segs = &path.0[1..];
        let mut value = self.read_storage(segs)?;
        for (prefix, v) in &self.data_overrides {
            if segs.starts_with(prefix) {
                value = lookup(v, &segs[prefix.len()..]).cloned();
            } else if prefix.starts_with(segs) {
                let base = value.take().unwrap_or_else(|| Term::object([]));
                value = Some(patch(&base, &prefix[segs.len()..], v.clone()));
            }
        }
        Ok(value)
    }

    fn read_storage(&mut self, segs: &[Term]) -> Result<Option<Term>, EvalError> {
        let Some((store, txn)) = self.env.store else {
            return Ok(None);
        };
        let mut path = Vec::with_capacity(segs.len());
        for s in segs {
            match &s.value {
                Value::String(x) => path.push(x.to_string()),
                Value::Number(n) if n.as_i64().is_some() => path.push(n.to_string()),
                _ => return Ok(None),
            }
        }
        if let Some(hit) = self.base_cache.get(&path) {
            self.count(metrics::BASE_CACHE_HIT);
            return Ok(hit.clone());
        }
        self.count(metrics::BASE_CACHE_MISS);
        let value = match store.read(txn, &StoragePath::new(path.clone())) {
            Ok(v) => Some(Term::from_json(&v)),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        self.base_cache.put(path, value.clone());
        Ok(value)
    }

    /// Whether a `with` override replaces the document at `path` (which
    /// starts with `data`).
    pub(crate) fn is_masked(&self, path: &[Term]) -> bool {
        let segs = &path[1..];
        self.data_overrides.iter().any(|(prefix, _)| segs.starts_with(prefix))
    }

    /// Current input value at an `input` path.
    pub(crate) fn input_value(&self, r: &Ref) -> Option<Term> {
        lookup(self.input.as_ref()?, &r.0[1..]).cloned()
    }
}

fn root_as_ref(t: Term) -> Term {
    match &t.value {
        Value::Var(v) if v.is_root() => Term::reference(Ref(vec![t.clone()])).with_location(t.location),
        _ => t,
    }
}

/// Needs evaluation before structural comparison. Bare root vars count.
fn is_dynamic(t: &Term) -> bool {
    match &t.value {
        Value::Var(v) => v.is_root(),
        Value::Array(items) => items.iter().any(is_dynamic),
        Value::Set(items) => items.iter().any(is_dynamic),
        Value::Object(obj) => obj.iter().any(|(key, v)| is_dynamic(key) || is_dynamic(v)),
        _ => t.has_dynamic(),
    }
}

/// `a` must be resolved before unifying with `b`. Arrays unify element by
/// element and objects value by value, so only what cannot be paired up
/// structurally is resolved first.
fn needs_resolution(a: &Term, b: &Term) -> bool {
    match (&a.value, &b.value) {
        (Value::Array(_), Value::Array(_)) => false,
        (Value::Object(x), Value::Object(_)) => x.keys().any(is_dynamic),
        (Value::Array(_) | Value::Object(_) | Value::Set(_), _) => is_dynamic(a),
        _ => false,
    }
}

/// Values of two objects paired by key, or `None` if the key sets differ.
fn pair_values(x: &Object, y: &Object) -> Option<Vec<(Term, Term)>> {
    if x.len() != y.len() {
        return None;
    }
    x.iter()
        .map(|(key, xv)| y.get(key).map(|yv| (xv.clone(), yv.clone())))
        .collect()
}

fn lookup<'t>(t: &'t Term, path: &[Term]) -> Option<&'t Term> {
    path.iter().try_fold(t, |node, key| node.get(key))
}

/// `base` with the value at `path` replaced, creating objects on the way.
pub(crate) fn patch(base: &Term, path: &[Term], value: Term) -> Term {
    let Some((key, rest)) = path.split_first() else {
        return value;
    };
    let mut obj = match &base.value {
        Value::Object(obj) => (**obj).clone(),
        _ => Object::new(),
    };
    let child = obj.get(key).cloned().unwrap_or_else(|| Term::object([]));
    obj.insert(key.clone(), patch(&child, rest, value));
    Term::object(obj)
}

fn rebuild_comprehension(c: &Term, heads: Vec<Term>, body: Body) -> Term {
    use verdict_lang::term::{ArrayComprehension, ObjectComprehension, SetComprehension};
    let mut heads = heads.into_iter();
    let mut next = || heads.next().unwrap_or_else(Term::null);
    let value = match &c.value {
        Value::ArrayComprehension(_) => Value::ArrayComprehension(Box::new(ArrayComprehension { term: next(), body })),
        Value::SetComprehension(_) => Value::SetComprehension(Box::new(SetComprehension { term: next(), body })),
        _ => Value::ObjectComprehension(Box::new(ObjectComprehension {
            key: next(),
            value: next(),
            body,
        })),
    };
    Term::new(value).with_location(c.location)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(x: &str) -> Term {
        Term::string(x)
    }

    #[test]
    fn patch_creates_missing_objects() {
        let base = Term::object([(s("a"), Term::int(1))]);
        let out = patch(&base, &[s("b"), s("c")], Term::int(2));
        assert_eq!(
            out,
            Term::object([
                (s("a"), Term::int(1)),
                (s("b"), Term::object([(s("c"), Term::int(2))]))
            ])
        );
        assert_eq!(patch(&base, &[], Term::int(3)), Term::int(3));
    }

    #[test]
    fn object_values_pair_by_key() {
        let x: Object = [(s("a"), Term::var("x"))].into_iter().collect();
        let y: Object = [(s("a"), Term::int(1))].into_iter().collect();
        let z: Object = [(s("b"), Term::int(1))].into_iter().collect();
        assert_eq!(pair_values(&x, &y), Some(vec![(Term::var("x"), Term::int(1))]));
        assert_eq!(pair_values(&x, &z), None);
    }

    #[test]
    fn root_vars_are_dynamic() {
        assert!(is_dynamic(&Term::var("input")));
        assert!(is_dynamic(&Term::array(vec![Term::var("data")])));
        assert!(!is_dynamic(&Term::array(vec![Term::var("x")])));
        assert!(needs_resolution(&Term::array(vec![Term::var("input")]), &Term::var("y")));
        assert!(!needs_resolution(&Term::array(vec![Term::var("input")]), &Term::array(vec![])));
    }
}
