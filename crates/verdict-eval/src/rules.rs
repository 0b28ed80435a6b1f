//! Rule evaluation
//!
//! Reached once a `data` ref lands on a rule tree node holding rules, or
//! when a function is called. Complete rules produce one value, partial
//! rules contribute members to a set or object, functions map arguments to
//! a value. In partial mode, rules depending on unknowns are either inlined
//! into the caller's residual query or emitted as support rules.

use std::collections::BTreeMap;

use tracing::debug;
use verdict_lang::index::{self, IndexResult};
use verdict_lang::{Body, Expr, Head, Location, Ref, Rule, RuleKind, RuleTreeNode, Term};

use crate::bindings::BindingsId;
use crate::copyprop::CopyPropagator;
use crate::error::EvalError;
use crate::eval::{Cont, Eval};
use crate::metrics;
use crate::resolve::TermStep;
use crate::tracer::Op;

/// Evaluation of the rules at one rule tree node for a ref.
#[derive(Clone)]
pub(crate) struct VirtualStep<'a, 'q> {
    pub r: &'a Ref,
    /// Index in `r` of the segment naming the rule.
    pub pos: usize,
    /// `r` up to and including `pos`, plugged.
    pub plugged: Vec<Term>,
    pub bindings: BindingsId,
    pub rterm: &'a Term,
    pub rbindings: BindingsId,
    pub node: &'q RuleTreeNode,
}

impl<'a, 'q> VirtualStep<'a, 'q> {
    pub(crate) fn eval(self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let Some(ir) = ev.rules_for(self.node) else {
            return Ok(());
        };
        let unknown = ev.partial && ev.contains_unknown(&Term::reference(self.r.clone()), self.bindings);
        if unknown && !ir.else_map.is_empty() {
            let saved = Term::reference(self.full_ref());
            return ev.save_unify(&saved, self.rterm, self.bindings, self.rbindings, k);
        }
        match ir.kind {
            RuleKind::Complete => self.eval_complete(ev, &ir, unknown, k),
            RuleKind::PartialSet => self.eval_partial(ev, &ir, true, unknown, k),
            RuleKind::PartialObject => self.eval_partial(ev, &ir, false, unknown, k),
            // A function referenced without being called is undefined.
            RuleKind::Function => Ok(()),
        }
    }

    fn path(&self) -> Ref {
        Ref(self.plugged.clone())
    }

    /// The plugged rule path followed by the rest of the original ref.
    fn full_ref(&self) -> Ref {
        Ref(self.plugged.clone()).concat(&self.r.0[self.pos + 1..])
    }

    /// Continue resolving the rest of the ref inside the rule's value.
    fn continue_with(&self, ev: &mut Eval<'q>, term: Term, term_bindings: BindingsId, skip: usize, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        TermStep {
            r: self.r,
            pos: self.pos + skip,
            bindings: self.bindings,
            term,
            term_bindings,
            rterm: self.rterm,
            rbindings: self.rbindings,
        }
        .eval(ev, k)
    }

    // ------------------------------------------------------------------------
    // Complete rules
    // ------------------------------------------------------------------------

    fn eval_complete(&self, ev: &mut Eval<'q>, ir: &IndexResult, unknown: bool, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        if ir.is_empty() {
            return Ok(());
        }
        if !unknown {
            return self.complete_value(ev, ir, k);
        }
        let needs_default = match &ir.default {
            Some(d) => {
                let rterm = ev.bindings.plug(self.rterm, self.rbindings);
                !rterm.is_constant() || d.head_value() == rterm
            }
            None => false,
        };
        if needs_default || ev.inlining.shallow || ev.inlining.disabled(&self.path(), false) {
            return self.support(ev, ir, k);
        }
        for rule in &ir.rules {
            let child = ev.child_frame(self.bindings);
            ev.trace(Op::Enter, &child, rule.as_ref(), rule.location);
            let value = rule.head_value();
            let result = ev.eval_body(&rule.body, &child, &mut |ev| {
                let (t, tb) = ev.bindings.apply(&value, child.bindings);
                self.continue_with(ev, t, tb, 1, k)
            });
            ev.release(child);
            result?;
        }
        Ok(())
    }

    fn complete_value(&self, ev: &mut Eval<'q>, ir: &IndexResult, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let key = self.plugged.clone();
        if !ev.partial {
            if let Some(cached) = ev.virtual_cache.get(&key).cloned() {
                ev.count(metrics::VIRTUAL_CACHE_HIT);
                return self.continue_with(ev, cached, self.bindings, 1, k);
            }
            ev.count(metrics::VIRTUAL_CACHE_MISS);
        }

        let mut prev: Option<Term> = None;
        for rule in &ir.rules {
            if !self.complete_rule(ev, rule, &key, &mut prev, k)? {
                for e in ir.else_chain(rule) {
                    if self.complete_rule(ev, e, &key, &mut prev, k)? {
                        break;
                    }
                }
            }
        }
        if prev.is_none() {
            if let Some(d) = &ir.default {
                self.complete_rule(ev, d, &key, &mut prev, k)?;
            }
        }
        Ok(())
    }

    /// Evaluate one complete rule; reports whether it produced a value.
    fn complete_rule(
        &self,
        ev: &mut Eval<'q>,
        rule: &Rule,
        key: &[Term],
        prev: &mut Option<Term>,
        k: &mut Cont<'_, 'q>,
    ) -> Result<bool, EvalError> {
        let child = ev.child_frame(self.bindings);
        ev.trace(Op::Enter, &child, rule, rule.location);
        let head = rule.head_value();
        let mut produced = false;
        let result = ev.eval_body(&rule.body, &child, &mut |ev| {
            produced = true;
            let value = ev.bindings.plug(&head, child.bindings);
            if let Some(p) = prev.as_ref() {
                if *p != value {
                    return Err(EvalError::conflict(
                        format!("{}: complete rules must not produce multiple outputs", self.path()),
                        rule.location,
                    ));
                }
                return Ok(());
            }
            *prev = Some(value.clone());
            if !ev.partial {
                ev.virtual_cache.put(key.to_vec(), value);
            }
            let (t, tb) = ev.bindings.apply(&head, child.bindings);
            self.continue_with(ev, t, tb, 1, k)
        });
        ev.release(child);
        result?;
        Ok(produced)
    }

    // ------------------------------------------------------------------------
    // Partial rules
    // ------------------------------------------------------------------------

    fn eval_partial(
        &self,
        ev: &mut Eval<'q>,
        ir: &IndexResult,
        is_set: bool,
        unknown: bool,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        if self.pos + 1 == self.r.len() {
            if unknown {
                return self.partial_support(ev, ir, is_set, k);
            }
            return self.partial_all(ev, ir, is_set, k);
        }
        if (unknown && ev.inlining.shallow) || ev.inlining.disabled(&self.path(), false) {
            return self.partial_support(ev, ir, is_set, k);
        }

        let mut cache_key = None;
        if !ev.partial && !is_set {
            let key = ev.bindings.plug(&self.r.0[self.pos + 1], self.bindings);
            if key.is_ground() {
                let mut ck = self.plugged.clone();
                ck.push(key);
                if let Some(cached) = ev.virtual_cache.get(&ck).cloned() {
                    ev.count(metrics::VIRTUAL_CACHE_HIT);
                    return self.continue_with(ev, cached, self.bindings, 2, k);
                }
                ev.count(metrics::VIRTUAL_CACHE_MISS);
                cache_key = Some(ck);
            }
        }

        let mut visited = BTreeMap::new();
        for rule in &ir.rules {
            self.partial_one(ev, rule, cache_key.as_deref(), unknown, &mut visited, k)?;
        }
        Ok(())
    }

    /// Evaluate one partial rule for the key named by the ref. `visited`
    /// holds the value already produced for each key; a differing value
    /// for the same key is a conflict.
    fn partial_one(
        &self,
        ev: &mut Eval<'q>,
        rule: &Rule,
        cache_key: Option<&[Term]>,
        unknown: bool,
        visited: &mut BTreeMap<Term, Term>,
        k: &mut Cont<'_, 'q>,
    ) -> Result<(), EvalError> {
        let Some(head_key) = rule.head.key.as_ref() else {
            return Ok(());
        };
        let value = rule.head_value();
        let child = ev.child_frame(self.bindings);
        ev.trace(Op::Enter, &child, rule, rule.location);
        let result = ev.biunify(head_key, &self.r.0[self.pos + 1], child.bindings, self.bindings, &mut |ev| {
            ev.eval_body(&rule.body, &child, &mut |ev| {
                if !unknown {
                    let member = ev.bindings.plug(head_key, child.bindings);
                    let v = ev.bindings.plug(&value, child.bindings);
                    match visited.get(&member) {
                        Some(existing) if *existing != v => {
                            return Err(EvalError::conflict(
                                format!("{}: object keys must be unique", self.path()),
                                rule.location,
                            ));
                        }
                        Some(_) => return Ok(()),
                        None => {
                            visited.insert(member, v.clone());
                        }
                    }
                    if let Some(ck) = cache_key {
                        ev.virtual_cache.put(ck.to_vec(), v);
                    }
                }
                let (t, tb) = ev.bindings.apply(&value, child.bindings);
                self.continue_with(ev, t, tb, 2, k)
            })
        });
        ev.release(child);
        result
    }

    /// Build the whole set or object.
    fn partial_all(&self, ev: &mut Eval<'q>, ir: &IndexResult, is_set: bool, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let key = self.plugged.clone();
        if !ev.partial {
            if let Some(cached) = ev.virtual_cache.get(&key).cloned() {
                ev.count(metrics::VIRTUAL_CACHE_HIT);
                return ev.biunify(&cached, self.rterm, self.bindings, self.rbindings, k);
            }
            ev.count(metrics::VIRTUAL_CACHE_MISS);
        }

        let mut members = verdict_lang::term::Set::new();
        let mut entries = verdict_lang::term::Object::new();
        for rule in &ir.rules {
            let Some(head_key) = rule.head.key.as_ref() else {
                continue;
            };
            let value = rule.head_value();
            let child = ev.child_frame(self.bindings);
            ev.trace(Op::Enter, &child, rule.as_ref(), rule.location);
            let result = ev.eval_body(&rule.body, &child, &mut |ev| {
                let member = ev.bindings.plug(head_key, child.bindings);
                if is_set {
                    members.insert(member);
                    return Ok(());
                }
                let v = ev.bindings.plug(&value, child.bindings);
                match entries.get(&member) {
                    Some(existing) if *existing != v => Err(EvalError::conflict(
                        format!("{}: object keys must be unique", self.path()),
                        rule.location,
                    )),
                    _ => {
                        entries.insert(member, v);
                        Ok(())
                    }
                }
            });
            ev.release(child);
            result?;
        }

        let doc = if is_set { Term::set(members) } else { Term::object(entries) };
        if !ev.partial {
            ev.virtual_cache.put(key, doc.clone());
        }
        ev.biunify(&doc, self.rterm, self.bindings, self.rbindings, k)
    }

    fn partial_support(&self, ev: &mut Eval<'q>, ir: &IndexResult, is_set: bool, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let path = ev.namespace_ref(&self.path());
        let mut defined = ev.support.exists(&path);
        if !defined {
            for rule in &ir.rules {
                defined |= support_rule(ev, rule, &path, self.bindings, &[])?;
            }
        }
        let term = if defined {
            Term::reference(ev.namespace_ref(&self.full_ref()))
        } else if self.pos + 1 == self.r.len() {
            if is_set {
                Term::set([])
            } else {
                Term::object([])
            }
        } else {
            return Ok(());
        };
        ev.save_unify(&term, self.rterm, self.bindings, self.rbindings, k)
    }

    fn support(&self, ev: &mut Eval<'q>, ir: &IndexResult, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let path = ev.namespace_ref(&self.path());
        let mut defined = ev.support.exists(&path);
        if !defined {
            for rule in ir.rules.iter().chain(ir.default.iter()) {
                defined |= support_rule(ev, rule, &path, self.bindings, &[])?;
            }
        }
        if !defined {
            return Ok(());
        }
        let term = Term::reference(ev.namespace_ref(&self.full_ref()));
        ev.save_unify(&term, self.rterm, self.bindings, self.rbindings, k)
    }
}

/// Partially evaluate `rule` and record each residual body as a support
/// rule at `path`. Vars in `unknown_args` positions of the head are treated
/// as unknown while the body is evaluated.
fn support_rule<'q>(
    ev: &mut Eval<'q>,
    rule: &Rule,
    path: &Ref,
    parent: BindingsId,
    unknown_args: &[Term],
) -> Result<bool, EvalError> {
    let child = ev.child_frame(parent);
    ev.trace(Op::Enter, &child, rule, rule.location);
    let caller = ev.caller;
    ev.save_stack.push_query(vec![]);
    let arg_vars = unknown_args
        .iter()
        .flat_map(Term::vars)
        .map(|v| (v, child.bindings))
        .collect();
    ev.save_set.push_vars(arg_vars);

    let mut defined = false;
    let result = ev.eval_body(&rule.body, &child, &mut |ev| {
        defined = true;
        let body = ev.save_stack.plug_query(&ev.bindings, caller);
        let plug = |t: &Term| ev.bindings.plug_namespaced(t, child.bindings, caller);
        let head = Head {
            name: rule.head.name.clone(),
            args: rule.head.args.iter().map(plug).collect(),
            key: rule.head.key.as_ref().map(plug),
            value: rule.head.value.as_ref().map(plug),
            location: rule.head.location,
        };
        let body = if ev.inlining.shallow {
            body
        } else {
            ev.copy_propagate(&CopyPropagator::new(head.vars()), &body)
        };
        let mut support = Rule::new(head, Body::new(body));
        support.default = rule.default;
        support.location = rule.location;
        debug!(path = %path, rule = %support.head.name, "support rule");
        ev.support.insert(path, support);
        Ok(())
    });

    ev.save_set.pop();
    ev.save_stack.pop_query();
    ev.release(child);
    result?;
    Ok(defined)
}

impl<'q> Eval<'q> {
    /// Candidate rules at `node`. Indexing only applies to full
    /// evaluation: partial evaluation must see every rule.
    fn rules_for(&self, node: &'q RuleTreeNode) -> Option<IndexResult> {
        if self.partial || !self.env.indexing {
            return index::all_rules(node);
        }
        self.count(metrics::RULE_INDEX);
        index::lookup(node, &|r: &Ref| self.input_value(r))
    }
}

// ============================================================================
// Functions
// ============================================================================

/// Call the function at `op` with `operands`: the declared arguments,
/// optionally followed by an output operand.
pub(crate) fn eval_func<'q>(
    ev: &mut Eval<'q>,
    op: &Ref,
    node: &'q RuleTreeNode,
    operands: &[Term],
    location: Option<Location>,
    b: BindingsId,
    k: &mut Cont<'_, 'q>,
) -> Result<(), EvalError> {
    let Some(ir) = index::all_rules(node) else {
        return Ok(());
    };
    let Some(first) = ir.rules.first().or(ir.default.as_ref()) else {
        return Ok(());
    };
    let arity = first.head.args.len();
    if operands.len() != arity && operands.len() != arity + 1 {
        return Err(EvalError::Builtin {
            name: op.to_string(),
            location,
            message: format!("expects {arity} arguments, got {}", operands.len()),
        });
    }
    let output = operands.get(arity);

    ev.resolve_all(&operands[..arity], 0, vec![], b, &mut |ev, args| {
        let call = FuncCall {
            op,
            ir: &ir,
            args: &args,
            output,
            bindings: b,
        };
        if ev.partial {
            let unknown = args.iter().any(|a| ev.contains_unknown(a, b)) || ev.data_ref_unknown(op);
            if unknown && !ir.else_map.is_empty() {
                return ev.save_call(call.terms(Term::reference(op.clone())), b, output, k);
            }
            if unknown && (ev.inlining.shallow || ev.inlining.disabled(op, false)) {
                return call.support(ev, k);
            }
        }
        call.value(ev, k)
    })
}

struct FuncCall<'a> {
    op: &'a Ref,
    ir: &'a IndexResult,
    /// Resolved arguments, interpreted in `bindings`.
    args: &'a [Term],
    output: Option<&'a Term>,
    bindings: BindingsId,
}

impl FuncCall<'_> {
    fn terms(&self, operator: Term) -> Vec<Term> {
        let mut terms = vec![operator];
        terms.extend(self.args.iter().cloned());
        terms.extend(self.output.cloned());
        terms
    }

    fn value<'q>(&self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let b = self.bindings;
        let mut cache_key = None;
        if !ev.partial {
            let mut ck = vec![Term::reference(self.op.clone())];
            ck.extend(self.args.iter().map(|a| ev.bindings.plug(a, b)));
            if ck[1..].iter().all(Term::is_ground) {
                if let Some(cached) = ev.virtual_cache.get(&ck).cloned() {
                    ev.count(metrics::VIRTUAL_CACHE_HIT);
                    return match self.output {
                        None if cached.is_false() => Ok(()),
                        None => k(ev),
                        Some(out) => ev.biunify(out, &cached, b, b, k),
                    };
                }
                ev.count(metrics::VIRTUAL_CACHE_MISS);
                cache_key = Some(ck);
            }
        }

        let mut prev: Option<Term> = None;
        for rule in &self.ir.rules {
            if !self.rule(ev, rule, cache_key.as_deref(), &mut prev, k)? {
                for e in self.ir.else_chain(rule) {
                    if self.rule(ev, e, cache_key.as_deref(), &mut prev, k)? {
                        break;
                    }
                }
            }
        }
        if prev.is_none() {
            if let Some(d) = &self.ir.default {
                self.rule(ev, d, cache_key.as_deref(), &mut prev, k)?;
            }
        }
        Ok(())
    }

    /// Evaluate one function rule; reports whether it produced a value.
    fn rule<'q>(
        &self,
        ev: &mut Eval<'q>,
        rule: &Rule,
        cache_key: Option<&[Term]>,
        prev: &mut Option<Term>,
        k: &mut Cont<'_, 'q>,
    ) -> Result<bool, EvalError> {
        let b = self.bindings;
        let child = ev.child_frame(b);
        ev.trace(Op::Enter, &child, rule, rule.location);
        let head_value = rule.head_value();
        let mut call_terms: Vec<Term> = self.args.to_vec();
        let mut head_terms: Vec<Term> = rule.head.args.clone();
        if let Some(out) = self.output {
            call_terms.push(out.clone());
            head_terms.push(head_value.clone());
        }

        let mut produced = false;
        let result = ev.biunify_slices(&call_terms, &head_terms, 0, b, child.bindings, &mut |ev| {
            ev.eval_body(&rule.body, &child, &mut |ev| {
                produced = true;
                if ev.partial && self.output.is_none() {
                    let (v, vb) = ev.bindings.apply(&head_value, child.bindings);
                    if ev.in_save_set(&v, vb) {
                        return ev.save_expr(Expr::term(head_value.clone()), child.bindings, k);
                    }
                }
                let result = ev.bindings.plug(&head_value, child.bindings);
                if let Some(ck) = cache_key {
                    ev.virtual_cache.put(ck.to_vec(), result.clone());
                }
                if !ev.partial {
                    if let Some(p) = prev.as_ref() {
                        if *p != result {
                            return Err(EvalError::conflict(
                                format!("{}: functions must not produce multiple outputs for same inputs", self.op),
                                rule.location,
                            ));
                        }
                        return Ok(());
                    }
                }
                *prev = Some(result.clone());
                if self.output.is_none() && result.is_false() {
                    return Ok(());
                }
                k(ev)
            })
        });
        ev.release(child);
        result?;
        Ok(produced)
    }

    /// Emit the function's rules as support rules and save the call.
    fn support<'q>(&self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let path = ev.namespace_ref(self.op);
        if !ev.support.exists(&path) {
            for rule in self.ir.rules.iter().chain(self.ir.default.iter()) {
                support_rule(ev, rule, &path, self.bindings, &rule.head.args)?;
            }
        }
        if !ev.support.exists(&path) {
            return Ok(());
        }
        let terms = self.terms(Term::reference(path));
        ev.save_call(terms, self.bindings, self.output, k)
    }
}
