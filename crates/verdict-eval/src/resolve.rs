//! Reference resolution
//!
//! A reference is resolved one segment at a time. Under `data` the walk
//! follows the rule tree (`TreeStep`) until it reaches a node holding rules,
//! where rule evaluation takes over (`VirtualStep`), or leaves the tree,
//! where the base document is read and the rest is a plain term walk
//! (`TermStep`). Refs rooted at `input` or a local var are term walks from
//! the start. Non-ground segments enumerate every key of the current node.

use std::collections::BTreeSet;

use verdict_lang::term::Object;
use verdict_lang::{Ref, RuleTreeNode, Term, Value, DATA_ROOT};

use crate::bindings::BindingsId;
use crate::error::EvalError;
use crate::eval::{Cont, Eval};
use crate::rules::VirtualStep;

/// Walk within a term: `input`, a local value, a base document or a rule's
/// value.
#[derive(Clone)]
pub(crate) struct TermStep<'a> {
    pub r: &'a Ref,
    /// Next segment of `r` to resolve.
    pub pos: usize,
    /// Frame `r`'s segments are interpreted in.
    pub bindings: BindingsId,
    pub term: Term,
    pub term_bindings: BindingsId,
    /// Term the resolved value unifies with.
    pub rterm: &'a Term,
    pub rbindings: BindingsId,
}

impl<'a> TermStep<'a> {
    pub(crate) fn eval<'q>(self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        if self.pos == self.r.len() {
            return ev.biunify(&self.term, self.rterm, self.term_bindings, self.rbindings, k);
        }
        if ev.partial && ev.in_save_set(&self.term, self.term_bindings) {
            return self.save(ev, k);
        }
        let seg = ev.bindings.plug(&self.r.0[self.pos], self.bindings);
        if seg.is_ground() {
            self.next(ev, &seg, k)
        } else {
            self.enumerate(ev, k)
        }
    }

    fn next<'q>(&self, ev: &mut Eval<'q>, key: &Term, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let container = match &self.term.value {
            Value::Object(_) | Value::Set(_) if !self.term.is_ground() => ev.bindings.plug(&self.term, self.term_bindings),
            _ => self.term.clone(),
        };
        let Some(child) = container.get(key) else {
            return Ok(());
        };
        let (term, term_bindings) = ev.bindings.apply(child, self.term_bindings);
        TermStep {
            pos: self.pos + 1,
            term,
            term_bindings,
            ..self.clone()
        }
        .eval(ev, k)
    }

    fn enumerate<'q>(&self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let keys: Vec<Term> = match &self.term.value {
            Value::Array(items) => (0..items.len() as i64).map(Term::int).collect(),
            Value::Object(obj) => obj.keys().cloned().collect(),
            Value::Set(set) => set.iter().cloned().collect(),
            _ => return Ok(()),
        };
        let seg = &self.r.0[self.pos];
        for key in keys {
            ev.biunify(&key, seg, self.bindings, self.bindings, &mut |ev| self.next(ev, &key, k))?;
        }
        Ok(())
    }

    /// The term is unknown: save the rest of the ref against it.
    fn save<'q>(&self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let head = ev.fresh_var("ref");
        let Some(name) = head.as_var().cloned() else {
            return Ok(());
        };
        let undo = ev
            .bindings
            .bind(&name, self.bindings, self.term.clone(), self.term_bindings);
        let mut terms = vec![head];
        terms.extend(self.r.0[self.pos..].iter().cloned());
        let saved = Term::reference(Ref(terms));
        let result = ev.save_unify(&saved, self.rterm, self.bindings, self.rbindings, k);
        ev.bindings.undo(undo);
        result
    }
}

/// Walk of a `data` ref through the rule tree.
#[derive(Clone)]
pub(crate) struct TreeStep<'a, 'q> {
    r: &'a Ref,
    pos: usize,
    /// Ground segments resolved so far, `data` included.
    plugged: Vec<Term>,
    bindings: BindingsId,
    rterm: &'a Term,
    rbindings: BindingsId,
    node: &'q RuleTreeNode,
}

impl<'a, 'q> TreeStep<'a, 'q> {
    pub(crate) fn new(r: &'a Ref, bindings: BindingsId, rterm: &'a Term, rbindings: BindingsId, root: &'q RuleTreeNode) -> Self {
        TreeStep {
            r,
            pos: 1,
            plugged: vec![Term::var(DATA_ROOT)],
            bindings,
            rterm,
            rbindings,
            node: root,
        }
    }

    pub(crate) fn eval(self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        if self.pos == self.r.len() {
            return self.finish(ev, k);
        }
        let seg = ev.bindings.plug(&self.r.0[self.pos], self.bindings);
        if seg.is_ground() {
            self.next(ev, &seg, k)
        } else {
            self.enumerate(ev, k)
        }
    }

    fn next(&self, ev: &mut Eval<'q>, key: &Term, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let mut plugged = self.plugged.clone();
        plugged.push(key.clone());
        let child = if ev.is_masked(&plugged) { None } else { self.node.child(key) };

        match child {
            Some(node) if node.has_rules() => VirtualStep {
                r: self.r,
                pos: self.pos,
                plugged,
                bindings: self.bindings,
                rterm: self.rterm,
                rbindings: self.rbindings,
                node,
            }
            .eval(ev, k),
            Some(node) => TreeStep {
                pos: self.pos + 1,
                plugged,
                node,
                ..self.clone()
            }
            .eval(ev, k),
            None => {
                let Some(doc) = ev.resolve_base(&Ref(plugged))? else {
                    return Ok(());
                };
                TermStep {
                    r: self.r,
                    pos: self.pos + 1,
                    bindings: self.bindings,
                    term: doc,
                    term_bindings: self.bindings,
                    rterm: self.rterm,
                    rbindings: self.rbindings,
                }
                .eval(ev, k)
            }
        }
    }

    fn enumerate(&self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let prefix = Ref(self.plugged.clone());
        if ev.partial && ev.inlining.disabled(&prefix, true) {
            let rest = Term::reference(prefix.concat(&self.r.0[self.pos..]));
            return ev.save_unify(&rest, self.rterm, self.bindings, self.rbindings, k);
        }

        let mut keys = BTreeSet::new();
        if let Some(doc) = ev.resolve_base(&prefix)? {
            match &doc.value {
                Value::Object(obj) => keys.extend(obj.keys().cloned()),
                Value::Array(items) => keys.extend((0..items.len() as i64).map(Term::int)),
                Value::Set(set) => keys.extend(set.iter().cloned()),
                _ => {}
            }
        }
        keys.extend(self.node.children.keys().cloned());

        let seg = &self.r.0[self.pos];
        for key in keys {
            ev.biunify(&key, seg, self.bindings, self.bindings, &mut |ev| self.next(ev, &key, k))?;
        }
        Ok(())
    }

    fn finish(&self, ev: &mut Eval<'q>, k: &mut Cont<'_, 'q>) -> Result<(), EvalError> {
        let path = Ref(self.plugged.clone());
        if ev.partial && ev.data_ref_unknown(&path) {
            return ev.save_unify(&Term::reference(path), self.rterm, self.bindings, self.rbindings, k);
        }
        let Some(value) = ev.extent(&path, self.node)? else {
            return Ok(());
        };
        ev.biunify(self.rterm, &value, self.rbindings, self.bindings, k)
    }
}

impl<'q> Eval<'q> {
    /// Full document at a ground `data` path: the base document merged
    /// with every rule value beneath the rule tree node.
    pub(crate) fn extent(&mut self, path: &Ref, node: &'q RuleTreeNode) -> Result<Option<Term>, EvalError> {
        let base = self.resolve_base(path)?;
        if node.children.is_empty() {
            return Ok(base);
        }
        let virt = self.leaves(path, node)?;
        match base {
            None => Ok(Some(virt)),
            Some(base) => match (&base.value, &virt.value) {
                (Value::Object(x), Value::Object(y)) => verdict_lang::term::merge_objects(x, y)
                    .map(|merged| Some(Term::object(merged)))
                    .ok_or_else(|| EvalError::conflict(format!("{path}: base and virtual documents conflict"), None)),
                _ => Err(EvalError::conflict(format!("{path}: base and virtual documents conflict"), None)),
            },
        }
    }

    /// Object of every rule value under `node`. Packages without any
    /// defined rule contribute empty objects.
    fn leaves(&mut self, path: &Ref, node: &'q RuleTreeNode) -> Result<Term, EvalError> {
        let mut out = Object::new();
        for (key, child) in &node.children {
            let child_path = path.append(key.clone());
            if self.is_masked(&child_path.0) {
                continue;
            }
            let value = if child.has_rules() {
                self.eval_leaf(&child_path)?
            } else {
                Some(self.leaves(&child_path, child)?)
            };
            if let Some(v) = value {
                out.insert(key.clone(), v);
            }
        }
        Ok(Term::object(out))
    }

    fn eval_leaf(&mut self, path: &Ref) -> Result<Option<Term>, EvalError> {
        let frame = self.child_frame(self.caller);
        let target = Term::reference(path.clone());
        let out_var = self.fresh_var("leaf");
        let mut out = None;
        let result = self.biunify(&target, &out_var, frame.bindings, frame.bindings, &mut |ev| {
            if out.is_none() {
                out = Some(ev.bindings.plug(&out_var, frame.bindings));
            }
            Ok(())
        });
        self.release(frame);
        result?;
        Ok(out)
    }
}
