//! Copy propagation over residual bodies.
//!
//! Equalities `v = t` where `v` is not live are removed and `t` is
//! substituted for `v` in the rest of the body. A removed binding whose
//! value still needs evaluation (a ref or a call) and that was never
//! substituted is kept, otherwise the body would no longer require that
//! value to be defined.

use std::collections::BTreeSet;

use verdict_lang::{Expr, ExprTerms, Term, Value, Var};

#[derive(Debug, Clone)]
pub struct CopyPropagator {
    live: BTreeSet<Var>,
    ensure_non_empty: bool,
}

impl CopyPropagator {
    pub fn new(live: impl IntoIterator<Item = Var>) -> Self {
        CopyPropagator {
            live: live.into_iter().collect(),
            ensure_non_empty: true,
        }
    }

    pub fn ensure_non_empty(mut self, yes: bool) -> Self {
        self.ensure_non_empty = yes;
        self
    }

    pub fn apply(&self, body: &[Expr]) -> Vec<Expr> {
        let mut rows: Vec<(Expr, bool)> = body.iter().map(|e| (e.clone(), false)).collect();

        while let Some((i, var, value)) = self.next_binding(&rows) {
            let (expr, _) = rows.remove(i);
            let mut used = false;
            for row in rows.iter_mut() {
                row.0 = row.0.map_vars(&mut |v: &Var| {
                    (v == &var).then(|| {
                        used = true;
                        value.clone()
                    })
                });
            }
            if !used && value.has_dynamic() {
                rows.insert(i, (expr, true));
            }
        }

        let mut out: Vec<Expr> = rows.into_iter().map(|(e, _)| e).filter(|e| !trivially_true(e)).collect();
        out.dedup();
        if out.is_empty() && self.ensure_non_empty {
            out.push(Expr::term(Term::boolean(true)));
        }
        for (i, e) in out.iter_mut().enumerate() {
            e.index = i;
        }
        out
    }

    fn next_binding(&self, rows: &[(Expr, bool)]) -> Option<(usize, Var, Term)> {
        for (i, (expr, pinned)) in rows.iter().enumerate() {
            if *pinned || expr.negated || !expr.with.is_empty() || !expr.is_equality() {
                continue;
            }
            let ops = expr.operands();
            for (a, b) in [(0, 1), (1, 0)] {
                let Some(v) = ops[a].as_var() else { continue };
                let value = &ops[b];
                if v.is_root() || self.live.contains(v) || value.vars().contains(v) {
                    continue;
                }
                if matches!(value.value, Value::Call(_)) {
                    continue;
                }
                let spliceable = value.is_var() || value.as_ref().is_some();
                if !spliceable && used_as_ref_head(rows, i, v) {
                    continue;
                }
                return Some((i, v.clone(), value.clone()));
            }
        }
        None
    }
}

fn used_as_ref_head(rows: &[(Expr, bool)], skip: usize, var: &Var) -> bool {
    rows.iter().enumerate().filter(|(j, _)| *j != skip).any(|(_, (e, _))| {
        let mut found = false;
        e.walk_terms(&mut |t| {
            if let Value::Ref(r) = &t.value {
                if r.head_var() == Some(var) {
                    found = true;
                }
            }
            found
        });
        found
    })
}

fn trivially_true(expr: &Expr) -> bool {
    if expr.negated || !expr.with.is_empty() {
        return false;
    }
    match &expr.terms {
        ExprTerms::Term(t) => matches!(t.value, Value::Boolean(true)),
        ExprTerms::Call(_) if expr.is_equality() => {
            let ops = expr.operands();
            ops[0] == ops[1] && !ops[0].has_dynamic()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdict_lang::parse_body;

    fn run(body: &str, live: &[&str]) -> String {
        let exprs = parse_body(body).expect("body").to_vec();
        let out = CopyPropagator::new(live.iter().map(Var::new)).apply(&exprs);
        out.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    }

    #[test]
    fn substitutes_generated_temporaries() {
        assert_eq!(run("__t1 = input.x; __t1 > 1", &[]), "input.x > 1");
        assert_eq!(run("__t1 = input.a; __t1.b == 1", &[]), "input.a.b == 1");
    }

    #[test]
    fn keeps_live_vars() {
        assert_eq!(run("x = input.a; x > 1", &["x"]), "x = input.a; x > 1");
        assert_eq!(run("x = __t2; __t2 = input.a", &["x"]), "x = input.a");
    }

    #[test]
    fn unused_ref_bindings_stay_constant_bindings_go() {
        assert_eq!(run("__t = input.a", &[]), "__t = input.a");
        assert_eq!(run("__term0__ = true", &[]), "true");
    }

    #[test]
    fn constants_are_not_spliced_into_ref_heads() {
        assert_eq!(run("__t = [1, 2]; __t[0] == 1", &[]), "__t = [1, 2]; __t[0] == 1");
    }

    #[test]
    fn empty_body_can_stay_empty() {
        let exprs = parse_body("__t = 1").expect("body").to_vec();
        assert!(CopyPropagator::new([]).ensure_non_empty(false).apply(&exprs).is_empty());
    }
}
