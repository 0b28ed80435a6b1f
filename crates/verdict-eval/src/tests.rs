use std::sync::Arc;

use serde_json::json;
use verdict_lang::{parse_body, CompiledPolicy, Compiler, Number, Term, Value, Var};
use verdict_storage::InMemoryStore;

use crate::metrics;
use crate::{BufferTracer, Cancel, EvalError, Metrics, Op, PartialResult, Query, QueryResult};

fn compile(sources: &[&str]) -> Arc<CompiledPolicy> {
    let mut compiler = Compiler::new();
    for source in sources {
        compiler = compiler.with_source(source).expect("policy should parse");
    }
    compiler.compile().expect("policy should compile")
}

fn query(policy: &Arc<CompiledPolicy>, text: &str) -> Query {
    Query::new(policy.clone(), parse_body(text).expect("query should parse"))
}

fn value(row: &QueryResult, var: &str) -> Term {
    row.get(&Var::new(var)).cloned().unwrap_or_else(|| panic!("{var} unbound in {row:?}"))
}

fn single(q: &Query, var: &str) -> Term {
    let rows = q.run().expect("query should evaluate");
    assert_eq!(rows.len(), 1, "expected one result, got {rows:?}");
    value(&rows[0], var)
}

fn partial(q: Query) -> PartialResult {
    q.partial_run().expect("partial evaluation should succeed")
}

/// Route evaluator logs to the test harness; repeated calls are no-ops.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

fn s(x: &str) -> Term {
    Term::string(x)
}

const ALLOW: &str = r#"
package policy

default allow = false
allow { input.user == "alice" }
"#;

// ============================================================================
// Full evaluation
// ============================================================================

#[test]
fn arithmetic_query_binds_result() {
    let policy = CompiledPolicy::empty();
    assert_eq!(single(&query(&policy, "x = 1 + 1"), "x"), Term::int(2));
}

#[test]
fn default_applies_only_when_no_rule_fires() {
    let policy = compile(&[ALLOW]);
    let q = query(&policy, "x = data.policy.allow");
    assert_eq!(single(&q.clone().with_input_json(&json!({"user": "alice"})), "x"), Term::boolean(true));
    assert_eq!(single(&q.with_input_json(&json!({"user": "bob"})), "x"), Term::boolean(false));
}

#[test]
fn false_term_expression_fails() {
    let policy = compile(&[ALLOW]);
    let rows = query(&policy, "data.policy.allow")
        .with_input_json(&json!({"user": "bob"}))
        .run()
        .expect("eval");
    assert!(rows.is_empty());
}

#[test]
fn partial_object_builds_whole_document() {
    let policy = compile(&[r#"
        package policy
        m["a"] = 1 { true }
        m["b"] = 2 { true }
        m[k] = v { k := "c"; v := 3 }
    "#]);
    let expected = Term::object([(s("a"), Term::int(1)), (s("b"), Term::int(2)), (s("c"), Term::int(3))]);
    assert_eq!(single(&query(&policy, "x = data.policy.m"), "x"), expected);
    assert_eq!(single(&query(&policy, "x = data.policy.m.b"), "x"), Term::int(2));
    assert_eq!(single(&query(&policy, "data.policy.m[k] = 3"), "k"), s("c"));
}

#[test]
fn partial_set_members_are_deduplicated() {
    let policy = compile(&[r#"
        package policy
        s[x] { x := input.xs[_] }
        s[x] { x := "extra" }
    "#]);
    let input = json!({"xs": ["a", "b", "a"]});
    let whole = single(&query(&policy, "x = data.policy.s").with_input_json(&input), "x");
    assert_eq!(whole, Term::set([s("a"), s("b"), s("extra")]));

    let rows = query(&policy, "data.policy.s[x]").with_input_json(&input).run().expect("eval");
    let members: Vec<Term> = rows.iter().map(|r| value(r, "x")).collect();
    assert_eq!(members, vec![s("a"), s("b"), s("extra")]);
}

#[test]
fn repeated_runs_yield_the_same_order() {
    let policy = compile(&[r#"
        package policy
        s[x] { x := input.xs[_] }
        s[x] { x := "z" }
    "#]);
    let q = query(&policy, "data.policy.s[x]").with_input_json(&json!({"xs": ["b", "a", "c"]}));
    let first = q.run().expect("eval");
    for _ in 0..3 {
        assert_eq!(q.run().expect("eval"), first);
    }
}

#[test]
fn conflicting_complete_rules_raise() {
    init_logging();
    let policy = compile(&[r#"
        package policy
        p = 1 { true }
        p = 2 { true }
    "#]);
    let err = query(&policy, "x = data.policy.p").run().expect_err("conflict");
    assert!(matches!(err, EvalError::Conflict { .. }), "{err}");
}

#[test]
fn conflicting_object_keys_raise() {
    let policy = compile(&[r#"
        package policy
        m["a"] = 1 { true }
        m["a"] = 2 { true }
    "#]);
    let err = query(&policy, "x = data.policy.m").run().expect_err("conflict");
    assert!(matches!(err, EvalError::Conflict { .. }), "{err}");
}

#[test]
fn bound_object_keys_unify_with_literal_keys() {
    let policy = CompiledPolicy::empty();
    assert_eq!(single(&query(&policy, r#"k := "a"; {k: 1} = {"a": y}"#), "y"), Term::int(1));
    assert_eq!(single(&query(&policy, r#"k := "a"; {"a": y} = {k: 1}"#), "y"), Term::int(1));
    assert!(query(&policy, r#"k := "b"; {k: 1} = {"a": y}"#).run().expect("eval").is_empty());
}

#[test]
fn conflicting_object_keys_raise_on_every_access_path() {
    let policy = compile(&[r#"
        package policy
        m[k] = v { k := "a"; v := 1 }
        m[k] = v { k := "a"; v := 2 }
        m[k] = v { k := "b"; v := 3 }
    "#]);
    for text in ["x = data.policy.m", "x = data.policy.m.a", "v = data.policy.m[k]"] {
        let err = query(&policy, text).run().expect_err(text);
        assert!(matches!(err, EvalError::Conflict { .. }), "{text}: {err}");
    }
    assert_eq!(single(&query(&policy, "x = data.policy.m.b"), "x"), Term::int(3));
}

#[test]
fn integer_overflow_in_division_does_not_panic() {
    let policy = CompiledPolicy::empty();
    let input = json!({ "a": i64::MIN, "b": -1 });
    let rem = single(&query(&policy, "x = input.a % input.b").with_input_json(&input), "x");
    assert_eq!(rem, Term::int(0));
    let div = single(&query(&policy, "x = input.a / input.b").with_input_json(&input), "x");
    assert!(matches!(div.value, Value::Number(Number::Float(f)) if f > 9.2e18), "{div}");
}

#[test]
fn else_chain_falls_through_in_order() {
    let policy = compile(&[r#"
        package policy
        grade = "a" if { input.score > 90 } else = "b" { input.score > 80 } else = "c"
    "#]);
    let q = query(&policy, "x = data.policy.grade");
    for (score, expected) in [(95, "a"), (85, "b"), (10, "c")] {
        let got = single(&q.clone().with_input_json(&json!({ "score": score })), "x");
        assert_eq!(got, s(expected), "score {score}");
    }
}

#[test]
fn functions_with_output_and_conflicts() {
    let policy = compile(&[r#"
        package policy
        inc(x) = y { y := x + 1 }
        g(x) = 1 { true }
        g(x) = 2 { true }
        no(x) = false { true }
    "#]);
    assert_eq!(single(&query(&policy, "y = data.policy.inc(1)"), "y"), Term::int(2));
    assert_eq!(single(&query(&policy, "data.policy.inc(41, y)"), "y"), Term::int(42));

    let err = query(&policy, "y = data.policy.g(0)").run().expect_err("conflict");
    assert!(matches!(err, EvalError::Conflict { .. }), "{err}");

    assert!(query(&policy, "data.policy.no(1)").run().expect("eval").is_empty());
    assert_eq!(single(&query(&policy, "data.policy.no(1, y)"), "y"), Term::boolean(false));
}

#[test]
fn negation_succeeds_only_without_solutions() {
    let policy = compile(&[r#"
        package policy
        deny { not input.admin }
    "#]);
    let q = query(&policy, "data.policy.deny");
    assert_eq!(q.clone().with_input_json(&json!({})).run().expect("eval").len(), 1);
    assert!(q.with_input_json(&json!({"admin": true})).run().expect("eval").is_empty());
}

#[test]
fn with_overrides_input_and_restores_cache() {
    let policy = compile(&[ALLOW]);
    let rows = query(&policy, r#"x = data.policy.allow with input.user as "alice"; y = data.policy.allow"#)
        .with_input_json(&json!({"user": "bob"}))
        .run()
        .expect("eval");
    assert_eq!(rows.len(), 1);
    assert_eq!(value(&rows[0], "x"), Term::boolean(true));
    assert_eq!(value(&rows[0], "y"), Term::boolean(false));
}

#[test]
fn with_overrides_data_and_masks_rules() {
    let policy = compile(&[
        ALLOW,
        r#"
        package check
        ok { data.roles.admin == "bob" }
        "#,
    ]);
    let store = Arc::new(InMemoryStore::from_value(json!({"roles": {"admin": "carol"}})));
    let q = query(&policy, r#"data.check.ok with data.roles.admin as "bob""#).with_store(store.clone());
    assert_eq!(q.run().expect("eval").len(), 1);
    assert!(query(&policy, "data.check.ok").with_store(store).run().expect("eval").is_empty());

    let masked = query(&policy, "x = data.policy.allow with data.policy.allow as 7");
    assert_eq!(single(&masked, "x"), Term::int(7));
}

#[test]
fn base_documents_merge_with_rules() {
    let policy = compile(&[ALLOW]);
    let store = Arc::new(InMemoryStore::from_value(json!({
        "roles": {"admin": "bob", "viewer": "eve"},
        "policy": {"limit": 3}
    })));
    let q = |text: &str| query(&policy, text).with_store(store.clone());
    assert_eq!(single(&q("x = data.roles.admin"), "x"), s("bob"));
    assert_eq!(single(&q(r#"data.roles[k] = "eve""#), "k"), s("viewer"));
    assert_eq!(
        single(&q("x = data.policy"), "x"),
        Term::object([(s("allow"), Term::boolean(false)), (s("limit"), Term::int(3))])
    );
    assert!(q("x = data.missing.path").run().expect("eval").is_empty());
}

#[test]
fn comprehensions_collect_solutions() {
    let policy = CompiledPolicy::empty();
    let q = query(&policy, "xs := [x | x := input.a[_]; x > 1]; n := count({y | y := input.a[_]})")
        .with_input_json(&json!({"a": [1, 2, 3, 2]}));
    let rows = q.run().expect("eval");
    assert_eq!(value(&rows[0], "xs"), Term::array(vec![Term::int(2), Term::int(3), Term::int(2)]));
    assert_eq!(value(&rows[0], "n"), Term::int(3));
}

#[test]
fn indexing_does_not_change_results() {
    let policy = compile(&[r#"
        package policy
        allow { input.method == "GET" }
        allow { input.method == "POST"; input.admin == true }
    "#]);
    let input = json!({"method": "GET"});
    let sink = Arc::new(Metrics::new());
    let indexed = query(&policy, "data.policy.allow")
        .with_input_json(&input)
        .with_metrics(sink.clone())
        .with_instrumentation(true);
    assert_eq!(indexed.run().expect("eval").len(), 1);
    assert!(sink.counter(metrics::RULE_INDEX) > 0);

    let plain = query(&policy, "data.policy.allow").with_input_json(&input).with_indexing(false);
    assert_eq!(plain.run().expect("eval").len(), 1);
}

#[test]
fn virtual_cache_is_hit_on_repeat_reads() {
    let policy = compile(&[ALLOW]);
    let sink = Arc::new(Metrics::new());
    query(&policy, "x = data.policy.allow; y = data.policy.allow")
        .with_input_json(&json!({"user": "alice"}))
        .with_metrics(sink.clone())
        .with_instrumentation(true)
        .run()
        .expect("eval");
    assert!(sink.counter(metrics::VIRTUAL_CACHE_HIT) >= 1);
    assert!(sink.timer(metrics::QUERY_EVAL) > std::time::Duration::ZERO);
}

#[test]
fn metrics_stay_empty_without_instrumentation() {
    let policy = compile(&[ALLOW]);
    let sink = Arc::new(Metrics::new());
    query(&policy, "x = data.policy.allow")
        .with_metrics(sink.clone())
        .run()
        .expect("eval");
    assert_eq!(sink.counter(metrics::VIRTUAL_CACHE_MISS), 0);
}

#[test]
fn tracer_sees_enter_eval_exit() {
    init_logging();
    let policy = compile(&[ALLOW]);
    let tracer = Arc::new(BufferTracer::new());
    query(&policy, "x = data.policy.allow")
        .with_tracer(tracer.clone())
        .run()
        .expect("eval");
    let ops = tracer.ops();
    for op in [Op::Enter, Op::Eval, Op::Exit, Op::Redo] {
        assert!(ops.contains(&op), "missing {op:?} in {ops:?}");
    }
    assert!(tracer.events().iter().any(|e| e.query_id != 0 && e.parent_id == 0));
}

#[test]
fn cancellation_stops_evaluation() {
    let policy = compile(&[ALLOW]);
    let cancel = Cancel::new();
    cancel.cancel();
    let err = query(&policy, "x = data.policy.allow")
        .with_cancel(cancel)
        .run()
        .expect_err("cancelled");
    assert!(err.is_cancelled());
}

#[test]
fn builtin_errors_name_the_builtin() {
    let policy = CompiledPolicy::empty();
    match query(&policy, r#"x = 1 + "a""#).run() {
        Err(EvalError::Type { builtin, .. }) => assert_eq!(builtin, "plus"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        query(&policy, "x = nope(1)").run(),
        Err(EvalError::UnknownBuiltin { .. })
    ));
}

#[test]
fn callback_errors_stop_iteration() {
    let policy = CompiledPolicy::empty();
    let mut seen = 0;
    let err = query(&policy, "x := input.xs[_]")
        .with_input_json(&json!({"xs": [1, 2, 3]}))
        .iter(|_| {
            seen += 1;
            Err(EvalError::Internal("stop".into()))
        })
        .expect_err("stopped");
    assert_eq!(err, EvalError::Internal("stop".into()));
    assert_eq!(seen, 1);
}

// ============================================================================
// Partial evaluation
// ============================================================================

#[test]
fn unknown_input_leaves_residual_comparison() {
    let policy = compile(&[r#"
        package policy
        allow { input.x > 1 }
    "#]);
    let out = partial(query(&policy, "data.policy.allow").with_unknowns(["input"]));
    assert_eq!(out.render(), vec!["input.x > 1"]);
    assert!(out.support.is_empty());
}

#[test]
fn known_parts_are_evaluated() {
    let policy = compile(&[r#"
        package policy
        allow { input.user == "alice"; input.x > 1 }
    "#]);
    let q = query(&policy, "data.policy.allow")
        .with_input_json(&json!({"user": "alice"}))
        .with_unknowns(["input.x"]);
    assert_eq!(partial(q).render(), vec!["input.x > 1"]);

    let q = query(&policy, "data.policy.allow")
        .with_input_json(&json!({"user": "bob"}))
        .with_unknowns(["input.x"]);
    assert!(partial(q).queries.is_empty());
}

#[test]
fn one_residual_query_per_rule() {
    let policy = compile(&[r#"
        package policy
        allow { input.role == "admin" }
        allow { input.owner == true }
    "#]);
    let out = partial(query(&policy, "data.policy.allow").with_unknowns(["input"]));
    assert_eq!(out.render(), vec![r#"input.role == "admin""#, "input.owner == true"]);
}

#[test]
fn default_rules_become_support_rules() {
    let out = partial(query(&compile(&[ALLOW]), "data.policy.allow").with_unknowns(["input"]));
    assert_eq!(out.render(), vec!["data.partial.policy.allow"]);
    assert_eq!(out.support.len(), 1);
    let module = &out.support[0];
    assert_eq!(module.package.to_string(), "data.partial.policy");
    assert_eq!(module.rules.len(), 2);
    assert!(module.rules.iter().any(|r| r.default));
    let rule = module.rules.iter().find(|r| !r.default).expect("non-default rule");
    assert_eq!(rule.body.to_string(), r#"input.user == "alice""#);
}

#[test]
fn partial_namespace_is_configurable() {
    let out = partial(
        query(&compile(&[ALLOW]), "data.policy.allow")
            .with_unknowns(["input"])
            .with_partial_namespace("residual"),
    );
    assert_eq!(out.render(), vec!["data.residual.policy.allow"]);
}

#[test]
fn negated_unknowns_are_inlined_as_complements() {
    let policy = CompiledPolicy::empty();
    let out = partial(query(&policy, "not input.x == 1").with_unknowns(["input"]));
    assert_eq!(out.render(), vec!["not input.x == 1"]);
}

fn disjunction(rules: usize) -> String {
    let mut src = String::from("package policy\n");
    for i in 0..rules {
        src.push_str(&format!("q {{ input.a == {i}; input.b == {i} }}\n"));
    }
    src
}

#[test]
fn negation_inlines_up_to_sixteen_bodies() {
    let policy = compile(&[&disjunction(4)]);
    let out = partial(query(&policy, "not data.policy.q").with_unknowns(["input"]));
    assert_eq!(out.queries.len(), 16);
    assert!(out.queries.iter().all(|q| q.len() == 4 && q.iter().all(|e| e.negated)));
    assert!(out.support.is_empty());
}

#[test]
fn larger_negations_use_support_rules() {
    let policy = compile(&[&disjunction(5)]);
    let out = partial(query(&policy, "not data.policy.q").with_unknowns(["input"]));
    assert_eq!(out.queries.len(), 1);
    let rendered = out.queries[0].to_string();
    assert!(rendered.starts_with("not data.partial.__not"), "{rendered}");
    assert_eq!(out.support.len(), 1);
    assert_eq!(out.support[0].rules.len(), 5);
}

#[test]
fn disabled_inlining_emits_function_support() {
    let policy = compile(&[r#"
        package policy
        inc(x) = y { y := x + 1 }
    "#]);
    let out = partial(
        query(&policy, "y = data.policy.inc(input.a)")
            .with_unknowns(["input"])
            .with_disable_inlining(["data.policy.inc"]),
    );
    assert_eq!(out.render(), vec!["data.partial.policy.inc(input.a, y)"]);
    assert_eq!(out.support.len(), 1);
    assert_eq!(out.support[0].rules[0].head.args.len(), 1);
}

#[test]
fn live_query_vars_keep_their_bindings() {
    let policy = CompiledPolicy::empty();
    let out = partial(query(&policy, "x = input.a; x > 1").with_unknowns(["input"]));
    assert_eq!(out.render(), vec!["x = input.a; x > 1"]);
}

#[test]
fn invalid_unknowns_are_rejected() {
    let err = query(&CompiledPolicy::empty(), "true")
        .with_unknowns(["input..x"])
        .partial_run()
        .expect_err("invalid");
    assert_eq!(err, EvalError::InvalidRef("input..x".into()));
}
