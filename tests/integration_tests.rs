//! End-to-end tests across the Verdict crates
//!
//! - Policy source → Compiler → Query evaluation
//! - Storage snapshot → transaction → base documents in queries
//! - Partial evaluation → residual queries and support modules
//!
//! Run with: cargo test --test integration_tests

use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use verdict_eval::{EvalError, Query};
use verdict_lang::{parse_body, CompiledPolicy, Compiler, Term, Var};
use verdict_storage::{InMemoryStore, PatchOp, Storage, StoreConfig, StoragePath, TransactionParams};

const RBAC: &str = r#"
package rbac

default allow = false

allow {
    some grant in data.grants[input.user]
    grant.action == input.action
    grant.resource == input.resource
}

admins[u] { data.roles[u] == "admin" }

allow { admins[input.user] }
"#;

fn rbac_policy() -> Arc<CompiledPolicy> {
    Compiler::new()
        .with_source(RBAC)
        .expect("should parse")
        .compile()
        .expect("should compile")
}

fn rbac_store() -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::from_value(json!({
        "roles": {"ann": "admin", "ben": "dev"},
        "grants": {
            "ben": [{"action": "read", "resource": "logs"}]
        }
    })))
}

fn allow(store: Arc<InMemoryStore>, input: serde_json::Value) -> Term {
    let rows = Query::new(rbac_policy(), parse_body("x = data.rbac.allow").unwrap())
        .with_store(store)
        .with_input_json(&input)
        .run()
        .unwrap();
    assert_eq!(rows.len(), 1);
    rows[0][&Var::new("x")].clone()
}

// ============================================================================
// Reference scenarios
// ============================================================================

fn policy(source: &str) -> Arc<CompiledPolicy> {
    Compiler::new().with_source(source).unwrap().compile().unwrap()
}

#[test]
fn test_scenario_arithmetic_without_rules() {
    let rows = Query::new(CompiledPolicy::empty(), parse_body("x = 1 + 1").unwrap())
        .run()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].len(), 1);
    assert_eq!(rows[0][&Var::new("x")], Term::int(2));
}

#[test]
fn test_scenario_boolean_rule() {
    let p = policy("package policy\nallow { input.user == \"admin\" }");
    let q = Query::new(p, parse_body("data.policy.allow").unwrap());
    let admin = q.clone().with_input_json(&json!({"user": "admin"})).run().unwrap();
    assert_eq!(admin.len(), 1);
    assert!(admin[0].is_empty());
    assert!(q.with_input_json(&json!({"user": "bob"})).run().unwrap().is_empty());
}

#[test]
fn test_scenario_partial_object() {
    let p = policy("package policy\nm[k] = v { k := \"a\"; v := 1 }\nm[k] = v { k := \"b\"; v := 2 }");
    let rows = Query::new(p, parse_body("x = data.policy.m").unwrap()).run().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0][&Var::new("x")],
        Term::object([(Term::string("a"), Term::int(1)), (Term::string("b"), Term::int(2))])
    );
}

#[test]
fn test_scenario_partial_evaluation_inlines() {
    let p = policy("package policy\nallow { input.x > 1 }");
    let out = Query::new(p, parse_body("data.policy.allow").unwrap())
        .with_unknowns(["input.x"])
        .partial_run()
        .unwrap();
    assert_eq!(out.render(), vec!["input.x > 1"]);
    assert!(out.support.is_empty());
}

#[test]
fn test_with_data_override_is_scoped() {
    let store = Arc::new(InMemoryStore::from_value(json!({"foo": {"a": 2}})));
    let rows = Query::new(
        CompiledPolicy::empty(),
        parse_body(r#"x = data.foo.a; y = data.foo.a with data.foo as {"a": 1}; z = data.foo.a"#).unwrap(),
    )
    .with_store(store)
    .run()
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][&Var::new("x")], Term::int(2));
    assert_eq!(rows[0][&Var::new("y")], Term::int(1));
    assert_eq!(rows[0][&Var::new("z")], Term::int(2));
}

// ============================================================================
// Policy → Query
// ============================================================================

#[test]
fn test_rbac_decisions() {
    let store = rbac_store();
    let cases = [
        (json!({"user": "ann", "action": "delete", "resource": "db"}), true),
        (json!({"user": "ben", "action": "read", "resource": "logs"}), true),
        (json!({"user": "ben", "action": "write", "resource": "logs"}), false),
        (json!({"user": "eve", "action": "read", "resource": "logs"}), false),
    ];
    for (input, expected) in cases {
        assert_eq!(allow(store.clone(), input.clone()), Term::boolean(expected), "{input}");
    }
}

#[test]
fn test_enumerate_virtual_set() {
    let rows = Query::new(rbac_policy(), parse_body("data.rbac.admins[u]").unwrap())
        .with_store(rbac_store())
        .run()
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][&Var::new("u")], Term::string("ann"));
}

// ============================================================================
// Storage → Query
// ============================================================================

#[test]
fn test_committed_writes_are_visible_to_new_queries() {
    let store = rbac_store();
    let input = json!({"user": "ben", "action": "write", "resource": "logs"});
    assert_eq!(allow(store.clone(), input.clone()), Term::boolean(false));

    let mut txn = store.new_transaction(TransactionParams::write()).unwrap();
    store
        .write(
            &mut txn,
            PatchOp::Replace,
            &StoragePath::parse("/roles/ben").unwrap(),
            json!("admin"),
        )
        .unwrap();
    store.commit(txn).unwrap();

    assert_eq!(allow(store, input), Term::boolean(true));
}

#[test]
fn test_query_reads_through_explicit_transaction() {
    let store = rbac_store();
    let mut txn = store.new_transaction(TransactionParams::write()).unwrap();
    store
        .write(&mut txn, PatchOp::Add, &StoragePath::parse("/roles/eve").unwrap(), json!("admin"))
        .unwrap();

    let rows = Query::new(rbac_policy(), parse_body("data.rbac.admins[u]").unwrap())
        .with_store(store.clone())
        .with_transaction(txn)
        .run()
        .unwrap();
    assert_eq!(rows.len(), 2);

    // Uncommitted writes stay private to the transaction.
    assert_eq!(store.snapshot()["roles"].get("eve"), None);
}

#[test]
fn test_snapshot_persistence() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        snapshot_path: Some(dir.path().join("data.json")),
    };

    let store = InMemoryStore::open(config.clone()).unwrap();
    let mut txn = store.new_transaction(TransactionParams::write()).unwrap();
    store
        .write(&mut txn, PatchOp::Add, &StoragePath::parse("/roles").unwrap(), json!({"ann": "admin"}))
        .unwrap();
    store.commit(txn).unwrap();
    store.flush().unwrap();

    let reopened = Arc::new(InMemoryStore::open(config).unwrap());
    let input = json!({"user": "ann", "action": "read", "resource": "x"});
    assert_eq!(allow(reopened, input), Term::boolean(true));
}

// ============================================================================
// Partial evaluation
// ============================================================================

#[test]
fn test_partial_eval_with_known_data_and_unknown_input() {
    let out = Query::new(rbac_policy(), parse_body("data.rbac.allow").unwrap())
        .with_store(rbac_store())
        .with_unknowns(["input"])
        .partial_run()
        .unwrap();

    // Base documents are known, so only input refs remain. The default
    // forces support rules; the residual points at them.
    assert_eq!(out.render(), vec!["data.partial.rbac.allow"]);
    let module = &out.support[0];
    assert_eq!(module.package.to_string(), "data.partial.rbac");
    assert!(module.rules.iter().any(|r| r.default));
    assert!(module.rules.iter().filter(|r| !r.default).count() >= 2);
    assert!(module.rules.iter().all(|r| !r.body.to_string().contains("data.roles")));
}

#[test]
fn test_support_modules_compile_and_agree() {
    let policy = rbac_policy();
    let out = Query::new(policy.clone(), parse_body("data.rbac.allow").unwrap())
        .with_store(rbac_store())
        .with_unknowns(["input"])
        .partial_run()
        .unwrap();

    let mut compiler = Compiler::new();
    for module in &out.support {
        compiler = compiler.with_module(module.clone());
    }
    let residual_policy = compiler.compile().unwrap();

    for (input, expected) in [
        (json!({"user": "ann", "action": "x", "resource": "y"}), true),
        (json!({"user": "ben", "action": "read", "resource": "logs"}), true),
        (json!({"user": "eve", "action": "read", "resource": "logs"}), false),
    ] {
        let rows = Query::new(residual_policy.clone(), out.queries[0].clone())
            .with_input_json(&input)
            .run()
            .unwrap();
        let residual_allows = !rows.is_empty();
        let value = Query::new(residual_policy.clone(), parse_body("x = data.partial.rbac.allow").unwrap())
            .with_input_json(&input)
            .run()
            .unwrap();
        assert_eq!(value[0][&Var::new("x")], Term::boolean(expected), "{input}");
        assert_eq!(residual_allows, expected, "{input}");
    }
}

#[test]
fn test_errors_surface_through_the_facade() {
    let policy = Compiler::new()
        .with_source("package p\nq = 1 { true }\nq = 2 { true }")
        .unwrap()
        .compile()
        .unwrap();
    let err = Query::new(policy, parse_body("x = data.p.q").unwrap()).run().unwrap_err();
    assert!(matches!(err, EvalError::Conflict { .. }));
}
