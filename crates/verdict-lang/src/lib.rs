//! Verdict policy language
//!
//! The pieces the evaluator consumes but does not own:
//!
//! - [`term`]: the closed term algebra (`Term`, `Value`, `Ref`, `Var`)
//! - [`ast`]: expressions, bodies, rules and modules
//! - [`parser`]: a `nom` parser for policy source and ad-hoc queries
//! - [`compile`]: module compilation into a path-keyed rule tree
//! - [`index`]: per-path rule lookup (`lookup` / `all_rules`)

pub mod ast;
pub mod compile;
pub mod index;
pub mod parser;
pub mod term;

pub use ast::{Body, Expr, ExprTerms, Head, Import, Module, Rule, RuleId, RuleKind, With};
pub use compile::{CompileError, CompiledPolicy, Compiler, RuleTree, RuleTreeNode};
pub use index::{IndexResult, ValueResolver};
pub use parser::{parse_body, parse_module, parse_term, ParseError};
pub use term::{Location, Number, Ref, Term, Value, Var, DATA_ROOT, INPUT_ROOT};
