//! Evaluation configuration

use serde::{Deserialize, Serialize};

/// Tunables for one query, loadable from JSON.
///
/// ```json
/// {"unknowns": ["input.user"], "partial_namespace": "residual", "indexing": false}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Filter candidate rules with the rule index.
    pub indexing: bool,
    /// Record counters and timers in the metrics sink.
    pub instrument: bool,
    /// Package prefix for generated support rules (`data.<namespace>...`).
    pub partial_namespace: String,
    /// Dotted refs whose virtual documents are never inlined.
    pub disable_inlining: Vec<String>,
    /// Never inline virtual documents on unknown paths; skip copy propagation.
    pub shallow_inlining: bool,
    /// Dotted refs treated as unknown by `partial_run`.
    pub unknowns: Vec<String>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        EvalConfig {
            indexing: true,
            instrument: false,
            partial_namespace: "partial".to_string(),
            disable_inlining: vec![],
            shallow_inlining: false,
            unknowns: vec![],
        }
    }
}

impl EvalConfig {
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
