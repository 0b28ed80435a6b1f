//! Query tracing
//!
//! Tracers receive a structured event stream describing evaluation:
//! queries and rule bodies being entered and exited, expressions being
//! evaluated, backtracking (`Redo`), failures and partial-evaluation saves.
//! This is separate from `tracing` diagnostics, which stay developer-facing.

use parking_lot::Mutex;
use serde::Serialize;
use verdict_lang::Location;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Op {
    Enter,
    Exit,
    Eval,
    Redo,
    Fail,
    Save,
    Index,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub op: Op,
    pub query_id: u64,
    pub parent_id: u64,
    /// Rendered expression, body or rule.
    pub node: String,
    pub location: Option<Location>,
}

pub trait QueryTracer: Send + Sync {
    fn enabled(&self) -> bool {
        true
    }

    fn trace(&self, event: &Event);
}

/// Collects every event in memory.
#[derive(Debug, Default)]
pub struct BufferTracer {
    events: Mutex<Vec<Event>>,
}

impl BufferTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.events.lock().iter().map(|e| e.op).collect()
    }
}

impl QueryTracer for BufferTracer {
    fn trace(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}
