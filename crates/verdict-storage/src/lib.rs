//! Verdict Base-Document Storage
//!
//! The evaluator reads base documents through the [`Storage`] trait:
//!
//! ```text
//! ┌──────────────┐  new_transaction  ┌────────────────────────────┐
//! │  evaluator   │──────────────────►│  InMemoryStore             │
//! │              │  read(txn, path)  │  RwLock<Arc<Value>>        │
//! │              │◄──────────────────│  (snapshot per txn)        │
//! └──────────────┘                   └─────────────┬──────────────┘
//!                                                  │ flush
//!                                                  ▼
//!                                         JSON snapshot file
//! ```
//!
//! Every transaction sees the snapshot that was current when it began.
//! Writes go to a private working copy and become visible on commit;
//! a commit fails if another write transaction committed in between.

pub mod persistence;

#[cfg(test)]
mod tests;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The path does not exist. Readers treat this as "no value".
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("transaction {0} is read-only")]
    ReadOnly(u64),

    #[error("transaction {0} conflicts with a concurrent commit")]
    Conflict(u64),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

// ============================================================================
// Paths
// ============================================================================

/// Path of string segments below the storage root, e.g. `/users/alice`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoragePath(pub Vec<String>);

impl StoragePath {
    pub fn new<S: Into<String>>(segments: impl IntoIterator<Item = S>) -> Self {
        StoragePath(segments.into_iter().map(Into::into).collect())
    }

    pub fn root() -> Self {
        StoragePath(vec![])
    }

    /// Parse `/a/b/c`; the empty string and `/` are the root.
    pub fn parse(text: &str) -> Result<Self, StorageError> {
        let trimmed = text.strip_prefix('/').unwrap_or(text);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(StorageError::InvalidPath {
                path: text.to_string(),
                reason: "empty segment".to_string(),
            });
        }
        Ok(StoragePath(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.0 {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionParams {
    pub write: bool,
}

impl TransactionParams {
    pub fn read() -> Self {
        TransactionParams { write: false }
    }

    pub fn write() -> Self {
        TransactionParams { write: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Create or overwrite; the parent must exist.
    Add,
    /// Overwrite; the path must exist.
    Replace,
    Remove,
}

/// A consistent view of the store.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: u64,
    params: TransactionParams,
    base_version: u64,
    snapshot: Arc<Value>,
    working: Option<Value>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_write(&self) -> bool {
        self.params.write
    }

    fn view(&self) -> &Value {
        self.working.as_ref().unwrap_or(&self.snapshot)
    }
}

/// Contract the evaluator needs from a base-document store.
pub trait Storage: Send + Sync {
    fn new_transaction(&self, params: TransactionParams) -> Result<Transaction, StorageError>;

    /// Value at `path`, or [`StorageError::NotFound`].
    fn read(&self, txn: &Transaction, path: &StoragePath) -> Result<Value, StorageError>;

    fn write(
        &self,
        txn: &mut Transaction,
        op: PatchOp,
        path: &StoragePath,
        value: Value,
    ) -> Result<(), StorageError>;

    fn commit(&self, txn: Transaction) -> Result<(), StorageError>;

    fn abort(&self, txn: Transaction);
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot loaded on open and written by [`InMemoryStore::flush`].
    pub snapshot_path: Option<PathBuf>,
}

struct Committed {
    version: u64,
    data: Arc<Value>,
}

pub struct InMemoryStore {
    committed: RwLock<Committed>,
    next_txn: AtomicU64,
    config: StoreConfig,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::from_value(Value::Object(Default::default()))
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(data: Value) -> Self {
        InMemoryStore {
            committed: RwLock::new(Committed {
                version: 0,
                data: Arc::new(data),
            }),
            next_txn: AtomicU64::new(1),
            config: StoreConfig::default(),
        }
    }

    /// Open a store, loading the configured snapshot when it exists.
    pub fn open(config: StoreConfig) -> anyhow::Result<Self> {
        let data = match &config.snapshot_path {
            Some(path) if path.exists() => persistence::load_snapshot(path)?,
            _ => Value::Object(Default::default()),
        };
        let mut store = Self::from_value(data);
        store.config = config;
        Ok(store)
    }

    /// Write the committed state to the configured snapshot, if any.
    pub fn flush(&self) -> anyhow::Result<()> {
        if let Some(path) = &self.config.snapshot_path {
            let data = self.committed.read().data.clone();
            persistence::save_snapshot(path, &data)?;
        }
        Ok(())
    }

    /// Committed state, outside any transaction.
    pub fn snapshot(&self) -> Arc<Value> {
        self.committed.read().data.clone()
    }
}

impl Storage for InMemoryStore {
    fn new_transaction(&self, params: TransactionParams) -> Result<Transaction, StorageError> {
        let committed = self.committed.read();
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        debug!(txn = id, write = params.write, "begin transaction");
        Ok(Transaction {
            id,
            params,
            base_version: committed.version,
            snapshot: committed.data.clone(),
            working: None,
        })
    }

    fn read(&self, txn: &Transaction, path: &StoragePath) -> Result<Value, StorageError> {
        lookup(txn.view(), path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    fn write(
        &self,
        txn: &mut Transaction,
        op: PatchOp,
        path: &StoragePath,
        value: Value,
    ) -> Result<(), StorageError> {
        if !txn.params.write {
            return Err(StorageError::ReadOnly(txn.id));
        }
        let working = txn.working.get_or_insert_with(|| (*txn.snapshot).clone());
        apply_patch(working, op, path, value)
    }

    fn commit(&self, txn: Transaction) -> Result<(), StorageError> {
        let Some(working) = txn.working else {
            debug!(txn = txn.id, "commit (no writes)");
            return Ok(());
        };
        let mut committed = self.committed.write();
        if committed.version != txn.base_version {
            return Err(StorageError::Conflict(txn.id));
        }
        committed.version += 1;
        committed.data = Arc::new(working);
        debug!(txn = txn.id, version = committed.version, "commit");
        Ok(())
    }

    fn abort(&self, txn: Transaction) {
        debug!(txn = txn.id, "abort");
    }
}

fn lookup<'a>(mut node: &'a Value, path: &StoragePath) -> Option<&'a Value> {
    for seg in path.segments() {
        node = match node {
            Value::Object(map) => map.get(seg)?,
            Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn apply_patch(root: &mut Value, op: PatchOp, path: &StoragePath, value: Value) -> Result<(), StorageError> {
    let Some((last, parent_path)) = path.segments().split_last() else {
        return match op {
            PatchOp::Remove => Err(StorageError::InvalidPath {
                path: path.to_string(),
                reason: "cannot remove the root".to_string(),
            }),
            _ => {
                *root = value;
                Ok(())
            }
        };
    };
    let not_found = || StorageError::NotFound(path.to_string());
    let mut parent = root;
    for seg in parent_path {
        parent = match parent {
            Value::Object(map) => map.get_mut(seg).ok_or_else(not_found)?,
            Value::Array(items) => seg
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(not_found)?,
            _ => return Err(not_found()),
        };
    }
    match (parent, op) {
        (Value::Object(map), PatchOp::Add) => {
            map.insert(last.clone(), value);
        }
        (Value::Object(map), PatchOp::Replace) => {
            *map.get_mut(last).ok_or_else(not_found)? = value;
        }
        (Value::Object(map), PatchOp::Remove) => {
            map.remove(last).ok_or_else(not_found)?;
        }
        (Value::Array(items), op) => {
            let idx = if last == "-" {
                items.len()
            } else {
                last.parse::<usize>().map_err(|_| StorageError::InvalidPath {
                    path: path.to_string(),
                    reason: "array index must be a number or `-`".to_string(),
                })?
            };
            match op {
                PatchOp::Add if idx <= items.len() => items.insert(idx, value),
                PatchOp::Replace if idx < items.len() => items[idx] = value,
                PatchOp::Remove if idx < items.len() => {
                    items.remove(idx);
                }
                _ => return Err(not_found()),
            }
        }
        _ => return Err(not_found()),
    }
    Ok(())
}
