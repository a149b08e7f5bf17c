//! Southbound flow store.
//!
//! The store persists one table object per (switch, physical table id),
//! each holding a set of flow entries addressed by [`FlowId`]. The renderer
//! owns no other persistent state.

use crate::flow::{FlowEntry, FlowId, TablePath};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Errors from store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Failed to read table {path}: {message}")]
    Read { path: TablePath, message: String },

    #[error("Failed to commit table {path}: {message}")]
    Commit { path: TablePath, message: String },

    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Invalid stored data: {0}")]
    Codec(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Changes to apply atomically to one table.
#[derive(Debug, Clone)]
pub struct TableTransaction {
    pub path: TablePath,
    pub deletes: Vec<FlowId>,
    pub puts: Vec<FlowEntry>,
}

impl TableTransaction {
    pub fn new(path: TablePath) -> Self {
        Self {
            path,
            deletes: Vec::new(),
            puts: Vec::new(),
        }
    }

    pub fn delete(&mut self, id: FlowId) {
        self.deletes.push(id);
    }

    /// Upserts a flow under its id.
    pub fn put(&mut self, flow: FlowEntry) {
        self.puts.push(flow);
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.puts.is_empty()
    }
}

/// Transactional store of flow tables.
///
/// All operations are bounded; implementations must not block forever.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Reads the persisted flows of a table, `None` if the table is absent.
    ///
    /// A table holding no flows counts as absent: implementations return
    /// `None` for it, never `Some` of an empty list.
    async fn read_table(&self, path: &TablePath) -> StoreResult<Option<Vec<FlowEntry>>>;

    /// Applies deletes, then puts, to one table as a single transaction.
    /// A table left without flows ceases to exist.
    ///
    /// On failure the table is left as it was before the call.
    async fn submit(&self, txn: TableTransaction) -> StoreResult<()>;

    /// Removes a whole table. Removing an absent table is not an error.
    async fn delete_table(&self, path: &TablePath) -> StoreResult<()>;
}

/// Write counters kept by [`MemoryFlowStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: usize,
    pub commits: usize,
    pub puts: usize,
    pub deletes: usize,
    pub table_deletes: usize,
}

impl StoreStats {
    /// Number of mutations applied to the store.
    pub fn writes(&self) -> usize {
        self.puts + self.deletes + self.table_deletes
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<TablePath, BTreeMap<FlowId, FlowEntry>>,
    stats: StoreStats,
    failing_reads: HashSet<TablePath>,
    failing_commits: HashSet<TablePath>,
}

/// In-process store, used by the daemon's `memory` backend and by tests.
///
/// Reads and commits for chosen tables can be made to fail so error
/// isolation can be exercised.
#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    state: Mutex<MemoryState>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a table's content directly, bypassing stats.
    pub fn seed_table(&self, path: TablePath, flows: Vec<FlowEntry>) {
        let table = flows.into_iter().map(|f| (f.id.clone(), f)).collect();
        self.state.lock().tables.insert(path, table);
    }

    /// Returns a table's flows ordered by id, `None` if absent.
    pub fn table(&self, path: &TablePath) -> Option<Vec<FlowEntry>> {
        self.state
            .lock()
            .tables
            .get(path)
            .map(|t| t.values().cloned().collect())
    }

    pub fn table_paths(&self) -> Vec<TablePath> {
        self.state.lock().tables.keys().cloned().collect()
    }

    pub fn stats(&self) -> StoreStats {
        self.state.lock().stats
    }

    pub fn reset_stats(&self) {
        self.state.lock().stats = StoreStats::default();
    }

    pub fn fail_reads(&self, path: TablePath, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_reads.insert(path);
        } else {
            state.failing_reads.remove(&path);
        }
    }

    pub fn fail_commits(&self, path: TablePath, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_commits.insert(path);
        } else {
            state.failing_commits.remove(&path);
        }
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn read_table(&self, path: &TablePath) -> StoreResult<Option<Vec<FlowEntry>>> {
        let mut state = self.state.lock();
        if state.failing_reads.contains(path) {
            return Err(StoreError::Read {
                path: path.clone(),
                message: "injected read failure".to_string(),
            });
        }
        state.stats.reads += 1;
        Ok(state
            .tables
            .get(path)
            .map(|t| t.values().cloned().collect()))
    }

    async fn submit(&self, txn: TableTransaction) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.failing_commits.contains(&txn.path) {
            return Err(StoreError::Commit {
                path: txn.path,
                message: "injected commit failure".to_string(),
            });
        }

        let (deletes, puts) = (txn.deletes.len(), txn.puts.len());
        let txn_path = txn.path.clone();
        let table = state.tables.entry(txn.path).or_default();
        for id in &txn.deletes {
            table.remove(id);
        }
        for flow in txn.puts {
            table.insert(flow.id.clone(), flow);
        }
        if table.is_empty() {
            state.tables.remove(&txn_path);
        }

        state.stats.commits += 1;
        state.stats.deletes += deletes;
        state.stats.puts += puts;
        Ok(())
    }

    async fn delete_table(&self, path: &TablePath) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.tables.remove(path).is_some() {
            state.stats.table_deletes += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowMatch;
    use ofoverlay_types::NodeId;
    use pretty_assertions::assert_eq;

    fn path(table: u8) -> TablePath {
        TablePath::new(NodeId::new("openflow:1"), table)
    }

    #[tokio::test]
    async fn test_submit_applies_deletes_then_puts() {
        let store = MemoryFlowStore::new();
        store.seed_table(path(0), vec![FlowEntry::drop_all("old", 0, 1)]);

        let mut txn = TableTransaction::new(path(0));
        txn.delete(FlowId::new("old"));
        txn.put(FlowEntry::new("new", 0, 1, FlowMatch::any().in_port(1), vec![]));
        store.submit(txn).await.unwrap();

        let flows = store.read_table(&path(0)).await.unwrap().unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].id.as_str(), "new");
        assert_eq!(store.stats().writes(), 2);
    }

    #[tokio::test]
    async fn test_emptied_table_is_absent() {
        let store = MemoryFlowStore::new();
        store.seed_table(path(4), vec![FlowEntry::drop_all("only", 4, 1)]);

        let mut txn = TableTransaction::new(path(4));
        txn.delete(FlowId::new("only"));
        store.submit(txn).await.unwrap();

        assert!(store.read_table(&path(4)).await.unwrap().is_none());
        assert!(store.table_paths().is_empty());
    }

    #[tokio::test]
    async fn test_absent_table_reads_none() {
        let store = MemoryFlowStore::new();
        assert!(store.read_table(&path(3)).await.unwrap().is_none());
        store.delete_table(&path(3)).await.unwrap();
        assert_eq!(store.stats().table_deletes, 0);
    }

    #[tokio::test]
    async fn test_injected_failures_leave_table_untouched() {
        let store = MemoryFlowStore::new();
        store.seed_table(path(1), vec![FlowEntry::drop_all("keep", 1, 1)]);
        store.fail_commits(path(1), true);
        store.fail_reads(path(2), true);

        let mut txn = TableTransaction::new(path(1));
        txn.delete(FlowId::new("keep"));
        assert!(matches!(store.submit(txn).await, Err(StoreError::Commit { .. })));
        assert_eq!(store.table(&path(1)).unwrap().len(), 1);

        assert!(matches!(store.read_table(&path(2)).await, Err(StoreError::Read { .. })));
        store.fail_reads(path(2), false);
        assert!(store.read_table(&path(2)).await.is_ok());
    }
}
