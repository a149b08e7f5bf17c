//! Diff & commit of staged flows against the southbound store.
//!
//! Each staged table is read, diffed under semantic equality and written as
//! one transaction. Tables are independent: a failed read skips its table
//! for this run, a failed commit is logged and left for the next run to
//! repair, and neither affects other tables.

use futures::future::join_all;
use ofoverlay_common::{FlowEntry, FlowMap, FlowStore, TableFlows, TablePath, TableTransaction};
use std::collections::HashSet;
use tracing::{debug, error, instrument, warn};

/// Outcome of reconciling one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOutcome {
    Unchanged,
    Committed { puts: usize, deletes: usize },
    ReadFailed,
    CommitFailed,
}

/// Totals over one commit pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub tables: usize,
    pub unchanged: usize,
    pub committed: usize,
    pub read_failures: usize,
    pub commit_failures: usize,
    pub puts: usize,
    pub deletes: usize,
}

impl CommitSummary {
    fn record(&mut self, outcome: TableOutcome) {
        self.tables += 1;
        match outcome {
            TableOutcome::Unchanged => self.unchanged += 1,
            TableOutcome::Committed { puts, deletes } => {
                self.committed += 1;
                self.puts += puts;
                self.deletes += deletes;
            }
            TableOutcome::ReadFailed => self.read_failures += 1,
            TableOutcome::CommitFailed => self.commit_failures += 1,
        }
    }

    /// Flow puts and deletes sent to the store.
    pub fn writes(&self) -> usize {
        self.puts + self.deletes
    }
}

/// Computes the transaction turning `persisted` into `desired`.
///
/// Persisted flows with a desired equivalent are left alone even if their
/// id differs; only one persisted copy of each desired flow is kept.
pub fn diff_table(path: TablePath, desired: TableFlows, persisted: Vec<FlowEntry>) -> TableTransaction {
    let mut txn = TableTransaction::new(path);
    let mut kept = HashSet::new();
    for flow in persisted {
        let key = flow.key();
        if desired.contains(&key) && !kept.contains(&key) {
            kept.insert(key);
        } else {
            txn.delete(flow.id);
        }
    }
    for (key, flow) in desired.into_entries() {
        if !kept.contains(&key) {
            txn.put(flow);
        }
    }
    txn
}

/// Reconciles one table.
pub async fn commit_table(store: &dyn FlowStore, path: TablePath, desired: TableFlows) -> TableOutcome {
    let persisted = match store.read_table(&path).await {
        Ok(flows) => flows.unwrap_or_default(),
        Err(e) => {
            warn!(table = %path, error = %e, "Couldn't read flow table, skipping this cycle");
            return TableOutcome::ReadFailed;
        }
    };
    let txn = diff_table(path, desired, persisted);
    if txn.is_empty() {
        return TableOutcome::Unchanged;
    }
    let (puts, deletes) = (txn.puts.len(), txn.deletes.len());
    let path = txn.path.clone();
    match store.submit(txn).await {
        Ok(()) => {
            debug!(table = %path, puts, deletes, "Flow table updated");
            TableOutcome::Committed { puts, deletes }
        }
        Err(e) => {
            error!(table = %path, error = %e, "Could not write flow table");
            TableOutcome::CommitFailed
        }
    }
}

/// Reconciles every table of `flows` against `store`, concurrently.
#[instrument(skip_all, fields(tables = flows.table_count()))]
pub async fn commit_flow_map(store: &dyn FlowStore, flows: FlowMap) -> CommitSummary {
    let outcomes = join_all(
        flows
            .into_tables()
            .into_iter()
            .map(|(path, desired)| commit_table(store, path, desired)),
    )
    .await;
    let mut summary = CommitSummary::default();
    for outcome in outcomes {
        summary.record(outcome);
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofoverlay_common::{Action, FlowMatch, MemoryFlowStore};
    use ofoverlay_types::NodeId;
    use pretty_assertions::assert_eq;

    fn path(table: u8) -> TablePath {
        TablePath::new(NodeId::new("openflow:1"), table)
    }

    fn flow(id: &str, port: u32) -> FlowEntry {
        FlowEntry::new(
            id,
            0,
            100,
            FlowMatch::any().in_port(port),
            vec![Action::GotoTable { table: 1 }],
        )
    }

    fn ids(txn: &TableTransaction) -> (Vec<String>, Vec<String>) {
        (
            txn.deletes.iter().map(|d| d.to_string()).collect(),
            txn.puts.iter().map(|p| p.id.to_string()).collect(),
        )
    }

    #[test]
    fn test_diff_adds_and_removes() {
        let desired: TableFlows = [flow("a", 1), flow("b", 2)].into_iter().collect();
        let persisted = vec![flow("b", 2), flow("c", 3)];
        let txn = diff_table(path(0), desired, persisted);
        assert_eq!(ids(&txn), (vec!["c".to_string()], vec!["a".to_string()]));
    }

    #[test]
    fn test_diff_ignores_ids() {
        let desired: TableFlows = [flow("new-name", 1)].into_iter().collect();
        let txn = diff_table(path(0), desired, vec![flow("old-name", 1)]);
        assert!(txn.is_empty());
    }

    #[test]
    fn test_diff_replaces_changed_flow_under_same_id() {
        let desired: TableFlows = [flow("a", 2)].into_iter().collect();
        let txn = diff_table(path(0), desired, vec![flow("a", 1)]);
        assert_eq!(ids(&txn), (vec!["a".to_string()], vec!["a".to_string()]));
    }

    #[test]
    fn test_diff_removes_persisted_duplicates() {
        let desired: TableFlows = [flow("a", 1)].into_iter().collect();
        let txn = diff_table(path(0), desired, vec![flow("a", 1), flow("a-copy", 1)]);
        assert_eq!(ids(&txn), (vec!["a-copy".to_string()], vec![]));
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = MemoryFlowStore::new();
        let build = || {
            let map = FlowMap::new();
            map.write_flow(&NodeId::new("openflow:1"), flow("a", 1));
            map.write_flow(&NodeId::new("openflow:1"), FlowEntry::drop_all("drop", 0, 1));
            map
        };
        let first = commit_flow_map(&store, build()).await;
        assert_eq!(first.committed, 1);
        assert_eq!(first.puts, 2);

        let second = commit_flow_map(&store, build()).await;
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.writes(), 0);
        assert_eq!(store.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_table() {
        let store = MemoryFlowStore::new();
        store.fail_reads(path(0), true);
        store.fail_commits(path(1), true);
        let map = FlowMap::new();
        let node = NodeId::new("openflow:1");
        map.write_flow(&node, FlowEntry::drop_all("drop", 0, 1));
        map.write_flow(&node, FlowEntry::drop_all("drop", 1, 1));
        map.write_flow(&node, FlowEntry::drop_all("drop", 2, 1));
        let summary = commit_flow_map(&store, map).await;
        assert_eq!(summary.read_failures, 1);
        assert_eq!(summary.commit_failures, 1);
        assert_eq!(summary.committed, 1);
        assert_eq!(store.table_paths(), vec![path(2)]);
    }
}
