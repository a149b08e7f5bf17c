//! Staging buffer for computed flows.
//!
//! A [`FlowMap`] is built fresh for every reconciliation run. Pipeline stages
//! write into it, possibly from several worker threads at once, and the
//! commit engine consumes it whole afterwards.

use crate::flow::{FlowEntry, FlowId, FlowKey, TableId, TablePath};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use indexmap::IndexMap;
use ofoverlay_types::NodeId;
use std::collections::HashSet;
use tracing::{trace, warn};

/// Flows staged for one (switch, table), deduplicated by [`FlowKey`].
///
/// Insertion order is preserved so a table's content is reproducible for
/// identical inputs. When two entries share a key, the first one wins and
/// keeps its id. Ids are unique within the table: a different flow arriving
/// under an id already taken is staged as `<id>#<n>`.
#[derive(Debug, Clone, Default)]
pub struct TableFlows {
    flows: IndexMap<FlowKey, FlowEntry>,
    ids: HashSet<FlowId>,
}

impl TableFlows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a flow unless a semantically equal one is present.
    ///
    /// Returns true if the flow was added.
    pub fn insert(&mut self, mut flow: FlowEntry) -> bool {
        let key = flow.key();
        if self.flows.contains_key(&key) {
            trace!(flow = %flow.id, "Flow already staged, skipping duplicate");
            return false;
        }
        if self.ids.contains(&flow.id) {
            let unique = self.free_id(&flow.id);
            warn!(flow = %flow.id, renamed = %unique, table = flow.table, "Flow id already staged for a different flow");
            flow.id = unique;
        }
        self.ids.insert(flow.id.clone());
        self.flows.insert(key, flow);
        true
    }

    fn free_id(&self, taken: &FlowId) -> FlowId {
        (2u32..)
            .map(|n| FlowId::new(format!("{}#{}", taken, n)))
            .find(|id| !self.ids.contains(id))
            .unwrap_or_else(|| taken.clone())
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.flows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowEntry> {
        self.flows.values()
    }

    /// Consumes the table, yielding (key, flow) pairs in insertion order.
    pub fn into_entries(self) -> impl Iterator<Item = (FlowKey, FlowEntry)> {
        self.flows.into_iter()
    }
}

impl FromIterator<FlowEntry> for TableFlows {
    fn from_iter<I: IntoIterator<Item = FlowEntry>>(iter: I) -> Self {
        let mut table = TableFlows::new();
        for flow in iter {
            table.insert(flow);
        }
        table
    }
}

/// Per (switch, table) accumulator shared by all stages of one run.
///
/// Buckets for different tables are independent. Writes into the same
/// bucket serialize on the bucket's shard lock, so the equality check and
/// the insert happen as one step.
#[derive(Debug, Default)]
pub struct FlowMap {
    tables: DashMap<TablePath, TableFlows>,
}

impl FlowMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the accumulator for a table, creating an empty one if absent.
    ///
    /// The returned guard locks the bucket's shard; do not call back into
    /// this map while holding it.
    pub fn get_or_create_table(&self, node: &NodeId, table: TableId) -> RefMut<'_, TablePath, TableFlows> {
        self.tables
            .entry(TablePath::new(node.clone(), table))
            .or_default()
    }

    /// Stages a flow for `node` in the flow's own table.
    ///
    /// Returns false if an equal flow was already staged.
    pub fn write_flow(&self, node: &NodeId, flow: FlowEntry) -> bool {
        self.get_or_create_table(node, flow.table).insert(flow)
    }

    /// Returns a copy of the flows staged for one table.
    pub fn flows(&self, node: &NodeId, table: TableId) -> Vec<FlowEntry> {
        self.tables
            .get(&TablePath::new(node.clone(), table))
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn flow_count(&self) -> usize {
        self.tables.iter().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Consumes the map, returning tables ordered by path.
    pub fn into_tables(self) -> Vec<(TablePath, TableFlows)> {
        let mut tables: Vec<_> = self.tables.into_iter().collect();
        tables.sort_by(|a, b| a.0.cmp(&b.0));
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Action, FlowMatch};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn node() -> NodeId {
        NodeId::new("openflow:1")
    }

    fn goto(id: &str, port: u32) -> FlowEntry {
        FlowEntry::new(
            id,
            2,
            100,
            FlowMatch::any().in_port(port),
            vec![Action::GotoTable { table: 3 }],
        )
    }

    #[test]
    fn test_duplicate_with_different_id_is_dropped() {
        let map = FlowMap::new();
        assert!(map.write_flow(&node(), goto("first", 4)));
        assert!(!map.write_flow(&node(), goto("second", 4)));

        let flows = map.flows(&node(), 2);
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].id.as_str(), "first");
    }

    #[test]
    fn test_different_flows_under_one_id_are_renamed() {
        let map = FlowMap::new();
        assert!(map.write_flow(&node(), goto("ep", 4)));
        assert!(map.write_flow(&node(), goto("ep", 5)));
        assert!(map.write_flow(&node(), goto("ep", 6)));
        assert!(!map.write_flow(&node(), goto("ep", 5)));

        let ids: Vec<_> = map
            .flows(&node(), 2)
            .into_iter()
            .map(|f| f.id.to_string())
            .collect();
        assert_eq!(ids, vec!["ep", "ep#2", "ep#3"]);
    }

    #[test]
    fn test_distinct_flows_keep_order() {
        let map = FlowMap::new();
        map.write_flow(&node(), goto("b", 5));
        map.write_flow(&node(), goto("a", 4));
        let ids: Vec<_> = map
            .flows(&node(), 2)
            .into_iter()
            .map(|f| f.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_get_or_create_table() {
        let map = FlowMap::new();
        assert!(map.get_or_create_table(&node(), 0).is_empty());
        assert_eq!(map.table_count(), 1);
        assert!(map.flows(&NodeId::new("openflow:9"), 0).is_empty());
        assert_eq!(map.table_count(), 1);
    }

    #[test]
    fn test_into_tables_sorted() {
        let map = FlowMap::new();
        map.write_flow(&NodeId::new("openflow:2"), goto("x", 1));
        map.write_flow(&node(), FlowEntry::drop_all("d", 0, 1));
        map.write_flow(&node(), goto("y", 1));
        let paths: Vec<_> = map.into_tables().into_iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(paths, vec!["openflow:1|0", "openflow:1|2", "openflow:2|2"]);
    }

    #[test]
    fn test_concurrent_writes_to_same_bucket() {
        let map = Arc::new(FlowMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                std::thread::spawn(move || {
                    for port in 0..50 {
                        map.write_flow(&node(), goto(&format!("t{}-{}", t, port), port));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(map.flow_count(), 50);
    }
}
