//! Flow entry model.
//!
//! A [`FlowEntry`] carries an id used to address it in the store, but two
//! entries are the same flow when their [`FlowKey`] (table, priority, match
//! and action list) agree. Dedup in the staging buffer and the diff against
//! the store both key on `FlowKey` directly.

use ofoverlay_types::{MacAddress, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// Physical flow table number as seen by the switch.
pub type TableId = u8;

/// Nicira extension registers used to carry context between tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reg {
    Reg0,
    Reg1,
    Reg2,
    Reg3,
    Reg4,
    Reg5,
    Reg6,
    Reg7,
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let idx = *self as u8;
        write!(f, "reg{}", idx)
    }
}

/// Match predicate of a flow entry. Unset fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_port: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_src: Option<MacAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_dst: Option<MacAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eth_type: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_src: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_dst: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_proto: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l4_dst_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub regs: BTreeMap<Reg, u32>,
}

impl FlowMatch {
    pub const ETH_TYPE_ARP: u16 = 0x0806;
    pub const ETH_TYPE_IPV4: u16 = 0x0800;
    pub const ETH_TYPE_IPV6: u16 = 0x86dd;

    pub fn any() -> Self {
        Self::default()
    }

    pub fn in_port(mut self, port: u32) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn eth_src(mut self, mac: MacAddress) -> Self {
        self.eth_src = Some(mac);
        self
    }

    pub fn eth_dst(mut self, mac: MacAddress) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    pub fn eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }

    /// Matches the source IP, also pinning the matching ethertype.
    pub fn ip_src(mut self, ip: IpAddr) -> Self {
        self.eth_type = Some(ethertype_for(&ip));
        self.ip_src = Some(ip);
        self
    }

    /// Matches the destination IP, also pinning the matching ethertype.
    pub fn ip_dst(mut self, ip: IpAddr) -> Self {
        self.eth_type = Some(ethertype_for(&ip));
        self.ip_dst = Some(ip);
        self
    }

    pub fn ip_proto(mut self, proto: u8) -> Self {
        self.ip_proto = Some(proto);
        self
    }

    pub fn l4_dst_port(mut self, port: u16) -> Self {
        self.l4_dst_port = Some(port);
        self
    }

    pub fn tunnel_id(mut self, id: u64) -> Self {
        self.tunnel_id = Some(id);
        self
    }

    pub fn reg(mut self, reg: Reg, value: u32) -> Self {
        self.regs.insert(reg, value);
        self
    }

    /// True when no field is constrained (table-miss style entry).
    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }
}

fn ethertype_for(ip: &IpAddr) -> u16 {
    match ip {
        IpAddr::V4(_) => FlowMatch::ETH_TYPE_IPV4,
        IpAddr::V6(_) => FlowMatch::ETH_TYPE_IPV6,
    }
}

/// A single action. Order within a flow's action list is significant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    LoadReg { reg: Reg, value: u32 },
    SetTunnelId { id: u64 },
    SetTunnelDst { ip: IpAddr },
    SetIpSrc { ip: IpAddr },
    SetIpDst { ip: IpAddr },
    Output { port: u32 },
    OutputReg { reg: Reg },
    Group { id: u32 },
    GotoTable { table: TableId },
    Drop,
}

/// Store-facing identifier of a flow within its table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Semantic identity of a flow: everything except its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub table: TableId,
    pub priority: u16,
    pub flow_match: FlowMatch,
    pub actions: Vec<Action>,
}

/// A flow entry destined for one table of one switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub id: FlowId,
    pub table: TableId,
    pub priority: u16,
    #[serde(rename = "match")]
    pub flow_match: FlowMatch,
    pub actions: Vec<Action>,
}

impl FlowEntry {
    pub fn new(
        id: impl Into<String>,
        table: TableId,
        priority: u16,
        flow_match: FlowMatch,
        actions: Vec<Action>,
    ) -> Self {
        Self {
            id: FlowId::new(id),
            table,
            priority,
            flow_match,
            actions,
        }
    }

    /// Wildcard entry whose only action is to drop.
    pub fn drop_all(id: impl Into<String>, table: TableId, priority: u16) -> Self {
        Self::new(id, table, priority, FlowMatch::any(), vec![Action::Drop])
    }

    /// Returns the key used for dedup and diff.
    pub fn key(&self) -> FlowKey {
        FlowKey {
            table: self.table,
            priority: self.priority,
            flow_match: self.flow_match.clone(),
            actions: self.actions.clone(),
        }
    }

    /// True if this flow's only effect is to drop the packet.
    pub fn is_drop(&self) -> bool {
        self.actions == [Action::Drop]
    }
}

/// Address of one flow table on one switch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TablePath {
    pub node: NodeId,
    pub table: TableId,
}

impl TablePath {
    pub fn new(node: NodeId, table: TableId) -> Self {
        Self { node, table }
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.node, self.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mac() -> MacAddress {
        "00:00:00:00:00:01".parse().unwrap()
    }

    #[test]
    fn test_key_ignores_id() {
        let m = FlowMatch::any().eth_src(mac());
        let a = FlowEntry::new("a", 2, 140, m.clone(), vec![Action::GotoTable { table: 3 }]);
        let b = FlowEntry::new("b", 2, 140, m, vec![Action::GotoTable { table: 3 }]);
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_respects_action_order() {
        let a = FlowEntry::new(
            "a",
            2,
            140,
            FlowMatch::any(),
            vec![
                Action::LoadReg { reg: Reg::Reg0, value: 1 },
                Action::LoadReg { reg: Reg::Reg1, value: 2 },
            ],
        );
        let mut b = a.clone();
        b.actions.reverse();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_ip_match_sets_ethertype() {
        let m = FlowMatch::any().ip_src("10.0.0.2".parse().unwrap());
        assert_eq!(m.eth_type, Some(FlowMatch::ETH_TYPE_IPV4));
        let m6 = FlowMatch::any().ip_dst("2001:db8::2".parse().unwrap());
        assert_eq!(m6.eth_type, Some(FlowMatch::ETH_TYPE_IPV6));
    }

    #[test]
    fn test_drop_all() {
        let f = FlowEntry::drop_all("drop", 0, 1);
        assert!(f.is_drop());
        assert!(f.flow_match.is_wildcard());
    }

    #[test]
    fn test_json_shape() {
        let f = FlowEntry::new(
            "f1",
            4,
            10,
            FlowMatch::any().reg(Reg::Reg4, 7),
            vec![Action::Output { port: 3 }],
        );
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["match"]["regs"]["Reg4"], 7);
        assert_eq!(json["actions"][0]["type"], "output");
        let back: FlowEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_table_path_display() {
        let path = TablePath::new(NodeId::new("openflow:1"), 3);
        assert_eq!(path.to_string(), "openflow:1|3");
    }
}
