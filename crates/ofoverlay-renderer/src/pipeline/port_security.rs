//! Table 0: admits traffic only from known ports and addresses.

use super::{flow_id, PipelineStage, PipelineTables, StageKind};
use crate::context::OfContext;
use crate::error::StageError;
use crate::policy::PolicyInfo;
use ofoverlay_common::{Action, FlowEntry, FlowMatch, TableId};
use ofoverlay_types::NodeId;

const DROP_PRIORITY: u16 = 1;
const L2_PRIORITY: u16 = 100;
const IP_DROP_PRIORITY: u16 = 110;
const L3_PRIORITY: u16 = 120;
const EXTERNAL_PRIORITY: u16 = 200;
const TUNNEL_PRIORITY: u16 = 300;

/// Allows tunnel and external ports wholesale, and local endpoints by
/// (port, MAC) and (port, MAC, IP). Any other IP traffic is dropped, so an
/// endpoint cannot spoof another's address.
pub struct PortSecurity {
    table: TableId,
    next: TableId,
}

impl PortSecurity {
    pub fn new(tables: PipelineTables) -> Self {
        Self {
            table: tables.table(StageKind::PortSecurity),
            next: tables.table(StageKind::IngressNat),
        }
    }

    fn allow(&self, id: String, priority: u16, flow_match: FlowMatch) -> FlowEntry {
        FlowEntry::new(
            id,
            self.table,
            priority,
            flow_match,
            vec![Action::GotoTable { table: self.next }],
        )
    }
}

impl PipelineStage for PortSecurity {
    fn kind(&self) -> StageKind {
        StageKind::PortSecurity
    }

    fn table_id(&self) -> TableId {
        self.table
    }

    fn compute(
        &self,
        ctx: &OfContext,
        node: &NodeId,
        _policy: &PolicyInfo,
    ) -> Result<Vec<FlowEntry>, StageError> {
        let kind = self.kind();
        let mut flows = vec![FlowEntry::drop_all(
            flow_id(kind, ["drop"]),
            self.table,
            DROP_PRIORITY,
        )];

        for (name, eth_type) in [("ipv4", FlowMatch::ETH_TYPE_IPV4), ("ipv6", FlowMatch::ETH_TYPE_IPV6)] {
            flows.push(FlowEntry::new(
                flow_id(kind, ["ipdrop", name]),
                self.table,
                IP_DROP_PRIORITY,
                FlowMatch::any().eth_type(eth_type),
                vec![Action::Drop],
            ));
        }

        if let Some(tunnel) = ctx.switches().tunnel(node) {
            let port = tunnel.port.port_number();
            flows.push(self.allow(
                flow_id(kind, ["tunnel".to_string(), port.to_string()]),
                TUNNEL_PRIORITY,
                FlowMatch::any().in_port(port),
            ));
        }

        for external in ctx.switches().external_ports(node) {
            let port = external.port_number();
            flows.push(self.allow(
                flow_id(kind, ["external".to_string(), port.to_string()]),
                EXTERNAL_PRIORITY,
                FlowMatch::any().in_port(port),
            ));
        }

        for ep in ctx.endpoints().endpoints_for_node(node) {
            let Some(port) = ep.port() else { continue };
            let mac = ep.key.mac;
            flows.push(self.allow(
                flow_id(kind, ["l2".to_string(), port.to_string(), mac.to_string()]),
                L2_PRIORITY,
                FlowMatch::any().in_port(port).eth_src(mac),
            ));
            for ip in &ep.ips {
                flows.push(self.allow(
                    flow_id(
                        kind,
                        ["l3".to_string(), port.to_string(), mac.to_string(), ip.to_string()],
                    ),
                    L3_PRIORITY,
                    FlowMatch::any().in_port(port).eth_src(mac).ip_src(*ip),
                ));
            }
        }
        Ok(flows)
    }
}
