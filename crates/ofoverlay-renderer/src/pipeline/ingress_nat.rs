//! Table 1: rewrites NAT destination addresses of inbound external traffic.

use super::{flow_id, PipelineStage, PipelineTables, StageKind};
use crate::context::OfContext;
use crate::error::StageError;
use crate::policy::PolicyInfo;
use ofoverlay_common::{Action, FlowEntry, FlowMatch, Reg, TableId};
use ofoverlay_types::NodeId;

const DEFAULT_PRIORITY: u16 = 1;
const NAT_PRIORITY: u16 = 100;

/// Traffic entering on an external port towards an endpoint's NAT address
/// is rewritten to the endpoint's own address of the same family. It skips
/// source mapping and goes straight to destination mapping with the L3
/// context loaded. All other traffic passes through.
pub struct IngressNat {
    table: TableId,
    next: TableId,
    destination_mapper: TableId,
}

impl IngressNat {
    pub fn new(tables: PipelineTables) -> Self {
        Self {
            table: tables.table(StageKind::IngressNat),
            next: tables.table(StageKind::SourceMapper),
            destination_mapper: tables.table(StageKind::DestinationMapper),
        }
    }
}

impl PipelineStage for IngressNat {
    fn kind(&self) -> StageKind {
        StageKind::IngressNat
    }

    fn table_id(&self) -> TableId {
        self.table
    }

    fn compute(
        &self,
        ctx: &OfContext,
        node: &NodeId,
        policy: &PolicyInfo,
    ) -> Result<Vec<FlowEntry>, StageError> {
        let kind = self.kind();
        let mut flows = vec![FlowEntry::new(
            flow_id(kind, ["default"]),
            self.table,
            DEFAULT_PRIORITY,
            FlowMatch::any(),
            vec![Action::GotoTable { table: self.next }],
        )];

        let external_ports = ctx.switches().external_ports(node);
        if external_ports.is_empty() {
            return Ok(flows);
        }

        for ep in ctx.endpoints().endpoints() {
            let Some(nat) = ep.nat_address else { continue };
            let Some(ip) = ep.ips.iter().find(|ip| ip.is_ipv4() == nat.is_ipv4()) else {
                continue;
            };
            let Some(ords) = ctx.resolved_ordinals(policy, &ep)? else { continue };
            for external in &external_ports {
                let port = external.port_number();
                flows.push(FlowEntry::new(
                    flow_id(kind, [port.to_string(), nat.to_string()]),
                    self.table,
                    NAT_PRIORITY,
                    FlowMatch::any().in_port(port).ip_dst(nat),
                    vec![
                        Action::SetIpDst { ip: *ip },
                        Action::LoadReg {
                            reg: Reg::Reg6,
                            value: ords.l3_context,
                        },
                        Action::GotoTable {
                            table: self.destination_mapper,
                        },
                    ],
                ));
            }
        }
        Ok(flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{endpoint, node, policy, Fixture};
    use ofoverlay_types::NodeConnectorId;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_only_default_without_external_port() {
        let fx = Fixture::new();
        fx.switches.add_switch(node(1), None);
        fx.endpoints
            .add_endpoint(endpoint(1, "web", 1, 4).with_nat_address("203.0.113.1".parse().unwrap()));
        let flows = IngressNat::new(fx.tables)
            .compute(&fx.ctx, &node(1), &policy())
            .unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].actions, vec![Action::GotoTable { table: 2 }]);
    }

    #[test]
    fn test_nat_flow_per_external_port() {
        let fx = Fixture::new();
        fx.switches.add_switch(node(1), None);
        fx.switches.add_external_port(NodeConnectorId::new(node(1), 9));
        // Endpoints elsewhere are reachable through this switch's uplink too.
        fx.endpoints
            .add_endpoint(endpoint(2, "web", 2, 4).with_nat_address("203.0.113.2".parse().unwrap()));
        fx.endpoints.add_endpoint(endpoint(3, "web", 1, 5));
        let flows = IngressNat::new(fx.tables)
            .compute(&fx.ctx, &node(1), &policy())
            .unwrap();
        assert_eq!(flows.len(), 2);
        let nat = &flows[1];
        assert_eq!(nat.flow_match.in_port, Some(9));
        assert_eq!(nat.flow_match.ip_dst, Some("203.0.113.2".parse().unwrap()));
        assert_eq!(
            nat.actions[0],
            Action::SetIpDst {
                ip: "10.0.0.2".parse().unwrap()
            }
        );
        assert_eq!(nat.actions[2], Action::GotoTable { table: 3 });
    }
}
