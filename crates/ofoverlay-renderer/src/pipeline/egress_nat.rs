//! Table 5: rewrites source addresses of traffic leaving through an external port.

use super::{flow_id, PipelineStage, PipelineTables, StageKind};
use crate::context::OfContext;
use crate::error::StageError;
use crate::policy::PolicyInfo;
use ofoverlay_common::{Action, FlowEntry, FlowMatch, Reg, TableId};
use ofoverlay_types::NodeId;

const DEFAULT_PRIORITY: u16 = 1;
const NAT_PRIORITY: u16 = 100;

pub struct EgressNat {
    table: TableId,
    next: TableId,
}

impl EgressNat {
    pub fn new(tables: PipelineTables) -> Self {
        Self {
            table: tables.table(StageKind::EgressNat),
            next: tables.table(StageKind::ExternalMapper),
        }
    }
}

impl PipelineStage for EgressNat {
    fn kind(&self) -> StageKind {
        StageKind::EgressNat
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
        for ep in ctx.endpoints().endpoints_for_node(node) {
            let Some(nat) = ep.nat_address else { continue };
            let Some(ords) = ctx.resolved_ordinals(policy, &ep)? else { continue };
            for ip in ep.ips.iter().filter(|ip| ip.is_ipv4() == nat.is_ipv4()) {
                for external in &external_ports {
                    let port = external.port_number();
                    flows.push(FlowEntry::new(
                        flow_id(kind, [port.to_string(), ip.to_string()]),
                        self.table,
                        NAT_PRIORITY,
                        FlowMatch::any()
                            .reg(Reg::Reg6, ords.l3_context)
                            .reg(Reg::Reg7, port)
                            .ip_src(*ip),
                        vec![
                            Action::SetIpSrc { ip: nat },
                            Action::GotoTable { table: self.next },
                        ],
                    ));
                }
            }
        }
        Ok(flows)
    }
}
