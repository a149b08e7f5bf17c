//! Table 3: classifies the destination and chooses the output port.

use super::{flow_id, PipelineStage, PipelineTables, StageKind};
use crate::context::{EndpointOrdinals, OfContext};
use crate::endpoint::Endpoint;
use crate::error::StageError;
use crate::policy::PolicyInfo;
use ofoverlay_common::{Action, FlowEntry, FlowMatch, Reg, TableId};
use ofoverlay_types::{MacAddress, NodeId};
use std::collections::BTreeSet;

const DROP_PRIORITY: u16 = 1;
const L3_PRIORITY: u16 = 40;
const L2_PRIORITY: u16 = 50;
const BROADCAST_PRIORITY: u16 = 140;

/// For every endpoint reachable in a bridge domain (L2, by destination MAC)
/// or L3 context (by destination IP) present on this switch, loads the
/// destination group and condition group into reg2 and reg3 and the output
/// port into reg7. Remote endpoints are reached through the local tunnel
/// port with the remote switch as tunnel destination.
///
/// Broadcast within a flood domain goes to the group whose id is the flood
/// domain ordinal.
pub struct DestinationMapper {
    table: TableId,
    next: TableId,
}

/// Contexts that have at least one member on the switch being computed.
#[derive(Default)]
struct LocalContexts {
    bridge_domains: BTreeSet<u32>,
    flood_domains: BTreeSet<u32>,
    l3_contexts: BTreeSet<u32>,
}

impl DestinationMapper {
    pub fn new(tables: PipelineTables) -> Self {
        Self {
            table: tables.table(StageKind::DestinationMapper),
            next: tables.table(StageKind::PolicyEnforcer),
        }
    }

    fn local_contexts(
        ctx: &OfContext,
        node: &NodeId,
        policy: &PolicyInfo,
    ) -> Result<LocalContexts, StageError> {
        let mut local = LocalContexts::default();
        for ep in ctx.endpoints().endpoints_for_node(node) {
            if let Some(ords) = ctx.resolved_ordinals(policy, &ep)? {
                local.bridge_domains.insert(ords.bridge_domain);
                local.flood_domains.insert(ords.flood_domain);
                local.l3_contexts.insert(ords.l3_context);
            }
        }
        // Translated inbound traffic enters through external ports.
        if !ctx.switches().external_ports(node).is_empty() {
            for ep in ctx.endpoints().endpoints() {
                if ep.nat_address.is_none() {
                    continue;
                }
                if let Some(ords) = ctx.resolved_ordinals(policy, &ep)? {
                    local.l3_contexts.insert(ords.l3_context);
                }
            }
        }
        local.flood_domains.remove(&0);
        Ok(local)
    }

    /// Actions delivering to `ep`, or `None` if it cannot be reached from `node`.
    fn output_actions(
        &self,
        ctx: &OfContext,
        node: &NodeId,
        ep: &Endpoint,
        ords: &EndpointOrdinals,
    ) -> Option<Vec<Action>> {
        let ep_node = ep.node()?;
        let port = ep.port()?;
        let mut actions = vec![
            Action::LoadReg {
                reg: Reg::Reg2,
                value: ords.group,
            },
            Action::LoadReg {
                reg: Reg::Reg3,
                value: ords.cond_group,
            },
        ];
        if ep_node == node {
            actions.push(Action::LoadReg {
                reg: Reg::Reg7,
                value: port,
            });
        } else {
            let local_tunnel = ctx.switches().tunnel(node)?;
            let remote_tunnel = ctx.switches().tunnel(ep_node)?;
            actions.push(Action::SetTunnelDst {
                ip: remote_tunnel.ip,
            });
            actions.push(Action::LoadReg {
                reg: Reg::Reg7,
                value: local_tunnel.port.port_number(),
            });
        }
        actions.push(Action::GotoTable { table: self.next });
        Some(actions)
    }
}

impl PipelineStage for DestinationMapper {
    fn kind(&self) -> StageKind {
        StageKind::DestinationMapper
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
        let mut flows = vec![FlowEntry::drop_all(
            flow_id(kind, ["drop"]),
            self.table,
            DROP_PRIORITY,
        )];

        let local = Self::local_contexts(ctx, node, policy)?;
        for fd in &local.flood_domains {
            flows.push(FlowEntry::new(
                flow_id(kind, ["broadcast".to_string(), fd.to_string()]),
                self.table,
                BROADCAST_PRIORITY,
                FlowMatch::any()
                    .reg(Reg::Reg5, *fd)
                    .eth_dst(MacAddress::BROADCAST),
                vec![Action::Group { id: *fd }],
            ));
        }

        for ep in ctx.endpoints().endpoints() {
            let Some(ords) = ctx.resolved_ordinals(policy, &ep)? else { continue };
            let Some(actions) = self.output_actions(ctx, node, &ep, &ords) else {
                continue;
            };
            if local.bridge_domains.contains(&ords.bridge_domain) {
                let mac = ep.key.mac;
                flows.push(FlowEntry::new(
                    flow_id(
                        kind,
                        ["l2".to_string(), ords.bridge_domain.to_string(), mac.to_string()],
                    ),
                    self.table,
                    L2_PRIORITY,
                    FlowMatch::any().reg(Reg::Reg4, ords.bridge_domain).eth_dst(mac),
                    actions.clone(),
                ));
            }
            if local.l3_contexts.contains(&ords.l3_context) {
                for ip in &ep.ips {
                    flows.push(FlowEntry::new(
                        flow_id(
                            kind,
                            ["l3".to_string(), ords.l3_context.to_string(), ip.to_string()],
                        ),
                        self.table,
                        L3_PRIORITY,
                        FlowMatch::any().reg(Reg::Reg6, ords.l3_context).ip_dst(*ip),
                        actions.clone(),
                    ));
                }
            }
        }
        Ok(flows)
    }
}
