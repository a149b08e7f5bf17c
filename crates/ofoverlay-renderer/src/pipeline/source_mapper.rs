//! Table 2: classifies the packet source into registers.

use super::{flow_id, PipelineStage, PipelineTables, StageKind};
use crate::context::{EndpointOrdinals, OfContext};
use crate::error::StageError;
use crate::policy::PolicyInfo;
use ofoverlay_common::{Action, FlowEntry, FlowMatch, Reg, TableId};
use ofoverlay_types::NodeId;
use std::collections::BTreeSet;

const DROP_PRIORITY: u16 = 1;
const SOURCE_PRIORITY: u16 = 150;

/// Maps a local endpoint (port, source MAC) to its group, condition group,
/// bridge domain, flood domain and L3 context ordinals in reg0, reg1, reg4,
/// reg5 and reg6, in that order, and tags the packet's tunnel id with the
/// group for the remote side.
///
/// Traffic from the tunnel is classified by tunnel id instead, for every
/// group with members on a remote switch that share a bridge domain with a
/// local endpoint. Unknown sources are dropped.
pub struct SourceMapper {
    table: TableId,
    next: TableId,
}

impl SourceMapper {
    pub fn new(tables: PipelineTables) -> Self {
        Self {
            table: tables.table(StageKind::SourceMapper),
            next: tables.table(StageKind::DestinationMapper),
        }
    }

    fn context_loads(ords: &EndpointOrdinals) -> [Action; 3] {
        [
            Action::LoadReg {
                reg: Reg::Reg4,
                value: ords.bridge_domain,
            },
            Action::LoadReg {
                reg: Reg::Reg5,
                value: ords.flood_domain,
            },
            Action::LoadReg {
                reg: Reg::Reg6,
                value: ords.l3_context,
            },
        ]
    }
}

impl PipelineStage for SourceMapper {
    fn kind(&self) -> StageKind {
        StageKind::SourceMapper
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

        let mut local_bds = BTreeSet::new();
        for ep in ctx.endpoints().endpoints_for_node(node) {
            let Some(port) = ep.port() else { continue };
            let Some(ords) = ctx.resolved_ordinals(policy, &ep)? else { continue };
            local_bds.insert(ords.bridge_domain);

            let mut actions = vec![
                Action::LoadReg {
                    reg: Reg::Reg0,
                    value: ords.group,
                },
                Action::LoadReg {
                    reg: Reg::Reg1,
                    value: ords.cond_group,
                },
            ];
            actions.extend(Self::context_loads(&ords));
            actions.push(Action::SetTunnelId {
                id: u64::from(ords.group),
            });
            actions.push(Action::GotoTable { table: self.next });
            flows.push(FlowEntry::new(
                flow_id(
                    kind,
                    [
                        "ep".to_string(),
                        port.to_string(),
                        ords.bridge_domain.to_string(),
                        ep.key.mac.to_string(),
                    ],
                ),
                self.table,
                SOURCE_PRIORITY,
                FlowMatch::any().in_port(port).eth_src(ep.key.mac),
                actions,
            ));
        }

        let Some(tunnel) = ctx.switches().tunnel(node) else {
            return Ok(flows);
        };
        let tunnel_port = tunnel.port.port_number();
        for remote in ctx.switches().ready_switches() {
            if &remote == node || ctx.switches().tunnel(&remote).is_none() {
                continue;
            }
            for ep in ctx.endpoints().endpoints_for_node(&remote) {
                let Some(ords) = ctx.resolved_ordinals(policy, &ep)? else { continue };
                if !local_bds.contains(&ords.bridge_domain) {
                    continue;
                }
                let mut actions = vec![Action::LoadReg {
                    reg: Reg::Reg0,
                    value: ords.group,
                }];
                actions.extend(Self::context_loads(&ords));
                actions.push(Action::GotoTable { table: self.next });
                // One flow per (group, contexts); the staging buffer folds
                // the copies coming from other remote members.
                flows.push(FlowEntry::new(
                    flow_id(
                        kind,
                        [
                            "tunnel".to_string(),
                            ords.group.to_string(),
                            ords.bridge_domain.to_string(),
                            ords.flood_domain.to_string(),
                            ords.l3_context.to_string(),
                        ],
                    ),
                    self.table,
                    SOURCE_PRIORITY,
                    FlowMatch::any()
                        .in_port(tunnel_port)
                        .tunnel_id(u64::from(ords.group)),
                    actions,
                ));
            }
        }
        Ok(flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{eg, endpoint, node, policy, tenant_id, Fixture, TUNNEL_PORT};
    use ofoverlay_common::FlowMap;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_no_policy_only_drop() {
        let fx = Fixture::new();
        fx.switches.add_switch(node(1), None);
        fx.endpoints.add_endpoint(endpoint(1, "web", 1, 4));
        let flows = SourceMapper::new(fx.tables)
            .compute(&fx.ctx, &node(1), &PolicyInfo::new())
            .unwrap();
        assert_eq!(flows.len(), 1);
        assert!(flows[0].is_drop());
    }

    #[test]
    fn test_local_endpoint_register_order() {
        let fx = Fixture::new();
        fx.switches.add_switch(node(1), None);
        let ep = endpoint(1, "web", 1, 4);
        fx.endpoints.add_endpoint(ep.clone());
        let flows = SourceMapper::new(fx.tables)
            .compute(&fx.ctx, &node(1), &policy())
            .unwrap();
        assert_eq!(flows.len(), 2);

        let ords = fx.ctx.ordinals();
        let expected = [
            (Reg::Reg0, ords.group_ordinal(&eg("web")).unwrap()),
            (Reg::Reg1, ords.cond_group_ordinal(&Default::default()).unwrap()),
            (Reg::Reg4, ords.context_ordinal(&tenant_id(), "bd").unwrap()),
            (Reg::Reg5, ords.context_ordinal(&tenant_id(), "fd").unwrap()),
            (Reg::Reg6, ords.context_ordinal(&tenant_id(), "l3c").unwrap()),
        ];
        let flow = &flows[1];
        assert_eq!(flow.flow_match.eth_src, Some(ep.key.mac));
        assert_eq!(flow.flow_match.in_port, Some(4));
        for (action, (reg, value)) in flow.actions.iter().zip(expected) {
            assert_eq!(*action, Action::LoadReg { reg, value });
        }
        assert_eq!(flow.actions.last(), Some(&Action::GotoTable { table: 3 }));
    }

    #[test]
    fn test_tunnel_flows_fold_per_group() {
        let fx = Fixture::new();
        fx.add_tunnel_switch(1);
        fx.add_tunnel_switch(2);
        fx.endpoints.add_endpoint(endpoint(1, "web", 1, 4));
        fx.endpoints.add_endpoint(endpoint(2, "db", 2, 4));
        fx.endpoints.add_endpoint(endpoint(3, "db", 2, 5));
        let flows = SourceMapper::new(fx.tables)
            .compute(&fx.ctx, &node(1), &policy())
            .unwrap();

        let map = FlowMap::new();
        for flow in flows {
            map.write_flow(&node(1), flow);
        }
        let staged = map.flows(&node(1), 2);
        // drop, local web endpoint, one tunnel flow for db
        assert_eq!(staged.len(), 3);
        let tunnel = &staged[2];
        assert_eq!(tunnel.flow_match.in_port, Some(TUNNEL_PORT));
        let db = u64::from(fx.ctx.ordinals().group_ordinal(&eg("db")).unwrap());
        assert_eq!(tunnel.flow_match.tunnel_id, Some(db));
    }

    #[test]
    fn test_deterministic() {
        let fx = Fixture::new();
        fx.add_tunnel_switch(1);
        fx.add_tunnel_switch(2);
        fx.endpoints.add_endpoint(endpoint(1, "web", 1, 4));
        fx.endpoints.add_endpoint(endpoint(2, "db", 2, 4));
        let stage = SourceMapper::new(fx.tables);
        let first = stage.compute(&fx.ctx, &node(1), &policy()).unwrap();
        let second = stage.compute(&fx.ctx, &node(1), &policy()).unwrap();
        assert_eq!(first, second);
    }
}
