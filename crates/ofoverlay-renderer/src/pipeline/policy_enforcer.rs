//! Table 4: applies contracts between endpoint groups.

use super::{flow_id, PipelineStage, PipelineTables, StageKind};
use crate::context::OfContext;
use crate::error::StageError;
use crate::policy::{Classifier, IntraGroupPolicy, PolicyInfo, Rule, RuleAction};
use ofoverlay_common::{Action, FlowEntry, FlowMatch, Reg, TableId};
use ofoverlay_types::{EgKey, NodeId};
use std::collections::BTreeMap;

const DROP_PRIORITY: u16 = 1;
const RULE_PRIORITY_BASE: u16 = 1000;
/// Rule orders beyond this share the lowest rule priority.
const RULE_PRIORITY_SPAN: u16 = 899;
const INTRA_GROUP_PRIORITY: u16 = 1500;
const EXTERNAL_PRIORITY: u16 = 1900;
const TUNNEL_PRIORITY: u16 = 2000;

/// Policy is enforced on the source switch: traffic from the tunnel or an
/// external port has already been enforced and passes. For every group with
/// local members, intra-group traffic passes unless the group requires a
/// contract, and each rule from the group towards a provider becomes one
/// flow per classifier matching (reg0, reg1, reg2, reg3) plus the classifier
/// fields. Lower rule order means higher priority. Everything else drops.
pub struct PolicyEnforcer {
    table: TableId,
    next: TableId,
}

impl PolicyEnforcer {
    pub fn new(tables: PipelineTables) -> Self {
        Self {
            table: tables.table(StageKind::PolicyEnforcer),
            next: tables.table(StageKind::EgressNat),
        }
    }

    fn pass(&self) -> Vec<Action> {
        vec![Action::GotoTable { table: self.next }]
    }

    fn rule_priority(rule: &Rule) -> u16 {
        let order = rule.order.min(u32::from(RULE_PRIORITY_SPAN)) as u16;
        RULE_PRIORITY_BASE - order
    }

    fn rule_match(base: &FlowMatch, classifier: &Classifier) -> FlowMatch {
        let mut m = base.clone();
        if let Some(eth_type) = classifier.eth_type {
            m = m.eth_type(eth_type);
        }
        if let Some(proto) = classifier.ip_proto {
            m = m.ip_proto(proto);
        }
        if let Some(port) = classifier.dst_port {
            m = m.l4_dst_port(port);
        }
        m
    }

    fn rule_flows(
        &self,
        ctx: &OfContext,
        consumer: u32,
        provider: &EgKey,
        rules: &[Rule],
    ) -> Result<Vec<FlowEntry>, StageError> {
        let ordinals = ctx.ordinals();
        let provider = ordinals.group_ordinal(provider)?;
        let mut flows = Vec::new();
        for rule in rules {
            let mut base = FlowMatch::any()
                .reg(Reg::Reg0, consumer)
                .reg(Reg::Reg2, provider);
            let mut consumer_cond = 0;
            if let Some(conditions) = &rule.consumer_conditions {
                consumer_cond = ordinals.cond_group_ordinal(conditions)?;
                base = base.reg(Reg::Reg1, consumer_cond);
            }
            let mut provider_cond = 0;
            if let Some(conditions) = &rule.provider_conditions {
                provider_cond = ordinals.cond_group_ordinal(conditions)?;
                base = base.reg(Reg::Reg3, provider_cond);
            }
            let actions = match rule.action {
                RuleAction::Allow => self.pass(),
                RuleAction::Deny => vec![Action::Drop],
            };
            let match_all = [Classifier::default()];
            let classifiers = if rule.classifiers.is_empty() {
                &match_all[..]
            } else {
                rule.classifiers.as_slice()
            };
            for (idx, classifier) in classifiers.iter().enumerate() {
                flows.push(FlowEntry::new(
                    flow_id(
                        self.kind(),
                        [
                            "rule".to_string(),
                            consumer.to_string(),
                            provider.to_string(),
                            consumer_cond.to_string(),
                            provider_cond.to_string(),
                            rule.order.to_string(),
                            rule.name.clone(),
                            idx.to_string(),
                        ],
                    ),
                    self.table,
                    Self::rule_priority(rule),
                    Self::rule_match(&base, classifier),
                    actions.clone(),
                ));
            }
        }
        Ok(flows)
    }
}

impl PipelineStage for PolicyEnforcer {
    fn kind(&self) -> StageKind {
        StageKind::PolicyEnforcer
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

        if let Some(tunnel) = ctx.switches().tunnel(node) {
            let port = tunnel.port.port_number();
            flows.push(FlowEntry::new(
                flow_id(kind, ["tunnel".to_string(), port.to_string()]),
                self.table,
                TUNNEL_PRIORITY,
                FlowMatch::any().in_port(port),
                self.pass(),
            ));
        }
        for external in ctx.switches().external_ports(node) {
            let port = external.port_number();
            flows.push(FlowEntry::new(
                flow_id(kind, ["external".to_string(), port.to_string()]),
                self.table,
                EXTERNAL_PRIORITY,
                FlowMatch::any().in_port(port),
                self.pass(),
            ));
        }

        let mut local_groups = BTreeMap::new();
        for ep in ctx.endpoints().endpoints_for_node(node) {
            if let Some(ords) = ctx.resolved_ordinals(policy, &ep)? {
                local_groups.insert(ep.eg_key(), ords.group);
            }
        }

        for (eg, group) in &local_groups {
            if policy.intra_group_policy(eg) == IntraGroupPolicy::Allow {
                flows.push(FlowEntry::new(
                    flow_id(kind, ["intra".to_string(), group.to_string()]),
                    self.table,
                    INTRA_GROUP_PRIORITY,
                    FlowMatch::any().reg(Reg::Reg0, *group).reg(Reg::Reg2, *group),
                    self.pass(),
                ));
            }
            for (provider, rules) in policy.policies_from(eg) {
                flows.extend(self.rule_flows(ctx, *group, provider, rules)?);
            }
        }
        Ok(flows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{eg, endpoint, node, policy, tenant, Fixture};
    use ofoverlay_types::{ConditionName, EndpointGroupId};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rules_become_prioritized_flows() {
        let fx = Fixture::new();
        fx.switches.add_switch(node(1), None);
        fx.endpoints.add_endpoint(endpoint(1, "web", 1, 4));
        let info = policy().with_rules(
            eg("web"),
            eg("db"),
            vec![
                Rule::new("deny-all", 20, RuleAction::Deny),
                Rule::new("sql", 10, RuleAction::Allow)
                    .with_classifier(Classifier::l4(FlowMatch::ETH_TYPE_IPV4, 6, 5432))
                    .with_classifier(Classifier::l4(FlowMatch::ETH_TYPE_IPV4, 6, 3306)),
            ],
        );
        let flows = PolicyEnforcer::new(fx.tables)
            .compute(&fx.ctx, &node(1), &info)
            .unwrap();

        // drop, intra-group, two classifier flows, one match-all deny
        assert_eq!(flows.len(), 5);
        let rules: Vec<_> = flows[2..].iter().map(|f| (f.priority, f.is_drop())).collect();
        assert_eq!(rules, vec![(990, false), (990, false), (980, true)]);
        assert_eq!(flows[2].flow_match.l4_dst_port, Some(5432));
        assert_eq!(flows[2].actions, vec![Action::GotoTable { table: 5 }]);
        let web = fx.ctx.ordinals().group_ordinal(&eg("web")).unwrap();
        let db = fx.ctx.ordinals().group_ordinal(&eg("db")).unwrap();
        assert_eq!(flows[4].flow_match.regs.get(&Reg::Reg0), Some(&web));
        assert_eq!(flows[4].flow_match.regs.get(&Reg::Reg2), Some(&db));
    }

    #[test]
    fn test_intra_group_contract_required() {
        let fx = Fixture::new();
        fx.switches.add_switch(node(1), None);
        fx.endpoints.add_endpoint(endpoint(1, "web", 1, 4));
        let mut t = tenant();
        if let Some(g) = t.groups.get_mut(&EndpointGroupId::new("web")) {
            g.intra_group_policy = IntraGroupPolicy::RequireContract;
        }
        let info = PolicyInfo::new().with_tenant(t);
        let flows = PolicyEnforcer::new(fx.tables)
            .compute(&fx.ctx, &node(1), &info)
            .unwrap();
        assert_eq!(flows.len(), 1);
    }

    #[test]
    fn test_condition_registers() {
        let fx = Fixture::new();
        fx.add_tunnel_switch(1);
        fx.endpoints.add_endpoint(endpoint(1, "web", 1, 4));
        let cond = [ConditionName::new("authenticated")].into_iter().collect();
        let info = policy().with_rules(
            eg("web"),
            eg("db"),
            vec![Rule::new("auth", 1, RuleAction::Allow).when_consumer(cond)],
        );
        let flows = PolicyEnforcer::new(fx.tables)
            .compute(&fx.ctx, &node(1), &info)
            .unwrap();
        assert_eq!(flows[1].priority, TUNNEL_PRIORITY);
        let rule = flows.last().unwrap();
        assert!(rule.flow_match.regs.contains_key(&Reg::Reg1));
        assert!(!rule.flow_match.regs.contains_key(&Reg::Reg3));
    }

    #[test]
    fn test_same_named_rules_get_distinct_ids() {
        let fx = Fixture::new();
        fx.switches.add_switch(node(1), None);
        fx.endpoints.add_endpoint(endpoint(1, "web", 1, 4));
        let cond = [ConditionName::new("authenticated")].into_iter().collect();
        let info = policy().with_rules(
            eg("web"),
            eg("db"),
            vec![
                Rule::new("allow", 10, RuleAction::Allow),
                Rule::new("allow", 20, RuleAction::Deny),
                Rule::new("allow", 20, RuleAction::Allow).when_consumer(cond),
            ],
        );
        let flows = PolicyEnforcer::new(fx.tables)
            .compute(&fx.ctx, &node(1), &info)
            .unwrap();

        let ids: std::collections::BTreeSet<_> = flows.iter().map(|f| f.id.clone()).collect();
        assert_eq!(flows.len(), 5);
        assert_eq!(ids.len(), flows.len());
    }
}
