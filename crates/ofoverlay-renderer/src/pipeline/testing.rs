//! Shared fixtures for stage tests.

use crate::context::OfContext;
use crate::endpoint::{Endpoint, EndpointRegistry};
use crate::pipeline::PipelineTables;
use crate::policy::{
    EndpointGroup, L2BridgeDomain, L2FloodDomain, L3Context, NetworkDomainId, PolicyInfo, Subnet,
    Tenant,
};
use crate::switch::{SwitchRegistry, TunnelConfig};
use ofoverlay_common::OrdinalAllocator;
use ofoverlay_types::{
    EgKey, EndpointGroupId, EpKey, L2BridgeDomainId, L2FloodDomainId, L3ContextId,
    NodeConnectorId, NodeId, SubnetId, TenantId,
};
use std::sync::Arc;

pub(crate) const TUNNEL_PORT: u32 = 100;

pub(crate) struct Fixture {
    pub switches: Arc<SwitchRegistry>,
    pub endpoints: Arc<EndpointRegistry>,
    pub ctx: OfContext,
    pub tables: PipelineTables,
}

impl Fixture {
    pub fn new() -> Self {
        let switches = Arc::new(SwitchRegistry::new());
        let endpoints = Arc::new(EndpointRegistry::new());
        let ctx = OfContext::new(
            switches.clone(),
            endpoints.clone(),
            Arc::new(OrdinalAllocator::new()),
        );
        let tables = PipelineTables::new(0).unwrap();
        Self {
            switches,
            endpoints,
            ctx,
            tables,
        }
    }

    /// Adds a ready switch with a tunnel on port 100 at 192.0.2.<n>.
    pub fn add_tunnel_switch(&self, n: u32) {
        self.switches.add_switch(
            node(n),
            Some(TunnelConfig {
                ip: format!("192.0.2.{}", n).parse().unwrap(),
                port: NodeConnectorId::new(node(n), TUNNEL_PORT),
            }),
        );
    }
}

pub(crate) fn node(n: u32) -> NodeId {
    NodeId::new(format!("openflow:{}", n))
}

pub(crate) fn tenant_id() -> TenantId {
    TenantId::new("tenant1")
}

pub(crate) fn eg(name: &str) -> EgKey {
    EgKey::new(tenant_id(), EndpointGroupId::new(name))
}

/// One tenant, groups `web` and `db`, both in subnet `sn` -> `fd` -> `bd` -> `l3c`.
pub(crate) fn tenant() -> Tenant {
    let subnet = NetworkDomainId::Subnet(SubnetId::new("sn"));
    Tenant::new(tenant_id())
        .with_l3_context(L3Context {
            id: L3ContextId::new("l3c"),
        })
        .with_bridge_domain(L2BridgeDomain {
            id: L2BridgeDomainId::new("bd"),
            parent: Some(L3ContextId::new("l3c")),
        })
        .with_flood_domain(L2FloodDomain {
            id: L2FloodDomainId::new("fd"),
            parent: Some(L2BridgeDomainId::new("bd")),
        })
        .with_subnet(Subnet {
            id: SubnetId::new("sn"),
            parent: Some(NetworkDomainId::FloodDomain(L2FloodDomainId::new("fd"))),
        })
        .with_group(EndpointGroup::new(
            EndpointGroupId::new("web"),
            Some(subnet.clone()),
        ))
        .with_group(EndpointGroup::new(EndpointGroupId::new("db"), Some(subnet)))
}

pub(crate) fn policy() -> PolicyInfo {
    PolicyInfo::new().with_tenant(tenant())
}

/// Endpoint `00:00:00:00:00:<last>` with IP 10.0.0.<last> on `openflow:<n>` port `port`.
pub(crate) fn endpoint(last: u8, group: &str, n: u32, port: u32) -> Endpoint {
    Endpoint::new(
        EpKey::new(
            L2BridgeDomainId::new("bd"),
            format!("00:00:00:00:00:{:02x}", last).parse().unwrap(),
        ),
        tenant_id(),
        EndpointGroupId::new(group),
    )
    .with_ip(format!("10.0.0.{}", last).parse().unwrap())
    .at(NodeConnectorId::new(node(n), port))
}
