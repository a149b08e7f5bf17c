//! Endpoint records and the endpoint registry.

use crate::policy::NetworkDomainId;
use ofoverlay_types::{ConditionName, EgKey, EndpointGroupId, EpKey, NodeConnectorId, NodeId, TenantId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 1024;

/// An L2 endpoint and where it is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub key: EpKey,
    pub tenant: TenantId,
    pub group: EndpointGroupId,
    pub ips: Vec<IpAddr>,
    /// Switch port the endpoint is attached to, if known.
    pub location: Option<NodeConnectorId>,
    /// Overrides the group's network domain.
    pub network_containment: Option<NetworkDomainId>,
    pub conditions: BTreeSet<ConditionName>,
    pub nat_address: Option<IpAddr>,
}

impl Endpoint {
    pub fn new(key: EpKey, tenant: TenantId, group: EndpointGroupId) -> Self {
        Self {
            key,
            tenant,
            group,
            ips: Vec::new(),
            location: None,
            network_containment: None,
            conditions: BTreeSet::new(),
            nat_address: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ips.push(ip);
        self
    }

    pub fn at(mut self, location: NodeConnectorId) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_condition(mut self, condition: ConditionName) -> Self {
        self.conditions.insert(condition);
        self
    }

    pub fn with_nat_address(mut self, nat: IpAddr) -> Self {
        self.nat_address = Some(nat);
        self
    }

    pub fn eg_key(&self) -> EgKey {
        EgKey::new(self.tenant.clone(), self.group.clone())
    }

    pub fn node(&self) -> Option<&NodeId> {
        self.location.as_ref().map(NodeConnectorId::node)
    }

    pub fn port(&self) -> Option<u32> {
        self.location.as_ref().map(NodeConnectorId::port_number)
    }
}

/// Notification from the endpoint source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    EndpointUpdated(EpKey),
    NodeEndpointUpdated { node: NodeId, endpoint: EpKey },
    GroupMembershipUpdated { group: EgKey, endpoint: EpKey },
}

/// Read access to endpoint state, as seen by pipeline stages.
///
/// Lists are returned in key order so stage output is deterministic.
pub trait EndpointManager: Send + Sync {
    fn endpoint(&self, key: &EpKey) -> Option<Endpoint>;

    fn endpoints(&self) -> Vec<Endpoint>;

    /// Endpoints attached to a port of `node`.
    fn endpoints_for_node(&self, node: &NodeId) -> Vec<Endpoint>;

    fn endpoints_for_group(&self, eg: &EgKey) -> Vec<Endpoint>;

    fn conditions_for(&self, key: &EpKey) -> BTreeSet<ConditionName>;

    fn membership_of(&self, key: &EpKey) -> Option<EgKey>;
}

/// In-memory endpoint store with change notification.
pub struct EndpointRegistry {
    endpoints: RwLock<BTreeMap<EpKey, Endpoint>>,
    events: broadcast::Sender<EndpointEvent>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            endpoints: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    /// Adds or replaces an endpoint.
    pub fn add_endpoint(&self, endpoint: Endpoint) {
        let key = endpoint.key.clone();
        let group = endpoint.eg_key();
        let node = endpoint.node().cloned();
        let previous = self.endpoints.write().insert(key.clone(), endpoint);
        debug!(endpoint = %key, group = %group, "Endpoint updated");

        let old_node = previous.as_ref().and_then(|p| p.node().cloned());
        let old_group = previous.as_ref().map(Endpoint::eg_key);
        self.notify(EndpointEvent::EndpointUpdated(key.clone()));
        for n in [old_node.filter(|n| Some(n) != node.as_ref()), node]
            .into_iter()
            .flatten()
        {
            self.notify(EndpointEvent::NodeEndpointUpdated {
                node: n,
                endpoint: key.clone(),
            });
        }
        if old_group.as_ref() != Some(&group) {
            if let Some(old) = old_group {
                self.notify(EndpointEvent::GroupMembershipUpdated {
                    group: old,
                    endpoint: key.clone(),
                });
            }
            self.notify(EndpointEvent::GroupMembershipUpdated {
                group,
                endpoint: key,
            });
        }
    }

    pub fn remove_endpoint(&self, key: &EpKey) -> Option<Endpoint> {
        let removed = self.endpoints.write().remove(key)?;
        debug!(endpoint = %key, "Endpoint removed");
        self.notify(EndpointEvent::EndpointUpdated(key.clone()));
        if let Some(node) = removed.node() {
            self.notify(EndpointEvent::NodeEndpointUpdated {
                node: node.clone(),
                endpoint: key.clone(),
            });
        }
        self.notify(EndpointEvent::GroupMembershipUpdated {
            group: removed.eg_key(),
            endpoint: key.clone(),
        });
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    fn notify(&self, event: EndpointEvent) {
        let _ = self.events.send(event);
    }

    fn collect<F>(&self, mut keep: F) -> Vec<Endpoint>
    where
        F: FnMut(&Endpoint) -> bool,
    {
        self.endpoints
            .read()
            .values()
            .filter(|ep| keep(ep))
            .cloned()
            .collect()
    }
}

impl EndpointManager for EndpointRegistry {
    fn endpoint(&self, key: &EpKey) -> Option<Endpoint> {
        self.endpoints.read().get(key).cloned()
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        self.collect(|_| true)
    }

    fn endpoints_for_node(&self, node: &NodeId) -> Vec<Endpoint> {
        self.collect(|ep| ep.node() == Some(node))
    }

    fn endpoints_for_group(&self, eg: &EgKey) -> Vec<Endpoint> {
        self.collect(|ep| ep.tenant == eg.tenant && ep.group == eg.group)
    }

    fn conditions_for(&self, key: &EpKey) -> BTreeSet<ConditionName> {
        self.endpoints
            .read()
            .get(key)
            .map(|ep| ep.conditions.clone())
            .unwrap_or_default()
    }

    fn membership_of(&self, key: &EpKey) -> Option<EgKey> {
        self.endpoints.read().get(key).map(Endpoint::eg_key)
    }
}
