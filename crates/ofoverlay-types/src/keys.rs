//! Composite keys for endpoint groups and endpoints.

use crate::{EndpointGroupId, L2BridgeDomainId, MacAddress, TenantId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies an endpoint group: the group id is only unique per tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EgKey {
    pub tenant: TenantId,
    pub group: EndpointGroupId,
}

impl EgKey {
    pub fn new(tenant: TenantId, group: EndpointGroupId) -> Self {
        Self { tenant, group }
    }
}

impl fmt::Display for EgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.group)
    }
}

/// Identifies an L2 endpoint by its bridge domain and MAC address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EpKey {
    pub l2_context: L2BridgeDomainId,
    pub mac: MacAddress,
}

impl EpKey {
    pub fn new(l2_context: L2BridgeDomainId, mac: MacAddress) -> Self {
        Self { l2_context, mac }
    }
}

impl fmt::Display for EpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.l2_context, self.mac)
    }
}
