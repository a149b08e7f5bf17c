//! Services shared by all pipeline stages.

use crate::endpoint::{Endpoint, EndpointManager};
use crate::error::StageError;
use crate::policy::PolicyInfo;
use crate::switch::SwitchManager;
use ofoverlay_common::OrdinalAllocator;
use std::sync::Arc;

/// Read access to switch, endpoint and ordinal services.
///
/// Stages receive it by reference on every call; they keep no state of
/// their own besides their table ids.
#[derive(Clone)]
pub struct OfContext {
    switches: Arc<dyn SwitchManager>,
    endpoints: Arc<dyn EndpointManager>,
    ordinals: Arc<OrdinalAllocator>,
}

/// Register values describing an endpoint's place in policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointOrdinals {
    pub group: u32,
    pub cond_group: u32,
    pub bridge_domain: u32,
    /// 0 when the endpoint's domain has no flood domain.
    pub flood_domain: u32,
    pub l3_context: u32,
}

impl OfContext {
    pub fn new(
        switches: Arc<dyn SwitchManager>,
        endpoints: Arc<dyn EndpointManager>,
        ordinals: Arc<OrdinalAllocator>,
    ) -> Self {
        Self {
            switches,
            endpoints,
            ordinals,
        }
    }

    pub fn switches(&self) -> &dyn SwitchManager {
        self.switches.as_ref()
    }

    pub fn endpoints(&self) -> &dyn EndpointManager {
        self.endpoints.as_ref()
    }

    pub fn ordinals(&self) -> &OrdinalAllocator {
        &self.ordinals
    }

    /// Resolves an endpoint's group, condition group and forwarding contexts
    /// in `policy` and returns their ordinals.
    ///
    /// The bridge domain and L3 context must both resolve; the flood domain
    /// is optional.
    pub fn endpoint_ordinals(
        &self,
        policy: &PolicyInfo,
        ep: &Endpoint,
    ) -> Result<EndpointOrdinals, StageError> {
        let tenant = policy
            .tenant(&ep.tenant)
            .ok_or_else(|| StageError::MissingTenant(ep.tenant.clone()))?;
        let group = tenant
            .group(&ep.group)
            .ok_or_else(|| StageError::MissingGroup {
                tenant: ep.tenant.clone(),
                group: ep.group.clone(),
            })?;
        let domain = ep
            .network_containment
            .as_ref()
            .or(group.network_domain.as_ref())
            .ok_or_else(|| StageError::UnresolvedContext {
                kind: "network domain",
                target: ep.key.to_string(),
            })?;
        let bd = tenant
            .resolve_bridge_domain(domain)
            .ok_or_else(|| StageError::UnresolvedContext {
                kind: "bridge domain",
                target: ep.key.to_string(),
            })?;
        let l3c = tenant
            .resolve_l3_context(domain)
            .ok_or_else(|| StageError::UnresolvedContext {
                kind: "L3 context",
                target: ep.key.to_string(),
            })?;

        let eg = ep.eg_key();
        let conditions = self.endpoints.conditions_for(&ep.key);
        let cond_group = policy.eg_cond_group(&eg, &conditions);
        let flood_domain = match tenant.resolve_flood_domain(domain) {
            Some(fd) => self.ordinals.context_ordinal(&ep.tenant, fd.id.as_str())?,
            None => 0,
        };
        Ok(EndpointOrdinals {
            group: self.ordinals.group_ordinal(&eg)?,
            cond_group: self.ordinals.cond_group_ordinal(&cond_group)?,
            bridge_domain: self.ordinals.context_ordinal(&ep.tenant, bd.id.as_str())?,
            flood_domain,
            l3_context: self.ordinals.context_ordinal(&ep.tenant, l3c.id.as_str())?,
        })
    }

    /// Like [`endpoint_ordinals`](Self::endpoint_ordinals), but treats an
    /// endpoint whose policy is not resolved (yet) as absent.
    pub fn resolved_ordinals(
        &self,
        policy: &PolicyInfo,
        ep: &Endpoint,
    ) -> Result<Option<EndpointOrdinals>, StageError> {
        match self.endpoint_ordinals(policy, ep) {
            Ok(ords) => Ok(Some(ords)),
            Err(e) if e.is_unresolved() => {
                tracing::trace!(endpoint = %ep.key, reason = %e, "Skipping endpoint");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
