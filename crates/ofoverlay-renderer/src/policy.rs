//! Resolved policy model and the snapshot provider.
//!
//! A [`PolicyInfo`] is an immutable view of resolved tenant policy. The
//! [`PolicyResolver`] swaps snapshots atomically; a reconciliation run takes
//! one `Arc<PolicyInfo>` at its start and keeps it for the whole run.

use ofoverlay_types::{
    ConditionName, EgKey, EndpointGroupId, L2BridgeDomainId, L2FloodDomainId, L3ContextId,
    SubnetId, TenantId,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Sorted set of conditions that select a rule set within a group.
pub type ConditionGroup = BTreeSet<ConditionName>;

const EVENT_CAPACITY: usize = 256;

/// Reference to any forwarding context a group or subnet can sit in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkDomainId {
    Subnet(SubnetId),
    FloodDomain(L2FloodDomainId),
    BridgeDomain(L2BridgeDomainId),
    L3Context(L3ContextId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: SubnetId,
    pub parent: Option<NetworkDomainId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2FloodDomain {
    pub id: L2FloodDomainId,
    pub parent: Option<L2BridgeDomainId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2BridgeDomain {
    pub id: L2BridgeDomainId,
    pub parent: Option<L3ContextId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3Context {
    pub id: L3ContextId,
}

/// Whether members of the same group may talk without a contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IntraGroupPolicy {
    #[default]
    Allow,
    RequireContract,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointGroup {
    pub id: EndpointGroupId,
    pub network_domain: Option<NetworkDomainId>,
    pub intra_group_policy: IntraGroupPolicy,
}

impl EndpointGroup {
    pub fn new(id: EndpointGroupId, network_domain: Option<NetworkDomainId>) -> Self {
        Self {
            id,
            network_domain,
            intra_group_policy: IntraGroupPolicy::default(),
        }
    }
}

/// A tenant's groups and forwarding contexts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: TenantId,
    pub groups: BTreeMap<EndpointGroupId, EndpointGroup>,
    pub subnets: BTreeMap<SubnetId, Subnet>,
    pub flood_domains: BTreeMap<L2FloodDomainId, L2FloodDomain>,
    pub bridge_domains: BTreeMap<L2BridgeDomainId, L2BridgeDomain>,
    pub l3_contexts: BTreeMap<L3ContextId, L3Context>,
}

/// Domains met while walking up from a starting domain.
#[derive(Debug, Default)]
struct DomainChain<'a> {
    flood_domain: Option<&'a L2FloodDomain>,
    bridge_domain: Option<&'a L2BridgeDomain>,
    l3_context: Option<&'a L3Context>,
}

impl Tenant {
    pub fn new(id: TenantId) -> Self {
        Self {
            id,
            groups: BTreeMap::new(),
            subnets: BTreeMap::new(),
            flood_domains: BTreeMap::new(),
            bridge_domains: BTreeMap::new(),
            l3_contexts: BTreeMap::new(),
        }
    }

    pub fn with_group(mut self, group: EndpointGroup) -> Self {
        self.groups.insert(group.id.clone(), group);
        self
    }

    pub fn with_subnet(mut self, subnet: Subnet) -> Self {
        self.subnets.insert(subnet.id.clone(), subnet);
        self
    }

    pub fn with_flood_domain(mut self, fd: L2FloodDomain) -> Self {
        self.flood_domains.insert(fd.id.clone(), fd);
        self
    }

    pub fn with_bridge_domain(mut self, bd: L2BridgeDomain) -> Self {
        self.bridge_domains.insert(bd.id.clone(), bd);
        self
    }

    pub fn with_l3_context(mut self, l3c: L3Context) -> Self {
        self.l3_contexts.insert(l3c.id.clone(), l3c);
        self
    }

    pub fn group(&self, id: &EndpointGroupId) -> Option<&EndpointGroup> {
        self.groups.get(id)
    }

    pub fn resolve_flood_domain(&self, domain: &NetworkDomainId) -> Option<&L2FloodDomain> {
        self.walk(domain).flood_domain
    }

    pub fn resolve_bridge_domain(&self, domain: &NetworkDomainId) -> Option<&L2BridgeDomain> {
        self.walk(domain).bridge_domain
    }

    pub fn resolve_l3_context(&self, domain: &NetworkDomainId) -> Option<&L3Context> {
        self.walk(domain).l3_context
    }

    /// Follows parent links subnet -> flood domain -> bridge domain -> L3 context.
    fn walk(&self, start: &NetworkDomainId) -> DomainChain<'_> {
        let mut chain = DomainChain::default();
        let mut next = Some(start.clone());
        // Parent links only point upwards, so the chain is at most four hops
        // unless a subnet points at another subnet.
        let mut seen_subnets = BTreeSet::new();
        while let Some(domain) = next.take() {
            match domain {
                NetworkDomainId::Subnet(id) => {
                    if !seen_subnets.insert(id.clone()) {
                        break;
                    }
                    next = self.subnets.get(&id).and_then(|s| s.parent.clone());
                }
                NetworkDomainId::FloodDomain(id) => {
                    if let Some(fd) = self.flood_domains.get(&id) {
                        chain.flood_domain = Some(fd);
                        next = fd.parent.clone().map(NetworkDomainId::BridgeDomain);
                    }
                }
                NetworkDomainId::BridgeDomain(id) => {
                    if let Some(bd) = self.bridge_domains.get(&id) {
                        chain.bridge_domain = Some(bd);
                        next = bd.parent.clone().map(NetworkDomainId::L3Context);
                    }
                }
                NetworkDomainId::L3Context(id) => {
                    chain.l3_context = self.l3_contexts.get(&id);
                }
            }
        }
        chain
    }
}

/// Verdict of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Allow,
    Deny,
}

/// Traffic selector of a rule. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classifier {
    pub eth_type: Option<u16>,
    pub ip_proto: Option<u8>,
    pub dst_port: Option<u16>,
}

impl Classifier {
    pub fn l4(eth_type: u16, ip_proto: u8, dst_port: u16) -> Self {
        Self {
            eth_type: Some(eth_type),
            ip_proto: Some(ip_proto),
            dst_port: Some(dst_port),
        }
    }
}

/// A resolved rule between a consumer and a provider group.
///
/// Lower `order` takes precedence. A rule without classifiers matches all
/// traffic between the two groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub name: String,
    pub order: u32,
    pub action: RuleAction,
    pub classifiers: Vec<Classifier>,
    pub consumer_conditions: Option<ConditionGroup>,
    pub provider_conditions: Option<ConditionGroup>,
}

impl Rule {
    pub fn new(name: impl Into<String>, order: u32, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            order,
            action,
            classifiers: Vec::new(),
            consumer_conditions: None,
            provider_conditions: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifiers.push(classifier);
        self
    }

    pub fn when_consumer(mut self, conditions: ConditionGroup) -> Self {
        self.consumer_conditions = Some(conditions);
        self
    }

    pub fn when_provider(mut self, conditions: ConditionGroup) -> Self {
        self.provider_conditions = Some(conditions);
        self
    }
}

/// Immutable resolved policy snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyInfo {
    tenants: BTreeMap<TenantId, Tenant>,
    policies: BTreeMap<(EgKey, EgKey), Vec<Rule>>,
    group_conditions: BTreeMap<EgKey, ConditionGroup>,
}

impl PolicyInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenant(mut self, tenant: Tenant) -> Self {
        self.tenants.insert(tenant.id.clone(), tenant);
        self
    }

    /// Sets the rules for traffic from `consumer` to `provider`, sorted by order.
    pub fn with_rules(mut self, consumer: EgKey, provider: EgKey, mut rules: Vec<Rule>) -> Self {
        rules.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
        self.policies.insert((consumer, provider), rules);
        self
    }

    /// Records the conditions referenced by a group's contracts.
    pub fn with_group_conditions(mut self, eg: EgKey, conditions: ConditionGroup) -> Self {
        self.group_conditions.insert(eg, conditions);
        self
    }

    pub fn tenant(&self, id: &TenantId) -> Option<&Tenant> {
        self.tenants.get(id)
    }

    pub fn tenants(&self) -> impl Iterator<Item = &Tenant> {
        self.tenants.values()
    }

    pub fn group(&self, eg: &EgKey) -> Option<&EndpointGroup> {
        self.tenant(&eg.tenant).and_then(|t| t.group(&eg.group))
    }

    /// Rules for traffic from `consumer` to `provider`, in precedence order.
    pub fn policy(&self, consumer: &EgKey, provider: &EgKey) -> &[Rule] {
        self.policies
            .get(&(consumer.clone(), provider.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Providers `consumer` has rules towards, with those rules.
    pub fn policies_from<'a>(
        &'a self,
        consumer: &'a EgKey,
    ) -> impl Iterator<Item = (&'a EgKey, &'a [Rule])> + 'a {
        self.policies
            .iter()
            .filter(move |((c, _), _)| c == consumer)
            .map(|((_, p), rules)| (p, rules.as_slice()))
    }

    /// The part of an endpoint's conditions that the group's contracts refer to.
    pub fn eg_cond_group(&self, eg: &EgKey, conditions: &BTreeSet<ConditionName>) -> ConditionGroup {
        match self.group_conditions.get(eg) {
            Some(referenced) => referenced.intersection(conditions).cloned().collect(),
            None => ConditionGroup::new(),
        }
    }

    pub fn intra_group_policy(&self, eg: &EgKey) -> IntraGroupPolicy {
        self.group(eg)
            .map(|g| g.intra_group_policy)
            .unwrap_or_default()
    }

    /// All groups known to the snapshot.
    pub fn group_keys(&self) -> BTreeSet<EgKey> {
        self.tenants
            .values()
            .flat_map(|t| t.groups.keys().map(|g| EgKey::new(t.id.clone(), g.clone())))
            .collect()
    }
}

/// Notification from the policy source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEvent {
    PolicyUpdated { affected: BTreeSet<EgKey> },
}

/// Source of policy snapshots.
pub trait PolicyProvider: Send + Sync {
    /// Current snapshot, `None` until policy has been resolved once.
    fn current_policy(&self) -> Option<Arc<PolicyInfo>>;

    /// Asks the provider to resolve policy for a group.
    fn add_to_scope(&self, eg: EgKey);
}

/// In-memory [`PolicyProvider`] with change notification.
pub struct PolicyResolver {
    current: RwLock<Option<Arc<PolicyInfo>>>,
    scope: RwLock<BTreeSet<EgKey>>,
    events: broadcast::Sender<PolicyEvent>,
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyResolver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            current: RwLock::new(None),
            scope: RwLock::new(BTreeSet::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.events.subscribe()
    }

    /// Replaces the snapshot and notifies subscribers of the groups whose
    /// resolved state changed.
    pub fn update_policy(&self, policy: PolicyInfo) {
        let policy = Arc::new(policy);
        let previous = self.current.write().replace(Arc::clone(&policy));
        let affected = affected_groups(previous.as_deref(), &policy);
        debug!(groups = affected.len(), "Policy snapshot updated");
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(PolicyEvent::PolicyUpdated { affected });
    }

    /// Adds or replaces a tenant in the current snapshot.
    pub fn add_tenant(&self, tenant: Tenant) {
        let base = self
            .current
            .read()
            .as_deref()
            .cloned()
            .unwrap_or_default();
        self.update_policy(base.with_tenant(tenant));
    }

    pub fn scope(&self) -> BTreeSet<EgKey> {
        self.scope.read().clone()
    }

    pub fn in_scope(&self, eg: &EgKey) -> bool {
        self.scope.read().contains(eg)
    }
}

impl PolicyProvider for PolicyResolver {
    fn current_policy(&self) -> Option<Arc<PolicyInfo>> {
        self.current.read().clone()
    }

    fn add_to_scope(&self, eg: EgKey) {
        if self.scope.write().insert(eg.clone()) {
            trace!(group = %eg, "Group added to policy scope");
        }
    }
}

fn affected_groups(previous: Option<&PolicyInfo>, current: &PolicyInfo) -> BTreeSet<EgKey> {
    let Some(previous) = previous else {
        return current.group_keys();
    };
    let mut keys = previous.group_keys();
    keys.extend(current.group_keys());
    keys.into_iter()
        .filter(|eg| {
            previous.group(eg) != current.group(eg)
                || previous.group_conditions.get(eg) != current.group_conditions.get(eg)
                || previous.policies_from(eg).ne(current.policies_from(eg))
        })
        .collect()
}
