//! Ordinal allocation for register-sized identifiers.
//!
//! Policy identifiers are strings, but flow matches and register loads need
//! small integers. The allocator hands out a stable ordinal per key. Numbers
//! grow monotonically and are never handed out twice, so an ordinal stays
//! bound to its key for as long as the key is referenced.
//!
//! Every lookup marks its key as referenced. A caller that walks the whole
//! policy calls [`OrdinalAllocator::clear_references`] first and
//! [`OrdinalAllocator::sweep`] afterwards to forget keys nothing used.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use ofoverlay_types::{ConditionName, EgKey, TenantId};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

/// Errors from ordinal allocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrdinalError {
    #[error("Ordinal space exhausted")]
    Exhausted,
}

/// Domain key an ordinal is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrdinalKey {
    /// An endpoint group.
    EndpointGroup(EgKey),
    /// A forwarding context (bridge domain, flood domain, L3 context) of a tenant.
    Context { tenant: TenantId, id: String },
    /// A sorted set of endpoint conditions.
    ConditionGroup(BTreeSet<ConditionName>),
}

/// Idempotent, monotonic ordinal allocator.
///
/// Ordinal 0 is never allocated; registers use it to mean "unset".
#[derive(Debug)]
pub struct OrdinalAllocator {
    ordinals: DashMap<OrdinalKey, u32>,
    referenced: DashSet<OrdinalKey>,
    next: AtomicU32,
}

impl Default for OrdinalAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl OrdinalAllocator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first: u32) -> Self {
        Self {
            ordinals: DashMap::new(),
            referenced: DashSet::new(),
            next: AtomicU32::new(first),
        }
    }

    /// Returns the ordinal for `key`, allocating one on first use.
    pub fn ordinal(&self, key: OrdinalKey) -> Result<u32, OrdinalError> {
        if !self.referenced.contains(&key) {
            self.referenced.insert(key.clone());
        }
        if let Some(existing) = self.ordinals.get(&key) {
            return Ok(*existing);
        }
        match self.ordinals.entry(key) {
            Entry::Occupied(e) => Ok(*e.get()),
            Entry::Vacant(e) => {
                let ordinal = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_add(1))
                    .map_err(|_| OrdinalError::Exhausted)?;
                e.insert(ordinal);
                Ok(ordinal)
            }
        }
    }

    pub fn group_ordinal(&self, eg: &EgKey) -> Result<u32, OrdinalError> {
        self.ordinal(OrdinalKey::EndpointGroup(eg.clone()))
    }

    pub fn context_ordinal(&self, tenant: &TenantId, id: &str) -> Result<u32, OrdinalError> {
        self.ordinal(OrdinalKey::Context {
            tenant: tenant.clone(),
            id: id.to_string(),
        })
    }

    pub fn cond_group_ordinal(&self, conditions: &BTreeSet<ConditionName>) -> Result<u32, OrdinalError> {
        self.ordinal(OrdinalKey::ConditionGroup(conditions.clone()))
    }

    /// Returns the ordinal for `key` without allocating.
    pub fn get(&self, key: &OrdinalKey) -> Option<u32> {
        self.ordinals.get(key).map(|v| *v)
    }

    pub fn len(&self) -> usize {
        self.ordinals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordinals.is_empty()
    }

    /// Forgets keys for which `referenced` returns false.
    ///
    /// Their numbers are not recycled.
    pub fn retain<F>(&self, mut referenced: F)
    where
        F: FnMut(&OrdinalKey) -> bool,
    {
        self.ordinals.retain(|key, _| referenced(key));
    }

    /// Starts a new reference window.
    pub fn clear_references(&self) {
        self.referenced.clear();
    }

    /// Forgets every key not looked up since the last
    /// [`clear_references`](Self::clear_references) and returns how many
    /// were dropped.
    pub fn sweep(&self) -> usize {
        let before = self.ordinals.len();
        self.retain(|key| self.referenced.contains(key));
        before.saturating_sub(self.ordinals.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofoverlay_types::EndpointGroupId;
    use pretty_assertions::assert_eq;

    fn eg(name: &str) -> EgKey {
        EgKey::new(TenantId::new("t1"), EndpointGroupId::new(name))
    }

    #[test]
    fn test_allocation_is_idempotent() {
        let alloc = OrdinalAllocator::new();
        let a = alloc.group_ordinal(&eg("web")).unwrap();
        let b = alloc.group_ordinal(&eg("db")).unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.group_ordinal(&eg("web")).unwrap(), a);
        assert_eq!(alloc.len(), 2);
        assert!(a >= 1 && b >= 1);
    }

    #[test]
    fn test_key_kinds_do_not_collide() {
        let alloc = OrdinalAllocator::new();
        let tenant = TenantId::new("t1");
        let ctx = alloc.context_ordinal(&tenant, "web").unwrap();
        let group = alloc.group_ordinal(&eg("web")).unwrap();
        assert_ne!(ctx, group);
    }

    #[test]
    fn test_cond_group_ordinal_by_content() {
        let alloc = OrdinalAllocator::new();
        let a: BTreeSet<_> = [ConditionName::new("x"), ConditionName::new("y")].into();
        let b: BTreeSet<_> = [ConditionName::new("y"), ConditionName::new("x")].into();
        assert_eq!(
            alloc.cond_group_ordinal(&a).unwrap(),
            alloc.cond_group_ordinal(&b).unwrap()
        );
    }

    #[test]
    fn test_retain_never_recycles() {
        let alloc = OrdinalAllocator::new();
        let web = alloc.group_ordinal(&eg("web")).unwrap();
        alloc.retain(|_| false);
        assert!(alloc.get(&OrdinalKey::EndpointGroup(eg("web"))).is_none());
        let db = alloc.group_ordinal(&eg("db")).unwrap();
        assert!(db > web);
    }

    #[test]
    fn test_sweep_forgets_unreferenced_keys() {
        let alloc = OrdinalAllocator::new();
        let web = alloc.group_ordinal(&eg("web")).unwrap();
        let db = alloc.group_ordinal(&eg("db")).unwrap();

        alloc.clear_references();
        assert_eq!(alloc.group_ordinal(&eg("web")).unwrap(), web);
        assert_eq!(alloc.sweep(), 1);
        assert_eq!(alloc.len(), 1);
        assert!(alloc.get(&OrdinalKey::EndpointGroup(eg("db"))).is_none());

        let app = alloc.group_ordinal(&eg("app")).unwrap();
        assert!(app > db);
        assert_eq!(alloc.group_ordinal(&eg("web")).unwrap(), web);
    }

    #[test]
    fn test_exhaustion() {
        let alloc = OrdinalAllocator::starting_at(u32::MAX - 1);
        assert_eq!(alloc.group_ordinal(&eg("a")).unwrap(), u32::MAX - 1);
        assert_eq!(alloc.group_ordinal(&eg("b")), Err(OrdinalError::Exhausted));
        assert_eq!(alloc.group_ordinal(&eg("a")).unwrap(), u32::MAX - 1);
    }

    #[test]
    fn test_concurrent_allocation_is_consistent() {
        let alloc = std::sync::Arc::new(OrdinalAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| alloc.group_ordinal(&eg(&format!("g{}", i))).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(alloc.len(), 100);
    }
}
