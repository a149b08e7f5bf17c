//! Common types for the group-based policy OpenFlow overlay.
//!
//! This crate provides type-safe representations of the identifiers and
//! network primitives shared by the policy renderer:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - Opaque policy identifiers ([`TenantId`], [`EndpointGroupId`], ...)
//! - [`NodeId`] / [`NodeConnectorId`]: switch and switch-port inventory ids
//! - Composite keys [`EgKey`] and [`EpKey`]

mod ids;
mod keys;
mod mac;

pub use ids::{
    ConditionName, ContractId, EndpointGroupId, L2BridgeDomainId, L2FloodDomainId, L3ContextId,
    NodeConnectorId, NodeId, SubnetId, TenantId,
};
pub use keys::{EgKey, EpKey};
pub use mac::MacAddress;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid identifier: {0:?} (must be non-empty, without '|')")]
    InvalidIdentifier(String),

    #[error("invalid node connector id: {0} (expected <node>:<port>)")]
    InvalidNodeConnector(String),
}
