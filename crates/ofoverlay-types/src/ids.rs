//! Opaque string identifiers used by the policy model and the inventory.
//!
//! Identifiers are compared and ordered by their string value. They are
//! validated on construction from untrusted input: empty strings and the
//! `|` key separator used by the southbound store are rejected.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn validate(s: &str) -> Result<(), ParseError> {
    if s.is_empty() || s.contains('|') {
        return Err(ParseError::InvalidIdentifier(s.to_string()));
    }
    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Wraps a trusted value without validation.
            ///
            /// Use `parse()` for untrusted input.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                validate(s)?;
                Ok(Self(s.to_string()))
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                validate(&s)?;
                Ok(Self(s))
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}

string_id!(
    /// A tenant owning endpoint groups, forwarding contexts and contracts.
    TenantId
);
string_id!(
    /// An endpoint group within a tenant.
    EndpointGroupId
);
string_id!(
    /// A layer-2 bridge domain (parent of flood domains).
    L2BridgeDomainId
);
string_id!(
    /// A layer-2 flood domain (broadcast scope).
    L2FloodDomainId
);
string_id!(
    /// A layer-3 routing context.
    L3ContextId
);
string_id!(SubnetId);
string_id!(ContractId);
string_id!(
    /// A named endpoint condition (e.g. `quarantine`).
    ConditionName
);
string_id!(
    /// A forwarding device, e.g. `openflow:1`.
    NodeId
);

/// A port on a forwarding device, e.g. `openflow:1:4`.
///
/// The last `:`-separated component is the OpenFlow port number; the
/// remainder is the owning [`NodeId`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeConnectorId {
    node: NodeId,
    port: u32,
}

impl NodeConnectorId {
    pub fn new(node: NodeId, port: u32) -> Self {
        Self { node, port }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn port_number(&self) -> u32 {
        self.port
    }
}

impl fmt::Display for NodeConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

impl FromStr for NodeConnectorId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidNodeConnector(s.to_string());
        let (node, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port = port.parse::<u32>().map_err(|_| invalid())?;
        let node = node.parse::<NodeId>().map_err(|_| invalid())?;
        Ok(Self { node, port })
    }
}

impl TryFrom<String> for NodeConnectorId {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeConnectorId> for String {
    fn from(id: NodeConnectorId) -> String {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identifier_validation() {
        assert!("".parse::<TenantId>().is_err());
        assert!("a|b".parse::<TenantId>().is_err());
        let tid: TenantId = "1118c691-8520-47ad-80b8-4cf5e3fe3302".parse().unwrap();
        assert_eq!(tid.as_str(), "1118c691-8520-47ad-80b8-4cf5e3fe3302");
    }

    #[test]
    fn test_node_connector_parse() {
        let ncid: NodeConnectorId = "openflow:1:42".parse().unwrap();
        assert_eq!(ncid.node(), &NodeId::new("openflow:1"));
        assert_eq!(ncid.port_number(), 42);
        assert_eq!(ncid.to_string(), "openflow:1:42");

        assert!("openflow".parse::<NodeConnectorId>().is_err());
        assert!("openflow:1:x".parse::<NodeConnectorId>().is_err());
    }
}
