//! External ports from vSwitch provider mappings.
//!
//! A vSwitch node names its uplink in the `provider_mappings` other-config
//! entry (`physnet:portname`). The listener finds that port on the node's
//! bridges and registers it as an external port of the OpenFlow switch.

use crate::switch::SwitchRegistry;
use ofoverlay_types::{NodeConnectorId, NodeId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub const PROVIDER_MAPPINGS_KEY: &str = "provider_mappings";
const INVENTORY_PREFIX: &str = "openflow:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvsdbPort {
    pub name: String,
    /// OpenFlow port number, once assigned.
    pub ofport: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OvsdbBridge {
    /// Datapath id as reported by the vSwitch, e.g. `00:00:00:00:00:00:00:01`.
    pub datapath_id: String,
    pub ports: Vec<OvsdbPort>,
}

/// A vSwitch database node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OvsdbNode {
    pub id: String,
    pub other_config: BTreeMap<String, String>,
    pub bridges: Vec<OvsdbBridge>,
}

impl OvsdbNode {
    /// Port name from the provider mapping, if the entry is well formed.
    pub fn provider_port(&self) -> Option<&str> {
        let mapping = self.other_config.get(PROVIDER_MAPPINGS_KEY)?;
        let mut parts = mapping.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(port), None) if !port.is_empty() => Some(port),
            _ => None,
        }
    }

    /// Inventory connector of the named port: `openflow:<dpid>:<ofport>`.
    pub fn inventory_connector(&self, port_name: &str) -> Option<NodeConnectorId> {
        self.bridges.iter().find_map(|bridge| {
            let ofport = bridge
                .ports
                .iter()
                .find(|p| p.name == port_name)
                .and_then(|p| p.ofport)?;
            let dpid = parse_datapath_id(&bridge.datapath_id)?;
            let node = NodeId::new(format!("{}{}", INVENTORY_PREFIX, dpid));
            Some(NodeConnectorId::new(node, ofport))
        })
    }
}

fn parse_datapath_id(dpid: &str) -> Option<u64> {
    let hex: String = dpid.chars().filter(|c| *c != ':').collect();
    match u64::from_str_radix(&hex, 16) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(dpid, error = %e, "Invalid datapath id");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OvsdbNodeEvent {
    Created(OvsdbNode),
    Updated(OvsdbNode),
    Removed(String),
}

/// Keeps the switch registry's external ports in step with provider mappings.
pub struct ProviderMappingListener {
    switches: Arc<SwitchRegistry>,
    // vSwitch node id -> registered external port
    external_ports: Mutex<HashMap<String, NodeConnectorId>>,
}

impl ProviderMappingListener {
    pub fn new(switches: Arc<SwitchRegistry>) -> Self {
        Self {
            switches,
            external_ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, event: OvsdbNodeEvent) {
        match event {
            OvsdbNodeEvent::Created(node) => self.process_node(&node),
            OvsdbNodeEvent::Updated(node) => {
                if node.provider_port().is_none() {
                    self.remove(&node.id);
                } else {
                    self.process_node(&node);
                }
            }
            OvsdbNodeEvent::Removed(id) => self.remove(&id),
        }
    }

    /// External port registered for a vSwitch node.
    pub fn external_port(&self, node_id: &str) -> Option<NodeConnectorId> {
        self.external_ports.lock().get(node_id).cloned()
    }

    fn process_node(&self, node: &OvsdbNode) {
        trace!(node = %node.id, "Looking for provider mapping");
        let Some(port_name) = node.provider_port() else {
            return;
        };
        let Some(connector) = node.inventory_connector(port_name) else {
            debug!(node = %node.id, port = port_name, "Provider port not found on any bridge");
            return;
        };

        let previous = self
            .external_ports
            .lock()
            .insert(node.id.clone(), connector.clone());
        match previous {
            Some(old) if old == connector => return,
            Some(old) => self.switches.remove_external_port(&old),
            None => {}
        }
        info!(node = %node.id, port = %connector, "Adding external port");
        self.switches.add_external_port(connector);
    }

    fn remove(&self, node_id: &str) {
        let removed = self.external_ports.lock().remove(node_id);
        if let Some(port) = removed {
            info!(node = node_id, port = %port, "Removing external port");
            self.switches.remove_external_port(&port);
        }
    }

    /// Forgets all bookkeeping. Registered ports stay on the switch registry.
    pub fn close(&self) {
        self.external_ports.lock().clear();
    }
}
