//! Switch inventory: readiness, tunnel endpoints and external ports.

use ofoverlay_types::{NodeConnectorId, NodeId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use tokio::sync::broadcast;
use tracing::{debug, info};

const EVENT_CAPACITY: usize = 256;

/// Overlay tunnel endpoint of a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    /// Underlay address other switches tunnel to.
    pub ip: IpAddr,
    /// Local port the tunnel is attached to.
    pub port: NodeConnectorId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SwitchState {
    ready: bool,
    tunnel: Option<TunnelConfig>,
    external_ports: BTreeSet<NodeConnectorId>,
}

/// Notification from the switch source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    SwitchReady(NodeId),
    SwitchRemoved(NodeId),
    SwitchUpdated(NodeId),
}

/// Read access to switch state, as seen by pipeline stages.
pub trait SwitchManager: Send + Sync {
    /// Ready switches, sorted.
    fn ready_switches(&self) -> Vec<NodeId>;

    fn is_ready(&self, node: &NodeId) -> bool;

    fn tunnel(&self, node: &NodeId) -> Option<TunnelConfig>;

    fn external_ports(&self, node: &NodeId) -> BTreeSet<NodeConnectorId>;
}

/// In-memory switch inventory with change notification.
///
/// External ports may be registered before the switch itself is ready; they
/// are kept and apply once it is.
pub struct SwitchRegistry {
    switches: RwLock<BTreeMap<NodeId, SwitchState>>,
    events: broadcast::Sender<SwitchEvent>,
}

impl Default for SwitchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            switches: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwitchEvent> {
        self.events.subscribe()
    }

    /// Marks a switch ready, or updates its tunnel if it already is.
    pub fn add_switch(&self, node: NodeId, tunnel: Option<TunnelConfig>) {
        let event = {
            let mut switches = self.switches.write();
            let state = switches.entry(node.clone()).or_default();
            let was_ready = std::mem::replace(&mut state.ready, true);
            state.tunnel = tunnel;
            if was_ready {
                SwitchEvent::SwitchUpdated(node.clone())
            } else {
                info!(switch = %node, "Switch ready");
                SwitchEvent::SwitchReady(node.clone())
            }
        };
        self.notify(event);
    }

    pub fn remove_switch(&self, node: &NodeId) -> bool {
        if self.switches.write().remove(node).is_none() {
            return false;
        }
        info!(switch = %node, "Switch removed");
        self.notify(SwitchEvent::SwitchRemoved(node.clone()));
        true
    }

    pub fn add_external_port(&self, port: NodeConnectorId) {
        let node = port.node().clone();
        let added = self
            .switches
            .write()
            .entry(node.clone())
            .or_default()
            .external_ports
            .insert(port.clone());
        if added {
            debug!(switch = %node, port = %port, "External port added");
            self.notify(SwitchEvent::SwitchUpdated(node));
        }
    }

    pub fn remove_external_port(&self, port: &NodeConnectorId) {
        let removed = self
            .switches
            .write()
            .get_mut(port.node())
            .is_some_and(|s| s.external_ports.remove(port));
        if removed {
            debug!(switch = %port.node(), port = %port, "External port removed");
            self.notify(SwitchEvent::SwitchUpdated(port.node().clone()));
        }
    }

    fn notify(&self, event: SwitchEvent) {
        let _ = self.events.send(event);
    }
}

impl SwitchManager for SwitchRegistry {
    fn ready_switches(&self) -> Vec<NodeId> {
        self.switches
            .read()
            .iter()
            .filter(|(_, s)| s.ready)
            .map(|(n, _)| n.clone())
            .collect()
    }

    fn is_ready(&self, node: &NodeId) -> bool {
        self.switches.read().get(node).is_some_and(|s| s.ready)
    }

    fn tunnel(&self, node: &NodeId) -> Option<TunnelConfig> {
        self.switches
            .read()
            .get(node)
            .filter(|s| s.ready)
            .and_then(|s| s.tunnel.clone())
    }

    fn external_ports(&self, node: &NodeId) -> BTreeSet<NodeConnectorId> {
        self.switches
            .read()
            .get(node)
            .filter(|s| s.ready)
            .map(|s| s.external_ports.clone())
            .unwrap_or_default()
    }
}
