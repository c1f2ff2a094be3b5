//! The host's device registry, seen from the gateway.
//!
//! The registry owns persistence: configured nodes and the sub-devices each
//! node expands into. The gateway only looks entries up and pushes values
//! into them, so every call is an independent upsert or delete by key and
//! implementations serialize their own writes.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use crate::device::{DeviceClass, DeviceKind};
use crate::identifier::NodeAddress;

/// Host-assigned id of a gateway instance.
pub type GatewayId = u32;

/// Registry id of a configured node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: DeviceKind,
    pub address: NodeAddress,
}

/// Identifies the registry entries belonging to one node. A node with several
/// sub-devices has one key and one entry per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub gateway: GatewayId,
    pub node: NodeId,
    pub address: NodeAddress,
    pub kind: DeviceKind,
}

impl DeviceKey {
    pub fn for_node(gateway: GatewayId, node: &Node) -> Self {
        Self {
            gateway,
            node: node.id,
            address: node.address,
            kind: node.kind,
        }
    }

    /// The device id string the host stores, built from the low 16 bits of
    /// the node id, the node address and the kind.
    pub fn device_id(&self) -> String {
        format!(
            "{:X}{:02X}{:02X}{:02X}",
            (self.node.0 >> 8) & 0xFF,
            self.node.0 & 0xFF,
            self.address.as_raw(),
            u8::from(self.kind)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub key: DeviceKey,
    pub unit: u8,
    pub name: String,
    pub class: DeviceClass,
    pub used: bool,
}

pub trait Registry: Send + Sync {
    /// Stores a new node and returns the id the registry assigned to it.
    fn insert_node(
        &self,
        gateway: GatewayId,
        name: &str,
        kind: DeviceKind,
        address: NodeAddress,
    ) -> Result<NodeId, RegistryError>;

    /// Rewrites a node. Returns `false` if no node with that id exists.
    fn update_node(&self, gateway: GatewayId, node: &Node) -> Result<bool, RegistryError>;

    /// Returns `false` if no node with that id exists.
    fn delete_node(&self, gateway: GatewayId, id: NodeId) -> Result<bool, RegistryError>;

    fn delete_all_nodes(&self, gateway: GatewayId) -> Result<usize, RegistryError>;

    fn node(&self, gateway: GatewayId, id: NodeId) -> Result<Option<Node>, RegistryError>;

    /// All nodes of a gateway ordered by id.
    fn nodes(&self, gateway: GatewayId) -> Result<Vec<Node>, RegistryError>;

    /// Looks up the device of `kind` at `address`, or any device of that kind
    /// on the gateway when `address` is `None`.
    fn find_device(
        &self,
        gateway: GatewayId,
        kind: DeviceKind,
        address: Option<NodeAddress>,
    ) -> Result<Option<DeviceKey>, RegistryError>;

    fn register_device(&self, entry: &DeviceEntry) -> Result<(), RegistryError>;

    /// Removes every unit registered under `key` and returns how many there were.
    fn delete_device(&self, key: &DeviceKey) -> Result<usize, RegistryError>;

    fn delete_all_devices(&self, gateway: GatewayId) -> Result<usize, RegistryError>;

    /// Adds `value` to an incremental counter.
    fn upsert_counter(&self, key: &DeviceKey, unit: u8, value: f64) -> Result<(), RegistryError>;

    /// Replaces the state of a switch-like device.
    fn upsert_state(
        &self,
        key: &DeviceKey,
        unit: u8,
        numeric: i32,
        text: &str,
    ) -> Result<(), RegistryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No device {device} with unit {unit} is registered")]
    DeviceNotFound { device: String, unit: u8 },
    #[error("Registry backend failure: {0}")]
    Backend(String),
}

/// A registered device together with the last values pushed into it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub entry: DeviceEntry,
    pub counter: f64,
    pub numeric: i32,
    pub text: String,
}

/// In-memory registry backed by [`DashMap`], used by the daemon and tests.
pub struct MemoryRegistry {
    next_node_id: AtomicU32,
    nodes: DashMap<(GatewayId, NodeId), Node>,
    devices: DashMap<(DeviceKey, u8), DeviceRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            next_node_id: AtomicU32::new(1),
            nodes: DashMap::new(),
            devices: DashMap::new(),
        }
    }

    pub fn device(&self, key: &DeviceKey, unit: u8) -> Option<DeviceRecord> {
        self.devices.get(&(*key, unit)).map(|r| r.value().clone())
    }

    /// Every device of a gateway, ordered by node id and unit.
    pub fn devices(&self, gateway: GatewayId) -> Vec<DeviceRecord> {
        let mut devices: Vec<DeviceRecord> = self
            .devices
            .iter()
            .filter(|r| r.key().0.gateway == gateway)
            .map(|r| r.value().clone())
            .collect();

        devices.sort_by_key(|record| (record.entry.key.node, record.entry.unit));
        devices
    }

    fn with_device(
        &self,
        key: &DeviceKey,
        unit: u8,
        update: impl FnOnce(&mut DeviceRecord),
    ) -> Result<(), RegistryError> {
        let mut record =
            self.devices
                .get_mut(&(*key, unit))
                .ok_or_else(|| RegistryError::DeviceNotFound {
                    device: key.device_id(),
                    unit,
                })?;

        update(record.value_mut());
        Ok(())
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry for MemoryRegistry {
    fn insert_node(
        &self,
        gateway: GatewayId,
        name: &str,
        kind: DeviceKind,
        address: NodeAddress,
    ) -> Result<NodeId, RegistryError> {
        let id = NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed));

        self.nodes.insert(
            (gateway, id),
            Node {
                id,
                name: name.to_string(),
                kind,
                address,
            },
        );

        Ok(id)
    }

    fn update_node(&self, gateway: GatewayId, node: &Node) -> Result<bool, RegistryError> {
        match self.nodes.get_mut(&(gateway, node.id)) {
            Some(mut existing) => {
                *existing = node.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_node(&self, gateway: GatewayId, id: NodeId) -> Result<bool, RegistryError> {
        Ok(self.nodes.remove(&(gateway, id)).is_some())
    }

    fn delete_all_nodes(&self, gateway: GatewayId) -> Result<usize, RegistryError> {
        let before = self.nodes.len();
        self.nodes.retain(|(owner, _), _| *owner != gateway);
        Ok(before - self.nodes.len())
    }

    fn node(&self, gateway: GatewayId, id: NodeId) -> Result<Option<Node>, RegistryError> {
        Ok(self.nodes.get(&(gateway, id)).map(|r| r.value().clone()))
    }

    fn nodes(&self, gateway: GatewayId) -> Result<Vec<Node>, RegistryError> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|r| r.key().0 == gateway)
            .map(|r| r.value().clone())
            .collect();

        nodes.sort_by_key(|node| node.id);
        Ok(nodes)
    }

    fn find_device(
        &self,
        gateway: GatewayId,
        kind: DeviceKind,
        address: Option<NodeAddress>,
    ) -> Result<Option<DeviceKey>, RegistryError> {
        Ok(self
            .devices
            .iter()
            .map(|r| r.key().0)
            .filter(|key| key.gateway == gateway && key.kind == kind)
            .filter(|key| address.map_or(true, |address| key.address == address))
            .min_by_key(|key| key.node))
    }

    fn register_device(&self, entry: &DeviceEntry) -> Result<(), RegistryError> {
        self.devices.insert(
            (entry.key, entry.unit),
            DeviceRecord {
                entry: entry.clone(),
                counter: 0.0,
                numeric: 0,
                text: String::new(),
            },
        );

        Ok(())
    }

    fn delete_device(&self, key: &DeviceKey) -> Result<usize, RegistryError> {
        let before = self.devices.len();
        self.devices.retain(|(existing, _), _| existing != key);
        Ok(before - self.devices.len())
    }

    fn delete_all_devices(&self, gateway: GatewayId) -> Result<usize, RegistryError> {
        let before = self.devices.len();
        self.devices.retain(|(key, _), _| key.gateway != gateway);
        Ok(before - self.devices.len())
    }

    fn upsert_counter(&self, key: &DeviceKey, unit: u8, value: f64) -> Result<(), RegistryError> {
        self.with_device(key, unit, |record| record.counter += value)
    }

    fn upsert_state(
        &self,
        key: &DeviceKey,
        unit: u8,
        numeric: i32,
        text: &str,
    ) -> Result<(), RegistryError> {
        self.with_device(key, unit, |record| {
            record.numeric = numeric;
            record.text = text.to_string();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u8) -> NodeAddress {
        NodeAddress::new(raw).unwrap()
    }

    fn counter_key(registry: &MemoryRegistry, gateway: GatewayId, address: u8) -> DeviceKey {
        let node = registry
            .insert_node(gateway, "counter", DeviceKind::CoinCounter, addr(address))
            .unwrap();
        let key = DeviceKey {
            gateway,
            node,
            address: addr(address),
            kind: DeviceKind::CoinCounter,
        };

        registry
            .register_device(&DeviceEntry {
                key,
                unit: 1,
                name: "counter".into(),
                class: DeviceClass::Counter,
                used: true,
            })
            .unwrap();

        key
    }

    #[test]
    fn device_id_format() {
        let key = DeviceKey {
            gateway: 1,
            node: NodeId(0x0102),
            address: addr(0x21),
            kind: DeviceKind::CoinCounter,
        };
        assert_eq!(key.device_id(), "1022108");

        let key = DeviceKey {
            node: NodeId(7),
            address: addr(5),
            kind: DeviceKind::RelayModule5,
            ..key
        };
        assert_eq!(key.device_id(), "007050B");
    }

    #[test]
    fn nodes_get_increasing_ids_per_registry() {
        let registry = MemoryRegistry::new();

        let first = registry
            .insert_node(1, "a", DeviceKind::ActiveMonitor, addr(3))
            .unwrap();
        let second = registry
            .insert_node(2, "b", DeviceKind::ActiveMonitor, addr(3))
            .unwrap();

        assert_eq!(first, NodeId(1));
        assert_eq!(second, NodeId(2));
        assert_eq!(registry.nodes(1).unwrap().len(), 1);
        assert_eq!(registry.node(2, second).unwrap().unwrap().name, "b");
        assert_eq!(registry.node(1, second).unwrap(), None);
    }

    #[test]
    fn counters_accumulate() {
        let registry = MemoryRegistry::new();
        let key = counter_key(&registry, 1, 10);

        registry.upsert_counter(&key, 1, 0.5).unwrap();
        registry.upsert_counter(&key, 1, 2.0).unwrap();

        assert_eq!(registry.device(&key, 1).unwrap().counter, 2.5);
        assert!(matches!(
            registry.upsert_counter(&key, 2, 1.0),
            Err(RegistryError::DeviceNotFound { unit: 2, .. })
        ));
    }

    #[test]
    fn find_device_by_address_or_any() {
        let registry = MemoryRegistry::new();
        let first = counter_key(&registry, 1, 10);
        let second = counter_key(&registry, 1, 11);
        counter_key(&registry, 2, 10);

        assert_eq!(
            registry
                .find_device(1, DeviceKind::CoinCounter, Some(addr(11)))
                .unwrap(),
            Some(second)
        );
        assert_eq!(
            registry.find_device(1, DeviceKind::CoinCounter, None).unwrap(),
            Some(first)
        );
        assert_eq!(
            registry
                .find_device(1, DeviceKind::ActiveMonitor, None)
                .unwrap(),
            None
        );
    }

    #[test]
    fn deletes_are_scoped_to_the_gateway() {
        let registry = MemoryRegistry::new();
        let key = counter_key(&registry, 1, 10);
        counter_key(&registry, 2, 10);

        assert_eq!(registry.delete_device(&key).unwrap(), 1);
        assert_eq!(registry.delete_device(&key).unwrap(), 0);
        assert_eq!(registry.delete_all_nodes(1).unwrap(), 1);
        assert_eq!(registry.delete_all_devices(2).unwrap(), 1);
        assert_eq!(registry.nodes(2).unwrap().len(), 1);
        assert!(registry.devices(2).is_empty());
    }
}
