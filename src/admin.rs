use std::sync::Arc;

use tracing::info;

use crate::device::DeviceKind;
use crate::identifier::NodeAddress;
use crate::registry::{DeviceEntry, DeviceKey, GatewayId, Node, NodeId, Registry, RegistryError};

/// Node management for one gateway: every change to a node keeps the
/// registry's sub-devices for that node in step.
pub struct NodeAdmin<R: Registry + ?Sized> {
    gateway: GatewayId,
    registry: Arc<R>,
}

impl<R: Registry + ?Sized> NodeAdmin<R> {
    pub fn new(gateway: GatewayId, registry: Arc<R>) -> Self {
        Self { gateway, registry }
    }

    /// Adds a node and registers its sub-devices. Adding a node identical to
    /// an existing one changes nothing and returns the existing id.
    pub fn add_node(
        &self,
        name: &str,
        kind: DeviceKind,
        address: NodeAddress,
    ) -> Result<NodeId, AdminError> {
        validate(name, address)?;

        if let Some(existing) = self
            .registry
            .nodes(self.gateway)?
            .into_iter()
            .find(|node| node.name == name && node.kind == kind && node.address == address)
        {
            return Ok(existing.id);
        }

        let id = self.registry.insert_node(self.gateway, name, kind, address)?;
        let node = Node {
            id,
            name: name.to_string(),
            kind,
            address,
        };

        self.register_devices(&node)?;
        info!(gateway = self.gateway, node = %id, kind = kind.name(), %address, "Node added");

        Ok(id)
    }

    /// Rewrites a node and replaces its sub-devices.
    pub fn update_node(
        &self,
        id: NodeId,
        name: &str,
        kind: DeviceKind,
        address: NodeAddress,
    ) -> Result<(), AdminError> {
        validate(name, address)?;

        let old = self
            .registry
            .node(self.gateway, id)?
            .ok_or(AdminError::NodeNotFound(id))?;

        self.registry
            .delete_device(&DeviceKey::for_node(self.gateway, &old))?;

        let node = Node {
            id,
            name: name.to_string(),
            kind,
            address,
        };

        if !self.registry.update_node(self.gateway, &node)? {
            return Err(AdminError::NodeNotFound(id));
        }

        self.register_devices(&node)?;
        info!(gateway = self.gateway, node = %id, kind = kind.name(), %address, "Node updated");

        Ok(())
    }

    pub fn remove_node(&self, id: NodeId) -> Result<(), AdminError> {
        let node = self
            .registry
            .node(self.gateway, id)?
            .ok_or(AdminError::NodeNotFound(id))?;

        self.registry
            .delete_device(&DeviceKey::for_node(self.gateway, &node))?;
        self.registry.delete_node(self.gateway, id)?;

        info!(gateway = self.gateway, node = %id, "Node removed");
        Ok(())
    }

    /// Deletes every node and every device of the gateway, including devices
    /// that no longer belong to a node. Returns the number of nodes removed.
    pub fn remove_all_nodes(&self) -> Result<usize, AdminError> {
        let nodes = self.registry.delete_all_nodes(self.gateway)?;
        let devices = self.registry.delete_all_devices(self.gateway)?;

        info!(gateway = self.gateway, nodes, devices, "All nodes removed");
        Ok(nodes)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>, AdminError> {
        Ok(self.registry.nodes(self.gateway)?)
    }

    fn register_devices(&self, node: &Node) -> Result<(), RegistryError> {
        let key = DeviceKey::for_node(self.gateway, node);

        for device in node.kind.sub_devices(&node.name) {
            self.registry.register_device(&DeviceEntry {
                key,
                unit: device.unit,
                name: device.name,
                class: device.class,
                used: device.used,
            })?;
        }

        Ok(())
    }
}

fn validate(name: &str, address: NodeAddress) -> Result<(), AdminError> {
    if name.trim().is_empty() {
        return Err(AdminError::EmptyName);
    }

    if address.is_broadcast() {
        return Err(AdminError::InvalidAddress(address));
    }

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("No node with id {0} exists on this gateway")]
    NodeNotFound(NodeId),
    #[error("Node address {0} is reserved for broadcast")]
    InvalidAddress(NodeAddress),
    #[error("A node needs a name")]
    EmptyName,
}
