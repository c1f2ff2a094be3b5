use std::io;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info};

use crate::admin::NodeAdmin;
use crate::bus::Bus;
use crate::command::{Command, CommandError, CommandExchange};
use crate::config::{GatewayConfig, Timing};
use crate::device::DeviceKind;
use crate::dispatcher::{Dispatcher, DispatcherHandle, DispatcherState};
use crate::event::CoinCode;
use crate::handlers::RegistryHandlers;
use crate::identifier::NodeAddress;
use crate::registry::Registry;

/// The operations the host invokes on a hardware instance.
pub trait Hardware {
    /// Starts the receive worker. Starting a running instance does nothing.
    fn start(&mut self) -> Result<(), GatewayError>;

    /// Stops the receive worker and waits for it. Idempotent.
    fn stop(&mut self);

    /// Executes a switch command the host issued for one of the devices.
    fn write(&self, command: &WriteCommand) -> Result<(), WriteError>;

    /// Last liveness timestamp recorded by the receive worker.
    fn last_heartbeat(&self) -> Option<SystemTime>;
}

/// A switch command as the host addresses it: device kind, node address,
/// sub-unit and the commanded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteCommand {
    pub kind: DeviceKind,
    pub node: NodeAddress,
    pub unit: u8,
    pub value: u8,
}

impl WriteCommand {
    pub fn from_raw(kind: u8, node: u8, unit: u8, value: u8) -> Result<Self, WriteError> {
        Ok(Self {
            kind: DeviceKind::try_from(kind).map_err(|_| WriteError::UnknownKind(kind))?,
            node: NodeAddress::new(node).ok_or(WriteError::InvalidAddress(node))?,
            unit,
            value,
        })
    }
}

pub struct Gateway<B: Bus, R: Registry + ?Sized> {
    config: GatewayConfig,
    timing: Timing,
    bus: Arc<B>,
    registry: Arc<R>,
    worker: Option<DispatcherHandle>,
}

impl<B, R> Gateway<B, R>
where
    B: Bus + 'static,
    R: Registry + ?Sized + 'static,
{
    pub fn new(config: GatewayConfig, bus: Arc<B>, registry: Arc<R>) -> Self {
        info!(
            hardware_id = config.hardware_id,
            address = %config.address,
            interface = %config.interface,
            "Gateway created"
        );

        Self {
            config,
            timing: Timing::default(),
            bus,
            registry,
            worker: None,
        }
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Node administration scoped to this gateway.
    pub fn nodes(&self) -> NodeAdmin<R> {
        NodeAdmin::new(self.config.hardware_id, Arc::clone(&self.registry))
    }

    /// Sends one command and waits for the node to acknowledge it.
    pub fn send_command(&self, target: NodeAddress, command: Command) -> Result<(), CommandError> {
        CommandExchange::new(&*self.bus, self.config.address)
            .with_timeout(self.timing.ack_timeout)
            .send(target, command)
    }

    pub fn state(&self) -> DispatcherState {
        self.worker
            .as_ref()
            .map_or(DispatcherState::Stopped, |worker| worker.status().state())
    }
}

impl<B, R> Hardware for Gateway<B, R>
where
    B: Bus + 'static,
    R: Registry + ?Sized + 'static,
{
    fn start(&mut self) -> Result<(), GatewayError> {
        if self.worker.is_some() {
            return Ok(());
        }

        let handlers = RegistryHandlers::new(self.config.hardware_id, Arc::clone(&self.registry));
        let worker = Dispatcher::new(Arc::clone(&self.bus), self.config.address, handlers)
            .with_timing(self.timing)
            .spawn()
            .map_err(GatewayError::Spawn)?;

        self.worker = Some(worker);
        info!(hardware_id = self.config.hardware_id, "Gateway started");

        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
            info!(hardware_id = self.config.hardware_id, "Gateway stopped");
        }
    }

    fn write(&self, command: &WriteCommand) -> Result<(), WriteError> {
        debug!(
            kind = command.kind.name(),
            node = %command.node,
            unit = command.unit,
            value = command.value,
            "Write requested"
        );

        // Only an "on" for a coin sender means anything on the bus
        if !command.kind.is_coin_sender() || command.value != 1 {
            return Ok(());
        }

        let coin = CoinCode::try_from(command.unit).map_err(|_| WriteError::InvalidCoin(command.unit))?;
        self.send_command(command.node, Command::ReleaseCoin(coin))?;

        Ok(())
    }

    fn last_heartbeat(&self) -> Option<SystemTime> {
        self.worker
            .as_ref()
            .and_then(|worker| worker.status().last_heartbeat())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Failed to spawn the receive worker")]
    Spawn(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Received a write for an unknown device kind ({0:?})")]
    UnknownKind(u8),
    #[error("Received a write for an invalid node address ({0:?})")]
    InvalidAddress(u8),
    #[error("Received a write for a unit that is not a coin code ({0:?})")]
    InvalidCoin(u8),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::device::{COUNTER_UNIT, TOTALS_UNIT};
    use crate::frame::Frame;
    use crate::identifier::{CanIdentifier, FunctionCode};
    use crate::registry::{DeviceKey, MemoryRegistry};
    use crate::sim::SimBus;

    fn addr(raw: u8) -> NodeAddress {
        NodeAddress::new(raw).unwrap()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);

        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }

        condition()
    }

    fn gateway(bus: &SimBus) -> (Gateway<SimBus, MemoryRegistry>, Arc<MemoryRegistry>) {
        let registry = Arc::new(MemoryRegistry::new());
        let config = GatewayConfig::from_host(2, "1", "sim0").unwrap();
        let timing = Timing {
            ack_timeout: Duration::from_millis(50),
            ..Timing::default()
        };

        (
            Gateway::new(config, Arc::new(bus.clone()), registry.clone()).with_timing(timing),
            registry,
        )
    }

    /// A coin sender at `address` that acknowledges everything sent to it.
    fn coin_sender(bus: &SimBus, address: NodeAddress) {
        bus.add_responder(move |frame| {
            let request = frame.identifier();

            (request.destination_address() == address).then(|| {
                Frame::empty(CanIdentifier::new(
                    address,
                    request.source_address(),
                    FunctionCode::NodeAck,
                    0,
                ))
            })
        });
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let bus = SimBus::new();
        let (mut gateway, _) = gateway(&bus);

        gateway.start().unwrap();
        gateway.start().unwrap();
        assert!(wait_for(|| gateway.state() == DispatcherState::Listening));
        assert_eq!(bus.opens(), 1);
        assert!(wait_for(|| gateway.last_heartbeat().is_some()));

        gateway.stop();
        gateway.stop();
        assert_eq!(gateway.state(), DispatcherState::Stopped);
        assert_eq!(gateway.last_heartbeat(), None);
        assert_eq!(bus.open_channels(), 0);

        gateway.start().unwrap();
        assert!(wait_for(|| bus.open_channels() == 1));
        gateway.stop();
    }

    #[test]
    fn coin_events_reach_the_registry() {
        let bus = SimBus::new();
        let (mut gateway, registry) = gateway(&bus);

        let counter = gateway
            .nodes()
            .add_node("counter", DeviceKind::CoinCounter, addr(20))
            .unwrap();
        let totals = gateway
            .nodes()
            .add_node("totals", DeviceKind::CoinCounterTotals, addr(21))
            .unwrap();

        gateway.start().unwrap();
        assert!(wait_for(|| bus.open_channels() == 1));

        bus.inject(&Frame::empty(CanIdentifier::new(
            addr(20),
            addr(1),
            FunctionCode::CoinEvent,
            CoinCode::ThreeEuro.into(),
        )));

        let counter_key = DeviceKey {
            gateway: 2,
            node: counter,
            address: addr(20),
            kind: DeviceKind::CoinCounter,
        };
        let totals_key = DeviceKey {
            gateway: 2,
            node: totals,
            address: addr(21),
            kind: DeviceKind::CoinCounterTotals,
        };

        assert!(wait_for(|| {
            registry
                .device(&totals_key, TOTALS_UNIT)
                .is_some_and(|record| record.counter == 3.0)
        }));
        assert_eq!(registry.device(&counter_key, COUNTER_UNIT).unwrap().counter, 3.0);

        gateway.stop();
    }

    #[test]
    fn write_on_releases_a_coin() {
        let bus = SimBus::new();
        coin_sender(&bus, addr(30));
        let (gateway, _) = gateway(&bus);

        gateway
            .write(&WriteCommand::from_raw(3, 30, 4, 1).unwrap())
            .unwrap();

        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].identifier().function(), Ok(FunctionCode::CoinEvent));
        assert_eq!(sent[0].identifier().parameter, 4);
        assert_eq!(sent[0].identifier().destination_address(), addr(30));
    }

    #[test]
    fn other_writes_do_nothing() {
        let bus = SimBus::new();
        let (gateway, _) = gateway(&bus);

        // "off" for a coin sender
        gateway
            .write(&WriteCommand::from_raw(3, 30, 4, 0).unwrap())
            .unwrap();
        // relay module
        gateway
            .write(&WriteCommand::from_raw(11, 30, 2, 1).unwrap())
            .unwrap();

        assert!(bus.sent().is_empty());
    }

    #[test]
    fn write_failures() {
        let bus = SimBus::new();
        let (gateway, _) = gateway(&bus);

        assert!(matches!(
            WriteCommand::from_raw(0, 30, 1, 1),
            Err(WriteError::UnknownKind(0))
        ));
        assert!(matches!(
            WriteCommand::from_raw(1, 200, 1, 1),
            Err(WriteError::InvalidAddress(200))
        ));
        assert!(matches!(
            gateway.write(&WriteCommand::from_raw(1, 30, 3, 1).unwrap()),
            Err(WriteError::InvalidCoin(3))
        ));
        assert!(matches!(
            gateway.write(&WriteCommand::from_raw(1, 30, 1, 1).unwrap()),
            Err(WriteError::Command(CommandError::NoResponse { .. }))
        ));
    }

    #[test]
    fn remove_all_nodes_leaves_no_devices() {
        let bus = SimBus::new();
        let (gateway, registry) = gateway(&bus);
        let admin = gateway.nodes();

        for (index, kind) in DeviceKind::ALL.into_iter().enumerate() {
            admin.add_node("node", kind, addr(index as u8 + 2)).unwrap();
        }
        assert_eq!(registry.devices(2).len(), 7 + 3 + 5);

        admin.remove_all_nodes().unwrap();
        assert!(registry.devices(2).is_empty());
        assert!(admin.list_nodes().unwrap().is_empty());
    }
}
