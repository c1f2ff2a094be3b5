use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::{DeviceKind, ACTIVITY_UNIT, COUNTER_UNIT, TOTALS_UNIT};
use crate::event::{Event, EventKind};
use crate::identifier::NodeAddress;
use crate::registry::{GatewayId, Registry, RegistryError};

/// Receives every event the dispatcher decodes, in arrival order.
pub trait EventSink: Send {
    fn handle(&mut self, event: &Event);
}

impl<F> EventSink for F
where
    F: FnMut(&Event) + Send,
{
    fn handle(&mut self, event: &Event) {
        self(event)
    }
}

/// Translates events into registry updates. Holds no state between events.
pub struct RegistryHandlers<R: Registry + ?Sized> {
    gateway: GatewayId,
    registry: Arc<R>,
}

impl<R: Registry + ?Sized> RegistryHandlers<R> {
    pub fn new(gateway: GatewayId, registry: Arc<R>) -> Self {
        Self { gateway, registry }
    }

    /// Applies one event and returns how many registry entries were updated.
    /// Devices that are not configured are skipped.
    ///
    /// A coin updates the counter and the totals independently. When either
    /// update fails the other is still attempted and the first error returned.
    pub fn apply(&self, event: &Event) -> Result<usize, RegistryError> {
        match event.kind {
            EventKind::Coin(coin) => {
                let value = coin.value();

                let counter = self.add_to_counter(
                    DeviceKind::CoinCounter,
                    Some(event.source),
                    COUNTER_UNIT,
                    value,
                );
                // One totals node per gateway, wherever it sits on the bus
                let totals =
                    self.add_to_counter(DeviceKind::CoinCounterTotals, None, TOTALS_UNIT, value);

                Ok(counter? + totals?)
            }
            EventKind::Activity(state) => {
                let Some(key) = self.registry.find_device(
                    self.gateway,
                    DeviceKind::ActiveMonitor,
                    Some(event.source),
                )?
                else {
                    return Ok(0);
                };

                let (numeric, text) = if state.is_active() { (1, "1") } else { (0, "0") };
                self.registry
                    .upsert_state(&key, ACTIVITY_UNIT, numeric, text)?;

                Ok(1)
            }
        }
    }

    fn add_to_counter(
        &self,
        kind: DeviceKind,
        address: Option<NodeAddress>,
        unit: u8,
        value: f64,
    ) -> Result<usize, RegistryError> {
        let Some(key) = self.registry.find_device(self.gateway, kind, address)? else {
            return Ok(0);
        };

        self.registry.upsert_counter(&key, unit, value)?;
        Ok(1)
    }
}

impl<R: Registry + ?Sized> EventSink for RegistryHandlers<R> {
    fn handle(&mut self, event: &Event) {
        match self.apply(event) {
            Ok(0) => debug!(node = %event.source, kind = ?event.kind, "No configured device for event"),
            Ok(updated) => debug!(node = %event.source, kind = ?event.kind, updated, "Event applied"),
            Err(err) => warn!(node = %event.source, kind = ?event.kind, error = %err, "Failed to apply event"),
        }
    }
}
