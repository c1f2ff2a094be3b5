use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::bus::{Bus, BusError, Channel, Filter};
use crate::event::CoinCode;
use crate::frame::Frame;
use crate::identifier::{CanIdentifier, FunctionCode, NodeAddress};

/// How long a node has to acknowledge a command.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// A command the gateway issues to a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Release one coin of the given denomination
    ReleaseCoin(CoinCode),
    Ping,
    Reset,
}

impl Command {
    pub fn function(&self) -> FunctionCode {
        match self {
            Self::ReleaseCoin(_) => FunctionCode::CoinEvent,
            Self::Ping => FunctionCode::NodePing,
            Self::Reset => FunctionCode::Reset,
        }
    }

    pub fn parameter(&self) -> u8 {
        match self {
            Self::ReleaseCoin(coin) => (*coin).into(),
            Self::Ping | Self::Reset => 0,
        }
    }

    /// The frame carrying this command from `source` to `target`. Commands
    /// never carry data.
    pub fn frame(&self, source: NodeAddress, target: NodeAddress) -> Frame {
        Frame::empty(CanIdentifier::new(
            source,
            target,
            self.function(),
            self.parameter(),
        ))
    }
}

/// Delivers commands and waits for their acknowledge.
///
/// Every [`CommandExchange::send`] opens its own channel filtered down to the
/// expected acknowledge and closes it before returning, so commands can be
/// issued while the receive dispatcher is listening on the same bus.
pub struct CommandExchange<'a, B: Bus> {
    bus: &'a B,
    own_address: NodeAddress,
    timeout: Duration,
}

impl<'a, B: Bus> CommandExchange<'a, B> {
    pub fn new(bus: &'a B, own_address: NodeAddress) -> Self {
        Self {
            bus,
            own_address,
            timeout: ACK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn send(&self, target: NodeAddress, command: Command) -> Result<(), CommandError> {
        let mut channel = self
            .bus
            .open(&[Filter::acknowledge(self.own_address, target)])?;

        let result = self.exchange(&mut channel, target, command);
        channel.close();

        match &result {
            Ok(()) => info!(node = %target, ?command, "Command acknowledged"),
            Err(err) => warn!(node = %target, ?command, error = %err, "Command failed"),
        }

        result
    }

    fn exchange(
        &self,
        channel: &mut B::Channel,
        target: NodeAddress,
        command: Command,
    ) -> Result<(), CommandError> {
        channel.send(&command.frame(self.own_address, target))?;

        let deadline = Instant::now() + self.timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            if remaining.is_zero() {
                return Err(CommandError::NoResponse { node: target });
            }

            let Some(frame) = channel.receive(remaining)? else {
                continue;
            };

            let identifier = frame.identifier();

            // Anything queued before the filter was installed
            if identifier.destination_address() != self.own_address
                || identifier.source_address() != target
                || identifier.function() != Ok(FunctionCode::NodeAck)
            {
                continue;
            }

            return if identifier.rtr {
                Err(CommandError::NegativeAck { node: target })
            } else {
                Ok(())
            };
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("Node {node} did not acknowledge the command in time")]
    NoResponse { node: NodeAddress },
    #[error("Node {node} rejected the command")]
    NegativeAck { node: NodeAddress },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameParseError;
    use crate::sim::{Reply, SimBus};

    const OWN: NodeAddress = match NodeAddress::new(1) {
        Some(address) => address,
        None => unreachable!(),
    };

    fn addr(raw: u8) -> NodeAddress {
        NodeAddress::new(raw).unwrap()
    }

    /// A node at `address` that answers every frame sent to it.
    fn node(bus: &SimBus, address: NodeAddress, negative: bool) {
        bus.add_responder(move |frame| {
            let request = frame.identifier();

            if request.destination_address() != address {
                return None;
            }

            let mut ack = CanIdentifier::new(address, request.source_address(), FunctionCode::NodeAck, 0);
            ack.rtr = negative;

            Some(Frame::empty(ack))
        });
    }

    #[test]
    fn command_frames() {
        let frame = Command::ReleaseCoin(CoinCode::TwoEuro).frame(OWN, addr(30));
        let identifier = frame.identifier();

        assert_eq!(identifier.encode(), 30 | (1 << 7) | (2 << 16) | (4 << 22) | (1 << 31));
        assert_eq!(frame.dlc(), 0);

        assert_eq!(Command::Ping.frame(OWN, addr(30)).identifier().function(), Ok(FunctionCode::NodePing));
        assert_eq!(Command::Reset.parameter(), 0);
    }

    #[test]
    fn acknowledged() {
        let bus = SimBus::new();
        node(&bus, addr(30), false);

        CommandExchange::new(&bus, OWN)
            .send(addr(30), Command::ReleaseCoin(CoinCode::OneEuro))
            .unwrap();

        assert_eq!(bus.open_channels(), 0);
        assert_eq!(bus.sent().len(), 1);
        assert_eq!(bus.sent()[0].identifier().parameter, 2);
    }

    #[test]
    fn negative_acknowledge() {
        let bus = SimBus::new();
        node(&bus, addr(30), true);

        let result = CommandExchange::new(&bus, OWN).send(addr(30), Command::Ping);

        assert!(matches!(result, Err(CommandError::NegativeAck { node }) if node == addr(30)));
        assert_eq!(bus.open_channels(), 0);
    }

    #[test]
    fn no_response() {
        let bus = SimBus::new();
        // Answers for a different node, so the acknowledge filter drops it
        node(&bus, addr(31), false);

        let started = Instant::now();
        let result = CommandExchange::new(&bus, OWN)
            .with_timeout(Duration::from_millis(50))
            .send(addr(30), Command::Reset);

        assert!(matches!(result, Err(CommandError::NoResponse { node }) if node == addr(30)));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(bus.open_channels(), 0);
    }

    #[test]
    fn short_acknowledge_frame() {
        let bus = SimBus::new();
        bus.add_raw_responder(|_| Some(Reply::Raw(vec![0; 12])));

        let result = CommandExchange::new(&bus, OWN).send(addr(30), Command::Ping);

        assert!(matches!(
            result,
            Err(CommandError::Bus(BusError::Frame(FrameParseError::ShortFrame(12))))
        ));
        assert_eq!(bus.open_channels(), 0);
    }

    #[test]
    fn filter_rejected() {
        let bus = SimBus::new();
        bus.reject_filters(true);

        let result = CommandExchange::new(&bus, OWN).send(addr(30), Command::Ping);

        assert!(matches!(
            result,
            Err(CommandError::Bus(BusError::FilterUnsupported(_)))
        ));
        assert!(bus.sent().is_empty());
    }
}
