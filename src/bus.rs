use std::io;
use std::time::Duration;

use crate::frame::{Frame, FrameParseError};
use crate::identifier::{
    CanIdentifier, FunctionCode, NodeAddress, DESTINATION_MASK, EXTENDED_FLAG_MASK, FUNCTION_MASK,
    SOURCE_MASK,
};

/// Receive timeout used by long-lived listening channels so that polling
/// never holds up a stop request for long.
pub const LISTEN_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// A kernel-style acceptance filter: a frame passes when
/// `frame_id & mask == id & mask`, flag bits included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub id: u32,
    pub mask: u32,
}

impl Filter {
    /// Extended frames addressed to `address`.
    pub const fn destination(address: NodeAddress) -> Self {
        Self {
            id: address.as_raw() as u32 | EXTENDED_FLAG_MASK,
            mask: DESTINATION_MASK | EXTENDED_FLAG_MASK,
        }
    }

    /// The acknowledge that `target` sends back to `own` after a command.
    pub fn acknowledge(own: NodeAddress, target: NodeAddress) -> Self {
        let expected = CanIdentifier {
            destination: own.as_raw(),
            source: target.as_raw(),
            function: FunctionCode::NodeAck.into(),
            ..Default::default()
        };

        Self {
            id: expected.encode(),
            mask: DESTINATION_MASK | SOURCE_MASK | FUNCTION_MASK,
        }
    }

    pub const fn matches(&self, raw_id: u32) -> bool {
        raw_id & self.mask == self.id & self.mask
    }
}

/// Something that can hand out independent channels onto one CAN bus.
///
/// Every channel has its own filter set, so a channel opened for a one-shot
/// command exchange never disturbs a long-lived listening channel.
pub trait Bus: Send + Sync {
    type Channel: Channel + Send;

    /// Opens a channel that only observes frames passing at least one of
    /// `filters`.
    fn open(&self, filters: &[Filter]) -> Result<Self::Channel, BusError>;

    /// Human readable name of the underlying interface, for logs.
    fn interface(&self) -> &str;
}

pub trait Channel {
    /// Returns the next frame passing the channel's filters, or `None` when
    /// nothing arrived within `timeout`.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, BusError>;

    /// Writes exactly one frame.
    fn send(&mut self, frame: &Frame) -> Result<(), BusError>;

    /// Releases the channel. Calling it more than once is harmless.
    fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to open a CAN socket on interface {interface:?}")]
    Open {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("The kernel rejected the CAN receive filters (CAN_RAW_FILTER not supported?)")]
    FilterUnsupported(#[source] io::Error),
    #[error("Failed to read from the CAN socket")]
    Read(#[source] io::Error),
    #[error("Failed to write a CAN frame")]
    Write(#[source] io::Error),
    #[error("Received a malformed CAN frame")]
    Frame(#[from] FrameParseError),
    #[error("The channel has already been closed")]
    Closed,
}

impl BusError {
    /// Whether this is the partial read case, which is dropped and logged
    /// rather than treated as a socket failure.
    pub fn is_short_frame(&self) -> bool {
        matches!(self, Self::Frame(FrameParseError::ShortFrame(_)))
    }
}

/// Opens the gateway's listening channel: frames addressed to `own_address`
/// and broadcast frames.
pub fn open_listener<B: Bus>(bus: &B, own_address: NodeAddress) -> Result<B::Channel, BusError> {
    bus.open(&[
        Filter::destination(own_address),
        Filter::destination(NodeAddress::BROADCAST),
    ])
}
