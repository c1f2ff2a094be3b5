use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::frame::Frame;
use crate::identifier::{CanIdentifier, FunctionCode, NodeAddress, UnknownFunctionCode};

/// An event reported by a node and consumed by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub source: NodeAddress,
    pub kind: EventKind,
    /// Node clock at the moment of the event, when the node sent one
    pub time: Option<NodeTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A coin went through a coin counter
    Coin(CoinCode),
    /// An activity monitor changed state
    Activity(ActivityState),
}

/// Coin denominations, encoded in half-euro units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[num_enum(error_type(name = EventParseError, constructor = EventParseError::InvalidCoinCode))]
#[repr(u8)]
pub enum CoinCode {
    FiftyCents = 1,
    OneEuro = 2,
    TwoEuro = 4,
    ThreeEuro = 6,
    FourEuro = 8,
    FiveEuro = 10,
    SixEuro = 12,
}

impl CoinCode {
    /// Value in euros. This is the raw code halved.
    pub fn value(self) -> f64 {
        u8::from(self) as f64 / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[num_enum(error_type(name = EventParseError, constructor = EventParseError::InvalidActivityState))]
#[repr(u8)]
pub enum ActivityState {
    Inactive = 0,
    Active = 1,
}

impl ActivityState {
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

/// Wall clock of a node, sent as BCD bytes `yy mm dd HH MM SS` at the
/// start of an event frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl NodeTime {
    const LENGTH: usize = 6;

    /// Returns `None` if there are fewer than six bytes or one of them is
    /// not valid BCD.
    pub fn from_bcd(data: &[u8]) -> Option<Self> {
        let bytes: &[u8; Self::LENGTH] = data.get(..Self::LENGTH)?.try_into().ok()?;

        Some(Self {
            year: 2000 + bcd_to_u8(bytes[0])? as u16,
            month: bcd_to_u8(bytes[1])?,
            day: bcd_to_u8(bytes[2])?,
            hour: bcd_to_u8(bytes[3])?,
            minute: bcd_to_u8(bytes[4])?,
            second: bcd_to_u8(bytes[5])?,
        })
    }
}

fn bcd_to_u8(byte: u8) -> Option<u8> {
    let (tens, units) = (byte >> 4, byte & 0xF);

    if tens > 9 || units > 9 {
        return None;
    }

    Some(tens * 10 + units)
}

impl Event {
    pub fn function(&self) -> FunctionCode {
        match self.kind {
            EventKind::Coin(_) => FunctionCode::CoinEvent,
            EventKind::Activity(_) => FunctionCode::ActiveEvent,
        }
    }

    /// Decodes the event carried by an identifier. Returns `Ok(None)` for
    /// function codes that are valid but not events the gateway consumes.
    pub fn from_identifier(identifier: &CanIdentifier) -> Result<Option<Self>, EventParseError> {
        let kind = match identifier.function()? {
            FunctionCode::CoinEvent => EventKind::Coin(identifier.parameter.try_into()?),
            FunctionCode::ActiveEvent => EventKind::Activity(identifier.parameter.try_into()?),
            _ => return Ok(None),
        };

        Ok(Some(Self {
            source: identifier.source_address(),
            kind,
            time: None,
        }))
    }

    pub fn from_frame(frame: &Frame) -> Result<Option<Self>, EventParseError> {
        Ok(Self::from_identifier(&frame.identifier())?.map(|event| Self {
            time: NodeTime::from_bcd(frame.data()),
            ..event
        }))
    }
}

/// Reasons an inbound frame could not be turned into an event. These only
/// ever cause the frame to be dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventParseError {
    #[error(transparent)]
    UnknownFunction(#[from] UnknownFunctionCode),
    #[error("Received a coin event with an unrecognized coin code ({0:?})")]
    InvalidCoinCode(u8),
    #[error("Received an activity event with an invalid state ({0:?})")]
    InvalidActivityState(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u8) -> NodeAddress {
        NodeAddress::new(raw).unwrap()
    }

    fn identifier(function: FunctionCode, parameter: u8) -> CanIdentifier {
        CanIdentifier::new(addr(33), addr(1), function, parameter)
    }

    #[test]
    fn coin_values_are_half_the_code() {
        assert_eq!(CoinCode::FiftyCents.value(), 0.5);
        assert_eq!(CoinCode::TwoEuro.value(), 2.0);
        assert_eq!(CoinCode::ThreeEuro.value(), 3.0);
        assert_eq!(CoinCode::SixEuro.value(), 6.0);
        assert_eq!(CoinCode::try_from(3), Err(EventParseError::InvalidCoinCode(3)));
    }

    #[test]
    fn decode_events() {
        assert_eq!(
            Event::from_identifier(&identifier(FunctionCode::CoinEvent, 4)),
            Ok(Some(Event {
                source: addr(33),
                kind: EventKind::Coin(CoinCode::TwoEuro),
                time: None,
            }))
        );

        assert_eq!(
            Event::from_identifier(&identifier(FunctionCode::ActiveEvent, 1)),
            Ok(Some(Event {
                source: addr(33),
                kind: EventKind::Activity(ActivityState::Active),
                time: None,
            }))
        );

        for function in [FunctionCode::CoinEvent, FunctionCode::ActiveEvent] {
            let event = Event::from_identifier(&identifier(function, 1))
                .unwrap()
                .unwrap();
            assert_eq!(event.function(), function);
        }
    }

    #[test]
    fn decode_errors() {
        assert_eq!(
            Event::from_identifier(&identifier(FunctionCode::CoinEvent, 5)),
            Err(EventParseError::InvalidCoinCode(5))
        );
        assert_eq!(
            Event::from_identifier(&identifier(FunctionCode::ActiveEvent, 2)),
            Err(EventParseError::InvalidActivityState(2))
        );

        let mut unknown = identifier(FunctionCode::Reset, 0);
        unknown.function = 0x30;

        assert_eq!(
            Event::from_identifier(&unknown),
            Err(EventParseError::UnknownFunction(UnknownFunctionCode(0x30)))
        );
    }

    #[test]
    fn other_functions_are_not_events() {
        for function in [FunctionCode::NodeAck, FunctionCode::NodePing, FunctionCode::Rtc] {
            assert_eq!(Event::from_identifier(&identifier(function, 0)), Ok(None));
        }
    }

    #[test]
    fn node_time_from_payload() {
        let frame = Frame::with_data(
            identifier(FunctionCode::CoinEvent, 1),
            &[0x24, 0x12, 0x31, 0x23, 0x59, 0x07],
        )
        .unwrap();

        let event = Event::from_frame(&frame).unwrap().unwrap();

        assert_eq!(event.kind, EventKind::Coin(CoinCode::FiftyCents));
        assert_eq!(
            event.time,
            Some(NodeTime {
                year: 2024,
                month: 12,
                day: 31,
                hour: 23,
                minute: 59,
                second: 7,
            })
        );

        assert_eq!(NodeTime::from_bcd(&[0x24, 0x12]), None);
        assert_eq!(NodeTime::from_bcd(&[0x2A, 0x12, 0x31, 0x23, 0x59, 0x07]), None);
    }
}
