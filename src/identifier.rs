use core::fmt;

use embedded_can::ExtendedId;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/* Field layout of the 32-bit identifier word */

pub const DESTINATION_SHIFT: u32 = 0;
pub const SOURCE_SHIFT: u32 = 7;
pub const FIRST_FRAGMENT_SHIFT: u32 = 14;
pub const LAST_FRAGMENT_SHIFT: u32 = 15;
pub const FUNCTION_SHIFT: u32 = 16;
pub const PARAMETER_SHIFT: u32 = 22;
pub const ERROR_FLAG_SHIFT: u32 = 29;
pub const RTR_FLAG_SHIFT: u32 = 30;
pub const EXTENDED_FLAG_SHIFT: u32 = 31;

pub const DESTINATION_MASK: u32 = 0x7F << DESTINATION_SHIFT;
pub const SOURCE_MASK: u32 = 0x7F << SOURCE_SHIFT;
pub const FIRST_FRAGMENT_MASK: u32 = 0x1 << FIRST_FRAGMENT_SHIFT;
pub const LAST_FRAGMENT_MASK: u32 = 0x1 << LAST_FRAGMENT_SHIFT;
pub const FUNCTION_MASK: u32 = 0x3F << FUNCTION_SHIFT;
pub const PARAMETER_MASK: u32 = 0x7F << PARAMETER_SHIFT;
pub const ERROR_FLAG_MASK: u32 = 0x1 << ERROR_FLAG_SHIFT;
pub const RTR_FLAG_MASK: u32 = 0x1 << RTR_FLAG_SHIFT;
pub const EXTENDED_FLAG_MASK: u32 = 0x1 << EXTENDED_FLAG_SHIFT;

/// Bits of the identifier word that travel in the 29-bit extended arbitration field.
pub const ARBITRATION_MASK: u32 = 0x1FFF_FFFF;

/// A 7-bit node address on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(u8);

impl NodeAddress {
    /// Reserved address meaning "all nodes"
    pub const BROADCAST: Self = Self(0x7F);

    /// Returns `None` if `raw` does not fit in 7 bits.
    pub const fn new(raw: u8) -> Option<Self> {
        if raw <= 0x7F {
            Some(Self(raw))
        } else {
            None
        }
    }

    pub const fn as_raw(self) -> u8 {
        self.0
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u8> for NodeAddress {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or(raw)
    }
}

/// Operation selector carried in the 6-bit function field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[num_enum(error_type(name = UnknownFunctionCode, constructor = UnknownFunctionCode))]
#[repr(u8)]
pub enum FunctionCode {
    Rtc = 0,
    SetRtc = 1,
    CoinEvent = 2,
    ActiveEvent = 3,
    ActiveStatus = 4,
    NodePing = 5,
    NodeAck = 6,
    FirmwareVersion = 7,
    NodeUdid = 8,
    SetNodeId = 9,
    FirmwareTransferStart = 10,
    FirmwareTransferEnd = 11,
    FirmwareTransferDword = 12,
    Reset = 13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Received a function code that is not part of the protocol ({0:?})")]
pub struct UnknownFunctionCode(pub u8);

/// The structured form of the 32-bit extended identifier word.
///
/// Every field is stored raw so that [`CanIdentifier::decode`] is total and
/// `decode(encode(x)) == x` holds for any value that fits its declared width.
/// Callers building identifiers by hand must keep each field within its
/// width; out-of-range values are a programming error and are masked off
/// (and caught by a debug assertion) during [`CanIdentifier::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CanIdentifier {
    /// 7 bits
    pub destination: u8,
    /// 7 bits
    pub source: u8,
    pub first_fragment: bool,
    pub last_fragment: bool,
    /// 6 bits, see [`FunctionCode`]
    pub function: u8,
    /// 7 bits, meaning depends on the function
    pub parameter: u8,
    pub error: bool,
    pub rtr: bool,
    pub extended: bool,
}

impl CanIdentifier {
    /// Builds a single-frame identifier with the extended flag set, which is
    /// the shape of every frame the gateway transmits.
    pub fn new(
        source: NodeAddress,
        destination: NodeAddress,
        function: FunctionCode,
        parameter: u8,
    ) -> Self {
        Self {
            destination: destination.as_raw(),
            source: source.as_raw(),
            function: function.into(),
            parameter,
            extended: true,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> u32 {
        debug_assert!(self.destination <= 0x7F, "destination out of range");
        debug_assert!(self.source <= 0x7F, "source out of range");
        debug_assert!(self.function <= 0x3F, "function out of range");
        debug_assert!(self.parameter <= 0x7F, "parameter out of range");

        ((self.destination as u32) << DESTINATION_SHIFT) & DESTINATION_MASK
            | ((self.source as u32) << SOURCE_SHIFT) & SOURCE_MASK
            | (self.first_fragment as u32) << FIRST_FRAGMENT_SHIFT
            | (self.last_fragment as u32) << LAST_FRAGMENT_SHIFT
            | ((self.function as u32) << FUNCTION_SHIFT) & FUNCTION_MASK
            | ((self.parameter as u32) << PARAMETER_SHIFT) & PARAMETER_MASK
            | (self.error as u32) << ERROR_FLAG_SHIFT
            | (self.rtr as u32) << RTR_FLAG_SHIFT
            | (self.extended as u32) << EXTENDED_FLAG_SHIFT
    }

    pub const fn decode(raw: u32) -> Self {
        Self {
            destination: ((raw & DESTINATION_MASK) >> DESTINATION_SHIFT) as u8,
            source: ((raw & SOURCE_MASK) >> SOURCE_SHIFT) as u8,
            first_fragment: raw & FIRST_FRAGMENT_MASK != 0,
            last_fragment: raw & LAST_FRAGMENT_MASK != 0,
            function: ((raw & FUNCTION_MASK) >> FUNCTION_SHIFT) as u8,
            parameter: ((raw & PARAMETER_MASK) >> PARAMETER_SHIFT) as u8,
            error: raw & ERROR_FLAG_MASK != 0,
            rtr: raw & RTR_FLAG_MASK != 0,
            extended: raw & EXTENDED_FLAG_MASK != 0,
        }
    }

    /// Maps the raw function field onto the known function codes.
    pub fn function(&self) -> Result<FunctionCode, UnknownFunctionCode> {
        FunctionCode::try_from(self.function)
    }

    pub fn source_address(&self) -> NodeAddress {
        NodeAddress(self.source & 0x7F)
    }

    pub fn destination_address(&self) -> NodeAddress {
        NodeAddress(self.destination & 0x7F)
    }

    /// The lower 29 bits as an `embedded_can` extended ID (the flag bits are
    /// not part of the arbitration field).
    pub fn arbitration_id(&self) -> ExtendedId {
        ExtendedId::new(self.encode() & ARBITRATION_MASK).unwrap_or(ExtendedId::ZERO)
    }
}

impl From<u32> for CanIdentifier {
    fn from(raw: u32) -> Self {
        Self::decode(raw)
    }
}

impl From<CanIdentifier> for u32 {
    fn from(id: CanIdentifier) -> Self {
        id.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(raw: u8) -> NodeAddress {
        NodeAddress::new(raw).unwrap()
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let samples = [
            CanIdentifier::default(),
            CanIdentifier {
                destination: 0x7F,
                source: 0x7F,
                first_fragment: true,
                last_fragment: true,
                function: 0x3F,
                parameter: 0x7F,
                error: true,
                rtr: true,
                extended: true,
            },
            CanIdentifier {
                destination: 1,
                source: 100,
                first_fragment: true,
                function: FunctionCode::FirmwareTransferDword.into(),
                parameter: 64,
                extended: true,
                ..Default::default()
            },
            CanIdentifier {
                destination: 0x55,
                source: 0x2A,
                last_fragment: true,
                function: 0x2A,
                parameter: 0x55,
                rtr: true,
                ..Default::default()
            },
        ];

        for id in samples {
            assert_eq!(CanIdentifier::decode(id.encode()), id);
        }
    }

    #[test]
    fn fields_land_on_the_node_firmware_bit_positions() {
        let id = CanIdentifier::new(addr(3), addr(10), FunctionCode::CoinEvent, 4);

        assert_eq!(id.encode(), 10 | (3 << 7) | (2 << 16) | (4 << 22) | (1 << 31));
        assert_eq!(
            CanIdentifier::decode(0x8000_0000 | 0x7F),
            CanIdentifier {
                destination: 0x7F,
                extended: true,
                ..Default::default()
            }
        );
    }

    #[test]
    fn parameter_does_not_disturb_addresses() {
        let base = CanIdentifier::new(addr(0x15), addr(0x6A), FunctionCode::ActiveEvent, 0);

        for parameter in [1, 0x40, 0x7F] {
            let changed = CanIdentifier { parameter, ..base }.encode();

            assert_eq!(changed & (DESTINATION_MASK | SOURCE_MASK), base.encode() & (DESTINATION_MASK | SOURCE_MASK));
            assert_eq!(CanIdentifier::decode(changed).source_address(), addr(0x15));
            assert_eq!(CanIdentifier::decode(changed).destination_address(), addr(0x6A));
        }
    }

    #[test]
    fn unknown_function_codes_still_decode() {
        let id = CanIdentifier::decode(0x3F << FUNCTION_SHIFT);

        assert_eq!(id.function, 0x3F);
        assert_eq!(id.function(), Err(UnknownFunctionCode(0x3F)));
        assert_eq!(
            CanIdentifier::decode(6 << FUNCTION_SHIFT).function(),
            Ok(FunctionCode::NodeAck)
        );
    }

    #[test]
    fn arbitration_id_drops_the_flag_bits() {
        let mut id = CanIdentifier::new(addr(1), addr(2), FunctionCode::NodeAck, 0x7F);
        id.rtr = true;
        id.error = true;

        assert_eq!(id.arbitration_id().as_raw(), id.encode() & ARBITRATION_MASK);
        assert_eq!(id.arbitration_id().as_raw() & !ARBITRATION_MASK, 0);
    }

    #[test]
    fn node_address_range() {
        assert_eq!(NodeAddress::new(0x7F), Some(NodeAddress::BROADCAST));
        assert!(NodeAddress::BROADCAST.is_broadcast());
        assert_eq!(NodeAddress::new(0x80), None);
        assert_eq!(NodeAddress::try_from(200), Err(200));
    }
}
