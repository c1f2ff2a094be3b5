use embedded_can::Id;
use heapless::Vec;

use crate::identifier::{CanIdentifier, ARBITRATION_MASK};

/// Size of one classic CAN frame on a raw socket (`struct can_frame`).
pub const CAN_MTU: usize = 16;

/// Maximum number of data bytes in a classic CAN frame.
pub const MAX_DATA_LENGTH: usize = 8;

const DLC_OFFSET: usize = 4;
const DATA_OFFSET: usize = 8;

/// A classic CAN frame addressed with the gateway's structured identifier.
///
/// The identifier keeps the flag bits (`rtr`, `error`, `extended`) exactly as
/// they travel in the first word of the raw frame. A remote frame has a DLC
/// but no data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    identifier: CanIdentifier,
    dlc: u8,
    data: Vec<u8, MAX_DATA_LENGTH>,
}

impl Frame {
    /// Creates a data frame. `data` must have a length in the range 0..=8 or
    /// else `None` will be returned instead.
    pub fn with_data(identifier: CanIdentifier, data: &[u8]) -> Option<Self> {
        let data = Vec::from_slice(data).ok()?;

        Some(Self {
            identifier,
            dlc: data.len() as u8,
            data,
        })
    }

    /// Creates a frame without payload, the shape of every command the
    /// gateway sends.
    pub fn empty(identifier: CanIdentifier) -> Self {
        Self {
            identifier,
            dlc: 0,
            data: Vec::new(),
        }
    }

    pub fn identifier(&self) -> CanIdentifier {
        self.identifier
    }

    /// Gets the DLC (Data Length Code) of the frame
    pub fn dlc(&self) -> usize {
        self.dlc as usize
    }

    /// Gets the data associated with the frame (empty for remote frames)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_remote(&self) -> bool {
        self.identifier.rtr
    }

    /// Parses one raw frame as read from the socket. Anything that is not
    /// exactly [`CAN_MTU`] bytes long is rejected instead of partially
    /// interpreted.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self, FrameParseError> {
        let buffer: &[u8; CAN_MTU] = buffer
            .try_into()
            .map_err(|_| FrameParseError::ShortFrame(buffer.len()))?;

        let raw_id = u32::from_ne_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        let identifier = CanIdentifier::decode(raw_id);
        let dlc = buffer[DLC_OFFSET];

        if dlc as usize > MAX_DATA_LENGTH {
            return Err(FrameParseError::InvalidDataLengthCode(dlc));
        }

        let data = if identifier.rtr {
            Vec::new()
        } else {
            Vec::from_slice(&buffer[DATA_OFFSET..DATA_OFFSET + dlc as usize])
                .map_err(|_| FrameParseError::InvalidDataLengthCode(dlc))?
        };

        Ok(Self {
            identifier,
            dlc,
            data,
        })
    }

    pub fn as_bytes(&self) -> [u8; CAN_MTU] {
        let mut result = [0u8; CAN_MTU];

        result[..DLC_OFFSET].copy_from_slice(&self.identifier.encode().to_ne_bytes());
        result[DLC_OFFSET] = self.dlc;
        result[DATA_OFFSET..DATA_OFFSET + self.data.len()].copy_from_slice(&self.data);

        result
    }
}

impl embedded_can::Frame for Frame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::with_data(identifier_from_id(id.into()), data)
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > MAX_DATA_LENGTH {
            return None;
        }

        let mut identifier = identifier_from_id(id.into());
        identifier.rtr = true;

        Some(Self {
            identifier,
            dlc: dlc as u8,
            data: Vec::new(),
        })
    }

    fn is_extended(&self) -> bool {
        self.identifier.extended
    }

    fn is_remote_frame(&self) -> bool {
        self.identifier.rtr
    }

    fn id(&self) -> Id {
        let raw = self.identifier.encode();

        if self.identifier.extended {
            Id::Extended(self.identifier.arbitration_id())
        } else {
            // 11-bit IDs only ever carry the low bits of the word
            embedded_can::StandardId::new((raw & 0x7FF) as u16)
                .map(Id::Standard)
                .unwrap_or(Id::Extended(self.identifier.arbitration_id()))
        }
    }

    fn dlc(&self) -> usize {
        self.dlc as usize
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

fn identifier_from_id(id: Id) -> CanIdentifier {
    match id {
        Id::Standard(standard_id) => CanIdentifier::decode(standard_id.as_raw() as u32),
        Id::Extended(extended_id) => {
            let mut identifier = CanIdentifier::decode(extended_id.as_raw() & ARBITRATION_MASK);
            identifier.extended = true;
            identifier
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameParseError {
    #[error("Received a frame of ({0:?}) bytes but a raw CAN frame is 16 bytes long")]
    ShortFrame(usize),
    #[error("Received a CAN DLC ({0:?}) that was out of the valid range (0..=8)")]
    InvalidDataLengthCode(u8),
}
