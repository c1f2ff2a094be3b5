use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::event::CoinCode;
use crate::identifier::FunctionCode;

/// The role a node plays on the bus, as configured by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[num_enum(error_type(name = DeviceKindError, constructor = DeviceKindError::Unknown))]
#[repr(u8)]
pub enum DeviceKind {
    CoinSender05 = 1,
    CoinSender1 = 2,
    CoinSender2 = 3,
    CoinSender3 = 4,
    CoinSender4 = 5,
    CoinSender5 = 6,
    CoinSender6 = 7,
    CoinCounter = 8,
    CoinCounterTotals = 9,
    ActiveMonitor = 10,
    RelayModule5 = 11,
}

/// How the host should present a sub-device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    /// Momentary switch, pressing it releases one coin
    PushOn,
    /// Incremental counter
    Counter,
    /// Motion sensor style on/off state reported by the node
    Motion,
    /// Plain switch
    OnOff,
}

/// One registry entry a node kind expands into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDevice {
    pub unit: u8,
    pub class: DeviceClass,
    pub name: String,
    /// Whether the host shows the entry right away
    pub used: bool,
}

const RELAY_CHANNELS: u8 = 5;

/// Sub-unit of the coin counter device that receives coin values.
pub const COUNTER_UNIT: u8 = 1;
/// Sub-unit of the totals device that receives coin values.
pub const TOTALS_UNIT: u8 = 2;
/// Sub-unit of the activity monitor device.
pub const ACTIVITY_UNIT: u8 = 0;

impl DeviceKind {
    pub const ALL: [Self; 11] = [
        Self::CoinSender05,
        Self::CoinSender1,
        Self::CoinSender2,
        Self::CoinSender3,
        Self::CoinSender4,
        Self::CoinSender5,
        Self::CoinSender6,
        Self::CoinCounter,
        Self::CoinCounterTotals,
        Self::ActiveMonitor,
        Self::RelayModule5,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::CoinSender05 => "DomoCAN_CoinSender_05",
            Self::CoinSender1 => "DomoCAN_CoinSender_1",
            Self::CoinSender2 => "DomoCAN_CoinSender_2",
            Self::CoinSender3 => "DomoCAN_CoinSender_3",
            Self::CoinSender4 => "DomoCAN_CoinSender_4",
            Self::CoinSender5 => "DomoCAN_CoinSender_5",
            Self::CoinSender6 => "DomoCAN_CoinSender_6",
            Self::CoinCounter => "DomoCAN_CoinCounter",
            Self::CoinCounterTotals => "DomoCAN_CoinCounter_Totals",
            Self::ActiveMonitor => "DomoCAN_ActiveMonitor",
            Self::RelayModule5 => "DomoCAN_RelayModule5Channels",
        }
    }

    /// The denomination a coin sender releases.
    pub const fn coin(self) -> Option<CoinCode> {
        match self {
            Self::CoinSender05 => Some(CoinCode::FiftyCents),
            Self::CoinSender1 => Some(CoinCode::OneEuro),
            Self::CoinSender2 => Some(CoinCode::TwoEuro),
            Self::CoinSender3 => Some(CoinCode::ThreeEuro),
            Self::CoinSender4 => Some(CoinCode::FourEuro),
            Self::CoinSender5 => Some(CoinCode::FiveEuro),
            Self::CoinSender6 => Some(CoinCode::SixEuro),
            _ => None,
        }
    }

    pub const fn is_coin_sender(self) -> bool {
        self.coin().is_some()
    }

    /// The registry entries a node of this kind named `name` expands into.
    pub fn sub_devices(self, name: &str) -> Vec<SubDevice> {
        let single = |unit: u8, class: DeviceClass| {
            vec![SubDevice {
                unit,
                class,
                name: name.to_string(),
                used: true,
            }]
        };

        match self {
            Self::CoinCounter => single(COUNTER_UNIT, DeviceClass::Counter),
            Self::CoinCounterTotals => single(TOTALS_UNIT, DeviceClass::Counter),
            Self::ActiveMonitor => single(ACTIVITY_UNIT, DeviceClass::Motion),
            Self::RelayModule5 => (0..RELAY_CHANNELS)
                .map(|unit| SubDevice {
                    unit,
                    class: DeviceClass::OnOff,
                    name: format!("{name}_{unit}"),
                    used: false,
                })
                .collect(),
            // Senders are keyed by the coin code they release
            sender => match sender.coin() {
                Some(coin) => single(coin.into(), DeviceClass::PushOn),
                None => Vec::new(),
            },
        }
    }

    /// Function codes a node of this kind sends to the gateway.
    pub const fn emits(self) -> &'static [FunctionCode] {
        match self {
            Self::CoinCounter | Self::CoinCounterTotals => {
                &[FunctionCode::CoinEvent, FunctionCode::NodeAck]
            }
            Self::ActiveMonitor => &[FunctionCode::ActiveEvent, FunctionCode::NodeAck],
            _ => &[FunctionCode::NodeAck],
        }
    }

    /// Function codes a node of this kind acts upon.
    pub const fn accepts(self) -> &'static [FunctionCode] {
        if self.is_coin_sender() {
            &[
                FunctionCode::CoinEvent,
                FunctionCode::NodePing,
                FunctionCode::Reset,
            ]
        } else {
            &[FunctionCode::NodePing, FunctionCode::Reset]
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceKindError {
    #[error("Received a device kind that is not supported ({0:?})")]
    Unknown(u8),
}
