use strum_macros::{Display, EnumString, FromRepr};

/// Packet type codes carried in the frame header.
///
/// Only a handful of these have a known record layout (see [`super::schema::KindTable`]);
/// the rest are listed so that logs and dumps can name what the controller sent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[repr(u16)]
pub enum TypeKey {
    Live = 0,
    Settings = 2,
    Config = 3,
    Peak = 4,
    Clock = 5,
    Info = 6,
    Error = 7,
    Firmware = 8,

    /// Keep-alive sent by the controller, never carries a payload.
    Heartbeat = 10,

    Filters = 13,

    OnzenLive = 48, // 0x30
    OnzenSettings = 50,

    // 0x70 - 0x79: LPC (lighting/peripheral controller) family
    LpcLive = 112,
    LpcInfo = 114,
    LpcConfig = 115,
    LpcPreferences = 116,
    LpcLights = 117,
    LpcSchedule = 118,
    LpcPeakDevices = 119,
    LpcError = 121,
}

impl TypeKey {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Human readable name for a raw type code, e.g. `HEARTBEAT(10)` or `0x1f`.
    pub fn describe(code: u16) -> String {
        match TypeKey::from_repr(code) {
            Some(key) => format!("{key}({code})"),
            None => format!("{code:#04x}"),
        }
    }
}
