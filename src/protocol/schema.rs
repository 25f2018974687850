//! Record layouts for the message kinds this client understands.
//!
//! Payloads are sequences of protobuf-style tagged fields. Every record below is
//! declared as an ordered table of `tag => field: type`; the type decides the
//! decoding rule (see [`super::mapper::FieldValue`]). Fields the controller did not
//! send stay `None`.
//!
//! Firmware revisions that move or add fields only need changes here.

use std::{collections::HashMap, fmt};

use bytes::Bytes;

use super::mapper::{FieldSpec, FieldValue, RawField, Rule, WireRecord};
use super::type_key::TypeKey;


/// Which record layout a frame's payload follows.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Live,
    OnzenLive,
    Config,
    Info,

    /// A type code with no known layout. Carries the raw code.
    Unknown(u16),
}

impl MessageKind {
    /// The type code this kind is sent with by current firmware.
    pub fn type_code(self) -> u16 {
        match self {
            MessageKind::Live => TypeKey::Live.code(),
            MessageKind::OnzenLive => TypeKey::OnzenLive.code(),
            MessageKind::Config => TypeKey::Config.code(),
            MessageKind::Info => TypeKey::Info.code(),
            MessageKind::Unknown(code) => code,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Live => write!(f, "Live"),
            MessageKind::OnzenLive => write!(f, "OnzenLive"),
            MessageKind::Config => write!(f, "Config"),
            MessageKind::Info => write!(f, "Info"),
            MessageKind::Unknown(code) => write!(f, "Unknown {}", TypeKey::describe(*code)),
        }
    }
}


/// Maps header type codes to message kinds.
///
/// Codes missing from the table decode as [`MessageKind::Unknown`].
#[derive(Clone, Debug)]
pub struct KindTable {
    kinds: HashMap<u16, MessageKind>,
}

impl KindTable {
    pub fn empty() -> Self {
        Self { kinds: HashMap::new() }
    }

    /// Route `code` to `kind`, returning whatever the code previously mapped to.
    pub fn insert(&mut self, code: u16, kind: MessageKind) -> Option<MessageKind> {
        self.kinds.insert(code, kind)
    }

    pub fn with(mut self, code: u16, kind: MessageKind) -> Self {
        self.insert(code, kind);
        self
    }

    pub fn kind_of(&self, code: u16) -> MessageKind {
        self.kinds.get(&code).copied().unwrap_or(MessageKind::Unknown(code))
    }
}

impl Default for KindTable {
    fn default() -> Self {
        [MessageKind::Live, MessageKind::OnzenLive, MessageKind::Config, MessageKind::Info]
            .into_iter()
            .fold(KindTable::empty(), |table, kind| table.with(kind.type_code(), kind))
    }
}


/// Define an enumerated field: a closed set of named values plus `Other` for
/// anything newer firmware sends that isn't catalogued here.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+

            /// Value not (yet) known to this client.
            Other(i32),
        }

        impl $name {
            /// Raw value as sent on the wire.
            pub fn value(self) -> i32 {
                match self {
                    $($name::$variant => $value,)+
                    $name::Other(value) => value,
                }
            }
        }

        impl From<i32> for $name {
            fn from(value: i32) -> Self {
                match value {
                    $($value => $name::$variant,)+
                    other => $name::Other(other),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => f.write_str($label),)+
                    $name::Other(value) => write!(f, "unrecognized value {value}"),
                }
            }
        }

        impl FieldValue for $name {
            const RULE: Rule = Rule::Enum;

            fn from_wire(raw: RawField<'_>) -> Option<Self> {
                // enums are int32 on the wire; negative values arrive sign-extended
                raw.varint().map(|value| $name::from(value as i32))
            }
        }
    };
}


/// Define a record: the struct (every field optional), its field table and the
/// routine that stores a decoded field by tag.
macro_rules! wire_record {
    ($(#[$meta:meta])* $name:ident ($kind:expr) { $($(#[$fmeta:meta])* $tag:literal => $field:ident: $ty:ty),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: Option<$ty>,)+
        }

        impl WireRecord for $name {
            const KIND: MessageKind = $kind;

            const FIELDS: &'static [FieldSpec] = &[
                $(FieldSpec { tag: $tag, name: stringify!($field), rule: <$ty as FieldValue>::RULE },)+
            ];

            fn apply(&mut self, tag: u32, raw: RawField<'_>) -> bool {
                match tag {
                    $($tag => {
                        self.$field = <$ty as FieldValue>::from_wire(raw);
                        self.$field.is_some()
                    })+
                    _ => false,
                }
            }
        }
    };
}


wire_enum!(
    /// Pump and blower speed.
    PumpStatus {
        Off = 0 => "OFF",
        Low = 1 => "LOW",
        High = 2 => "HIGH",
    }
);

wire_enum!(
    HeaterStatus {
        Idle = 0 => "IDLE",
        Warmup = 1 => "WARMUP",
        Heating = 2 => "HEATING",
        Cooldown = 3 => "COOLDOWN",
    }
);

wire_enum!(
    /// Filtration cycle state.
    FilterStatus {
        Idle = 0 => "IDLE",
        Filtering = 1 => "FILTERING",
        Suspended = 2 => "SUSPENDED",
        Overtemperature = 3 => "OVERTEMPERATURE",
        Resuming = 4 => "RESUMING",
        Purging = 5 => "PURGING",
        Cleaning = 6 => "CLEANING",
        Disabled = 7 => "DISABLED",
    }
);

wire_enum!(
    OzoneStatus {
        Idle = 0 => "IDLE",
        Active = 1 => "ACTIVE",
        Suspended = 2 => "SUSPENDED",
    }
);

wire_enum!(
    SaunaStatus {
        Idle = 0 => "IDLE",
        Heating = 1 => "HEATING",
        Active = 2 => "ACTIVE",
        Cooldown = 3 => "COOLDOWN",
    }
);

wire_enum!(
    /// Health indicator used by the Onzen display for pH and ORP.
    Color {
        Low = 0 => "LOW",
        CautionLow = 1 => "CAUTION_LOW",
        Ok = 2 => "OK",
        CautionHigh = 3 => "CAUTION_HIGH",
        High = 4 => "HIGH",
    }
);

wire_enum!(
    /// Electrical supply configuration.
    Phase {
        TrueThree = 0 => "TRUE_THREE",
        Single = 1 => "SINGLE",
        Two = 2 => "TWO",
        Three = 3 => "THREE",
    }
);

wire_enum!(
    SpaType {
        HotTub = 0 => "HOT_TUB",
        ColdTub = 1 => "COLD_TUB",
        Sauna = 2 => "SAUNA",
    }
);


wire_record!(
    /// Live status of the tub, sent as type `LIVE`.
    Live (MessageKind::Live) {
        1 => temperature_fahrenheit: u32,
        2 => temperature_setpoint_fahrenheit: u32,
        3 => pump_1: PumpStatus,
        4 => pump_2: PumpStatus,
        5 => pump_3: PumpStatus,
        6 => pump_4: PumpStatus,
        7 => pump_5: PumpStatus,
        8 => blower_1: PumpStatus,
        9 => blower_2: PumpStatus,
        10 => lights: bool,
        11 => stereo: bool,
        12 => heater_1: HeaterStatus,
        13 => heater_2: HeaterStatus,
        14 => filter: FilterStatus,
        15 => onzen: bool,
        16 => ozone: OzoneStatus,
        17 => exhaust_fan: bool,
        18 => sauna: SaunaStatus,
        /// Raw ADC reading of the heater circuit.
        19 => heater_adc: u32,
        /// Minutes.
        20 => sauna_time_left: u32,
        21 => economy: bool,
        22 => current_adc: u32,
        23 => all_on: bool,
        24 => fogger: bool,
        25 => error: u32,
        26 => alarm: u32,
        27 => status: u32,
        28 => ph: u32,
        29 => orp: u32,
        30 => sds: bool,
        31 => yess: bool,
    }
);

impl Live {
    pub fn temperature_celsius(&self) -> Option<f32> {
        self.temperature_fahrenheit.map(|f| (f as f32 - 32.0) * 5.0 / 9.0)
    }
}

wire_record!(
    /// Live telemetry of the Onzen salt-water sanitation system, type `ONZEN_LIVE`.
    OnzenLive (MessageKind::OnzenLive) {
        1 => guid: String,
        2 => orp: u32,
        /// pH multiplied by 100.
        3 => ph_100: u32,
        4 => current: u32,
        5 => voltage: u32,
        6 => current_setpoint: u32,
        7 => voltage_setpoint: u32,
        8 => pump_1: bool,
        9 => pump_2: bool,
        10 => order_state: u32,
        11 => live_state: u32,
        12 => electrode_id: u32,
        13 => electrode_polarity: u32,
        14 => electrode_1_resistance_1: u32,
        15 => electrode_1_resistance_2: u32,
        16 => electrode_2_resistance_1: u32,
        17 => electrode_2_resistance_2: u32,
        18 => command_mode: bool,
        19 => electrode_wear: u32,
        20 => ph_color: Color,
        21 => orp_color: Color,
    }
);

impl OnzenLive {
    pub fn ph(&self) -> Option<f32> {
        self.ph_100.map(|ph| ph as f32 / 100.0)
    }
}

wire_record!(
    /// Installed equipment, type `CONFIG`.
    Config (MessageKind::Config) {
        1 => pump_1: bool,
        2 => pump_2: bool,
        3 => pump_3: bool,
        4 => pump_4: bool,
        5 => pump_5: bool,
        6 => blower_1: bool,
        7 => blower_2: bool,
        8 => lights: bool,
        9 => stereo: bool,
        10 => heater_1: bool,
        11 => heater_2: bool,
        12 => filter: bool,
        13 => onzen: bool,
        14 => ozone: bool,
        15 => exhaust_fan: bool,
        16 => sauna: bool,
        17 => fogger: bool,
        18 => sds: bool,
        19 => yess: bool,
        20 => phase: Phase,
        /// Amps.
        21 => breaker_size: u32,
        22 => smart_onzen: u32,
    }
);

wire_record!(
    /// Serial numbers and firmware versions, type `INFO`.
    Info (MessageKind::Info) {
        1 => pack_serial_number: String,
        2 => pack_firmware_version: String,
        3 => pack_hardware_version: String,
        4 => pack_product_id: String,
        5 => pack_board_id: String,
        6 => topside_product_id: String,
        7 => topside_software_version: String,
        8 => guid: String,
        9 => spa_type: SpaType,
        10 => website_registration: bool,
        11 => website_registration_confirm: bool,
        12 => mac_address: Vec<u8>,
        13 => firmware_version: String,
        14 => product_code: String,
        15 => var_software_version: String,
        16 => spaboy_firmware_version: String,
        17 => spaboy_hardware_version: String,
        18 => spaboy_product_id: String,
        19 => spaboy_serial_number: String,
        20 => rfid_firmware_version: String,
        21 => rfid_hardware_version: String,
        22 => rfid_product_id: String,
        23 => rfid_serial_number: String,
    }
);

impl Info {
    /// MAC address formatted as `aa:bb:cc:dd:ee:ff`.
    pub fn mac_address_string(&self) -> Option<String> {
        self.mac_address.as_ref().map(|mac| {
            mac.iter()
                .map(|byte| format!("{byte:02x}"))
                .collect::<Vec<_>>()
                .join(":")
        })
    }
}


/// A decoded payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Live(Live),
    OnzenLive(OnzenLive),
    Config(Config),
    Info(Info),

    /// Payload of a type with no known layout, kept as received.
    Unknown {
        type_code: u16,
        payload: Bytes,
    },
}

impl Record {
    pub fn kind(&self) -> MessageKind {
        match self {
            Record::Live(_) => Live::KIND,
            Record::OnzenLive(_) => OnzenLive::KIND,
            Record::Config(_) => Config::KIND,
            Record::Info(_) => Info::KIND,
            Record::Unknown { type_code, .. } => MessageKind::Unknown(*type_code),
        }
    }
}
