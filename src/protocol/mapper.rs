//! Turns a validated payload into a typed [`Record`].
//!
//! The payload is walked field by field. Each field is looked up in the record's
//! [`WireRecord::FIELDS`] table and stored if its wire type matches the table's
//! rule. Decoding never fails part way: a truncated or malformed field ends the
//! walk, leaving that field and everything after it unset.

use bytes::Bytes;
use prost::encoding::{decode_key, decode_varint, WireType};
use thiserror::Error;
use tracing::{debug, trace};

use super::codec::RawFrame;
use super::schema::{Config, Info, Live, MessageKind, OnzenLive, Record};


/// How a field's value is encoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rule {
    /// Unsigned varint, truncated to 32 bits.
    Uint,
    /// Varint, non-zero is `true`.
    Bool,
    /// Varint naming an enum variant.
    Enum,
    /// Length-delimited, kept as raw bytes.
    Bytes,
    /// Length-delimited UTF-8.
    Text,
}

impl Rule {
    pub fn wire_type(self) -> WireType {
        match self {
            Rule::Uint | Rule::Bool | Rule::Enum => WireType::Varint,
            Rule::Bytes | Rule::Text => WireType::LengthDelimited,
        }
    }
}

/// One row of a record's field table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub tag: u32,
    pub name: &'static str,
    pub rule: Rule,
}

/// A field value as it appeared on the wire, before interpretation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawField<'a> {
    Varint(u64),
    Fixed32(u32),
    Fixed64(u64),
    Bytes(&'a [u8]),
}

impl<'a> RawField<'a> {
    pub fn varint(self) -> Option<u64> {
        match self {
            RawField::Varint(value) => Some(value),
            _ => None,
        }
    }

    pub fn bytes(self) -> Option<&'a [u8]> {
        match self {
            RawField::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// A Rust type that a field can decode into.
pub trait FieldValue: Sized {
    const RULE: Rule;

    fn from_wire(raw: RawField<'_>) -> Option<Self>;
}

impl FieldValue for u32 {
    const RULE: Rule = Rule::Uint;

    fn from_wire(raw: RawField<'_>) -> Option<Self> {
        raw.varint().map(|value| value as u32)
    }
}

impl FieldValue for bool {
    const RULE: Rule = Rule::Bool;

    fn from_wire(raw: RawField<'_>) -> Option<Self> {
        raw.varint().map(|value| value != 0)
    }
}

impl FieldValue for Vec<u8> {
    const RULE: Rule = Rule::Bytes;

    fn from_wire(raw: RawField<'_>) -> Option<Self> {
        raw.bytes().map(<[u8]>::to_vec)
    }
}

impl FieldValue for String {
    const RULE: Rule = Rule::Text;

    fn from_wire(raw: RawField<'_>) -> Option<Self> {
        raw.bytes().and_then(|bytes| String::from_utf8(bytes.to_vec()).ok())
    }
}

/// A record with a field table. Implemented by `wire_record!`.
pub trait WireRecord: Default {
    const KIND: MessageKind;

    /// Known fields, ordered by tag.
    const FIELDS: &'static [FieldSpec];

    /// Store a field. Returns `false` if the tag is unknown or the value didn't decode.
    fn apply(&mut self, tag: u32, raw: RawField<'_>) -> bool;

    fn field(tag: u32) -> Option<&'static FieldSpec> {
        Self::FIELDS.iter().find(|spec| spec.tag == tag)
    }
}


/// Summary of one payload walk.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldScan {
    /// Fields stored into the record.
    pub applied: usize,
    /// Fields skipped: unknown tag, wrong wire type or undecodable value.
    pub skipped: usize,
    /// The walk stopped early on a truncated or malformed field.
    pub truncated: bool,
}

fn read_field<'a>(payload: &mut &'a [u8], wire_type: WireType) -> Option<RawField<'a>> {
    fn take<'a>(payload: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
        if payload.len() < len {
            return None;
        }

        let (head, tail) = payload.split_at(len);
        *payload = tail;

        Some(head)
    }

    match wire_type {
        WireType::Varint => decode_varint(payload).ok().map(RawField::Varint),

        WireType::LengthDelimited => {
            let len = decode_varint(payload).ok()?;
            let len = usize::try_from(len).ok()?;
            take(payload, len).map(RawField::Bytes)
        },

        WireType::ThirtyTwoBit => take(payload, 4)
            .map(|bytes| RawField::Fixed32(u32::from_le_bytes(bytes.try_into().unwrap_or_default()))),

        WireType::SixtyFourBit => take(payload, 8)
            .map(|bytes| RawField::Fixed64(u64::from_le_bytes(bytes.try_into().unwrap_or_default()))),

        // groups are deprecated and never sent by the controller
        WireType::StartGroup | WireType::EndGroup => None,
    }
}

/// Walk `payload`, storing every known field into `record`.
pub fn read_fields<R: WireRecord>(record: &mut R, mut payload: &[u8]) -> FieldScan {
    let mut scan = FieldScan::default();

    while !payload.is_empty() {
        let (tag, wire_type) = match decode_key(&mut payload) {
            Ok(key) => key,
            Err(err) => {
                trace!("{}: bad field key: {err}", R::KIND);
                scan.truncated = true;
                break;
            }
        };

        let Some(raw) = read_field(&mut payload, wire_type) else {
            trace!("{}: field {tag} truncated", R::KIND);
            scan.truncated = true;
            break;
        };

        match R::field(tag) {
            Some(spec) if spec.rule.wire_type() == wire_type => {
                if record.apply(tag, raw) {
                    scan.applied += 1;
                } else {
                    trace!("{}: could not decode field {} ({tag})", R::KIND, spec.name);
                    scan.skipped += 1;
                }
            },

            Some(spec) => {
                trace!("{}: field {} ({tag}) has wire type {wire_type:?}, expected {:?}", R::KIND, spec.name, spec.rule.wire_type());
                scan.skipped += 1;
            },

            None => {
                trace!("{}: skipping unknown field {tag}", R::KIND);
                scan.skipped += 1;
            }
        }
    }

    scan
}

/// Decode a record of type `R` from `payload`.
pub fn decode_record<R: WireRecord>(payload: &[u8]) -> R {
    let mut record = R::default();
    let scan = read_fields(&mut record, payload);

    if scan.truncated {
        debug!("{} payload ({} bytes) ended early, {} fields decoded", R::KIND, payload.len(), scan.applied);
    }

    record
}


#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no record layout for message type {0}")]
    UnknownKind(u16),
}

/// Maps payloads to records according to their message kind.
#[derive(Copy, Clone, Debug)]
pub struct RecordMapper {
    raw_fallback: bool,
}

impl RecordMapper {
    /// A mapper that keeps payloads of unknown kinds as [`Record::Unknown`].
    pub fn new() -> Self {
        Self { raw_fallback: true }
    }

    /// A mapper that rejects unknown kinds with [`DecodeError::UnknownKind`].
    pub fn strict() -> Self {
        Self { raw_fallback: false }
    }

    pub fn map(&self, kind: MessageKind, payload: &[u8]) -> Result<Record, DecodeError> {
        self.map_bytes(kind, Bytes::copy_from_slice(payload))
    }

    pub fn map_frame(&self, frame: &RawFrame) -> Result<Record, DecodeError> {
        self.map_bytes(frame.kind, frame.payload.clone())
    }

    fn map_bytes(&self, kind: MessageKind, payload: Bytes) -> Result<Record, DecodeError> {
        let record = match kind {
            MessageKind::Live => Record::Live(decode_record(&payload)),
            MessageKind::OnzenLive => Record::OnzenLive(decode_record(&payload)),
            MessageKind::Config => Record::Config(decode_record(&payload)),
            MessageKind::Info => Record::Info(decode_record(&payload)),

            MessageKind::Unknown(type_code) if self.raw_fallback => Record::Unknown { type_code, payload },
            MessageKind::Unknown(type_code) => return Err(DecodeError::UnknownKind(type_code)),
        };

        Ok(record)
    }
}

impl Default for RecordMapper {
    fn default() -> Self {
        Self::new()
    }
}
