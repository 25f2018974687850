use std::{fmt::Debug, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use packed_struct::prelude::*;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use super::schema::{KindTable, MessageKind};
use super::type_key::TypeKey;


pub const PREAMBLE: [u8; 4] = [0xab, 0xad, 0x1d, 0x3a];

pub const HEADER_SIZE: usize = 20;

/// Largest payload accepted by default. The controller's frames are far smaller;
/// anything above this is a misaligned header.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;


/// Frame header, all fields big endian.
#[derive(PackedStruct, Copy, Clone, Debug, PartialEq, Eq)]
#[packed_struct(bit_numbering="msb0", endian="msb")]
pub struct FrameHeader {
    #[packed_field(bytes="0..=3")]
    pub preamble: [u8; 4],

    #[packed_field(bytes="4..=7")]
    pub checksum: [u8; 4],

    /// Incremented by the controller for every frame sent.
    #[packed_field(bytes="8..=11")]
    pub counter: u32,

    /// Unknown. Always zero in captures.
    #[packed_field(bytes="12..=15")]
    pub reserved: u32,

    #[packed_field(bytes="16..=17")]
    pub type_code: u16,

    /// Payload length, excluding the header.
    #[packed_field(bytes="18..=19")]
    pub length: u16,
}

impl FrameHeader {
    pub fn new(type_code: u16, counter: u32, checksum: [u8; 4], length: u16) -> Self {
        Self {
            preamble: PREAMBLE,
            checksum,
            counter,
            reserved: 0,
            type_code,
            length,
        }
    }

    fn read(src: &[u8]) -> Option<Self> {
        let bytes: &[u8; HEADER_SIZE] = src.get(..HEADER_SIZE)?.try_into().ok()?;
        FrameHeader::unpack(bytes).ok()
    }
}


/// Checksum validation for received frames.
pub trait FrameCheck: Debug + Send + Sync {
    /// Checksum for a frame with this header and payload, or `None` when frames
    /// can't be checked and should be accepted as-is.
    fn compute(&self, header: &FrameHeader, payload: &[u8]) -> Option<[u8; 4]>;

    fn verify(&self, header: &FrameHeader, payload: &[u8]) -> bool {
        self.compute(header, payload)
            .map_or(true, |expected| expected == header.checksum)
    }
}

/// Accepts every frame.
///
/// The controller's checksum algorithm hasn't been identified, so this is the default.
#[derive(Copy, Clone, Debug, Default)]
pub struct Unverified;

impl FrameCheck for Unverified {
    fn compute(&self, _header: &FrameHeader, _payload: &[u8]) -> Option<[u8; 4]> {
        None
    }
}

/// CRC-32 over header bytes 8..20 (counter, reserved, type, length) and the payload.
#[derive(Copy, Clone, Debug, Default)]
pub struct Crc32;

impl FrameCheck for Crc32 {
    fn compute(&self, header: &FrameHeader, payload: &[u8]) -> Option<[u8; 4]> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header.counter.to_be_bytes());
        hasher.update(&header.reserved.to_be_bytes());
        hasher.update(&header.type_code.to_be_bytes());
        hasher.update(&header.length.to_be_bytes());
        hasher.update(payload);

        Some(hasher.finalize().to_be_bytes())
    }
}


/// A validated frame, payload not yet interpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: MessageKind,
    pub type_code: u16,
    pub counter: u32,
    pub checksum: [u8; 4],
    pub payload: Bytes,
}


#[derive(Error, Debug)]
enum FramingError {
    #[error("input buffer too small")]
    BufferTooSmall,
    #[error("start of frame marker not found")]
    FrameStartNotFound {
        /// bytes that can't be the start of a frame
        junk: usize
    },
    #[error("payload length {length} exceeds the maximum of {max}")]
    LengthOutOfRange {
        length: usize,
        max: usize,
    },
    #[error("invalid checksum (expected {expected:02x?}, actual: {actual:02x?})")]
    InvalidChecksum {
        expected: Option<[u8; 4]>,
        actual: [u8; 4],
    },
}

/// Outcome of inspecting the start of a buffer.
enum Step {
    /// A frame, and the number of bytes it occupied.
    Frame(FrameHeader, usize),
    /// Discard this many bytes and look again.
    Skip(usize),
    /// The buffer ends inside a frame.
    NeedMore,
}


/// Splits a byte stream into frames.
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    kinds: KindTable,
    check: Arc<dyn FrameCheck>,
    max_payload: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            kinds: KindTable::default(),
            check: Arc::new(Unverified),
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_kinds(mut self, kinds: KindTable) -> Self {
        self.kinds = kinds;
        self
    }

    pub fn with_check<C: FrameCheck + 'static>(mut self, check: C) -> Self {
        self.check = Arc::new(check);
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn check(&self) -> &dyn FrameCheck {
        self.check.as_ref()
    }

    /// Iterate the complete frames in `buffer`.
    ///
    /// Once the iterator is exhausted, [`Frames::remainder`] holds the trailing
    /// bytes of an incomplete frame (if any) that should be prepended to the
    /// next read.
    pub fn decode_frames<'a>(&'a self, buffer: &'a [u8]) -> Frames<'a> {
        Frames {
            decoder: self,
            buffer,
            pos: 0,
        }
    }

    fn try_read_frame(&self, src: &[u8]) -> Result<(FrameHeader, usize), FramingError> {
        if src.len() < PREAMBLE.len() {
            // can't tell yet, unless these bytes can't possibly begin a preamble
            if PREAMBLE.starts_with(src) {
                return Err(FramingError::BufferTooSmall);
            }
        }

        if !src.starts_with(&PREAMBLE) {
            let junk = src.windows(PREAMBLE.len())
                .position(|window| window == PREAMBLE)
                .unwrap_or_else(|| {
                    // keep a tail that may be the first bytes of a preamble
                    let keep = (1..PREAMBLE.len()).rev()
                        .find(|&n| n <= src.len() && src.ends_with(&PREAMBLE[..n]))
                        .unwrap_or(0);
                    src.len() - keep
                });

            return Err(FramingError::FrameStartNotFound { junk });
        }

        let header = FrameHeader::read(src).ok_or(FramingError::BufferTooSmall)?;

        let length = header.length as usize;
        if length > self.max_payload {
            return Err(FramingError::LengthOutOfRange { length, max: self.max_payload });
        }

        let size = HEADER_SIZE + length;
        if src.len() < size {
            return Err(FramingError::BufferTooSmall);
        }

        let payload = &src[HEADER_SIZE..size];
        if !self.check.verify(&header, payload) {
            return Err(FramingError::InvalidChecksum {
                expected: self.check.compute(&header, payload),
                actual: header.checksum,
            });
        }

        Ok((header, size))
    }

    fn step(&self, src: &[u8]) -> Step {
        match self.try_read_frame(src) {
            Ok((header, size)) => Step::Frame(header, size),

            // need more data to complete the header or payload
            Err(FramingError::BufferTooSmall) => Step::NeedMore,

            Err(FramingError::FrameStartNotFound { junk }) => {
                trace!("skipping {junk} bytes of junk");
                if junk == 0 {
                    Step::NeedMore
                } else {
                    Step::Skip(junk)
                }
            },

            // preamble found but the frame is bad -- the preamble bytes were likely part
            // of a payload or a partial capture. skip past it to resync
            Err(err) => {
                debug!("dropping frame: {err}");
                Step::Skip(1)
            }
        }
    }

    fn frame(&self, header: &FrameHeader, payload: Bytes) -> RawFrame {
        let kind = self.kinds.kind_of(header.type_code);

        trace!("frame {} counter {} ({} bytes)", TypeKey::describe(header.type_code), header.counter, payload.len());

        RawFrame {
            kind,
            type_code: header.type_code,
            counter: header.counter,
            checksum: header.checksum,
            payload,
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}


/// Iterator over the frames of a buffer. See [`FrameDecoder::decode_frames`].
pub struct Frames<'a> {
    decoder: &'a FrameDecoder,
    buffer: &'a [u8],
    pos: usize,
}

impl<'a> Frames<'a> {
    /// Bytes not consumed so far.
    pub fn remainder(&self) -> &'a [u8] {
        &self.buffer[self.pos..]
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Frames<'a> {
    type Item = RawFrame;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let src = self.remainder();

            match self.decoder.step(&src[..]) {
                Step::Frame(header, size) => {
                    self.pos += size;
                    let payload = Bytes::copy_from_slice(&src[HEADER_SIZE..size]);

                    return Some(self.decoder.frame(&header, payload));
                },
                Step::Skip(n) => self.pos += n,
                Step::NeedMore => return None,
            }
        }
    }
}


/// A frame to send to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundFrame {
    pub type_code: u16,
    pub counter: u32,
    pub checksum: [u8; 4],
    pub payload: Bytes,
}

impl OutboundFrame {
    pub fn new(type_code: u16, payload: Bytes) -> Self {
        Self { type_code, counter: 0, checksum: [0; 4], payload }
    }
}

/// Request for `LIVE` frames, as captured from the vendor app.
pub fn request_live() -> OutboundFrame {
    OutboundFrame {
        type_code: TypeKey::Live.code(),
        counter: 0,
        checksum: [0x11, 0xc2, 0xc9, 0x84],
        payload: Bytes::new(),
    }
}

/// Request for `ONZEN_LIVE` frames, as captured from the vendor app.
pub fn request_onzen_live() -> OutboundFrame {
    OutboundFrame {
        type_code: TypeKey::OnzenLive.code(),
        counter: 0,
        checksum: [0x35, 0xa9, 0x2c, 0x14],
        payload: Bytes::new(),
    }
}

/// The known request for `kind`, if there is one.
pub fn request_for(kind: MessageKind) -> Option<OutboundFrame> {
    match kind {
        MessageKind::Live => Some(request_live()),
        MessageKind::OnzenLive => Some(request_onzen_live()),
        _ => None,
    }
}

/// Sent after connecting; makes the controller start streaming live data.
pub fn init_sequence() -> Vec<OutboundFrame> {
    vec![request_live(), request_onzen_live()]
}


/// `tokio_util` codec for controller connections.
#[derive(Clone, Debug, Default)]
pub struct SpaCodec {
    decoder: FrameDecoder,
}

impl SpaCodec {
    pub fn new(decoder: FrameDecoder) -> Self {
        Self { decoder }
    }

    pub fn frame_decoder(&self) -> &FrameDecoder {
        &self.decoder
    }
}

impl Decoder for SpaCodec {
    type Item = RawFrame;

    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.decoder.step(&src[..]) {
                Step::Frame(header, size) => {
                    let mut frame = src.split_to(size);
                    frame.advance(HEADER_SIZE);

                    return Ok(Some(self.decoder.frame(&header, frame.freeze())));
                },
                Step::Skip(n) => src.advance(n),
                Step::NeedMore => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!("discarding {} bytes of incomplete frame at end of stream", src.len());
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<OutboundFrame> for SpaCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = u16::try_from(frame.payload.len())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "payload too large for a frame"))?;

        let mut header = FrameHeader::new(frame.type_code, frame.counter, frame.checksum, length);
        if let Some(checksum) = self.decoder.check().compute(&header, &frame.payload) {
            header.checksum = checksum;
        }

        let header = header.pack()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err.to_string()))?;

        dst.reserve(HEADER_SIZE + frame.payload.len());
        dst.put(&header[..]);
        dst.put(frame.payload);

        Ok(())
    }
}
