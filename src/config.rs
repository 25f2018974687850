use std::time::Duration;

use crate::protocol::codec::{Crc32, FrameDecoder, DEFAULT_MAX_PAYLOAD};


/// TCP port the controller listens on.
pub const SPA_PORT: u16 = 65534;

/// UDP port discovery queries are sent to.
pub const QUERY_PORT: u16 = 9131;

/// UDP port the controller sends discovery responses to.
pub const RESPONSE_PORT: u16 = 33327;


/// How received frames are checked.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Accept frames without verifying their checksum.
    #[default]
    Unverified,
    /// Verify CRC-32 checksums (see [`Crc32`]).
    Crc32,
}

/// Frame decoding settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecConfig {
    pub max_payload: usize,
    pub checksum: ChecksumMode,
}

impl CodecConfig {
    pub fn frame_decoder(&self) -> FrameDecoder {
        let decoder = FrameDecoder::new().with_max_payload(self.max_payload);

        match self.checksum {
            ChecksumMode::Unverified => decoder,
            ChecksumMode::Crc32 => decoder.with_check(Crc32),
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            checksum: ChecksumMode::default(),
        }
    }
}


/// Discovery scan settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchOptions {
    /// How long to wait for each host to answer its probe.
    pub per_host_timeout: Duration,

    /// The scan returns whatever it found once this elapses.
    pub overall_timeout: Duration,

    /// Maximum number of probes awaiting a reply at once.
    pub concurrency: usize,

    pub query_port: u16,
    pub response_port: u16,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            per_host_timeout: Duration::from_secs(1),
            overall_timeout: Duration::from_secs(10),
            concurrency: 256,
            query_port: QUERY_PORT,
            response_port: RESPONSE_PORT,
        }
    }
}
