use std::net::Ipv4Addr;

use thiserror::Error;
use url::Url;

pub use crate::protocol::mapper::DecodeError;


/// Failures that end a poll or scan.
///
/// Everything the controller sends is handled without error; only the
/// connection itself (or the caller's arguments) can fail a call.
#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by the controller")]
    Closed,

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("url scheme {0} not supported")]
    UnsupportedScheme(String),

    #[error("url {0} requires a host")]
    MissingHost(Url),

    #[error("subnet mask {0} is not contiguous")]
    InvalidMask(Ipv4Addr),

    #[error("prefix length /{0} is out of range")]
    InvalidPrefix(u8),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
