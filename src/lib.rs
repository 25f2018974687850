//! Client for the local-network telemetry protocol of Arctic Spa hot tub controllers.
//!
//! ```no_run
//! # async fn example() -> arctic_spa::Result<()> {
//! use std::time::Duration;
//! use arctic_spa::{MessageKind, Record};
//!
//! let records = arctic_spa::poll(
//!     "192.168.1.40".parse().unwrap(),
//!     &[MessageKind::Live, MessageKind::OnzenLive],
//!     Duration::from_secs(5),
//! ).await?;
//!
//! for record in records {
//!     if let Record::Live(live) = record {
//!         println!("{:?}F", live.temperature_fahrenheit);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{poll, Packet, SpaClient};
pub use config::{CodecConfig, SearchOptions};
pub use discovery::{search, DiscoveredDevice, Subnet};
pub use error::{DecodeError, Error, Result};
pub use protocol::schema::{MessageKind, Record};
pub use transport::{DatagramTransport, TcpTransport, Transport};
