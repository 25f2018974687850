use std::{collections::HashSet, net::{IpAddr, SocketAddr}, time::Duration};

use bytes::BytesMut;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::config::SPA_PORT;
use crate::error::{Error, Result};
use crate::protocol::codec::{init_sequence, request_for, SpaCodec};
use crate::protocol::mapper::RecordMapper;
use crate::protocol::schema::{MessageKind, Record};
use crate::transport::{TcpTransport, Transport};


/// About thirty years; stands in for "no limit".
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// `timeout` from now, saturating instead of overflowing for huge timeouts.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();

    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}


/// A decoded frame along with its header fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub type_code: u16,
    pub counter: u32,
    pub checksum: [u8; 4],
    pub record: Record,
}


#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PollState {
    Awaiting,
    Satisfied,
    TimedOut,
}


/// Talks to one controller.
///
/// Either poll it (`poll`), or stream from it: send `request` once, then call
/// `read_packets`/`read_records` as often as wanted.
///
/// The methods borrow the client mutably, so only one exchange can be in flight
/// per connection. Share a client between tasks with a `tokio::sync::Mutex`.
pub struct SpaClient<T> {
    transport: T,
    codec: SpaCodec,
    mapper: RecordMapper,

    /// Bytes of a frame not yet completely received.
    buffer: BytesMut,
}

impl<T: Transport> SpaClient<T> {
    pub fn new(transport: T) -> Self {
        Self::with_codec(transport, SpaCodec::default(), RecordMapper::default())
    }

    pub fn with_codec(transport: T, codec: SpaCodec, mapper: RecordMapper) -> Self {
        Self { transport, codec, mapper, buffer: BytesMut::new() }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Request `requested` from the controller and collect records until each
    /// requested kind has been seen or `timeout` elapses.
    ///
    /// Every record received is returned in arrival order, whatever its kind.
    /// Running out of time isn't an error: the records received so far are returned.
    pub async fn poll(&mut self, requested: &[MessageKind], timeout: Duration) -> Result<Vec<Record>> {
        let mut records = Vec::new();

        let mut outstanding: HashSet<MessageKind> = requested.iter().copied().collect();
        if outstanding.is_empty() {
            return Ok(records);
        }

        let deadline = deadline_after(timeout);

        if timeout_at(deadline, self.request(requested)).await.is_err() {
            debug!("poll timed out sending requests");
            return Ok(records);
        }

        let mut state = PollState::Awaiting;

        while state == PollState::Awaiting {
            let Some(packets) = self.read_cycle(deadline).await? else {
                state = PollState::TimedOut;
                continue;
            };

            for packet in packets {
                outstanding.remove(&packet.record.kind());
                records.push(packet.record);
            }

            if outstanding.is_empty() {
                state = PollState::Satisfied;
            }
        }

        if state == PollState::TimedOut {
            debug!("poll timed out with {} records, still waiting for {:?}", records.len(), outstanding);
        }

        Ok(records)
    }

    /// Send the requests for `kinds`, or the init sequence if none of them has
    /// a dedicated request. The controller then streams live data.
    pub async fn request(&mut self, kinds: &[MessageKind]) -> Result<()> {
        let mut requests: Vec<_> = kinds.iter()
            .filter_map(|kind| request_for(*kind))
            .collect();

        if requests.is_empty() {
            requests = init_sequence();
        }

        let mut buf = BytesMut::new();
        for request in requests {
            self.codec.encode(request, &mut buf)?;
        }

        self.transport.send(&buf).await
    }

    /// Wait up to `timeout` for one read and return the frames it completed.
    ///
    /// Returns an empty list if nothing arrived in time. Bytes of an incomplete
    /// frame are kept for the next call.
    pub async fn read_packets(&mut self, timeout: Duration) -> Result<Vec<Packet>> {
        Ok(self.read_cycle(deadline_after(timeout)).await?.unwrap_or_default())
    }

    /// As [`Self::read_packets`], without the header fields.
    pub async fn read_records(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        let packets = self.read_packets(timeout).await?;

        Ok(packets.into_iter().map(|packet| packet.record).collect())
    }

    /// One receive cycle. `None` once `deadline` has passed without data.
    async fn read_cycle(&mut self, deadline: Instant) -> Result<Option<Vec<Packet>>> {
        let remaining = deadline.saturating_duration_since(Instant::now());

        let chunk = match timeout_at(deadline, self.transport.receive(remaining)).await {
            Ok(Ok(Some(chunk))) => chunk,
            Ok(Ok(None)) | Err(_) => return Ok(None),
            Ok(Err(err)) => return Err(err),
        };

        self.buffer.extend_from_slice(&chunk);

        let mut packets = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            match self.mapper.map_frame(&frame) {
                Ok(record) => packets.push(Packet {
                    type_code: frame.type_code,
                    counter: frame.counter,
                    checksum: frame.checksum,
                    record,
                }),
                Err(err) => debug!("skipping frame {}: {err}", frame.counter),
            }
        }

        Ok(Some(packets))
    }
}


/// Connect to the controller at `address`, poll it once and disconnect.
///
/// Connecting counts against `timeout`.
pub async fn poll(address: IpAddr, requested: &[MessageKind], timeout: Duration) -> Result<Vec<Record>> {
    let deadline = deadline_after(timeout);
    let addr = SocketAddr::new(address, SPA_PORT);

    let transport = timeout_at(deadline, TcpTransport::connect(addr)).await
        .map_err(|_| Error::ConnectTimeout(addr.to_string()))??;

    let mut client = SpaClient::new(transport);

    client.poll(requested, deadline.saturating_duration_since(Instant::now())).await
}
