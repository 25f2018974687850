//! Finding controllers on the local network.
//!
//! Every host of the subnet is sent a UDP query; controllers answer on a
//! fixed port with a `Response,BlueFalls,...` datagram.

use std::{collections::{HashMap, HashSet}, net::{IpAddr, Ipv4Addr, SocketAddr}};

use tokio::{net::UdpSocket, select, time::{sleep_until, Instant}};
use tracing::{debug, info, trace};

use crate::client::deadline_after;
use crate::config::SearchOptions;
use crate::error::{Error, Result};
use crate::transport::DatagramTransport;


pub const QUERY: &[u8] = b"Query,BlueFalls,";

pub const RESPONSE_PREFIX: &[u8] = b"Response,BlueFalls,";

const MAX_RESPONSE_SIZE: usize = 512;


#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DiscoveredDevice {
    pub address: Ipv4Addr,
    pub guid: Option<String>,
    pub product_id: Option<String>,
}


/// An IPv4 network.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

fn prefix_mask(prefix: u8) -> u32 {
    match prefix {
        0 => 0,
        _ => u32::MAX << (32 - u32::from(prefix)),
    }
}

impl Subnet {
    /// The subnet `address` belongs to, from a mask such as `255.255.255.0`.
    pub fn from_mask(address: Ipv4Addr, mask: Ipv4Addr) -> Result<Self> {
        let bits = u32::from(mask);
        let prefix = bits.leading_ones() as u8;

        if prefix_mask(prefix) != bits {
            return Err(Error::InvalidMask(mask));
        }

        Self::from_prefix(address, prefix)
    }

    pub fn from_prefix(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::InvalidPrefix(prefix));
        }

        let network = Ipv4Addr::from(u32::from(address) & prefix_mask(prefix));

        Ok(Self { network, prefix })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn mask(&self) -> Ipv4Addr {
        Ipv4Addr::from(prefix_mask(self.prefix))
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !prefix_mask(self.prefix))
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        u32::from(address) & prefix_mask(self.prefix) == u32::from(self.network)
    }

    /// Usable host addresses, in ascending order.
    ///
    /// The network and broadcast addresses are excluded, except on /31 and /32
    /// networks where every address is a host.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network);
        let last = u32::from(self.broadcast());

        let range = if self.prefix >= 31 {
            first..=last
        } else {
            first + 1..=last - 1
        };

        range.map(Ipv4Addr::from)
    }

    /// Addresses to probe: every host other than `local`.
    pub fn candidates(&self, local: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
        self.hosts().filter(move |address| *address != local)
    }
}


/// Parse a discovery reply from `address`.
///
/// Returns `None` if the datagram isn't a controller response. The fields after
/// the prefix, when present and non-empty, are the device guid and product id.
pub fn parse_response(address: Ipv4Addr, datagram: &[u8]) -> Option<DiscoveredDevice> {
    let rest = datagram.strip_prefix(RESPONSE_PREFIX)?;
    let rest = String::from_utf8_lossy(rest);

    let mut fields = rest
        .split(',')
        .map(|field| field.trim_matches(|c: char| c.is_whitespace() || c == '\0'))
        .map(|field| (!field.is_empty()).then(|| field.to_string()));

    Some(DiscoveredDevice {
        address,
        guid: fields.next().flatten(),
        product_id: fields.next().flatten(),
    })
}


/// ICMP unreachable replies to an earlier probe, reported by some platforms on
/// the next receive.
fn is_unreachable(err: &std::io::Error) -> bool {
    matches!(err.kind(), std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused)
}


/// Probe the candidates of `subnet` over `transport` and collect the devices
/// that answer.
///
/// At most `options.concurrency` probes wait for a reply at once, each for
/// `options.per_host_timeout`. Devices are returned in reply order, once each.
/// Whatever has been found when `options.overall_timeout` elapses is returned.
///
/// A probe that can't be sent counts as unanswered. Only a failure of the
/// socket itself ends the scan with an error.
pub async fn scan<T>(transport: &T, local: Ipv4Addr, subnet: &Subnet, options: &SearchOptions) -> Result<Vec<DiscoveredDevice>>
where
    T: DatagramTransport + ?Sized
{
    let deadline = deadline_after(options.overall_timeout);
    let concurrency = options.concurrency.max(1);

    let mut candidates = subnet.candidates(local);

    // probes awaiting a reply, and when each stops waiting
    let mut in_flight: HashMap<Ipv4Addr, Instant> = HashMap::new();

    let mut seen = HashSet::new();
    let mut devices = Vec::new();

    let mut buf = [0u8; MAX_RESPONSE_SIZE];

    debug!("scanning {}/{} from {local}", subnet.network(), subnet.prefix());

    loop {
        if Instant::now() >= deadline {
            debug!("scan deadline reached with {} probes outstanding", in_flight.len());
            break;
        }

        while in_flight.len() < concurrency {
            let Some(address) = candidates.next() else { break };

            let target = SocketAddr::new(IpAddr::V4(address), options.query_port);

            // e.g. the broadcast address of a smaller network than the one scanned
            if let Err(err) = transport.send_to(QUERY, target).await {
                debug!("can't probe {target}: {err}");
                continue;
            }

            trace!("probed {target}");
            in_flight.insert(address, deadline_after(options.per_host_timeout));
        }

        let Some(next_expiry) = in_flight.values().min().copied() else {
            // every candidate has been probed and answered or expired
            break;
        };

        select! {
            biased;

            _ = sleep_until(deadline) => {
                debug!("scan deadline reached with {} probes outstanding", in_flight.len());
                break;
            },

            received = transport.recv_from(&mut buf) => {
                let (len, from) = match received {
                    Ok(received) => received,
                    Err(Error::Io(err)) if is_unreachable(&err) => {
                        debug!("ignoring receive error: {err}");
                        continue;
                    },
                    Err(err) => return Err(err),
                };

                let IpAddr::V4(address) = from.ip() else {
                    continue;
                };

                let now = Instant::now();
                match in_flight.get(&address) {
                    Some(expiry) if *expiry > now => {},
                    _ => {
                        trace!("ignoring datagram from {from}");
                        continue;
                    },
                }

                let Some(device) = parse_response(address, &buf[..len]) else {
                    trace!("ignoring non-response datagram from {from}");
                    continue;
                };

                in_flight.remove(&address);

                if seen.insert(address) {
                    info!("found device at {address} (guid {:?}, product {:?})", device.guid, device.product_id);
                    devices.push(device);
                }
            },

            _ = sleep_until(next_expiry) => {
                let now = Instant::now();
                in_flight.retain(|_, expiry| *expiry > now);
            },
        }
    }

    Ok(devices)
}

/// Search the subnet of `local` for controllers.
///
/// Replies are received on `options.response_port` of `local`.
pub async fn search(local: Ipv4Addr, mask: Ipv4Addr, options: &SearchOptions) -> Result<Vec<DiscoveredDevice>> {
    let subnet = Subnet::from_mask(local, mask)?;

    let socket = UdpSocket::bind((local, options.response_port)).await?;

    scan(&socket, local, &subnet, options).await
}

/// The local address of the interface with the default route.
///
/// Nothing is sent; connecting a UDP socket only selects a route.
pub async fn default_route_address() -> Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((Ipv4Addr::new(10, 254, 254, 254), 1)).await?;

    match socket.local_addr()?.ip() {
        IpAddr::V4(address) if !address.is_unspecified() => Ok(address),
        other => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("no ipv4 route, got local address {other}"),
        ))),
    }
}


#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex as AsyncMutex};

    use super::*;

    /// A simulated network. Responders answer probes after a delay.
    type Delivery = std::result::Result<(Vec<u8>, SocketAddr), std::io::ErrorKind>;

    struct MockNetwork {
        responders: HashMap<Ipv4Addr, (Duration, Vec<Vec<u8>>)>,
        /// Sending to these fails.
        unreachable: HashSet<Ipv4Addr>,
        probes: Mutex<Vec<SocketAddr>>,
        replies_send: mpsc::UnboundedSender<Delivery>,
        replies_recv: AsyncMutex<mpsc::UnboundedReceiver<Delivery>>,
    }

    impl MockNetwork {
        fn new() -> Self {
            let (replies_send, replies_recv) = mpsc::unbounded_channel();

            Self {
                responders: HashMap::new(),
                unreachable: HashSet::new(),
                probes: Mutex::new(Vec::new()),
                replies_send,
                replies_recv: AsyncMutex::new(replies_recv),
            }
        }

        fn responder(mut self, address: [u8; 4], delay_ms: u64, replies: &[&[u8]]) -> Self {
            let replies = replies.iter().map(|reply| reply.to_vec()).collect();
            self.responders.insert(Ipv4Addr::from(address), (Duration::from_millis(delay_ms), replies));
            self
        }

        /// A datagram that arrives without being asked for.
        fn stray(self, from: [u8; 4], datagram: &[u8]) -> Self {
            let from = SocketAddr::new(IpAddr::V4(Ipv4Addr::from(from)), 9131);
            self.replies_send.send(Ok((datagram.to_vec(), from))).unwrap();
            self
        }

        /// The next receive fails with `kind`.
        fn receive_error(self, kind: std::io::ErrorKind) -> Self {
            self.replies_send.send(Err(kind)).unwrap();
            self
        }

        fn unreachable(mut self, address: [u8; 4]) -> Self {
            self.unreachable.insert(Ipv4Addr::from(address));
            self
        }

        fn probed(&self) -> Vec<Ipv4Addr> {
            self.probes.lock().unwrap().iter()
                .map(|target| match target.ip() {
                    IpAddr::V4(address) => address,
                    IpAddr::V6(_) => panic!("probe to ipv6 address"),
                })
                .collect()
        }
    }

    #[async_trait]
    impl DatagramTransport for MockNetwork {
        async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
            assert_eq!(data, QUERY);
            assert_eq!(target.port(), 9131);

            self.probes.lock().unwrap().push(target);

            let IpAddr::V4(address) = target.ip() else { return Ok(()) };

            if self.unreachable.contains(&address) {
                return Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied).into());
            }

            if let Some((delay, replies)) = self.responders.get(&address) {
                let delay = *delay;
                let replies = replies.clone();
                let send = self.replies_send.clone();

                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for reply in replies {
                        let _ = send.send(Ok((reply, SocketAddr::new(target.ip(), 9131))));
                    }
                });
            }

            Ok(())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
            let mut replies = self.replies_recv.lock().await;

            match replies.recv().await {
                Some(Ok((datagram, from))) => {
                    let len = datagram.len().min(buf.len());
                    buf[..len].copy_from_slice(&datagram[..len]);
                    Ok((len, from))
                },
                Some(Err(kind)) => Err(std::io::Error::from(kind).into()),
                None => std::future::pending().await,
            }
        }
    }

    fn ip(octets: [u8; 4]) -> Ipv4Addr {
        Ipv4Addr::from(octets)
    }

    #[test]
    fn test_subnet_from_mask() {
        let subnet = Subnet::from_mask(ip([192, 168, 100, 5]), ip([255, 255, 255, 0])).unwrap();
        assert_eq!(subnet.network(), ip([192, 168, 100, 0]));
        assert_eq!(subnet.prefix(), 24);
        assert_eq!(subnet.broadcast(), ip([192, 168, 100, 255]));
        assert!(subnet.contains(ip([192, 168, 100, 77])));
        assert!(!subnet.contains(ip([192, 168, 101, 77])));
        assert_eq!(subnet.hosts().count(), 254);

        assert!(matches!(
            Subnet::from_mask(ip([10, 0, 0, 1]), ip([255, 0, 255, 0])),
            Err(Error::InvalidMask(mask)) if mask == ip([255, 0, 255, 0])
        ));
        assert!(matches!(Subnet::from_prefix(ip([10, 0, 0, 1]), 33), Err(Error::InvalidPrefix(33))));

        let all = Subnet::from_mask(ip([10, 0, 0, 1]), ip([0, 0, 0, 0])).unwrap();
        assert_eq!(all.prefix(), 0);
        assert_eq!(all.mask(), ip([0, 0, 0, 0]));
    }

    #[test]
    fn test_subnet_hosts() {
        let subnet = Subnet::from_prefix(ip([192, 168, 1, 1]), 30).unwrap();
        assert_eq!(subnet.hosts().collect::<Vec<_>>(), [ip([192, 168, 1, 1]), ip([192, 168, 1, 2])]);
        assert_eq!(subnet.candidates(ip([192, 168, 1, 1])).collect::<Vec<_>>(), [ip([192, 168, 1, 2])]);

        let subnet = Subnet::from_prefix(ip([192, 168, 1, 7]), 31).unwrap();
        assert_eq!(subnet.hosts().collect::<Vec<_>>(), [ip([192, 168, 1, 6]), ip([192, 168, 1, 7])]);

        let subnet = Subnet::from_prefix(ip([192, 168, 1, 7]), 32).unwrap();
        assert_eq!(subnet.hosts().collect::<Vec<_>>(), [ip([192, 168, 1, 7])]);
        assert_eq!(subnet.candidates(ip([192, 168, 1, 7])).count(), 0);
    }

    #[test]
    fn test_parse_response() {
        let address = ip([10, 0, 0, 9]);

        let device = parse_response(address, b"Response,BlueFalls,0a1b2c3d,AS-1000\0").unwrap();
        assert_eq!(device.address, address);
        assert_eq!(device.guid.as_deref(), Some("0a1b2c3d"));
        assert_eq!(device.product_id.as_deref(), Some("AS-1000"));

        let device = parse_response(address, b"Response,BlueFalls,").unwrap();
        assert_eq!(device, DiscoveredDevice { address, guid: None, product_id: None });

        let device = parse_response(address, b"Response,BlueFalls,,AS-1000").unwrap();
        assert_eq!(device.guid, None);
        assert_eq!(device.product_id.as_deref(), Some("AS-1000"));

        assert_eq!(parse_response(address, b"Query,BlueFalls,"), None);
        assert_eq!(parse_response(address, b"Response,"), None);
        assert_eq!(parse_response(address, b""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_probes_each_candidate_once() {
        let network = MockNetwork::new()
            .responder([192, 168, 1, 2], 10, &[b"Response,BlueFalls,guid-2,"]);

        let local = ip([192, 168, 1, 1]);
        let subnet = Subnet::from_prefix(local, 30).unwrap();

        let devices = scan(&network, local, &subnet, &SearchOptions::default()).await.unwrap();

        assert_eq!(network.probed(), [ip([192, 168, 1, 2])]);
        assert_eq!(devices, [DiscoveredDevice {
            address: ip([192, 168, 1, 2]),
            guid: Some("guid-2".into()),
            product_id: None,
        }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_survives_failed_probes() {
        let network = MockNetwork::new()
            .receive_error(std::io::ErrorKind::ConnectionReset)
            .responder([192, 168, 1, 2], 10, &[b"Response,BlueFalls,two,"])
            .unreachable([192, 168, 1, 127])
            .responder([192, 168, 1, 200], 20, &[b"Response,BlueFalls,far,"]);

        let local = ip([192, 168, 1, 1]);
        let subnet = Subnet::from_prefix(local, 24).unwrap();

        let devices = scan(&network, local, &subnet, &SearchOptions::default()).await.unwrap();

        let addresses: Vec<_> = devices.iter().map(|device| device.address).collect();
        assert_eq!(addresses, [ip([192, 168, 1, 2]), ip([192, 168, 1, 200])]);

        // every candidate was still tried
        assert_eq!(network.probed().len(), 253);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_socket_failure_is_fatal() {
        let network = MockNetwork::new()
            .receive_error(std::io::ErrorKind::Other);

        let local = ip([192, 168, 1, 1]);
        let subnet = Subnet::from_prefix(local, 30).unwrap();

        let result = scan(&network, local, &subnet, &SearchOptions::default()).await;
        assert!(matches!(result, Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::Other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_without_time_limit() {
        let network = MockNetwork::new();

        let options = SearchOptions { overall_timeout: Duration::MAX, ..Default::default() };
        let local = ip([192, 168, 1, 1]);
        let subnet = Subnet::from_prefix(local, 30).unwrap();

        let start = Instant::now();
        let devices = scan(&network, local, &subnet, &options).await.unwrap();

        assert!(devices.is_empty());
        assert_eq!(network.probed(), [ip([192, 168, 1, 2])]);
        assert!(start.elapsed() < Duration::from_millis(1010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_collects_responders() {
        let network = MockNetwork::new()
            .stray([10, 0, 0, 5], b"Response,BlueFalls,stray,")
            .responder([192, 168, 1, 20], 50, &[b"Response,BlueFalls,b,", b"Response,BlueFalls,b,"])
            .responder([192, 168, 1, 10], 100, &[b"Response,BlueFalls,a,"])
            .responder([192, 168, 1, 30], 1500, &[b"Response,BlueFalls,late,"])
            .responder([192, 168, 1, 40], 10, &[b"Hello"]);

        let local = ip([192, 168, 1, 1]);
        let subnet = Subnet::from_prefix(local, 24).unwrap();

        let start = Instant::now();
        let devices = scan(&network, local, &subnet, &SearchOptions::default()).await.unwrap();

        let addresses: Vec<_> = devices.iter().map(|device| device.address).collect();
        assert_eq!(addresses, [ip([192, 168, 1, 20]), ip([192, 168, 1, 10])]);

        let probed = network.probed();
        assert_eq!(probed.len(), 253);
        assert!(!probed.contains(&local));
        assert_eq!(probed.iter().collect::<HashSet<_>>().len(), 253);

        // every window closed before the overall deadline
        assert!(start.elapsed() < SearchOptions::default().overall_timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_bounded_concurrency_and_deadline() {
        let network = MockNetwork::new()
            .responder([192, 168, 1, 3], 10, &[b"Response,BlueFalls,c,"]);

        let options = SearchOptions {
            per_host_timeout: Duration::from_secs(1),
            overall_timeout: Duration::from_millis(2500),
            concurrency: 1,
            ..Default::default()
        };

        let local = ip([192, 168, 1, 1]);
        let subnet = Subnet::from_prefix(local, 24).unwrap();

        let start = Instant::now();
        let devices = scan(&network, local, &subnet, &options).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(2500));
        assert!(start.elapsed() < Duration::from_millis(2510));

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address, ip([192, 168, 1, 3]));

        // .2 waited out its window, .3 answered at once, .4 waited, .5 was cut off
        assert_eq!(network.probed(), [ip([192, 168, 1, 2]), ip([192, 168, 1, 3]), ip([192, 168, 1, 4]), ip([192, 168, 1, 5])]);
    }

    #[tokio::test]
    async fn test_scan_over_udp() {
        // 127.0.0.3/31 leaves 127.0.0.2 as the only candidate
        let local = ip([127, 0, 0, 3]);
        let subnet = Subnet::from_prefix(local, 31).unwrap();

        let (Ok(responder), Ok(socket)) = (
            UdpSocket::bind((ip([127, 0, 0, 2]), 0)).await,
            UdpSocket::bind((local, 0)).await,
        ) else {
            // loopback aliases aren't available everywhere
            return;
        };

        let options = SearchOptions {
            per_host_timeout: Duration::from_millis(200),
            overall_timeout: Duration::from_secs(5),
            query_port: responder.local_addr().unwrap().port(),
            ..Default::default()
        };

        let server = tokio::spawn(async move {
            let mut buf = [0; 64];
            let (len, from) = responder.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], QUERY);

            responder.send_to(b"Response,BlueFalls,abc,def", from).await.unwrap();
        });

        let devices = scan(&socket, local, &subnet, &options).await.unwrap();
        server.await.unwrap();

        assert_eq!(devices, [DiscoveredDevice {
            address: ip([127, 0, 0, 2]),
            guid: Some("abc".into()),
            product_id: Some("def".into()),
        }]);
    }
}
