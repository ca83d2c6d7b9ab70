//! IP-level binding and fragment reassembly.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::frame::Frame;
use crate::ip::IpProtocol;
use crate::socket::ProtocolSocket;

/// Default time a partial datagram is kept.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on partial datagrams per socket.
pub const DEFAULT_MAX_PENDING: usize = 64;

/// Limits of the reassembly buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Partial datagrams older than this are discarded
    pub timeout: Duration,
    /// New datagrams beyond this many partial ones are dropped
    pub max_pending: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// A complete IP payload addressed to a socket.
#[derive(Debug, Clone, PartialEq)]
pub struct IpDatagram {
    pub source: IpAddr,
    pub destination: IpAddr,
    pub protocol: IpProtocol,
    /// The parsed upper layer, or raw bytes for reassembled datagrams
    pub payload: Frame,
}

/// What happened to a frame offered to an [`IpSocket`].
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Not addressed to this binding
    Ignored,
    /// A fragment was buffered
    Pending,
    /// A fragment was discarded (buffer limit reached)
    Dropped,
    Complete(IpDatagram),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    source: IpAddr,
    destination: IpAddr,
    identification: u32,
}

/// Fragment position within the original datagram.
#[derive(Debug, Clone, Copy)]
struct FragmentInfo {
    identification: u32,
    offset: usize,
    more_fragments: bool,
}

#[derive(Debug)]
struct ReassemblyBuffer {
    data: Vec<u8>,
    /// One flag per 8-byte block
    covered: Vec<bool>,
    total_length: Option<usize>,
    created: Instant,
}

impl ReassemblyBuffer {
    fn new(now: Instant) -> Self {
        Self {
            data: Vec::new(),
            covered: Vec::new(),
            total_length: None,
            created: now,
        }
    }

    /// Writes a fragment; overlapping bytes take the latest value.
    fn insert(&mut self, offset: usize, bytes: &[u8], more_fragments: bool) {
        let end = offset + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);

        let last_block = end.div_ceil(8);
        if self.covered.len() < last_block {
            self.covered.resize(last_block, false);
        }
        self.covered[offset / 8..last_block].fill(true);

        if !more_fragments {
            self.total_length = Some(end);
        }
    }

    fn is_complete(&self) -> bool {
        self.total_length.is_some_and(|total| {
            let blocks = total.div_ceil(8);
            self.covered.len() >= blocks && self.covered[..blocks].iter().all(|covered| *covered)
        })
    }

    fn into_payload(mut self) -> Vec<u8> {
        if let Some(total) = self.total_length {
            self.data.truncate(total);
        }
        self.data
    }
}

/// The IP layer as seen by a socket: addresses, protocol and fragment info.
struct Arrival<'a> {
    source: IpAddr,
    destination: IpAddr,
    protocol: IpProtocol,
    fragment: Option<FragmentInfo>,
    payload: Option<&'a Frame>,
}

fn classify(frame: &Frame) -> Option<Arrival<'_>> {
    frame.iter().find_map(|layer| match layer {
        Frame::Ipv4(ip) => Some(Arrival {
            source: IpAddr::V4(ip.source),
            destination: IpAddr::V4(ip.destination),
            protocol: ip.protocol,
            fragment: ip.is_fragment().then_some(FragmentInfo {
                identification: u32::from(ip.identification),
                offset: ip.fragment_offset as usize * 8,
                more_fragments: ip.flags.more_fragments,
            }),
            payload: ip.payload.as_deref(),
        }),
        Frame::Ipv6(ip) => {
            let mut protocol = ip.next_header;
            let mut fragment = None;
            let mut current = ip.payload.as_deref();
            loop {
                match current {
                    Some(Frame::Ipv6Routing(header)) => {
                        protocol = header.next_header;
                        current = header.payload.as_deref();
                    }
                    Some(Frame::Ipv6Fragment(header)) => {
                        protocol = header.next_header;
                        if header.is_fragment() {
                            fragment = Some(FragmentInfo {
                                identification: header.identification,
                                offset: header.fragment_offset as usize * 8,
                                more_fragments: header.more_fragments,
                            });
                        }
                        current = header.payload.as_deref();
                    }
                    _ => break,
                }
            }
            Some(Arrival {
                source: IpAddr::V6(ip.source),
                destination: IpAddr::V6(ip.destination),
                protocol,
                fragment,
                payload: current,
            })
        }
        _ => None,
    })
}

/// A binding on (local address, optional remote address, protocol).
///
/// Unfragmented datagrams complete immediately; fragments are buffered per
/// (source, destination, identification) until every 8-byte block up to
/// the final fragment is covered, then delivered as raw bytes.
#[derive(Debug)]
pub struct IpSocket {
    local: IpAddr,
    remote: Option<IpAddr>,
    protocol: IpProtocol,
    config: ReassemblyConfig,
    buffers: Mutex<HashMap<FragmentKey, ReassemblyBuffer>>,
    received: Mutex<VecDeque<IpDatagram>>,
}

impl IpSocket {
    /// Binds `protocol` on `local`. An unspecified address accepts any destination.
    pub fn bind(local: IpAddr, protocol: IpProtocol) -> Self {
        Self {
            local,
            remote: None,
            protocol,
            config: ReassemblyConfig::default(),
            buffers: Mutex::new(HashMap::new()),
            received: Mutex::new(VecDeque::new()),
        }
    }

    /// Only accepts datagrams from `remote`.
    pub fn with_remote(mut self, remote: IpAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_config(mut self, config: ReassemblyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn local(&self) -> IpAddr {
        self.local
    }

    pub fn remote(&self) -> Option<IpAddr> {
        self.remote
    }

    pub fn protocol(&self) -> IpProtocol {
        self.protocol
    }

    /// Number of partially reassembled datagrams.
    pub fn pending(&self) -> usize {
        self.buffers.lock().len()
    }

    fn matches(&self, arrival: &Arrival<'_>) -> bool {
        arrival.protocol == self.protocol
            && (self.local.is_unspecified() || arrival.destination == self.local)
            && self.remote.is_none_or(|remote| remote == arrival.source)
    }

    /// Offers a frame to the binding without queueing the result.
    pub fn deliver(&self, frame: &Frame) -> Delivery {
        let Some(arrival) = classify(frame) else {
            return Delivery::Ignored;
        };
        if !self.matches(&arrival) {
            return Delivery::Ignored;
        }

        let Some(fragment) = arrival.fragment else {
            return Delivery::Complete(IpDatagram {
                source: arrival.source,
                destination: arrival.destination,
                protocol: arrival.protocol,
                payload: arrival.payload.cloned().unwrap_or_else(|| Frame::raw(&[])),
            });
        };

        let key = FragmentKey {
            source: arrival.source,
            destination: arrival.destination,
            identification: fragment.identification,
        };
        let bytes = arrival.payload.map(Frame::to_bytes).unwrap_or_default();
        let now = Instant::now();

        let mut buffers = self.buffers.lock();
        let timeout = self.config.timeout;
        buffers.retain(|key, buffer| {
            let alive = now.duration_since(buffer.created) < timeout;
            if !alive {
                debug!(identification = key.identification, "Reassembly timed out");
            }
            alive
        });
        if !buffers.contains_key(&key) && buffers.len() >= self.config.max_pending {
            debug!(
                identification = fragment.identification,
                pending = buffers.len(),
                "Reassembly buffers full, dropping fragment"
            );
            return Delivery::Dropped;
        }

        let buffer = buffers.entry(key).or_insert_with(|| ReassemblyBuffer::new(now));
        buffer.insert(fragment.offset, &bytes, fragment.more_fragments);
        if !buffer.is_complete() {
            return Delivery::Pending;
        }
        let Some(buffer) = buffers.remove(&key) else {
            return Delivery::Pending;
        };
        drop(buffers);

        let payload = buffer.into_payload();
        trace!(
            identification = fragment.identification,
            length = payload.len(),
            "Datagram reassembled"
        );
        Delivery::Complete(IpDatagram {
            source: arrival.source,
            destination: arrival.destination,
            protocol: arrival.protocol,
            payload: Frame::raw(&payload),
        })
    }

    /// Takes the oldest complete datagram.
    pub fn receive(&self) -> Option<IpDatagram> {
        self.received.lock().pop_front()
    }
}

impl ProtocolSocket for IpSocket {
    fn push_up(&self, frame: &Frame) -> bool {
        match self.deliver(frame) {
            Delivery::Ignored => false,
            Delivery::Pending | Delivery::Dropped => true,
            Delivery::Complete(datagram) => {
                self.received.lock().push_back(datagram);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{fragment_ipv4, fragment_ipv6};
    use crate::ip::Ipv4Frame;
    use crate::ipv6::Ipv6Frame;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 2);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

    fn datagram(identification: u16, length: usize) -> Ipv4Frame {
        let data: Vec<u8> = (0..length).map(|i| (i % 199) as u8).collect();
        let mut ip = Ipv4Frame::new(IpProtocol::Other(253), REMOTE, LOCAL).with_payload(Frame::raw(&data));
        ip.identification = identification;
        ip
    }

    fn socket() -> IpSocket {
        IpSocket::bind(IpAddr::V4(LOCAL), IpProtocol::Other(253))
    }

    #[test]
    fn test_unfragmented_datagram_completes() {
        let socket = socket();
        let ip = datagram(1, 100);
        assert!(socket.push_up(&Frame::Ipv4(ip.clone())));
        let received = socket.receive().unwrap();
        assert_eq!(received.source, IpAddr::V4(REMOTE));
        assert_eq!(received.payload.to_bytes(), crate::frame::payload_bytes(&ip.payload));
    }

    #[test]
    fn test_binding_mismatch_is_ignored() {
        let socket = socket().with_remote(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert!(!socket.push_up(&Frame::Ipv4(datagram(1, 10))));
        let other_protocol = IpSocket::bind(IpAddr::V4(LOCAL), IpProtocol::Udp);
        assert!(!other_protocol.push_up(&Frame::Ipv4(datagram(1, 10))));
        assert!(!socket.push_up(&Frame::raw(&[1, 2, 3])));
    }

    #[test]
    fn test_interleaved_datagrams_with_duplicates() {
        let socket = socket();
        let first = fragment_ipv4(&datagram(7, 2000), 300).unwrap();
        let second = fragment_ipv4(&datagram(8, 1000), 300).unwrap();

        for (index, (a, b)) in first.iter().zip(second.iter()).enumerate() {
            socket.push_up(&Frame::Ipv4(b.clone()));
            if index == 0 {
                socket.push_up(&Frame::Ipv4(b.clone()));
            }
            socket.push_up(&Frame::Ipv4(a.clone()));
        }
        for piece in &first[second.len()..] {
            socket.push_up(&Frame::Ipv4(piece.clone()));
        }

        let mut lengths: Vec<usize> = std::iter::from_fn(|| socket.receive())
            .map(|datagram| datagram.payload.len())
            .collect();
        lengths.sort();
        assert_eq!(lengths, vec![1000, 2000]);
        assert_eq!(socket.pending(), 0);
    }

    #[test]
    fn test_missing_block_keeps_datagram_pending() {
        let socket = socket();
        let pieces = fragment_ipv4(&datagram(9, 1000), 300).unwrap();
        for piece in pieces.iter().skip(1) {
            assert!(socket.push_up(&Frame::Ipv4(piece.clone())));
        }
        assert!(socket.receive().is_none());
        assert_eq!(socket.pending(), 1);
    }

    #[test]
    fn test_pending_bound_drops_new_datagrams() {
        let socket = socket().with_config(ReassemblyConfig {
            timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_pending: 1,
        });
        let a = fragment_ipv4(&datagram(1, 1000), 300).unwrap();
        let b = fragment_ipv4(&datagram(2, 1000), 300).unwrap();
        assert_eq!(socket.deliver(&Frame::Ipv4(a[0].clone())), Delivery::Pending);
        assert_eq!(socket.deliver(&Frame::Ipv4(b[0].clone())), Delivery::Dropped);
    }

    #[test]
    fn test_expired_buffers_are_discarded() {
        let socket = socket().with_config(ReassemblyConfig {
            timeout: Duration::ZERO,
            max_pending: DEFAULT_MAX_PENDING,
        });
        let pieces = fragment_ipv4(&datagram(3, 1000), 300).unwrap();
        for piece in &pieces {
            socket.push_up(&Frame::Ipv4(piece.clone()));
        }
        assert!(socket.receive().is_none());
    }

    #[test]
    fn test_ipv6_reassembly() {
        let local: Ipv6Addr = "fe80::2".parse().unwrap();
        let remote: Ipv6Addr = "fe80::1".parse().unwrap();
        let data: Vec<u8> = (0..3000).map(|i| (i % 97) as u8).collect();
        let ip = Ipv6Frame::new(IpProtocol::Other(253), remote, local).with_payload(Frame::raw(&data));

        let socket = IpSocket::bind(IpAddr::V6(local), IpProtocol::Other(253));
        for piece in fragment_ipv6(&ip, 1280, Some(42)).unwrap() {
            assert!(socket.push_up(&Frame::Ipv6(piece)));
        }
        assert_eq!(socket.receive().unwrap().payload.to_bytes(), data);
    }
}
