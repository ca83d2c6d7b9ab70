//! UDP sockets.

use std::collections::VecDeque;
use std::net::IpAddr;

use parking_lot::Mutex;
use tracing::debug;

use crate::checksum::{self, finish, ones_complement_sum};
use crate::error::FrameError;
use crate::frame::Frame;
use crate::ip::{IpProtocol, Ipv4Frame};
use crate::ipv6::Ipv6Frame;
use crate::socket::ProtocolSocket;
use crate::socket::ip::{Delivery, IpDatagram, IpSocket, ReassemblyConfig};
use crate::udp::UdpFrame;
use crate::{Checksummed, Codec};

/// A received UDP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub source: IpAddr,
    pub source_port: u16,
    pub destination: IpAddr,
    pub destination_port: u16,
    pub payload: Vec<u8>,
}

/// A UDP binding on top of an [`IpSocket`], so fragmented datagrams are
/// reassembled before the port is checked.
#[derive(Debug)]
pub struct UdpSocket {
    ip: IpSocket,
    port: u16,
    remote_port: Option<u16>,
    received: Mutex<VecDeque<UdpDatagram>>,
}

impl UdpSocket {
    /// Binds `port` on `local`.
    pub fn bind(local: IpAddr, port: u16) -> Self {
        Self {
            ip: IpSocket::bind(local, IpProtocol::Udp),
            port,
            remote_port: None,
            received: Mutex::new(VecDeque::new()),
        }
    }

    /// Only accepts datagrams from `remote:port`.
    pub fn connect(mut self, remote: IpAddr, port: u16) -> Self {
        self.ip = self.ip.with_remote(remote);
        self.remote_port = Some(port);
        self
    }

    pub fn with_reassembly(mut self, config: ReassemblyConfig) -> Self {
        self.ip = self.ip.with_config(config);
        self
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Takes the oldest received datagram.
    pub fn receive(&self) -> Option<UdpDatagram> {
        self.received.lock().pop_front()
    }

    /// Builds an IP frame carrying `payload` from this socket to `destination:port`,
    /// checksum included.
    ///
    /// # Returns
    /// - `Ok(Frame)` - An IPv4 or IPv6 frame, matching the local address family
    /// - `Err(FrameError)` - If the address families differ or the payload is too long
    pub fn datagram_to(&self, destination: IpAddr, port: u16, payload: &[u8]) -> Result<Frame, FrameError> {
        let udp = Frame::Udp(
            UdpFrame::builder()
                .source_port(self.port)
                .destination_port(port)
                .payload(Frame::raw(payload))
                .build()?,
        );

        Ok(match (self.ip.local(), destination) {
            (IpAddr::V4(source), IpAddr::V4(destination)) => {
                let mut ip = Ipv4Frame::new(IpProtocol::Udp, source, destination).with_payload(udp);
                ip.update_transport_checksum();
                Frame::Ipv4(ip)
            }
            (IpAddr::V6(source), IpAddr::V6(destination)) => {
                let mut ip = Ipv6Frame::new(IpProtocol::Udp, source, destination).with_payload(udp);
                ip.update_transport_checksum();
                Frame::Ipv6(ip)
            }
            _ => {
                return Err(FrameError::InvalidFieldValue(
                    "source and destination address families differ".into(),
                ));
            }
        })
    }

    /// Decodes the UDP header of a complete datagram and checks it against the binding.
    fn accept(&self, datagram: IpDatagram) -> bool {
        let (udp, wire) = match datagram.payload {
            Frame::Udp(udp) => (udp, None),
            Frame::Raw(raw) => match UdpFrame::parse(&raw.data) {
                Ok(udp) => (udp, Some(raw.data)),
                Err(err) => {
                    debug!(error = %err, "Discarding undecodable UDP datagram");
                    return false;
                }
            },
            _ => return false,
        };
        if udp.destination_port != self.port || self.remote_port.is_some_and(|port| port != udp.source_port) {
            return false;
        }

        let Some(pseudo) = checksum::pseudo_header(
            datagram.source,
            datagram.destination,
            IpProtocol::Udp.to_u8(),
            udp.length(),
        ) else {
            return false;
        };
        if !checksum_ok(&udp, wire.as_deref(), &pseudo) {
            debug!(port = self.port, "Discarding UDP datagram with a bad checksum");
            return true;
        }

        self.received.lock().push_back(UdpDatagram {
            source: datagram.source,
            source_port: udp.source_port,
            destination: datagram.destination,
            destination_port: udp.destination_port,
            payload: udp.payload_bytes(),
        });
        true
    }
}

/// Verifies against the wire bytes when available.
///
/// Parsed application payloads may not re-serialize byte for byte (DNS
/// names are written uncompressed), so parsed frames are only checked when
/// their payload is raw.
fn checksum_ok(udp: &UdpFrame, wire: Option<&[u8]>, pseudo: &[u8]) -> bool {
    if udp.checksum == 0 {
        return true;
    }
    match wire {
        Some(bytes) => finish(ones_complement_sum(bytes, ones_complement_sum(pseudo, 0))) == 0,
        None if matches!(udp.payload.as_deref(), None | Some(Frame::Raw(_))) => udp.verify_checksum(pseudo),
        None => true,
    }
}

impl ProtocolSocket for UdpSocket {
    fn push_up(&self, frame: &Frame) -> bool {
        match self.ip.deliver(frame) {
            Delivery::Ignored => false,
            Delivery::Pending | Delivery::Dropped => true,
            Delivery::Complete(datagram) => self.accept(datagram),
        }
    }
}
