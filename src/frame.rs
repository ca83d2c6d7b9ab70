//! The recursive frame model.
//!
//! A [`Frame`] is one parsed protocol unit. Every codec struct owns an
//! optional encapsulated frame, so a captured packet becomes a chain such as
//! `TrafficDescription -> Ethernet -> Ipv4 -> Udp -> Dns`. Frames form a
//! tree: each node exclusively owns its payload and `Clone` copies the whole
//! chain.

use std::net::IpAddr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::Codec;
use crate::arp::ArpFrame;
use crate::dns::DnsMessage;
use crate::error::FrameError;
use crate::ethernet::{EtherType, EthernetFrame};
use crate::http::HttpMessage;
use crate::icmp::IcmpFrame;
use crate::icmpv6::Icmpv6Frame;
use crate::ip::{IpProtocol, Ipv4Frame};
use crate::ipv6::{Ipv6FragmentHeader, Ipv6Frame, Ipv6RoutingHeader};
use crate::ospf::OspfPacket;
use crate::rip::RipMessage;
use crate::tcp::TcpFrame;
use crate::udp::UdpFrame;

/// Well-known UDP port of DNS.
pub const DNS_PORT: u16 = 53;
/// Well-known UDP port of RIP.
pub const RIP_PORT: u16 = 520;

/// Protocol tag of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameType {
    Raw,
    TrafficDescription,
    Ethernet,
    Arp,
    Ipv4,
    Ipv6,
    Ipv6Fragment,
    Ipv6Routing,
    Udp,
    Tcp,
    Icmp,
    Icmpv6,
    Dns,
    Http,
    Ospf,
    Rip,
}

/// Opaque bytes: unknown payloads, fragments, or freshly captured data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDataFrame {
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl RawDataFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Codec for RawDataFrame {
    const FRAME_TYPE: FrameType = FrameType::Raw;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(Self::new(bytes.to_vec()))
    }

    fn header_length(&self) -> usize {
        self.data.len()
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn length(&self) -> usize {
        self.data.len()
    }
}

/// Out-of-band capture metadata that travels with a frame.
///
/// Serialization is transparent: the bytes of a description frame are the
/// bytes of its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficDescriptionFrame {
    pub timestamp: SystemTime,
    /// Name of the interface the frame was captured on
    pub source_interface: String,
    pub payload: Option<Box<Frame>>,
}

impl TrafficDescriptionFrame {
    pub fn new(source_interface: impl Into<String>, payload: Frame) -> Self {
        Self {
            timestamp: SystemTime::now(),
            source_interface: source_interface.into(),
            payload: Some(Box::new(payload)),
        }
    }
}

/// A frame of any supported protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Raw(RawDataFrame),
    TrafficDescription(TrafficDescriptionFrame),
    Ethernet(EthernetFrame),
    Arp(ArpFrame),
    Ipv4(Ipv4Frame),
    Ipv6(Ipv6Frame),
    Ipv6Fragment(Ipv6FragmentHeader),
    Ipv6Routing(Ipv6RoutingHeader),
    Udp(UdpFrame),
    Tcp(TcpFrame),
    Icmp(IcmpFrame),
    Icmpv6(Icmpv6Frame),
    Dns(DnsMessage),
    Http(HttpMessage),
    Ospf(OspfPacket),
    Rip(RipMessage),
}

/// Iterator over a frame and its encapsulated frames, outermost first.
pub struct FrameIter<'a> {
    next: Option<&'a Frame>,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = &'a Frame;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.encapsulated();
        Some(current)
    }
}

macro_rules! frame_accessors {
    ($($variant:ident => $ty:ty, $get:ident, $get_mut:ident;)*) => {
        impl Frame {
            $(
                /// Returns the outermost frame of this type in the chain.
                pub fn $get(&self) -> Option<&$ty> {
                    self.iter().find_map(|frame| match frame {
                        Frame::$variant(inner) => Some(inner),
                        _ => None,
                    })
                }

                pub fn $get_mut(&mut self) -> Option<&mut $ty> {
                    match self {
                        Frame::$variant(inner) => Some(inner),
                        other => other.encapsulated_mut().and_then(|frame| frame.$get_mut()),
                    }
                }
            )*
        }
    };
}

frame_accessors! {
    Raw => RawDataFrame, raw_data, raw_data_mut;
    TrafficDescription => TrafficDescriptionFrame, description, description_mut;
    Ethernet => EthernetFrame, ethernet, ethernet_mut;
    Arp => ArpFrame, arp, arp_mut;
    Ipv4 => Ipv4Frame, ipv4, ipv4_mut;
    Ipv6 => Ipv6Frame, ipv6, ipv6_mut;
    Ipv6Fragment => Ipv6FragmentHeader, ipv6_fragment, ipv6_fragment_mut;
    Udp => UdpFrame, udp, udp_mut;
    Tcp => TcpFrame, tcp, tcp_mut;
    Icmpv6 => Icmpv6Frame, icmpv6, icmpv6_mut;
    Dns => DnsMessage, dns, dns_mut;
}

impl Frame {
    /// Wraps a copy of `bytes` in a raw frame.
    pub fn raw(bytes: &[u8]) -> Frame {
        Frame::Raw(RawDataFrame::new(bytes.to_vec()))
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Raw(_) => FrameType::Raw,
            Frame::TrafficDescription(_) => FrameType::TrafficDescription,
            Frame::Ethernet(_) => FrameType::Ethernet,
            Frame::Arp(_) => FrameType::Arp,
            Frame::Ipv4(_) => FrameType::Ipv4,
            Frame::Ipv6(_) => FrameType::Ipv6,
            Frame::Ipv6Fragment(_) => FrameType::Ipv6Fragment,
            Frame::Ipv6Routing(_) => FrameType::Ipv6Routing,
            Frame::Udp(_) => FrameType::Udp,
            Frame::Tcp(_) => FrameType::Tcp,
            Frame::Icmp(_) => FrameType::Icmp,
            Frame::Icmpv6(_) => FrameType::Icmpv6,
            Frame::Dns(_) => FrameType::Dns,
            Frame::Http(_) => FrameType::Http,
            Frame::Ospf(_) => FrameType::Ospf,
            Frame::Rip(_) => FrameType::Rip,
        }
    }

    /// Serializes the frame and everything it encapsulates.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Frame::Raw(f) => f.to_bytes(),
            Frame::TrafficDescription(f) => payload_bytes(&f.payload),
            Frame::Ethernet(f) => f.to_bytes(),
            Frame::Arp(f) => f.to_bytes(),
            Frame::Ipv4(f) => f.to_bytes(),
            Frame::Ipv6(f) => f.to_bytes(),
            Frame::Ipv6Fragment(f) => f.to_bytes(),
            Frame::Ipv6Routing(f) => f.to_bytes(),
            Frame::Udp(f) => f.to_bytes(),
            Frame::Tcp(f) => f.to_bytes(),
            Frame::Icmp(f) => f.to_bytes(),
            Frame::Icmpv6(f) => f.to_bytes(),
            Frame::Dns(f) => f.to_bytes(),
            Frame::Http(f) => f.to_bytes(),
            Frame::Ospf(f) => f.to_bytes(),
            Frame::Rip(f) => f.to_bytes(),
        }
    }

    /// Length of `to_bytes()`.
    pub fn len(&self) -> usize {
        match self {
            Frame::Raw(f) => f.length(),
            Frame::TrafficDescription(f) => payload_length(&f.payload),
            Frame::Ethernet(f) => f.length(),
            Frame::Arp(f) => f.length(),
            Frame::Ipv4(f) => f.length(),
            Frame::Ipv6(f) => f.length(),
            Frame::Ipv6Fragment(f) => f.length(),
            Frame::Ipv6Routing(f) => f.length(),
            Frame::Udp(f) => f.length(),
            Frame::Tcp(f) => f.length(),
            Frame::Icmp(f) => f.length(),
            Frame::Icmpv6(f) => f.length(),
            Frame::Dns(f) => f.length(),
            Frame::Http(f) => f.length(),
            Frame::Ospf(f) => f.length(),
            Frame::Rip(f) => f.length(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn payload_slot(&self) -> Option<&Option<Box<Frame>>> {
        match self {
            Frame::TrafficDescription(f) => Some(&f.payload),
            Frame::Ethernet(f) => Some(&f.payload),
            Frame::Ipv4(f) => Some(&f.payload),
            Frame::Ipv6(f) => Some(&f.payload),
            Frame::Ipv6Fragment(f) => Some(&f.payload),
            Frame::Ipv6Routing(f) => Some(&f.payload),
            Frame::Udp(f) => Some(&f.payload),
            Frame::Tcp(f) => Some(&f.payload),
            Frame::Icmp(f) => Some(&f.payload),
            _ => None,
        }
    }

    fn payload_slot_mut(&mut self) -> Option<&mut Option<Box<Frame>>> {
        match self {
            Frame::TrafficDescription(f) => Some(&mut f.payload),
            Frame::Ethernet(f) => Some(&mut f.payload),
            Frame::Ipv4(f) => Some(&mut f.payload),
            Frame::Ipv6(f) => Some(&mut f.payload),
            Frame::Ipv6Fragment(f) => Some(&mut f.payload),
            Frame::Ipv6Routing(f) => Some(&mut f.payload),
            Frame::Udp(f) => Some(&mut f.payload),
            Frame::Tcp(f) => Some(&mut f.payload),
            Frame::Icmp(f) => Some(&mut f.payload),
            _ => None,
        }
    }

    /// The directly encapsulated frame, if any.
    pub fn encapsulated(&self) -> Option<&Frame> {
        self.payload_slot().and_then(|slot| slot.as_deref())
    }

    pub fn encapsulated_mut(&mut self) -> Option<&mut Frame> {
        self.payload_slot_mut().and_then(|slot| slot.as_deref_mut())
    }

    /// Detaches and returns the encapsulated frame.
    pub fn take_encapsulated(&mut self) -> Option<Frame> {
        self.payload_slot_mut().and_then(|slot| slot.take()).map(|frame| *frame)
    }

    /// Replaces the encapsulated frame.
    ///
    /// Fails for leaf codecs, which carry no payload slot.
    pub fn set_encapsulated(&mut self, payload: Option<Frame>) -> Result<(), FrameError> {
        let frame_type = self.frame_type();
        let slot = self.payload_slot_mut().ok_or_else(|| {
            FrameError::InvalidFieldValue(format!("{:?} frames cannot encapsulate a payload", frame_type))
        })?;
        *slot = payload.map(Box::new);
        Ok(())
    }

    /// Walks the chain, outermost frame first.
    pub fn iter(&self) -> FrameIter<'_> {
        FrameIter { next: Some(self) }
    }

    /// Returns the outermost frame of the given type.
    pub fn find(&self, frame_type: FrameType) -> Option<&Frame> {
        self.iter().find(|frame| frame.frame_type() == frame_type)
    }

    /// Returns the outermost frame of the given type, mutably.
    pub fn find_mut(&mut self, frame_type: FrameType) -> Option<&mut Frame> {
        if self.frame_type() == frame_type {
            return Some(self);
        }
        self.encapsulated_mut().and_then(|frame| frame.find_mut(frame_type))
    }

    /// Removes a leading traffic description, returning the described frame.
    pub fn into_described(self) -> Option<Frame> {
        match self {
            Frame::TrafficDescription(description) => description.payload.map(|frame| *frame),
            other => Some(other),
        }
    }

    /// Source address of the outermost IP header.
    pub fn source_ip(&self) -> Option<IpAddr> {
        self.iter().find_map(|frame| match frame {
            Frame::Ipv4(ip) => Some(IpAddr::V4(ip.source)),
            Frame::Ipv6(ip) => Some(IpAddr::V6(ip.source)),
            _ => None,
        })
    }

    /// Destination address of the outermost IP header.
    pub fn destination_ip(&self) -> Option<IpAddr> {
        self.iter().find_map(|frame| match frame {
            Frame::Ipv4(ip) => Some(IpAddr::V4(ip.destination)),
            Frame::Ipv6(ip) => Some(IpAddr::V6(ip.destination)),
            _ => None,
        })
    }

    /// Parses `bytes` with the codec registered for `frame_type`.
    pub fn parse_as(frame_type: FrameType, bytes: &[u8]) -> Result<Frame, FrameError> {
        Ok(match frame_type {
            FrameType::Raw | FrameType::TrafficDescription => Frame::raw(bytes),
            FrameType::Ethernet => Frame::Ethernet(EthernetFrame::parse(bytes)?),
            FrameType::Arp => Frame::Arp(ArpFrame::parse(bytes)?),
            FrameType::Ipv4 => Frame::Ipv4(Ipv4Frame::parse(bytes)?),
            FrameType::Ipv6 => Frame::Ipv6(Ipv6Frame::parse(bytes)?),
            FrameType::Ipv6Fragment => Frame::Ipv6Fragment(Ipv6FragmentHeader::parse(bytes)?),
            FrameType::Ipv6Routing => Frame::Ipv6Routing(Ipv6RoutingHeader::parse(bytes)?),
            FrameType::Udp => Frame::Udp(UdpFrame::parse(bytes)?),
            FrameType::Tcp => Frame::Tcp(TcpFrame::parse(bytes)?),
            FrameType::Icmp => Frame::Icmp(IcmpFrame::parse(bytes)?),
            FrameType::Icmpv6 => Frame::Icmpv6(Icmpv6Frame::parse(bytes)?),
            FrameType::Dns => Frame::Dns(DnsMessage::parse(bytes)?),
            FrameType::Http => Frame::Http(HttpMessage::parse(bytes)?),
            FrameType::Ospf => Frame::Ospf(OspfPacket::parse(bytes)?),
            FrameType::Rip => Frame::Rip(RipMessage::parse(bytes)?),
        })
    }

    /// Re-parses this frame as `frame_type`, e.g. raw bytes as Ethernet.
    pub fn reparse_as(&self, frame_type: FrameType) -> Result<Frame, FrameError> {
        Frame::parse_as(frame_type, &self.to_bytes())
    }
}

pub(crate) fn payload_bytes(payload: &Option<Box<Frame>>) -> Vec<u8> {
    payload.as_ref().map(|frame| frame.to_bytes()).unwrap_or_default()
}

pub(crate) fn payload_length(payload: &Option<Box<Frame>>) -> usize {
    payload.as_ref().map_or(0, |frame| frame.len())
}

fn boxed(frame: Frame) -> Option<Box<Frame>> {
    Some(Box::new(frame))
}

/// Parses application data, keeping it raw when the codec rejects it.
fn parse_or_raw<C: Codec>(bytes: &[u8], wrap: fn(C) -> Frame) -> Frame {
    match C::parse(bytes) {
        Ok(message) => wrap(message),
        Err(err) => {
            tracing::trace!("keeping {:?} payload raw: {}", C::FRAME_TYPE, err);
            Frame::raw(bytes)
        }
    }
}

/// Dispatches an Ethernet payload by EtherType.
pub(crate) fn parse_ether_payload(ether_type: EtherType, bytes: &[u8]) -> Result<Option<Box<Frame>>, FrameError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let frame = match ether_type {
        EtherType::Ipv4 => Frame::Ipv4(Ipv4Frame::parse(bytes)?),
        EtherType::Ipv6 => Frame::Ipv6(Ipv6Frame::parse(bytes)?),
        EtherType::Arp => Frame::Arp(ArpFrame::parse(bytes)?),
        _ => Frame::raw(bytes),
    };
    Ok(boxed(frame))
}

/// Dispatches an IP payload by protocol number.
pub(crate) fn parse_ip_payload(protocol: IpProtocol, bytes: &[u8]) -> Result<Option<Box<Frame>>, FrameError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let frame = match protocol {
        IpProtocol::Udp => Frame::Udp(UdpFrame::parse(bytes)?),
        IpProtocol::Tcp => Frame::Tcp(TcpFrame::parse(bytes)?),
        IpProtocol::Icmp => Frame::Icmp(IcmpFrame::parse(bytes)?),
        IpProtocol::Icmpv6 => Frame::Icmpv6(Icmpv6Frame::parse(bytes)?),
        IpProtocol::Ipv6Fragment => Frame::Ipv6Fragment(Ipv6FragmentHeader::parse(bytes)?),
        IpProtocol::Ipv6Routing => Frame::Ipv6Routing(Ipv6RoutingHeader::parse(bytes)?),
        IpProtocol::Ospf => parse_or_raw(bytes, Frame::Ospf),
        _ => Frame::raw(bytes),
    };
    Ok(boxed(frame))
}

/// Dispatches a UDP payload by well-known port.
pub(crate) fn parse_udp_payload(source_port: u16, destination_port: u16, bytes: &[u8]) -> Option<Box<Frame>> {
    if bytes.is_empty() {
        return None;
    }
    let is = |port: u16| source_port == port || destination_port == port;
    let frame = if is(DNS_PORT) {
        parse_or_raw(bytes, Frame::Dns)
    } else if is(RIP_PORT) {
        parse_or_raw(bytes, Frame::Rip)
    } else {
        Frame::raw(bytes)
    };
    boxed(frame)
}
