//! IPv6 base header and the Fragment and Routing extension headers.
//!
//! Extension headers are frames of their own and chain through
//! `next_header`, so `Ipv6 -> Ipv6Routing -> Ipv6Fragment -> Udp` is an
//! ordinary frame chain.

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::frame::{self, Frame, FrameType};
use crate::ip::IpProtocol;
use crate::{Checksummed, Codec, FrameError};

pub const HEADER_LENGTH: usize = 40;
pub const FRAGMENT_HEADER_LENGTH: usize = 8;

/// IPv6 base header.
///
/// The payload length is computed when serializing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ipv6Frame {
    pub traffic_class: u8,
    /// 20-bit flow label
    pub flow_label: u32,
    pub next_header: IpProtocol,
    pub hop_limit: u8,
    pub source: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub payload: Option<Box<Frame>>,
}

impl Ipv6Frame {
    pub fn new(next_header: IpProtocol, source: Ipv6Addr, destination: Ipv6Addr) -> Self {
        Self {
            traffic_class: 0,
            flow_label: 0,
            next_header,
            hop_limit: 64,
            source,
            destination,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Frame) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    /// Builds the checksum pseudo-header for an upper-layer unit of `length` bytes.
    pub fn pseudo_header(&self, next_header: IpProtocol, length: usize) -> Vec<u8> {
        checksum::ipv6_pseudo_header(self.source, self.destination, next_header.to_u8(), length as u32)
    }

    /// The first frame after the extension header chain.
    pub fn upper_layer(&self) -> Option<&Frame> {
        let mut current = self.payload.as_deref();
        while let Some(frame) = current {
            match frame {
                Frame::Ipv6Fragment(_) | Frame::Ipv6Routing(_) => current = frame.encapsulated(),
                _ => break,
            }
        }
        current
    }

    /// Recomputes the UDP, TCP or ICMPv6 checksum of the upper-layer unit.
    pub fn update_transport_checksum(&mut self) {
        let (source, destination) = (self.source, self.destination);
        let pseudo = |protocol: IpProtocol, length: usize| {
            checksum::ipv6_pseudo_header(source, destination, protocol.to_u8(), length as u32)
        };
        let mut current = self.payload.as_deref_mut();
        loop {
            match current {
                Some(Frame::Ipv6Fragment(header)) => current = header.payload.as_deref_mut(),
                Some(Frame::Ipv6Routing(header)) => current = header.payload.as_deref_mut(),
                Some(Frame::Udp(udp)) => {
                    udp.checksum = udp.calculate_checksum(&pseudo(IpProtocol::Udp, udp.length()));
                    return;
                }
                Some(Frame::Tcp(tcp)) => {
                    tcp.checksum = tcp.calculate_checksum(&pseudo(IpProtocol::Tcp, tcp.length()));
                    return;
                }
                Some(Frame::Icmpv6(icmp)) => {
                    icmp.checksum = icmp.calculate_checksum(&pseudo(IpProtocol::Icmpv6, icmp.length()));
                    return;
                }
                _ => return,
            }
        }
    }
}

impl Codec for Ipv6Frame {
    const FRAME_TYPE: FrameType = FrameType::Ipv6;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("ipv6", bytes, HEADER_LENGTH)?;
        let version = bytes[0] >> 4;
        if version != 6 {
            return Err(FrameError::InvalidProtocolVersion { codec: "ipv6", version });
        }
        let payload_length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        FrameError::ensure("ipv6", bytes, HEADER_LENGTH + payload_length)?;

        let next_header = IpProtocol::from_u8(bytes[6]);
        let mut source = [0u8; 16];
        source.copy_from_slice(&bytes[8..24]);
        let mut destination = [0u8; 16];
        destination.copy_from_slice(&bytes[24..40]);

        Ok(Self {
            traffic_class: (bytes[0] << 4) | (bytes[1] >> 4),
            flow_label: u32::from_be_bytes([0, bytes[1] & 0x0F, bytes[2], bytes[3]]),
            next_header,
            hop_limit: bytes[7],
            source: Ipv6Addr::from(source),
            destination: Ipv6Addr::from(destination),
            payload: frame::parse_ip_payload(next_header, &bytes[HEADER_LENGTH..HEADER_LENGTH + payload_length])?,
        })
    }

    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        let payload = frame::payload_bytes(&self.payload);
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + payload.len());
        let first_word = (6u32 << 28) | ((self.traffic_class as u32) << 20) | (self.flow_label & 0x000F_FFFF);
        bytes.extend_from_slice(&first_word.to_be_bytes());
        bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        bytes.push(self.next_header.to_u8());
        bytes.push(self.hop_limit);
        bytes.extend_from_slice(&self.source.octets());
        bytes.extend_from_slice(&self.destination.octets());
        bytes.extend_from_slice(&payload);
        bytes
    }

    fn length(&self) -> usize {
        HEADER_LENGTH + frame::payload_length(&self.payload)
    }

    fn validate(&self) -> Result<(), FrameError> {
        if frame::payload_length(&self.payload) > u16::MAX as usize {
            return Err(FrameError::invalid_length("ipv6", "payload exceeds 65535 bytes"));
        }
        if self.flow_label > 0x000F_FFFF {
            return Err(FrameError::InvalidFieldValue("flow label exceeds 20 bits".to_string()));
        }
        Ok(())
    }
}

/// IPv6 Fragment extension header (next header 44).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ipv6FragmentHeader {
    pub next_header: IpProtocol,
    /// Offset in 8-byte units
    pub fragment_offset: u16,
    pub more_fragments: bool,
    pub identification: u32,
    pub payload: Option<Box<Frame>>,
}

impl Ipv6FragmentHeader {
    pub fn new(next_header: IpProtocol, identification: u32) -> Self {
        Self {
            next_header,
            fragment_offset: 0,
            more_fragments: false,
            identification,
            payload: None,
        }
    }

    /// True when this header describes one piece of a larger datagram.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.fragment_offset != 0
    }
}

impl Codec for Ipv6FragmentHeader {
    const FRAME_TYPE: FrameType = FrameType::Ipv6Fragment;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("ipv6 fragment", bytes, FRAGMENT_HEADER_LENGTH)?;
        let next_header = IpProtocol::from_u8(bytes[0]);
        let offset_word = u16::from_be_bytes([bytes[2], bytes[3]]);
        let mut header = Self {
            next_header,
            fragment_offset: offset_word >> 3,
            more_fragments: offset_word & 0x0001 != 0,
            identification: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            payload: None,
        };

        let payload = &bytes[FRAGMENT_HEADER_LENGTH..];
        header.payload = if header.is_fragment() {
            (!payload.is_empty()).then(|| Box::new(Frame::raw(payload)))
        } else {
            frame::parse_ip_payload(next_header, payload)?
        };
        Ok(header)
    }

    fn header_length(&self) -> usize {
        FRAGMENT_HEADER_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length());
        bytes.push(self.next_header.to_u8());
        bytes.push(0);
        let offset_word = (self.fragment_offset << 3) | self.more_fragments as u16;
        bytes.extend_from_slice(&offset_word.to_be_bytes());
        bytes.extend_from_slice(&self.identification.to_be_bytes());
        bytes.extend_from_slice(&frame::payload_bytes(&self.payload));
        bytes
    }

    fn length(&self) -> usize {
        FRAGMENT_HEADER_LENGTH + frame::payload_length(&self.payload)
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.fragment_offset > 0x1FFF {
            return Err(FrameError::InvalidFieldValue("fragment offset exceeds 13 bits".to_string()));
        }
        Ok(())
    }
}

/// IPv6 Routing extension header (next header 43).
///
/// The type-specific data is kept as raw bytes and zero-padded to a
/// multiple of 8 bytes when written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ipv6RoutingHeader {
    pub next_header: IpProtocol,
    pub routing_type: u8,
    pub segments_left: u8,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub payload: Option<Box<Frame>>,
}

impl Ipv6RoutingHeader {
    pub fn new(next_header: IpProtocol, routing_type: u8, segments_left: u8, data: Vec<u8>) -> Self {
        Self {
            next_header,
            routing_type,
            segments_left,
            data,
            payload: None,
        }
    }
}

impl Codec for Ipv6RoutingHeader {
    const FRAME_TYPE: FrameType = FrameType::Ipv6Routing;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("ipv6 routing", bytes, 8)?;
        let header_length = (bytes[1] as usize + 1) * 8;
        FrameError::ensure("ipv6 routing", bytes, header_length)?;
        let next_header = IpProtocol::from_u8(bytes[0]);
        Ok(Self {
            next_header,
            routing_type: bytes[2],
            segments_left: bytes[3],
            data: bytes[4..header_length].to_vec(),
            payload: frame::parse_ip_payload(next_header, &bytes[header_length..])?,
        })
    }

    fn header_length(&self) -> usize {
        (4 + self.data.len() + 7) & !7
    }

    fn to_bytes(&self) -> Vec<u8> {
        let header_length = self.header_length();
        let mut bytes = Vec::with_capacity(self.length());
        bytes.push(self.next_header.to_u8());
        bytes.push((header_length / 8 - 1) as u8);
        bytes.push(self.routing_type);
        bytes.push(self.segments_left);
        bytes.extend_from_slice(&self.data);
        bytes.resize(header_length, 0);
        bytes.extend_from_slice(&frame::payload_bytes(&self.payload));
        bytes
    }

    fn length(&self) -> usize {
        self.header_length() + frame::payload_length(&self.payload)
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.header_length() > 2048 {
            return Err(FrameError::invalid_length("ipv6 routing", "header exceeds 2048 bytes"));
        }
        Ok(())
    }
}
