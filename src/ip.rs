use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::checksum::{self, internet_checksum};
use crate::frame::{self, Frame, FrameType};
use crate::{Checksummed, Codec, FrameError};

const MIN_HEADER_LENGTH: usize = 20;
const MAX_TOTAL_LENGTH: usize = u16::MAX as usize;

/// IP protocol numbers (shared by the IPv4 protocol field and the IPv6
/// next-header chain).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum IpProtocol {
    HopByHop,
    Icmp,
    Tcp,
    Udp,
    Ipv6Routing,
    Ipv6Fragment,
    Icmpv6,
    Ipv6NoNext,
    Ospf,
    Other(u8),
}

impl IpProtocol {
    pub fn to_u8(self) -> u8 {
        match self {
            IpProtocol::HopByHop => 0,
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Ipv6Routing => 43,
            IpProtocol::Ipv6Fragment => 44,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Ipv6NoNext => 59,
            IpProtocol::Ospf => 89,
            IpProtocol::Other(value) => value,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => IpProtocol::HopByHop,
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            43 => IpProtocol::Ipv6Routing,
            44 => IpProtocol::Ipv6Fragment,
            58 => IpProtocol::Icmpv6,
            59 => IpProtocol::Ipv6NoNext,
            89 => IpProtocol::Ospf,
            other => IpProtocol::Other(other),
        }
    }
}

/// IPv4 header flags
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ipv4Flags {
    pub reserved: bool,
    pub dont_fragment: bool,
    pub more_fragments: bool,
}

impl Ipv4Flags {
    pub fn new(dont_fragment: bool, more_fragments: bool) -> Self {
        Self {
            reserved: false,
            dont_fragment,
            more_fragments,
        }
    }

    pub fn as_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.reserved {
            flags |= 0b100;
        }
        if self.dont_fragment {
            flags |= 0b010;
        }
        if self.more_fragments {
            flags |= 0b001;
        }
        flags
    }

    pub fn from_u8(flags: u8) -> Self {
        Self {
            reserved: flags & 0b100 != 0,
            dont_fragment: flags & 0b010 != 0,
            more_fragments: flags & 0b001 != 0,
        }
    }
}

/// IPv4 frame.
///
/// Total length and header checksum are computed when serializing.
/// `fragment_offset` counts 8-byte units.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ipv4Frame {
    /// DSCP and ECN bits
    pub type_of_service: u8,
    pub identification: u16,
    pub flags: Ipv4Flags,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// Raw option bytes, zero-padded to a 4-byte boundary when written
    #[serde(with = "serde_bytes")]
    pub options: Vec<u8>,
    pub payload: Option<Box<Frame>>,
}

impl Ipv4Frame {
    pub fn new(protocol: IpProtocol, source: Ipv4Addr, destination: Ipv4Addr) -> Self {
        Self {
            type_of_service: 0,
            identification: 0,
            flags: Ipv4Flags::default(),
            fragment_offset: 0,
            ttl: 64,
            protocol,
            source,
            destination,
            options: Vec::new(),
            payload: None,
        }
    }

    /// Creates a new IPv4 frame builder.
    pub fn builder() -> Ipv4Builder {
        Ipv4Builder::default()
    }

    pub fn with_payload(mut self, payload: Frame) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    /// True when this frame is one piece of a fragmented datagram.
    pub fn is_fragment(&self) -> bool {
        self.flags.more_fragments || self.fragment_offset != 0
    }

    /// Builds the checksum pseudo-header for a transport segment of `length` bytes.
    pub fn pseudo_header(&self, protocol: IpProtocol, length: usize) -> Vec<u8> {
        checksum::ipv4_pseudo_header(self.source, self.destination, protocol.to_u8(), length as u16)
    }

    /// Header checksum as it will be written.
    pub fn header_checksum(&self) -> u16 {
        let bytes = self.to_bytes();
        u16::from_be_bytes([bytes[10], bytes[11]])
    }

    /// Recomputes the UDP or TCP checksum of the encapsulated segment.
    pub fn update_transport_checksum(&mut self) {
        let (source, destination) = (self.source, self.destination);
        let pseudo = |protocol: IpProtocol, length: usize| {
            checksum::ipv4_pseudo_header(source, destination, protocol.to_u8(), length as u16)
        };
        match self.payload.as_deref_mut() {
            Some(Frame::Udp(udp)) => {
                udp.checksum = udp.calculate_checksum(&pseudo(IpProtocol::Udp, udp.length()));
            }
            Some(Frame::Tcp(tcp)) => {
                tcp.checksum = tcp.calculate_checksum(&pseudo(IpProtocol::Tcp, tcp.length()));
            }
            _ => {}
        }
    }

    fn padded_options_length(&self) -> usize {
        (self.options.len() + 3) & !3
    }
}

/// Builder for constructing IPv4 frames.
#[derive(Debug, Default)]
pub struct Ipv4Builder {
    protocol: Option<IpProtocol>,
    source: Option<Ipv4Addr>,
    destination: Option<Ipv4Addr>,
    ttl: Option<u8>,
    identification: u16,
    flags: Ipv4Flags,
    payload: Option<Frame>,
}

impl Ipv4Builder {
    pub fn protocol(mut self, protocol: IpProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn source(mut self, addr: Ipv4Addr) -> Self {
        self.source = Some(addr);
        self
    }

    pub fn destination(mut self, addr: Ipv4Addr) -> Self {
        self.destination = Some(addr);
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn identification(mut self, identification: u16) -> Self {
        self.identification = identification;
        self
    }

    pub fn flags(mut self, flags: Ipv4Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn payload(mut self, payload: Frame) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the IPv4 frame.
    ///
    /// # Returns
    /// - `Ok(Ipv4Frame)` - The constructed frame
    /// - `Err(FrameError)` - If addresses or protocol are missing, or the frame is too long
    pub fn build(self) -> Result<Ipv4Frame, FrameError> {
        let protocol = self
            .protocol
            .ok_or_else(|| FrameError::InvalidFieldValue("IP protocol not set".to_string()))?;
        let source = self
            .source
            .ok_or_else(|| FrameError::InvalidFieldValue("Source address not set".to_string()))?;
        let destination = self
            .destination
            .ok_or_else(|| FrameError::InvalidFieldValue("Destination address not set".to_string()))?;

        let mut frame = Ipv4Frame::new(protocol, source, destination);
        frame.ttl = self.ttl.unwrap_or(64);
        frame.identification = self.identification;
        frame.flags = self.flags;
        frame.payload = self.payload.map(Box::new);

        frame.validate()?;
        Ok(frame)
    }
}

impl Codec for Ipv4Frame {
    const FRAME_TYPE: FrameType = FrameType::Ipv4;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("ipv4", bytes, MIN_HEADER_LENGTH)?;
        let version = bytes[0] >> 4;
        if version != 4 {
            return Err(FrameError::InvalidProtocolVersion { codec: "ipv4", version });
        }
        let header_length = (bytes[0] & 0x0F) as usize * 4;
        if header_length < MIN_HEADER_LENGTH {
            return Err(FrameError::invalid_length(
                "ipv4",
                format!("header length {} is below the minimum", header_length),
            ));
        }
        FrameError::ensure("ipv4", bytes, header_length)?;

        let total_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if total_length < header_length {
            return Err(FrameError::invalid_length(
                "ipv4",
                format!("total length {} is shorter than the header", total_length),
            ));
        }
        FrameError::ensure("ipv4", bytes, total_length)?;

        let flags_and_offset = u16::from_be_bytes([bytes[6], bytes[7]]);
        let protocol = IpProtocol::from_u8(bytes[9]);
        let mut frame = Self {
            type_of_service: bytes[1],
            identification: u16::from_be_bytes([bytes[4], bytes[5]]),
            flags: Ipv4Flags::from_u8((flags_and_offset >> 13) as u8),
            fragment_offset: flags_and_offset & 0x1FFF,
            ttl: bytes[8],
            protocol,
            source: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            destination: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
            options: bytes[MIN_HEADER_LENGTH..header_length].to_vec(),
            payload: None,
        };

        let payload = &bytes[header_length..total_length];
        frame.payload = if frame.is_fragment() {
            (!payload.is_empty()).then(|| Box::new(Frame::raw(payload)))
        } else {
            frame::parse_ip_payload(protocol, payload)?
        };
        Ok(frame)
    }

    fn header_length(&self) -> usize {
        MIN_HEADER_LENGTH + self.padded_options_length()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let payload = frame::payload_bytes(&self.payload);
        let header_length = self.header_length();
        let total_length = header_length + payload.len();
        let mut bytes = Vec::with_capacity(total_length);

        // Version & IHL
        bytes.push(0x40 | (header_length / 4) as u8);
        bytes.push(self.type_of_service);
        bytes.extend_from_slice(&(total_length as u16).to_be_bytes());
        bytes.extend_from_slice(&self.identification.to_be_bytes());

        // Flags & Fragment Offset
        let flags_and_offset = ((self.flags.as_u8() as u16) << 13) | (self.fragment_offset & 0x1FFF);
        bytes.extend_from_slice(&flags_and_offset.to_be_bytes());

        bytes.push(self.ttl);
        bytes.push(self.protocol.to_u8());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.source.octets());
        bytes.extend_from_slice(&self.destination.octets());
        bytes.extend_from_slice(&self.options);
        bytes.resize(header_length, 0);

        let header_checksum = internet_checksum(&bytes);
        bytes[10..12].copy_from_slice(&header_checksum.to_be_bytes());

        bytes.extend_from_slice(&payload);
        bytes
    }

    fn length(&self) -> usize {
        self.header_length() + frame::payload_length(&self.payload)
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.length() > MAX_TOTAL_LENGTH {
            return Err(FrameError::invalid_length("ipv4", "datagram exceeds 65535 bytes"));
        }
        if self.padded_options_length() > 40 {
            return Err(FrameError::invalid_length("ipv4", "options exceed 40 bytes"));
        }
        Ok(())
    }
}
