//! ICMPv6 messages, including the neighbor discovery subset used to
//! resolve link-layer addresses.

use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};

use crate::checksum::{checksum_with_pseudo_header, finish, ones_complement_sum};
use crate::ethernet::MacAddress;
use crate::frame::FrameType;
use crate::{Checksummed, Codec, FrameError};

const HEADER_LENGTH: usize = 4;

pub const ECHO_REQUEST: u8 = 128;
pub const ECHO_REPLY: u8 = 129;
pub const ROUTER_SOLICITATION: u8 = 133;
pub const NEIGHBOR_SOLICITATION: u8 = 135;
pub const NEIGHBOR_ADVERTISEMENT: u8 = 136;

/// All-routers multicast address (ff02::2)
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// Neighbor discovery option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NdpOption {
    SourceLinkLayerAddress(MacAddress),
    TargetLinkLayerAddress(MacAddress),
    Other { option_type: u8, data: Vec<u8> },
}

impl NdpOption {
    /// Encode option to bytes (Type + Length + Data), length in units of 8 octets
    pub fn to_bytes(&self) -> Vec<u8> {
        let (option_type, data) = match self {
            NdpOption::SourceLinkLayerAddress(mac) => (1, mac.as_bytes()),
            NdpOption::TargetLinkLayerAddress(mac) => (2, mac.as_bytes()),
            NdpOption::Other { option_type, data } => (*option_type, data.as_slice()),
        };
        let length = (2 + data.len()).div_ceil(8);
        let mut bytes = Vec::with_capacity(length * 8);
        bytes.push(option_type);
        bytes.push(length as u8);
        bytes.extend_from_slice(data);
        bytes.resize(length * 8, 0);
        bytes
    }

    fn parse_all(mut bytes: &[u8]) -> Result<Vec<NdpOption>, FrameError> {
        let mut options = Vec::new();
        while !bytes.is_empty() {
            FrameError::ensure("ndp option", bytes, 2)?;
            let length = bytes[1] as usize * 8;
            if length == 0 {
                return Err(FrameError::invalid_length("ndp option", "zero-length option"));
            }
            FrameError::ensure("ndp option", bytes, length)?;
            let data = &bytes[2..length];
            options.push(match bytes[0] {
                1 => NdpOption::SourceLinkLayerAddress(MacAddress::from_slice(data)),
                2 => NdpOption::TargetLinkLayerAddress(MacAddress::from_slice(data)),
                option_type => NdpOption::Other {
                    option_type,
                    data: data.to_vec(),
                },
            });
            bytes = &bytes[length..];
        }
        Ok(options)
    }
}

/// Body of an ICMPv6 message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Icmpv6Message {
    EchoRequest {
        identifier: u16,
        sequence: u16,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    EchoReply {
        identifier: u16,
        sequence: u16,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    RouterSolicitation {
        options: Vec<NdpOption>,
    },
    NeighborSolicitation {
        target: Ipv6Addr,
        options: Vec<NdpOption>,
    },
    NeighborAdvertisement {
        router: bool,
        solicited: bool,
        override_entry: bool,
        target: Ipv6Addr,
        options: Vec<NdpOption>,
    },
    /// Any other type, kept as raw body bytes
    Other {
        icmp_type: u8,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
    },
}

impl Icmpv6Message {
    pub fn icmp_type(&self) -> u8 {
        match self {
            Icmpv6Message::EchoRequest { .. } => ECHO_REQUEST,
            Icmpv6Message::EchoReply { .. } => ECHO_REPLY,
            Icmpv6Message::RouterSolicitation { .. } => ROUTER_SOLICITATION,
            Icmpv6Message::NeighborSolicitation { .. } => NEIGHBOR_SOLICITATION,
            Icmpv6Message::NeighborAdvertisement { .. } => NEIGHBOR_ADVERTISEMENT,
            Icmpv6Message::Other { icmp_type, .. } => *icmp_type,
        }
    }

    fn body_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let options = match self {
            Icmpv6Message::EchoRequest { identifier, sequence, data }
            | Icmpv6Message::EchoReply { identifier, sequence, data } => {
                bytes.extend_from_slice(&identifier.to_be_bytes());
                bytes.extend_from_slice(&sequence.to_be_bytes());
                bytes.extend_from_slice(data);
                return bytes;
            }
            Icmpv6Message::Other { body, .. } => return body.clone(),
            Icmpv6Message::RouterSolicitation { options } => {
                bytes.extend_from_slice(&[0u8; 4]); // Reserved
                options
            }
            Icmpv6Message::NeighborSolicitation { target, options } => {
                bytes.extend_from_slice(&[0u8; 4]); // Reserved
                bytes.extend_from_slice(&target.octets());
                options
            }
            Icmpv6Message::NeighborAdvertisement {
                router,
                solicited,
                override_entry,
                target,
                options,
            } => {
                let mut flags = 0u32;
                if *router {
                    flags |= 0x8000_0000;
                }
                if *solicited {
                    flags |= 0x4000_0000;
                }
                if *override_entry {
                    flags |= 0x2000_0000;
                }
                bytes.extend_from_slice(&flags.to_be_bytes());
                bytes.extend_from_slice(&target.octets());
                options
            }
        };
        for option in options {
            bytes.extend_from_slice(&option.to_bytes());
        }
        bytes
    }

    fn parse(icmp_type: u8, body: &[u8]) -> Result<Self, FrameError> {
        let address = |at: usize| {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[at..at + 16]);
            Ipv6Addr::from(octets)
        };
        Ok(match icmp_type {
            ECHO_REQUEST | ECHO_REPLY => {
                FrameError::ensure("icmpv6 echo", body, 4)?;
                let identifier = u16::from_be_bytes([body[0], body[1]]);
                let sequence = u16::from_be_bytes([body[2], body[3]]);
                let data = body[4..].to_vec();
                if icmp_type == ECHO_REQUEST {
                    Icmpv6Message::EchoRequest { identifier, sequence, data }
                } else {
                    Icmpv6Message::EchoReply { identifier, sequence, data }
                }
            }
            ROUTER_SOLICITATION => {
                FrameError::ensure("icmpv6 router solicitation", body, 4)?;
                Icmpv6Message::RouterSolicitation {
                    options: NdpOption::parse_all(&body[4..])?,
                }
            }
            NEIGHBOR_SOLICITATION => {
                FrameError::ensure("icmpv6 neighbor solicitation", body, 20)?;
                Icmpv6Message::NeighborSolicitation {
                    target: address(4),
                    options: NdpOption::parse_all(&body[20..])?,
                }
            }
            NEIGHBOR_ADVERTISEMENT => {
                FrameError::ensure("icmpv6 neighbor advertisement", body, 20)?;
                Icmpv6Message::NeighborAdvertisement {
                    router: body[0] & 0x80 != 0,
                    solicited: body[0] & 0x40 != 0,
                    override_entry: body[0] & 0x20 != 0,
                    target: address(4),
                    options: NdpOption::parse_all(&body[20..])?,
                }
            }
            _ => Icmpv6Message::Other {
                icmp_type,
                body: body.to_vec(),
            },
        })
    }
}

/// ICMPv6 message. The checksum covers the IPv6 pseudo-header and is a
/// stored field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Icmpv6Frame {
    pub code: u8,
    pub checksum: u16,
    pub message: Icmpv6Message,
}

impl Icmpv6Frame {
    pub fn new(message: Icmpv6Message) -> Self {
        Self {
            code: 0,
            checksum: 0,
            message,
        }
    }

    /// Asks who owns `target`, announcing our own link-layer address.
    pub fn neighbor_solicitation(target: Ipv6Addr, source_mac: MacAddress) -> Self {
        Self::new(Icmpv6Message::NeighborSolicitation {
            target,
            options: vec![NdpOption::SourceLinkLayerAddress(source_mac)],
        })
    }

    /// Answers a solicitation for `target`, which is at `mac`.
    pub fn neighbor_advertisement(target: Ipv6Addr, mac: MacAddress, solicited: bool) -> Self {
        Self::new(Icmpv6Message::NeighborAdvertisement {
            router: false,
            solicited,
            override_entry: true,
            target,
            options: vec![NdpOption::TargetLinkLayerAddress(mac)],
        })
    }

    /// First link-layer address carried in the options, if any.
    pub fn link_layer_address(&self) -> Option<MacAddress> {
        let options = match &self.message {
            Icmpv6Message::RouterSolicitation { options }
            | Icmpv6Message::NeighborSolicitation { options, .. }
            | Icmpv6Message::NeighborAdvertisement { options, .. } => options,
            _ => return None,
        };
        options.iter().find_map(|option| match option {
            NdpOption::SourceLinkLayerAddress(mac) | NdpOption::TargetLinkLayerAddress(mac) => Some(*mac),
            NdpOption::Other { .. } => None,
        })
    }

    fn bytes_with_checksum(&self, checksum: u16) -> Vec<u8> {
        let mut bytes = vec![self.message.icmp_type(), self.code];
        bytes.extend_from_slice(&checksum.to_be_bytes());
        bytes.extend_from_slice(&self.message.body_bytes());
        bytes
    }
}

/// Solicited-node multicast group of `address` (ff02::1:ffXX:XXXX).
pub fn solicited_node_multicast(address: Ipv6Addr) -> Ipv6Addr {
    let octets = address.octets();
    Ipv6Addr::from([
        0xff, 0x02, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x01, 0xff, octets[13], octets[14], octets[15],
    ])
}

/// Ethernet multicast address a multicast IPv6 group maps to (33:33:xx:xx:xx:xx).
pub fn multicast_mac(group: Ipv6Addr) -> MacAddress {
    let octets = group.octets();
    MacAddress::new([0x33, 0x33, octets[12], octets[13], octets[14], octets[15]])
}

impl Codec for Icmpv6Frame {
    const FRAME_TYPE: FrameType = FrameType::Icmpv6;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("icmpv6", bytes, HEADER_LENGTH)?;
        Ok(Self {
            code: bytes[1],
            checksum: u16::from_be_bytes([bytes[2], bytes[3]]),
            message: Icmpv6Message::parse(bytes[0], &bytes[HEADER_LENGTH..])?,
        })
    }

    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.bytes_with_checksum(self.checksum)
    }
}

impl Checksummed for Icmpv6Frame {
    fn calculate_checksum(&self, pseudo_header: &[u8]) -> u16 {
        checksum_with_pseudo_header(pseudo_header, &self.bytes_with_checksum(0))
    }

    fn verify_checksum(&self, pseudo_header: &[u8]) -> bool {
        let sum = ones_complement_sum(pseudo_header, 0);
        finish(ones_complement_sum(&self.to_bytes(), sum)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ipv6_pseudo_header;

    #[test]
    fn test_neighbor_solicitation_round_trip() {
        let mac = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let target: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let source: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let group = solicited_node_multicast(target);
        assert_eq!(group, "ff02::1:ff00:1".parse::<Ipv6Addr>().unwrap());

        let mut frame = Icmpv6Frame::neighbor_solicitation(target, mac);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 4 + 20 + 8);
        assert_eq!(&bytes[8..24], &target.octets());

        let pseudo = ipv6_pseudo_header(source, group, 58, bytes.len() as u32);
        frame.checksum = frame.calculate_checksum(&pseudo);
        let parsed = Icmpv6Frame::parse(&frame.to_bytes()).unwrap();
        assert_eq!(parsed, frame);
        assert!(parsed.verify_checksum(&pseudo));
        assert_eq!(parsed.link_layer_address(), Some(mac));
        assert_eq!(multicast_mac(group).octets(), [0x33, 0x33, 0xff, 0, 0, 1]);
    }

    #[test]
    fn test_advertisement_flags() {
        let mac = MacAddress::new([1, 2, 3, 4, 5, 6]);
        let frame = Icmpv6Frame::neighbor_advertisement("fe80::1".parse().unwrap(), mac, true);
        let bytes = frame.to_bytes();
        assert_eq!(bytes[0], NEIGHBOR_ADVERTISEMENT);
        assert_eq!(bytes[4], 0x60);
        assert_eq!(Icmpv6Frame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_unknown_type_and_bad_option() {
        let other = Icmpv6Frame::new(Icmpv6Message::Other {
            icmp_type: 1,
            body: vec![0, 0, 0, 0, 0x60],
        });
        assert_eq!(Icmpv6Frame::parse(&other.to_bytes()).unwrap(), other);

        let mut bytes = Icmpv6Frame::neighbor_solicitation(Ipv6Addr::LOCALHOST, MacAddress::ZERO).to_bytes();
        bytes[25] = 0;
        assert!(Icmpv6Frame::parse(&bytes).is_err());
    }
}
