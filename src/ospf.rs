//! OSPFv2 packet codec.
//!
//! Only the wire format is handled here: the common header, Hello and
//! Database Description bodies. Other packet types keep their body raw.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::checksum::internet_checksum;
use crate::frame::FrameType;
use crate::{Codec, FrameError};

pub const OSPF_VERSION: u8 = 2;

/// AllSPFRouters multicast address (224.0.0.5)
pub const ALL_SPF_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 5);

const HEADER_LENGTH: usize = 24;
const HELLO_LENGTH: usize = 20;
const DATABASE_DESCRIPTION_LENGTH: usize = 8;
const LSA_HEADER_LENGTH: usize = 20;

pub const TYPE_HELLO: u8 = 1;
pub const TYPE_DATABASE_DESCRIPTION: u8 = 2;

/// OSPF LSA Header
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LsaHeader {
    pub age: u16,
    pub options: u8,
    pub lsa_type: u8,
    pub link_state_id: Ipv4Addr,
    pub advertising_router: Ipv4Addr,
    pub sequence: u32,
    pub checksum: u16,
    pub length: u16,
}

impl LsaHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(LSA_HEADER_LENGTH);
        bytes.extend_from_slice(&self.age.to_be_bytes());
        bytes.push(self.options);
        bytes.push(self.lsa_type);
        bytes.extend_from_slice(&self.link_state_id.octets());
        bytes.extend_from_slice(&self.advertising_router.octets());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.checksum.to_be_bytes());
        bytes.extend_from_slice(&self.length.to_be_bytes());
        bytes
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            age: u16::from_be_bytes([data[0], data[1]]),
            options: data[2],
            lsa_type: data[3],
            link_state_id: ipv4_at(data, 4),
            advertising_router: ipv4_at(data, 8),
            sequence: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            length: u16::from_be_bytes([data[18], data[19]]),
        }
    }
}

/// OSPF Hello body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OspfHello {
    pub network_mask: Ipv4Addr,
    pub hello_interval: u16,
    pub options: u8,
    pub router_priority: u8,
    pub router_dead_interval: u32,
    pub designated_router: Ipv4Addr,
    pub backup_designated_router: Ipv4Addr,
    pub neighbors: Vec<Ipv4Addr>,
}

impl OspfHello {
    pub fn new(network_mask: Ipv4Addr) -> Self {
        Self {
            network_mask,
            hello_interval: 10,
            options: 0x02, // E-bit
            router_priority: 1,
            router_dead_interval: 40,
            designated_router: Ipv4Addr::UNSPECIFIED,
            backup_designated_router: Ipv4Addr::UNSPECIFIED,
            neighbors: vec![],
        }
    }

    pub fn add_neighbor(mut self, neighbor: Ipv4Addr) -> Self {
        self.neighbors.push(neighbor);
        self
    }
}

/// Database Description body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseDescription {
    pub interface_mtu: u16,
    pub options: u8,
    /// I, M and MS bits
    pub flags: u8,
    pub sequence: u32,
    pub lsa_headers: Vec<LsaHeader>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OspfBody {
    Hello(OspfHello),
    DatabaseDescription(DatabaseDescription),
    /// Link state request, update and acknowledgment bodies
    Other {
        packet_type: u8,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
}

impl OspfBody {
    pub fn packet_type(&self) -> u8 {
        match self {
            OspfBody::Hello(_) => TYPE_HELLO,
            OspfBody::DatabaseDescription(_) => TYPE_DATABASE_DESCRIPTION,
            OspfBody::Other { packet_type, .. } => *packet_type,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        match self {
            OspfBody::Hello(hello) => {
                bytes.extend_from_slice(&hello.network_mask.octets());
                bytes.extend_from_slice(&hello.hello_interval.to_be_bytes());
                bytes.push(hello.options);
                bytes.push(hello.router_priority);
                bytes.extend_from_slice(&hello.router_dead_interval.to_be_bytes());
                bytes.extend_from_slice(&hello.designated_router.octets());
                bytes.extend_from_slice(&hello.backup_designated_router.octets());
                for neighbor in &hello.neighbors {
                    bytes.extend_from_slice(&neighbor.octets());
                }
            }
            OspfBody::DatabaseDescription(description) => {
                bytes.extend_from_slice(&description.interface_mtu.to_be_bytes());
                bytes.push(description.options);
                bytes.push(description.flags);
                bytes.extend_from_slice(&description.sequence.to_be_bytes());
                for header in &description.lsa_headers {
                    bytes.extend_from_slice(&header.to_bytes());
                }
            }
            OspfBody::Other { data, .. } => bytes.extend_from_slice(data),
        }
        bytes
    }

    fn parse(packet_type: u8, data: &[u8]) -> Result<Self, FrameError> {
        Ok(match packet_type {
            TYPE_HELLO => {
                FrameError::ensure("ospf hello", data, HELLO_LENGTH)?;
                if (data.len() - HELLO_LENGTH) % 4 != 0 {
                    return Err(FrameError::invalid_length("ospf hello", "neighbor list is not a multiple of 4"));
                }
                OspfBody::Hello(OspfHello {
                    network_mask: ipv4_at(data, 0),
                    hello_interval: u16::from_be_bytes([data[4], data[5]]),
                    options: data[6],
                    router_priority: data[7],
                    router_dead_interval: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
                    designated_router: ipv4_at(data, 12),
                    backup_designated_router: ipv4_at(data, 16),
                    neighbors: data[HELLO_LENGTH..]
                        .chunks_exact(4)
                        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
                        .collect(),
                })
            }
            TYPE_DATABASE_DESCRIPTION => {
                FrameError::ensure("ospf database description", data, DATABASE_DESCRIPTION_LENGTH)?;
                if (data.len() - DATABASE_DESCRIPTION_LENGTH) % LSA_HEADER_LENGTH != 0 {
                    return Err(FrameError::invalid_length(
                        "ospf database description",
                        "LSA header list is not a multiple of 20",
                    ));
                }
                OspfBody::DatabaseDescription(DatabaseDescription {
                    interface_mtu: u16::from_be_bytes([data[0], data[1]]),
                    options: data[2],
                    flags: data[3],
                    sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                    lsa_headers: data[DATABASE_DESCRIPTION_LENGTH..]
                        .chunks_exact(LSA_HEADER_LENGTH)
                        .map(LsaHeader::parse)
                        .collect(),
                })
            }
            _ => OspfBody::Other {
                packet_type,
                data: data.to_vec(),
            },
        })
    }
}

fn ipv4_at(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

/// OSPF Packet
///
/// Packet length and checksum are computed when serializing. The checksum
/// covers the whole packet except the 64-bit authentication field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OspfPacket {
    pub router_id: Ipv4Addr,
    pub area_id: Ipv4Addr,
    pub auth_type: u16,
    pub authentication: [u8; 8],
    pub body: OspfBody,
}

impl OspfPacket {
    pub fn new(router_id: Ipv4Addr, area_id: Ipv4Addr, body: OspfBody) -> Self {
        Self {
            router_id,
            area_id,
            auth_type: 0, // No authentication
            authentication: [0u8; 8],
            body,
        }
    }

    pub fn hello(router_id: Ipv4Addr, area_id: Ipv4Addr, hello: OspfHello) -> Self {
        Self::new(router_id, area_id, OspfBody::Hello(hello))
    }

    /// Checksum as it will be written.
    pub fn checksum(&self) -> u16 {
        let bytes = self.to_bytes();
        u16::from_be_bytes([bytes[12], bytes[13]])
    }
}

fn compute_checksum(packet: &[u8]) -> u16 {
    let mut covered = Vec::with_capacity(packet.len() - 8);
    covered.extend_from_slice(&packet[..16]);
    covered.extend_from_slice(&packet[HEADER_LENGTH..]);
    internet_checksum(&covered)
}

impl Codec for OspfPacket {
    const FRAME_TYPE: FrameType = FrameType::Ospf;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("ospf", bytes, HEADER_LENGTH)?;
        if bytes[0] != OSPF_VERSION {
            return Err(FrameError::InvalidProtocolVersion {
                codec: "ospf",
                version: bytes[0],
            });
        }
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if length < HEADER_LENGTH {
            return Err(FrameError::invalid_length("ospf", format!("packet length {}", length)));
        }
        FrameError::ensure("ospf", bytes, length)?;

        let mut authentication = [0u8; 8];
        authentication.copy_from_slice(&bytes[16..24]);
        Ok(Self {
            router_id: ipv4_at(bytes, 4),
            area_id: ipv4_at(bytes, 8),
            auth_type: u16::from_be_bytes([bytes[14], bytes[15]]),
            authentication,
            body: OspfBody::parse(bytes[1], &bytes[HEADER_LENGTH..length])?,
        })
    }

    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_bytes();
        let mut bytes = Vec::with_capacity(HEADER_LENGTH + body.len());
        bytes.push(OSPF_VERSION);
        bytes.push(self.body.packet_type());
        bytes.extend_from_slice(&((HEADER_LENGTH + body.len()) as u16).to_be_bytes());
        bytes.extend_from_slice(&self.router_id.octets());
        bytes.extend_from_slice(&self.area_id.octets());
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.auth_type.to_be_bytes());
        bytes.extend_from_slice(&self.authentication);
        bytes.extend_from_slice(&body);

        let checksum = compute_checksum(&bytes);
        bytes[12..14].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::verify;

    #[test]
    fn test_hello_round_trip() {
        let hello = OspfHello::new(Ipv4Addr::new(255, 255, 255, 0)).add_neighbor(Ipv4Addr::new(10, 0, 0, 2));
        let mut packet = OspfPacket::hello(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::UNSPECIFIED, hello);
        packet.authentication = *b"secret!!";

        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), 24 + 24);
        assert_eq!(bytes[1], TYPE_HELLO);

        // checksum excludes the authentication field
        let mut covered = bytes[..16].to_vec();
        covered.extend_from_slice(&bytes[24..]);
        assert!(verify(&covered));

        assert_eq!(OspfPacket::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_database_description_with_lsa_headers() {
        let header = LsaHeader {
            age: 1,
            options: 0x02,
            lsa_type: 1,
            link_state_id: Ipv4Addr::new(10, 0, 0, 1),
            advertising_router: Ipv4Addr::new(10, 0, 0, 1),
            sequence: 0x8000_0001,
            checksum: 0x1234,
            length: 36,
        };
        let packet = OspfPacket::new(
            Ipv4Addr::new(1, 1, 1, 1),
            Ipv4Addr::UNSPECIFIED,
            OspfBody::DatabaseDescription(DatabaseDescription {
                interface_mtu: 1500,
                options: 0x02,
                flags: 0x07,
                sequence: 42,
                lsa_headers: vec![header.clone(), header],
            }),
        );
        let parsed = OspfPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut bytes = OspfPacket::new(Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED, OspfBody::Other {
            packet_type: 5,
            data: vec![],
        })
        .to_bytes();
        bytes[0] = 3;
        assert!(OspfPacket::parse(&bytes).is_err());
    }
}
