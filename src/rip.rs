//! RIP v1/v2 message codec.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::frame::FrameType;
use crate::{Codec, FrameError};

pub const RIP_VERSION_1: u8 = 1;
pub const RIP_VERSION_2: u8 = 2;

/// Metric meaning "unreachable".
pub const INFINITY_METRIC: u32 = 16;

const HEADER_LENGTH: usize = 4;
const ENTRY_LENGTH: usize = 20;

/// RIP Commands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum RipCommand {
    Request = 1,
    Response = 2,
}

/// RIP Route Entry (20 bytes)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RipEntry {
    pub address_family: u16,
    pub route_tag: u16,
    pub ip_address: Ipv4Addr,
    /// Zero in version 1 messages
    pub subnet_mask: Ipv4Addr,
    /// Zero in version 1 messages
    pub next_hop: Ipv4Addr,
    pub metric: u32,
}

impl RipEntry {
    pub fn new(ip: Ipv4Addr, mask: Ipv4Addr, metric: u32) -> Self {
        Self {
            address_family: 2, // IPv4
            route_tag: 0,
            ip_address: ip,
            subnet_mask: mask,
            next_hop: Ipv4Addr::UNSPECIFIED,
            metric,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ENTRY_LENGTH);
        bytes.extend_from_slice(&self.address_family.to_be_bytes());
        bytes.extend_from_slice(&self.route_tag.to_be_bytes());
        bytes.extend_from_slice(&self.ip_address.octets());
        bytes.extend_from_slice(&self.subnet_mask.octets());
        bytes.extend_from_slice(&self.next_hop.octets());
        bytes.extend_from_slice(&self.metric.to_be_bytes());
        bytes
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            address_family: u16::from_be_bytes([data[0], data[1]]),
            route_tag: u16::from_be_bytes([data[2], data[3]]),
            ip_address: Ipv4Addr::new(data[4], data[5], data[6], data[7]),
            subnet_mask: Ipv4Addr::new(data[8], data[9], data[10], data[11]),
            next_hop: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            metric: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
        }
    }
}

/// RIP message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RipMessage {
    pub command: RipCommand,
    pub version: u8,
    pub entries: Vec<RipEntry>,
}

impl RipMessage {
    pub fn response(version: u8, entries: Vec<RipEntry>) -> Self {
        Self {
            command: RipCommand::Response,
            version,
            entries,
        }
    }

    /// A request for the whole routing table.
    pub fn request_all(version: u8) -> Self {
        let mut entry = RipEntry::new(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, INFINITY_METRIC);
        entry.address_family = 0;
        Self {
            command: RipCommand::Request,
            version,
            entries: vec![entry],
        }
    }
}

impl Codec for RipMessage {
    const FRAME_TYPE: FrameType = FrameType::Rip;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("rip", bytes, HEADER_LENGTH)?;
        let command = match bytes[0] {
            1 => RipCommand::Request,
            2 => RipCommand::Response,
            other => return Err(FrameError::InvalidFieldValue(format!("RIP command {}", other))),
        };
        let version = bytes[1];
        if version != RIP_VERSION_1 && version != RIP_VERSION_2 {
            return Err(FrameError::InvalidProtocolVersion { codec: "rip", version });
        }
        let entries = &bytes[HEADER_LENGTH..];
        if entries.len() % ENTRY_LENGTH != 0 {
            return Err(FrameError::invalid_length(
                "rip",
                format!("{} entry bytes is not a multiple of 20", entries.len()),
            ));
        }

        Ok(Self {
            command,
            version,
            entries: entries.chunks_exact(ENTRY_LENGTH).map(RipEntry::parse).collect(),
        })
    }

    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length());
        bytes.push(self.command as u8);
        bytes.push(self.version);
        bytes.extend_from_slice(&[0u8; 2]); // Reserved
        for entry in &self.entries {
            bytes.extend_from_slice(&entry.to_bytes());
        }
        bytes
    }

    fn length(&self) -> usize {
        HEADER_LENGTH + self.entries.len() * ENTRY_LENGTH
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.entries.len() > 25 {
            return Err(FrameError::invalid_length("rip", "more than 25 route entries"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rip_response_round_trip() {
        let message = RipMessage::response(
            RIP_VERSION_2,
            vec![RipEntry::new(Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 0, 0, 0), 5)],
        );
        let bytes = message.to_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..2], &[2, 2]);
        assert_eq!(RipMessage::parse(&bytes).unwrap(), message);
    }

    #[test]
    fn test_request_all() {
        let request = RipMessage::request_all(RIP_VERSION_1);
        let parsed = RipMessage::parse(&request.to_bytes()).unwrap();
        assert_eq!(parsed.entries[0].metric, INFINITY_METRIC);
        assert_eq!(parsed.entries[0].address_family, 0);
    }

    #[test]
    fn test_rejects_partial_entry() {
        let mut bytes = RipMessage::response(RIP_VERSION_2, vec![]).to_bytes();
        bytes.extend_from_slice(&[0; 10]);
        assert!(RipMessage::parse(&bytes).is_err());
        assert!(RipMessage::parse(&[3, 2, 0, 0]).is_err());
    }
}
