//! ARP (Address Resolution Protocol) implementation.
//!
//! This module provides types and functionality for working with ARP frames
//! resolving IPv4 addresses over Ethernet.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::ethernet::MacAddress;
use crate::frame::FrameType;
use crate::{Codec, FrameError};

const ARP_LENGTH: usize = 28;
const PROTOCOL_IPV4: u16 = 0x0800;

/// ARP hardware types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u16)]
pub enum HardwareType {
    /// Ethernet (10Mb)
    Ethernet = 1,
    /// Experimental Ethernet
    ExperimentalEthernet = 2,
    /// IEEE 802 Networks
    IEEE802 = 6,
}

impl HardwareType {
    fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(HardwareType::Ethernet),
            2 => Ok(HardwareType::ExperimentalEthernet),
            6 => Ok(HardwareType::IEEE802),
            other => Err(FrameError::UnsupportedProtocol(format!("ARP hardware type {}", other))),
        }
    }
}

/// ARP operation codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u16)]
pub enum Operation {
    /// ARP Request
    Request = 1,
    /// ARP Reply
    Reply = 2,
    /// RARP Request
    ReverseRequest = 3,
    /// RARP Reply
    ReverseReply = 4,
}

impl Operation {
    fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            1 => Ok(Operation::Request),
            2 => Ok(Operation::Reply),
            3 => Ok(Operation::ReverseRequest),
            4 => Ok(Operation::ReverseReply),
            other => Err(FrameError::InvalidFieldValue(format!("ARP operation {}", other))),
        }
    }
}

/// ARP frame for IPv4 over an Ethernet-like link.
///
/// Contains the fields defined in the ARP packet format. The address lengths
/// are fixed at 6 and 4 bytes. ARP frames do not encapsulate a payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArpFrame {
    pub hardware_type: HardwareType,
    pub protocol_type: u16,
    pub operation: Operation,
    pub sender_hardware_addr: MacAddress,
    pub sender_protocol_addr: Ipv4Addr,
    pub target_hardware_addr: MacAddress,
    pub target_protocol_addr: Ipv4Addr,
}

/// Builder for constructing ARP frames.
#[derive(Debug, Default)]
pub struct ArpBuilder {
    operation: Option<Operation>,
    sender_hardware_addr: Option<MacAddress>,
    sender_protocol_addr: Option<Ipv4Addr>,
    target_hardware_addr: Option<MacAddress>,
    target_protocol_addr: Option<Ipv4Addr>,
}

impl ArpBuilder {
    /// Creates a new ARP frame builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ARP operation.
    pub fn operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Sets the sender hardware address.
    pub fn sender_hardware_addr(mut self, addr: MacAddress) -> Self {
        self.sender_hardware_addr = Some(addr);
        self
    }

    /// Sets the sender protocol address.
    pub fn sender_protocol_addr(mut self, addr: Ipv4Addr) -> Self {
        self.sender_protocol_addr = Some(addr);
        self
    }

    /// Sets the target hardware address.
    pub fn target_hardware_addr(mut self, addr: MacAddress) -> Self {
        self.target_hardware_addr = Some(addr);
        self
    }

    /// Sets the target protocol address.
    pub fn target_protocol_addr(mut self, addr: Ipv4Addr) -> Self {
        self.target_protocol_addr = Some(addr);
        self
    }

    /// Builds the ARP frame.
    ///
    /// # Returns
    /// - `Ok(ArpFrame)` - The constructed ARP frame
    /// - `Err(FrameError)` - If any required fields are missing
    pub fn build(self) -> Result<ArpFrame, FrameError> {
        let operation = self
            .operation
            .ok_or_else(|| FrameError::InvalidFieldValue("ARP operation not set".to_string()))?;
        let sender_hardware_addr = self
            .sender_hardware_addr
            .ok_or_else(|| FrameError::InvalidFieldValue("Sender hardware address not set".to_string()))?;
        let sender_protocol_addr = self
            .sender_protocol_addr
            .ok_or_else(|| FrameError::InvalidFieldValue("Sender protocol address not set".to_string()))?;
        let target_protocol_addr = self
            .target_protocol_addr
            .ok_or_else(|| FrameError::InvalidFieldValue("Target protocol address not set".to_string()))?;

        let frame = ArpFrame {
            hardware_type: HardwareType::Ethernet,
            protocol_type: PROTOCOL_IPV4,
            operation,
            sender_hardware_addr,
            sender_protocol_addr,
            target_hardware_addr: self.target_hardware_addr.unwrap_or(MacAddress::ZERO),
            target_protocol_addr,
        };

        frame.validate()?;
        Ok(frame)
    }
}

impl ArpFrame {
    /// Creates a new ARP frame builder.
    pub fn builder() -> ArpBuilder {
        ArpBuilder::new()
    }

    /// Creates a request asking who owns `target_protocol_addr`.
    pub fn request(
        sender_hardware_addr: MacAddress,
        sender_protocol_addr: Ipv4Addr,
        target_protocol_addr: Ipv4Addr,
    ) -> Self {
        Self {
            hardware_type: HardwareType::Ethernet,
            protocol_type: PROTOCOL_IPV4,
            operation: Operation::Request,
            sender_hardware_addr,
            sender_protocol_addr,
            target_hardware_addr: MacAddress::ZERO,
            target_protocol_addr,
        }
    }

    /// Creates a reply announcing `sender_protocol_addr` is at `sender_hardware_addr`.
    pub fn reply(
        sender_hardware_addr: MacAddress,
        sender_protocol_addr: Ipv4Addr,
        target_hardware_addr: MacAddress,
        target_protocol_addr: Ipv4Addr,
    ) -> Self {
        Self {
            hardware_type: HardwareType::Ethernet,
            protocol_type: PROTOCOL_IPV4,
            operation: Operation::Reply,
            sender_hardware_addr,
            sender_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        }
    }
}

impl Codec for ArpFrame {
    const FRAME_TYPE: FrameType = FrameType::Arp;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("arp", bytes, 8)?;
        let hardware_type = HardwareType::from_u16(u16::from_be_bytes([bytes[0], bytes[1]]))?;
        let protocol_type = u16::from_be_bytes([bytes[2], bytes[3]]);
        let (hardware_len, protocol_len) = (bytes[4], bytes[5]);
        if hardware_len != 6 || protocol_len != 4 {
            return Err(FrameError::UnsupportedProtocol(format!(
                "ARP with {}-byte hardware and {}-byte protocol addresses",
                hardware_len, protocol_len
            )));
        }
        FrameError::ensure("arp", bytes, ARP_LENGTH)?;
        let operation = Operation::from_u16(u16::from_be_bytes([bytes[6], bytes[7]]))?;

        let ipv4 = |at: usize| Ipv4Addr::new(bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]);
        Ok(Self {
            hardware_type,
            protocol_type,
            operation,
            sender_hardware_addr: MacAddress::from_slice(&bytes[8..14]),
            sender_protocol_addr: ipv4(14),
            target_hardware_addr: MacAddress::from_slice(&bytes[18..24]),
            target_protocol_addr: ipv4(24),
        })
    }

    fn header_length(&self) -> usize {
        ARP_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ARP_LENGTH);

        // Hardware Type
        bytes.extend_from_slice(&(self.hardware_type as u16).to_be_bytes());

        // Protocol Type
        bytes.extend_from_slice(&self.protocol_type.to_be_bytes());

        // Hardware and Protocol Address Lengths
        bytes.push(6);
        bytes.push(4);

        // Operation
        bytes.extend_from_slice(&(self.operation as u16).to_be_bytes());

        // Sender Hardware and Protocol Address
        bytes.extend_from_slice(self.sender_hardware_addr.as_bytes());
        bytes.extend_from_slice(&self.sender_protocol_addr.octets());

        // Target Hardware and Protocol Address
        bytes.extend_from_slice(self.target_hardware_addr.as_bytes());
        bytes.extend_from_slice(&self.target_protocol_addr.octets());

        bytes
    }

    fn length(&self) -> usize {
        ARP_LENGTH
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.protocol_type != PROTOCOL_IPV4 {
            return Err(FrameError::UnsupportedProtocol(
                "Only IPv4 protocol type is supported".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_addresses() -> (MacAddress, MacAddress, Ipv4Addr, Ipv4Addr) {
        let sender_mac = MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let target_mac = MacAddress::new([0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]);
        let sender_ip = Ipv4Addr::new(192, 168, 1, 1);
        let target_ip = Ipv4Addr::new(192, 168, 1, 2);
        (sender_mac, target_mac, sender_ip, target_ip)
    }

    #[test]
    fn test_arp_reply_round_trip() {
        let (sender_mac, target_mac, sender_ip, target_ip) = create_test_addresses();

        let frame = ArpFrame::reply(sender_mac, sender_ip, target_mac, target_ip);
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[6..8], &[0, 2]);

        let parsed = ArpFrame::parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_arp_builder() {
        let (sender_mac, _, sender_ip, target_ip) = create_test_addresses();

        let frame = ArpFrame::builder()
            .operation(Operation::Request)
            .sender_hardware_addr(sender_mac)
            .sender_protocol_addr(sender_ip)
            .target_protocol_addr(target_ip)
            .build()
            .unwrap();
        assert_eq!(frame, ArpFrame::request(sender_mac, sender_ip, target_ip));

        let missing = ArpFrame::builder().operation(Operation::Request).build();
        assert!(missing.is_err());
    }

    #[test]
    fn test_rejects_foreign_address_sizes() {
        let (sender_mac, _, sender_ip, target_ip) = create_test_addresses();
        let mut bytes = ArpFrame::request(sender_mac, sender_ip, target_ip).to_bytes();
        bytes[4] = 8;
        assert!(matches!(ArpFrame::parse(&bytes), Err(FrameError::UnsupportedProtocol(_))));
        assert!(ArpFrame::parse(&bytes[..20]).is_err());
    }
}
