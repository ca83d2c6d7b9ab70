use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::frame::{self, Frame, FrameType};
use crate::{Codec, FrameError};

/// Minimum length of an Ethernet frame on output. Shorter frames are
/// zero-padded.
pub const MIN_FRAME_LENGTH: usize = 64;

/// Maximum Ethernet payload (the standard MTU).
pub const MAX_PAYLOAD_LENGTH: usize = 1500;

const HEADER_LENGTH: usize = 14;
const VLAN_TAG_LENGTH: usize = 4;

/// MAC address representation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const BROADCAST: MacAddress = MacAddress([0xff; 6]);
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// True for group addresses (broadcast included).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[..6]);
        Self(addr)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d, e, g)
    }
}

impl FromStr for MacAddress {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in addr.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| FrameError::InvalidFieldValue(format!("MAC address too short: {}", s)))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| FrameError::InvalidFieldValue(format!("invalid MAC address: {}", s)))?;
        }
        if parts.next().is_some() {
            return Err(FrameError::InvalidFieldValue(format!("MAC address too long: {}", s)));
        }
        Ok(Self(addr))
    }
}

/// EtherType values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EtherType {
    Ipv4,
    Ipv6,
    Arp,
    /// 802.1Q VLAN tag marker
    Vlan,
    Other(u16),
}

impl EtherType {
    pub fn to_u16(self) -> u16 {
        match self {
            EtherType::Ipv4 => 0x0800,
            EtherType::Ipv6 => 0x86DD,
            EtherType::Arp => 0x0806,
            EtherType::Vlan => 0x8100,
            EtherType::Other(value) => value,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0800 => EtherType::Ipv4,
            0x86DD => EtherType::Ipv6,
            0x0806 => EtherType::Arp,
            0x8100 => EtherType::Vlan,
            other => EtherType::Other(other),
        }
    }
}

/// 802.1Q tag control information.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VlanTag {
    /// Priority code point (3 bits)
    pub priority: u8,
    pub drop_eligible: bool,
    /// VLAN identifier (12 bits)
    pub vlan_id: u16,
}

impl VlanTag {
    pub fn new(vlan_id: u16) -> Self {
        Self {
            priority: 0,
            drop_eligible: false,
            vlan_id: vlan_id & 0x0FFF,
        }
    }

    fn to_u16(self) -> u16 {
        ((self.priority as u16 & 0x07) << 13) | ((self.drop_eligible as u16) << 12) | (self.vlan_id & 0x0FFF)
    }

    fn from_u16(tci: u16) -> Self {
        Self {
            priority: (tci >> 13) as u8,
            drop_eligible: tci & 0x1000 != 0,
            vlan_id: tci & 0x0FFF,
        }
    }
}

/// Ethernet II frame, optionally carrying one 802.1Q tag.
///
/// `ether_type` always names the payload protocol; the VLAN marker is
/// written automatically when `vlan` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EthernetFrame {
    pub destination: MacAddress,
    pub source: MacAddress,
    pub vlan: Option<VlanTag>,
    pub ether_type: EtherType,
    pub payload: Option<Box<Frame>>,
}

impl EthernetFrame {
    pub fn new(destination: MacAddress, source: MacAddress, ether_type: EtherType) -> Self {
        Self {
            destination,
            source,
            vlan: None,
            ether_type,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Frame) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    pub fn with_vlan(mut self, vlan: VlanTag) -> Self {
        self.vlan = Some(vlan);
        self
    }

    /// Get the required padding length to meet minimum frame size
    fn padding_length(&self, unpadded: usize) -> usize {
        MIN_FRAME_LENGTH.saturating_sub(unpadded)
    }
}

impl Codec for EthernetFrame {
    const FRAME_TYPE: FrameType = FrameType::Ethernet;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("ethernet", bytes, HEADER_LENGTH)?;
        let destination = MacAddress::from_slice(&bytes[0..6]);
        let source = MacAddress::from_slice(&bytes[6..12]);
        let mut ether_type = EtherType::from_u16(u16::from_be_bytes([bytes[12], bytes[13]]));

        let mut header_length = HEADER_LENGTH;
        let mut vlan = None;
        if ether_type == EtherType::Vlan {
            FrameError::ensure("ethernet", bytes, HEADER_LENGTH + VLAN_TAG_LENGTH)?;
            vlan = Some(VlanTag::from_u16(u16::from_be_bytes([bytes[14], bytes[15]])));
            ether_type = EtherType::from_u16(u16::from_be_bytes([bytes[16], bytes[17]]));
            header_length += VLAN_TAG_LENGTH;
        }

        let payload = frame::parse_ether_payload(ether_type, &bytes[header_length..])?;
        Ok(Self {
            destination,
            source,
            vlan,
            ether_type,
            payload,
        })
    }

    fn header_length(&self) -> usize {
        if self.vlan.is_some() {
            HEADER_LENGTH + VLAN_TAG_LENGTH
        } else {
            HEADER_LENGTH
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let payload = frame::payload_bytes(&self.payload);
        let mut bytes = Vec::with_capacity(MIN_FRAME_LENGTH.max(self.header_length() + payload.len()));
        bytes.extend_from_slice(self.destination.as_bytes());
        bytes.extend_from_slice(self.source.as_bytes());
        if let Some(vlan) = self.vlan {
            bytes.extend_from_slice(&EtherType::Vlan.to_u16().to_be_bytes());
            bytes.extend_from_slice(&vlan.to_u16().to_be_bytes());
        }
        bytes.extend_from_slice(&self.ether_type.to_u16().to_be_bytes());
        bytes.extend_from_slice(&payload);

        // Add padding if necessary
        let padding_length = self.padding_length(bytes.len());
        bytes.resize(bytes.len() + padding_length, 0);
        bytes
    }

    fn length(&self) -> usize {
        let unpadded = self.header_length() + frame::payload_length(&self.payload);
        unpadded + self.padding_length(unpadded)
    }

    fn validate(&self) -> Result<(), FrameError> {
        let payload_length = frame::payload_length(&self.payload);
        if payload_length > MAX_PAYLOAD_LENGTH {
            return Err(FrameError::invalid_length(
                "ethernet",
                format!("payload of {} bytes exceeds {}", payload_length, MAX_PAYLOAD_LENGTH),
            ));
        }
        if self.ether_type == EtherType::Vlan {
            return Err(FrameError::InvalidFieldValue(
                "the VLAN marker is written from the vlan field, not ether_type".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn macs() -> (MacAddress, MacAddress) {
        (
            MacAddress::new([0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB]),
            MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
        )
    }

    #[test]
    fn test_short_frame_is_padded() {
        let (dst, src) = macs();
        let frame = EthernetFrame::new(dst, src, EtherType::Other(0x88b5)).with_payload(Frame::raw(&[1, 2, 3, 4]));

        assert!(frame.validate().is_ok());
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), MIN_FRAME_LENGTH);
        assert_eq!(frame.length(), bytes.len());
        assert_eq!(&bytes[12..14], &[0x88, 0xb5]);
        assert!(bytes[18..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_vlan_tag_round_trip() {
        let (dst, src) = macs();
        let payload = Frame::raw(&[0x5a; 80]);
        let frame = EthernetFrame::new(dst, src, EtherType::Other(0x88b5))
            .with_vlan(VlanTag {
                priority: 5,
                drop_eligible: true,
                vlan_id: 42,
            })
            .with_payload(payload);

        let bytes = frame.to_bytes();
        assert_eq!(&bytes[12..14], &[0x81, 0x00]);
        assert_eq!(&bytes[14..16], &[0xb0, 0x2a]);
        assert_eq!(bytes.len(), 18 + 80);

        let parsed = EthernetFrame::parse(&bytes).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            EthernetFrame::parse(&[0u8; 10]),
            Err(FrameError::Truncated { needed: 14, available: 10, .. })
        ));

        let mut tagged = vec![0u8; 16];
        tagged[12] = 0x81;
        assert!(EthernetFrame::parse(&tagged).is_err());
    }

    #[test]
    fn test_oversized_payload_is_invalid() {
        let (dst, src) = macs();
        let frame = EthernetFrame::new(dst, src, EtherType::Ipv4).with_payload(Frame::raw(&[0; 1501]));
        assert!(frame.validate().is_err());
    }

    #[test]
    fn test_mac_address_text() {
        let mac: MacAddress = "00:11:22:aa:BB:cc".parse().unwrap();
        assert_eq!(mac.octets(), [0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]);
        assert_eq!(mac.to_string(), "00:11:22:aa:bb:cc");
        assert!("00:11:22".parse::<MacAddress>().is_err());
        assert!(MacAddress::BROADCAST.is_multicast());
        assert!(!mac.is_multicast());
    }
}
