//! UDP (User Datagram Protocol) implementation.
//!
//! This module provides the UDP frame, its builder and the pseudo-header
//! checksum.

use serde::{Deserialize, Serialize};

use crate::checksum::{checksum_with_pseudo_header, finish, ones_complement_sum};
use crate::frame::{self, Frame, FrameType};
use crate::{Checksummed, Codec, FrameError};

const HEADER_LENGTH: usize = 8;

/// UDP frame.
///
/// The length field is derived when serializing. `checksum` is stored as
/// set; use [`Checksummed::calculate_checksum`] with the enclosing IP
/// pseudo-header to fill it in. A zero checksum means "not computed".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UdpFrame {
    pub source_port: u16,
    pub destination_port: u16,
    pub checksum: u16,
    pub payload: Option<Box<Frame>>,
}

/// Builder for constructing UDP frames.
#[derive(Debug, Default)]
pub struct UdpBuilder {
    source_port: Option<u16>,
    destination_port: Option<u16>,
    payload: Option<Frame>,
}

impl UdpBuilder {
    /// Creates a new UDP frame builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source port.
    pub fn source_port(mut self, port: u16) -> Self {
        self.source_port = Some(port);
        self
    }

    /// Sets the destination port.
    pub fn destination_port(mut self, port: u16) -> Self {
        self.destination_port = Some(port);
        self
    }

    /// Sets the encapsulated payload.
    pub fn payload(mut self, payload: Frame) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the UDP frame.
    ///
    /// # Returns
    /// - `Ok(UdpFrame)` - The constructed UDP frame
    /// - `Err(FrameError)` - If any required fields are missing or the datagram is too long
    pub fn build(self) -> Result<UdpFrame, FrameError> {
        let source_port = self
            .source_port
            .ok_or_else(|| FrameError::InvalidFieldValue("Source port not set".to_string()))?;
        let destination_port = self
            .destination_port
            .ok_or_else(|| FrameError::InvalidFieldValue("Destination port not set".to_string()))?;

        let frame = UdpFrame {
            source_port,
            destination_port,
            checksum: 0,
            payload: self.payload.map(Box::new),
        };

        frame.validate()?;
        Ok(frame)
    }
}

impl UdpFrame {
    pub fn new(source_port: u16, destination_port: u16) -> Self {
        Self {
            source_port,
            destination_port,
            checksum: 0,
            payload: None,
        }
    }

    /// Creates a new UDP frame builder.
    pub fn builder() -> UdpBuilder {
        UdpBuilder::new()
    }

    pub fn with_payload(mut self, payload: Frame) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    /// Bytes carried after the UDP header.
    pub fn payload_bytes(&self) -> Vec<u8> {
        frame::payload_bytes(&self.payload)
    }

    fn header_bytes(&self, checksum: u16) -> [u8; HEADER_LENGTH] {
        let mut bytes = [0u8; HEADER_LENGTH];
        bytes[0..2].copy_from_slice(&self.source_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.destination_port.to_be_bytes());
        bytes[4..6].copy_from_slice(&(self.length() as u16).to_be_bytes());
        bytes[6..8].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }
}

impl Codec for UdpFrame {
    const FRAME_TYPE: FrameType = FrameType::Udp;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("udp", bytes, HEADER_LENGTH)?;
        let source_port = u16::from_be_bytes([bytes[0], bytes[1]]);
        let destination_port = u16::from_be_bytes([bytes[2], bytes[3]]);
        let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
        if length < HEADER_LENGTH {
            return Err(FrameError::invalid_length(
                "udp",
                format!("length field {} is shorter than the header", length),
            ));
        }
        FrameError::ensure("udp", bytes, length)?;

        Ok(Self {
            source_port,
            destination_port,
            checksum: u16::from_be_bytes([bytes[6], bytes[7]]),
            payload: frame::parse_udp_payload(source_port, destination_port, &bytes[HEADER_LENGTH..length]),
        })
    }

    /// The UDP header is always 8 bytes long.
    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header_bytes(self.checksum).to_vec();
        bytes.extend_from_slice(&self.payload_bytes());
        bytes
    }

    fn length(&self) -> usize {
        HEADER_LENGTH + frame::payload_length(&self.payload)
    }

    /// Ensures that the total length fits the 16-bit length field and that
    /// a DNS payload can be encoded.
    fn validate(&self) -> Result<(), FrameError> {
        if self.length() > u16::MAX as usize {
            return Err(FrameError::invalid_length("udp", "datagram exceeds 65535 bytes"));
        }
        if let Some(Frame::Dns(dns)) = self.payload.as_deref() {
            dns.validate()?;
        }
        Ok(())
    }
}

impl Checksummed for UdpFrame {
    /// Calculates the UDP checksum over pseudo-header, header and payload.
    ///
    /// A computed value of zero is returned as 0xFFFF, since zero on the
    /// wire means no checksum.
    fn calculate_checksum(&self, pseudo_header: &[u8]) -> u16 {
        let mut segment = self.header_bytes(0).to_vec();
        segment.extend_from_slice(&self.payload_bytes());
        match checksum_with_pseudo_header(pseudo_header, &segment) {
            0 => 0xFFFF,
            value => value,
        }
    }

    fn verify_checksum(&self, pseudo_header: &[u8]) -> bool {
        if self.checksum == 0 {
            return true;
        }
        let sum = ones_complement_sum(pseudo_header, 0);
        finish(ones_complement_sum(&self.to_bytes(), sum)) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ipv4_pseudo_header;
    use std::net::Ipv4Addr;

    #[test]
    fn test_udp_builder() {
        let frame = UdpFrame::builder()
            .source_port(12345)
            .destination_port(8080)
            .payload(Frame::raw(&[1, 2, 3, 4]))
            .build()
            .unwrap();

        assert!(frame.validate().is_ok());
        assert_eq!(frame.length(), 12); // 8 (header) + 4 (payload)
        assert_eq!(&frame.to_bytes()[4..6], &[0, 12]);

        // Test missing fields
        let result = UdpFrame::builder().source_port(12345).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_checksum_over_pseudo_header() {
        let mut frame = UdpFrame::new(1000, 2000).with_payload(Frame::raw(b"abc"));
        let pseudo = ipv4_pseudo_header(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            17,
            frame.length() as u16,
        );
        assert!(frame.verify_checksum(&pseudo), "zero checksum is not verified");

        frame.checksum = frame.calculate_checksum(&pseudo);
        assert_ne!(frame.checksum, 0);
        assert!(frame.verify_checksum(&pseudo));

        frame.source_port = 1001;
        assert!(!frame.verify_checksum(&pseudo));
    }

    /// Plain 32-bit accumulate-then-fold sum over big-endian words.
    fn reference_checksum(data: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        for pair in data.chunks(2) {
            let word = if pair.len() == 2 {
                (u32::from(pair[0]) << 8) | u32::from(pair[1])
            } else {
                u32::from(pair[0]) << 8
            };
            sum += word;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }

    #[test]
    fn test_checksum_matches_reference_sum() {
        let source = Ipv4Addr::new(192, 168, 1, 10);
        let destination = Ipv4Addr::new(192, 168, 1, 1);
        let mut frame = UdpFrame::new(40000, 53).with_payload(Frame::raw(b"odd length!"));
        let pseudo = ipv4_pseudo_header(source, destination, 17, frame.length() as u16);
        frame.checksum = frame.calculate_checksum(&pseudo);

        let mut covered = pseudo.clone();
        let mut segment = frame.to_bytes();
        segment[6] = 0;
        segment[7] = 0;
        covered.extend_from_slice(&segment);
        let expected = match reference_checksum(&covered) {
            0 => 0xffff,
            sum => sum,
        };
        assert_eq!(frame.checksum, expected);

        // a correct checksum folds the whole segment to zero
        covered.truncate(pseudo.len());
        covered.extend_from_slice(&frame.to_bytes());
        assert_eq!(reference_checksum(&covered), 0);
    }

    #[test]
    fn test_parse_dispatches_dns_port() {
        let frame = UdpFrame::new(53, 40000).with_payload(Frame::raw(&[0xde, 0xad]));
        let parsed = UdpFrame::parse(&frame.to_bytes()).unwrap();
        // two bytes cannot hold a DNS header, so the payload stays raw
        assert_eq!(parsed.payload.as_deref(), Some(&Frame::raw(&[0xde, 0xad])));
    }

    #[test]
    fn test_length_field_is_checked() {
        let mut bytes = UdpFrame::new(1, 2).with_payload(Frame::raw(&[0; 4])).to_bytes();
        bytes[5] = 4;
        assert!(matches!(UdpFrame::parse(&bytes), Err(FrameError::InvalidLength { .. })));
        bytes[5] = 40;
        assert!(matches!(UdpFrame::parse(&bytes), Err(FrameError::Truncated { .. })));
    }
}
