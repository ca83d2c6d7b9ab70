use serde::{Deserialize, Serialize};

use crate::checksum::{checksum_with_pseudo_header, finish, ones_complement_sum};
use crate::frame::{self, Frame, FrameType};
use crate::{Checksummed, Codec, FrameError};

const MIN_HEADER_LENGTH: usize = 20;
const MAX_HEADER_LENGTH: usize = 60;

/// TCP Flags
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn syn() -> Self {
        Self {
            syn: true,
            ..Self::default()
        }
    }

    pub fn as_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0b00000001; }
        if self.syn { flags |= 0b00000010; }
        if self.rst { flags |= 0b00000100; }
        if self.psh { flags |= 0b00001000; }
        if self.ack { flags |= 0b00010000; }
        if self.urg { flags |= 0b00100000; }
        if self.ece { flags |= 0b01000000; }
        if self.cwr { flags |= 0b10000000; }
        flags
    }

    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0b00000001 != 0,
            syn: flags & 0b00000010 != 0,
            rst: flags & 0b00000100 != 0,
            psh: flags & 0b00001000 != 0,
            ack: flags & 0b00010000 != 0,
            urg: flags & 0b00100000 != 0,
            ece: flags & 0b01000000 != 0,
            cwr: flags & 0b10000000 != 0,
        }
    }
}

/// TCP Header Options
///
/// End-of-option-list is implied by the zero padding written after the
/// last option and is not kept when parsing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TcpOption {
    NoOperation,
    MaximumSegmentSize(u16),
    WindowScale(u8),
    SelectiveAckPermitted,
    /// Selective acknowledgment blocks (left edge, right edge)
    SelectiveAck(Vec<(u32, u32)>),
    Timestamp(u32, u32),
    Unknown { kind: u8, data: Vec<u8> },
}

impl TcpOption {
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            TcpOption::NoOperation => vec![1],
            TcpOption::MaximumSegmentSize(size) => {
                vec![2, 4, (*size >> 8) as u8, *size as u8]
            }
            TcpOption::WindowScale(shift) => vec![3, 3, *shift],
            TcpOption::SelectiveAckPermitted => vec![4, 2],
            TcpOption::SelectiveAck(blocks) => {
                let mut bytes = vec![5, (2 + blocks.len() * 8) as u8];
                for (left, right) in blocks {
                    bytes.extend_from_slice(&left.to_be_bytes());
                    bytes.extend_from_slice(&right.to_be_bytes());
                }
                bytes
            }
            TcpOption::Timestamp(val, echo) => {
                let mut bytes = vec![8, 10];
                bytes.extend_from_slice(&val.to_be_bytes());
                bytes.extend_from_slice(&echo.to_be_bytes());
                bytes
            }
            TcpOption::Unknown { kind, data } => {
                let mut bytes = vec![*kind, (2 + data.len()) as u8];
                bytes.extend_from_slice(data);
                bytes
            }
        }
    }

    /// Parses the option list of a TCP header.
    fn parse_all(mut bytes: &[u8]) -> Result<Vec<TcpOption>, FrameError> {
        let mut options = Vec::new();
        while let Some(&kind) = bytes.first() {
            match kind {
                0 => break,
                1 => {
                    options.push(TcpOption::NoOperation);
                    bytes = &bytes[1..];
                    continue;
                }
                _ => {}
            }
            FrameError::ensure("tcp option", bytes, 2)?;
            let length = bytes[1] as usize;
            if length < 2 {
                return Err(FrameError::invalid_length(
                    "tcp option",
                    format!("option {} has length {}", kind, length),
                ));
            }
            FrameError::ensure("tcp option", bytes, length)?;
            let data = &bytes[2..length];
            let option = match (kind, data.len()) {
                (2, 2) => TcpOption::MaximumSegmentSize(u16::from_be_bytes([data[0], data[1]])),
                (3, 1) => TcpOption::WindowScale(data[0]),
                (4, 0) => TcpOption::SelectiveAckPermitted,
                (5, n) if n % 8 == 0 => TcpOption::SelectiveAck(
                    data.chunks_exact(8)
                        .map(|block| {
                            (
                                u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
                                u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
                            )
                        })
                        .collect(),
                ),
                (8, 8) => TcpOption::Timestamp(
                    u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
                    u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
                ),
                _ => TcpOption::Unknown {
                    kind,
                    data: data.to_vec(),
                },
            };
            options.push(option);
            bytes = &bytes[length..];
        }
        Ok(options)
    }
}

/// TCP segment.
///
/// The data offset is derived from the options when serializing. The
/// checksum is a stored field; see [`Checksummed`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpFrame {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
    pub options: Vec<TcpOption>,
    pub payload: Option<Box<Frame>>,
}

impl TcpFrame {
    pub fn new(source_port: u16, destination_port: u16) -> Self {
        Self {
            source_port,
            destination_port,
            sequence_number: 0,
            acknowledgment_number: 0,
            flags: TcpFlags::new(),
            window_size: 65535,
            checksum: 0,
            urgent_pointer: 0,
            options: Vec::new(),
            payload: None,
        }
    }

    pub fn with_flags(mut self, flags: TcpFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sequence(mut self, seq: u32) -> Self {
        self.sequence_number = seq;
        self
    }

    pub fn with_ack(mut self, ack: u32) -> Self {
        self.acknowledgment_number = ack;
        self.flags.ack = true;
        self
    }

    pub fn with_window_size(mut self, size: u16) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_payload(mut self, payload: Frame) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    pub fn add_option(mut self, option: TcpOption) -> Self {
        self.options.push(option);
        self
    }

    /// Bytes carried after the TCP header.
    pub fn payload_bytes(&self) -> Vec<u8> {
        frame::payload_bytes(&self.payload)
    }

    /// Sequence space consumed by this segment (SYN and FIN count as one).
    pub fn sequence_length(&self) -> u32 {
        frame::payload_length(&self.payload) as u32 + self.flags.syn as u32 + self.flags.fin as u32
    }

    fn data_offset(&self) -> u8 {
        (self.header_length() / 4) as u8
    }

    fn header_bytes(&self, checksum: u16) -> Vec<u8> {
        let header_length = self.header_length();
        let mut bytes = Vec::with_capacity(header_length);

        bytes.extend_from_slice(&self.source_port.to_be_bytes());
        bytes.extend_from_slice(&self.destination_port.to_be_bytes());
        bytes.extend_from_slice(&self.sequence_number.to_be_bytes());
        bytes.extend_from_slice(&self.acknowledgment_number.to_be_bytes());

        // Data Offset, Reserved, and Flags
        bytes.push(self.data_offset() << 4);
        bytes.push(self.flags.as_u8());

        bytes.extend_from_slice(&self.window_size.to_be_bytes());
        bytes.extend_from_slice(&checksum.to_be_bytes());
        bytes.extend_from_slice(&self.urgent_pointer.to_be_bytes());

        for option in &self.options {
            bytes.extend_from_slice(&option.as_bytes());
        }

        // Pad to 4-byte boundary
        bytes.resize(header_length, 0);
        bytes
    }
}

impl Codec for TcpFrame {
    const FRAME_TYPE: FrameType = FrameType::Tcp;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("tcp", bytes, MIN_HEADER_LENGTH)?;
        let header_length = (bytes[12] >> 4) as usize * 4;
        if header_length < MIN_HEADER_LENGTH {
            return Err(FrameError::invalid_length(
                "tcp",
                format!("data offset {} is below 5 words", header_length / 4),
            ));
        }
        FrameError::ensure("tcp", bytes, header_length)?;

        let word = |at: usize| u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let half = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);
        let payload = &bytes[header_length..];

        Ok(Self {
            source_port: half(0),
            destination_port: half(2),
            sequence_number: word(4),
            acknowledgment_number: word(8),
            flags: TcpFlags::from_u8(bytes[13]),
            window_size: half(14),
            checksum: half(16),
            urgent_pointer: half(18),
            options: TcpOption::parse_all(&bytes[MIN_HEADER_LENGTH..header_length])?,
            payload: (!payload.is_empty()).then(|| Box::new(Frame::raw(payload))),
        })
    }

    fn header_length(&self) -> usize {
        let options: usize = self.options.iter().map(|option| option.as_bytes().len()).sum();
        (MIN_HEADER_LENGTH + options + 3) & !3
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header_bytes(self.checksum);
        bytes.extend_from_slice(&self.payload_bytes());
        bytes
    }

    fn length(&self) -> usize {
        self.header_length() + frame::payload_length(&self.payload)
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.header_length() > MAX_HEADER_LENGTH {
            return Err(FrameError::InvalidFieldValue(
                "TCP options exceed the 40 bytes a header can hold".to_string(),
            ));
        }
        Ok(())
    }
}

impl Checksummed for TcpFrame {
    fn calculate_checksum(&self, pseudo_header: &[u8]) -> u16 {
        let mut segment = self.header_bytes(0);
        segment.extend_from_slice(&self.payload_bytes());
        checksum_with_pseudo_header(pseudo_header, &segment)
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
    use std::net::Ipv6Addr;

    #[test]
    fn test_tcp_options_round_trip() {
        let segment = TcpFrame::new(40000, 80)
            .with_flags(TcpFlags::syn())
            .with_sequence(1000)
            .add_option(TcpOption::MaximumSegmentSize(1460))
            .add_option(TcpOption::NoOperation)
            .add_option(TcpOption::WindowScale(7))
            .add_option(TcpOption::SelectiveAck(vec![(10, 20)]))
            .add_option(TcpOption::Timestamp(1, 2));

        assert!(segment.validate().is_ok());
        let bytes = segment.to_bytes();
        assert_eq!(bytes.len(), 48);
        assert_eq!(bytes[12] >> 4, 12);

        let parsed = TcpFrame::parse(&bytes).unwrap();
        assert_eq!(parsed, segment);
        assert_eq!(parsed.sequence_length(), 1);
    }

    #[test]
    fn test_checksum_and_payload() {
        let source = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
        let destination = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 2);
        let mut segment = TcpFrame::new(1, 2).with_ack(7).with_payload(Frame::raw(b"GET /"));
        let pseudo = ipv6_pseudo_header(source, destination, 6, segment.length() as u32);

        segment.checksum = segment.calculate_checksum(&pseudo);
        assert!(segment.verify_checksum(&pseudo));

        let parsed = TcpFrame::parse(&segment.to_bytes()).unwrap();
        assert!(parsed.verify_checksum(&pseudo));
        assert_eq!(parsed.payload_bytes(), b"GET /");
        assert!(parsed.flags.ack);
    }

    #[test]
    fn test_malformed_headers() {
        let mut bytes = TcpFrame::new(1, 2).to_bytes();
        bytes[12] = 0x40;
        assert!(matches!(TcpFrame::parse(&bytes), Err(FrameError::InvalidLength { .. })));
        bytes[12] = 0x60;
        assert!(matches!(TcpFrame::parse(&bytes), Err(FrameError::Truncated { .. })));

        // option length running past the header
        let mut bytes = TcpFrame::new(1, 2).add_option(TcpOption::WindowScale(1)).to_bytes();
        bytes[21] = 9;
        assert!(TcpFrame::parse(&bytes).is_err());
    }
}
