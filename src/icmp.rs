//! ICMP (Internet Control Message Protocol) implementation.
//!
//! This module provides types and functionality for working with ICMP
//! messages, including message types, codes, and the checksum computed
//! at serialization time.

use serde::{Deserialize, Serialize};

use crate::checksum::internet_checksum;
use crate::frame::{self, Frame, FrameType};
use crate::ip::Ipv4Frame;
use crate::{Codec, FrameError};

const HEADER_LENGTH: usize = 8;

/// ICMP message types as defined in RFC 792 and subsequent RFCs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IcmpType {
    /// Echo Reply (Type 0)
    EchoReply,
    /// Destination Unreachable (Type 3)
    DestinationUnreachable,
    /// Source Quench (Type 4)
    SourceQuench,
    /// Redirect Message (Type 5)
    Redirect,
    /// Echo Request (Type 8)
    EchoRequest,
    /// Router Advertisement (Type 9)
    RouterAdvertisement,
    /// Router Solicitation (Type 10)
    RouterSolicitation,
    /// Time Exceeded (Type 11)
    TimeExceeded,
    /// Parameter Problem (Type 12)
    ParameterProblem,
    /// Timestamp Request (Type 13)
    TimestampRequest,
    /// Timestamp Reply (Type 14)
    TimestampReply,
    Other(u8),
}

impl IcmpType {
    pub fn to_u8(self) -> u8 {
        match self {
            IcmpType::EchoReply => 0,
            IcmpType::DestinationUnreachable => 3,
            IcmpType::SourceQuench => 4,
            IcmpType::Redirect => 5,
            IcmpType::EchoRequest => 8,
            IcmpType::RouterAdvertisement => 9,
            IcmpType::RouterSolicitation => 10,
            IcmpType::TimeExceeded => 11,
            IcmpType::ParameterProblem => 12,
            IcmpType::TimestampRequest => 13,
            IcmpType::TimestampReply => 14,
            IcmpType::Other(value) => value,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => IcmpType::EchoReply,
            3 => IcmpType::DestinationUnreachable,
            4 => IcmpType::SourceQuench,
            5 => IcmpType::Redirect,
            8 => IcmpType::EchoRequest,
            9 => IcmpType::RouterAdvertisement,
            10 => IcmpType::RouterSolicitation,
            11 => IcmpType::TimeExceeded,
            12 => IcmpType::ParameterProblem,
            13 => IcmpType::TimestampRequest,
            14 => IcmpType::TimestampReply,
            other => IcmpType::Other(other),
        }
    }
}

/// ICMP codes for Destination Unreachable messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum DestUnreachableCode {
    /// Network Unreachable
    NetworkUnreachable = 0,
    /// Host Unreachable
    HostUnreachable = 1,
    /// Protocol Unreachable
    ProtocolUnreachable = 2,
    /// Port Unreachable
    PortUnreachable = 3,
    /// Fragmentation Required and DF Set
    FragmentationNeeded = 4,
    /// Source Route Failed
    SourceRouteFailed = 5,
}

/// ICMP message.
///
/// `rest_of_header` holds the type-specific second word (identifier and
/// sequence for echo messages, the next-hop MTU for fragmentation needed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IcmpFrame {
    pub icmp_type: IcmpType,
    pub code: u8,
    pub rest_of_header: u32,
    pub payload: Option<Box<Frame>>,
}

impl IcmpFrame {
    pub fn new(icmp_type: IcmpType, code: u8, rest_of_header: u32) -> Self {
        Self {
            icmp_type,
            code,
            rest_of_header,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Frame) -> Self {
        self.payload = Some(Box::new(payload));
        self
    }

    /// Creates an echo request.
    pub fn echo_request(identifier: u16, sequence: u16, data: &[u8]) -> Self {
        Self::new(IcmpType::EchoRequest, 0, echo_word(identifier, sequence)).with_payload(Frame::raw(data))
    }

    /// Creates the echo reply answering `request`.
    pub fn echo_reply(request: &IcmpFrame) -> Self {
        Self {
            icmp_type: IcmpType::EchoReply,
            code: 0,
            rest_of_header: request.rest_of_header,
            payload: request.payload.clone(),
        }
    }

    /// Creates a time-exceeded (TTL expired in transit) error quoting `original`.
    pub fn time_exceeded(original: &Ipv4Frame) -> Self {
        Self::new(IcmpType::TimeExceeded, 0, 0).with_payload(Frame::raw(&quote(original)))
    }

    /// Creates a destination-unreachable error quoting `original`.
    pub fn destination_unreachable(code: DestUnreachableCode, original: &Ipv4Frame) -> Self {
        Self::new(IcmpType::DestinationUnreachable, code as u8, 0).with_payload(Frame::raw(&quote(original)))
    }

    pub fn identifier(&self) -> u16 {
        (self.rest_of_header >> 16) as u16
    }

    pub fn sequence(&self) -> u16 {
        self.rest_of_header as u16
    }

    /// Checksum as it will be written.
    pub fn checksum(&self) -> u16 {
        let bytes = self.to_bytes();
        u16::from_be_bytes([bytes[2], bytes[3]])
    }
}

fn echo_word(identifier: u16, sequence: u16) -> u32 {
    ((identifier as u32) << 16) | sequence as u32
}

/// Original IP header plus the first 8 payload bytes, as quoted by ICMP errors.
fn quote(original: &Ipv4Frame) -> Vec<u8> {
    let bytes = original.to_bytes();
    let end = (original.header_length() + 8).min(bytes.len());
    bytes[..end].to_vec()
}

impl Codec for IcmpFrame {
    const FRAME_TYPE: FrameType = FrameType::Icmp;

    fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        FrameError::ensure("icmp", bytes, HEADER_LENGTH)?;
        let payload = &bytes[HEADER_LENGTH..];
        Ok(Self {
            icmp_type: IcmpType::from_u8(bytes[0]),
            code: bytes[1],
            rest_of_header: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            payload: (!payload.is_empty()).then(|| Box::new(Frame::raw(payload))),
        })
    }

    fn header_length(&self) -> usize {
        HEADER_LENGTH
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length());
        bytes.push(self.icmp_type.to_u8());
        bytes.push(self.code);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&self.rest_of_header.to_be_bytes());
        bytes.extend_from_slice(&frame::payload_bytes(&self.payload));

        let checksum = internet_checksum(&bytes);
        bytes[2..4].copy_from_slice(&checksum.to_be_bytes());
        bytes
    }

    fn length(&self) -> usize {
        HEADER_LENGTH + frame::payload_length(&self.payload)
    }
}
