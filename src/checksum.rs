//! Internet checksum (RFC 1071) and transport pseudo-headers.
//!
//! UDP, TCP and ICMPv6 checksums cover a pseudo-header made of the IP
//! addresses, the protocol number and the segment length. The pseudo-header
//! is only ever used for computing checksums and is never transmitted.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Sums `data` as big-endian 16-bit words into a 32-bit accumulator.
///
/// A trailing odd byte is padded with a zero byte.
pub fn ones_complement_sum(data: &[u8], initial: u32) -> u32 {
    let mut sum = initial;

    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
    }

    if let Some(&byte) = chunks.remainder().first() {
        sum = sum.wrapping_add((byte as u32) << 8);
    }

    sum
}

/// Folds a 32-bit accumulator into 16 bits and returns its one's complement.
pub fn finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Calculates the Internet checksum of `data`.
pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(ones_complement_sum(data, 0))
}

/// Calculates the checksum of `data` prefixed with `pseudo_header`.
pub fn checksum_with_pseudo_header(pseudo_header: &[u8], data: &[u8]) -> u16 {
    let sum = ones_complement_sum(pseudo_header, 0);
    // pseudo-headers are always an even number of bytes, so the segment
    // can be summed separately
    finish(ones_complement_sum(data, sum))
}

/// True when `data` (checksum field included) sums to zero.
pub fn verify(data: &[u8]) -> bool {
    internet_checksum(data) == 0
}

/// Builds the 12-byte IPv4 pseudo-header.
pub fn ipv4_pseudo_header(source: Ipv4Addr, destination: Ipv4Addr, protocol: u8, length: u16) -> Vec<u8> {
    let mut header = Vec::with_capacity(12);
    header.extend_from_slice(&source.octets());
    header.extend_from_slice(&destination.octets());
    header.push(0);
    header.push(protocol);
    header.extend_from_slice(&length.to_be_bytes());
    header
}

/// Builds the 40-byte IPv6 pseudo-header (RFC 8200 §8.1).
pub fn ipv6_pseudo_header(source: Ipv6Addr, destination: Ipv6Addr, next_header: u8, length: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(40);
    header.extend_from_slice(&source.octets());
    header.extend_from_slice(&destination.octets());
    header.extend_from_slice(&length.to_be_bytes());
    header.extend_from_slice(&[0, 0, 0, next_header]);
    header
}

/// Builds the pseudo-header matching the address family of the endpoints.
///
/// Returns `None` when the addresses belong to different families.
pub fn pseudo_header(source: IpAddr, destination: IpAddr, protocol: u8, length: usize) -> Option<Vec<u8>> {
    match (source, destination) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => Some(ipv4_pseudo_header(src, dst, protocol, length as u16)),
        (IpAddr::V6(src), IpAddr::V6(dst)) => Some(ipv6_pseudo_header(src, dst, protocol, length as u32)),
        _ => None,
    }
}
