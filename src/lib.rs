//! A Rust library for capturing, parsing, mutating, routing and re-emitting
//! network traffic.
//!
//! This library is built around two ideas:
//!
//! - [`Frame`]: a recursive, type-tagged protocol tree (Ethernet, ARP,
//!   IPv4/IPv6, UDP, TCP, ICMP, DNS, HTTP, OSPF, RIP) that can be parsed from
//!   and serialized to wire bytes
//! - [`TrafficHandler`](handler::TrafficHandler): a chain-of-responsibility
//!   pipeline of modifiers, analyzers, splitters, interfaces and routers
//!   that frames are pushed through
//!
//! Around them sit IP fragmentation and reassembly, pseudo-header checksums,
//! TCP stream reconstruction, ARP host and routing tables, and a libpcap
//! dumper.

pub mod arp;
pub mod checksum;
pub mod config;
pub mod device;
pub mod dns;
pub mod error;
pub mod ethernet;
pub mod event;
pub mod fragment;
pub mod frame;
pub mod handler;
pub mod hosts;
pub mod http;
pub mod icmp;
pub mod icmpv6;
pub mod ip;
pub mod ipv6;
pub mod ospf;
pub mod pcap;
pub mod rip;
pub mod routing;
pub mod socket;
pub mod stream;
pub mod tcp;
pub mod udp;
pub mod worker;

pub use error::{Error, FrameError, Result};
pub use frame::{Frame, FrameType, RawDataFrame, TrafficDescriptionFrame};

/// Core trait of every wire format.
///
/// `parse` reads one unit from the front of a buffer, including whatever it
/// encapsulates, and `to_bytes` is its inverse. Lengths and header checksums
/// are derived at serialization time, so they are never stale.
pub trait Codec: Sized {
    /// Tag of the frames produced by this codec.
    const FRAME_TYPE: FrameType;

    /// Parse the codec's header and payload from the front of `bytes`.
    ///
    /// # Returns
    /// - `Ok(Self)` - The parsed unit
    /// - `Err(FrameError)` - If the buffer is truncated or a length field is inconsistent
    fn parse(bytes: &[u8]) -> std::result::Result<Self, FrameError>;

    /// Get the length of this unit's own header in bytes.
    fn header_length(&self) -> usize;

    /// Serialize the unit and everything it encapsulates.
    fn to_bytes(&self) -> Vec<u8>;

    /// Get the total serialized length in bytes.
    fn length(&self) -> usize {
        self.to_bytes().len()
    }

    /// Validate the field values.
    fn validate(&self) -> std::result::Result<(), FrameError> {
        Ok(())
    }
}

/// Trait for transport units whose checksum covers a pseudo-header.
///
/// Implemented by UDP, TCP and ICMPv6.
pub trait Checksummed {
    /// Calculate the checksum for the unit, treating its checksum field as zero.
    fn calculate_checksum(&self, pseudo_header: &[u8]) -> u16;

    /// Verify the stored checksum against the pseudo-header.
    fn verify_checksum(&self, pseudo_header: &[u8]) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arp::{ArpFrame, Operation as ArpOperation};
    use crate::ethernet::{EtherType, EthernetFrame, MacAddress};
    use crate::fragment::fragment;
    use crate::handler::TrafficHandler;
    use crate::handler::analyzer::TrafficAnalyzer;
    use crate::handler::parser::FrameParser;
    use crate::ip::{IpProtocol, Ipv4Frame};
    use crate::pcap::LibCapDumper;
    use crate::socket::ProtocolSocket;
    use crate::socket::udp::UdpSocket;
    use crate::udp::UdpFrame;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    #[test]
    fn test_ethernet_arp_round_trip() {
        let sender_mac = MacAddress::new([0xAA; 6]);
        let sender_ip = Ipv4Addr::new(192, 168, 0, 5);
        let target_ip = Ipv4Addr::new(192, 168, 0, 1);

        let arp = ArpFrame::request(sender_mac, sender_ip, target_ip);
        let frame = EthernetFrame::new(MacAddress::BROADCAST, sender_mac, EtherType::Arp)
            .with_payload(Frame::Arp(arp));
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), 64);

        let parsed = EthernetFrame::parse(&bytes).unwrap();
        assert_eq!(parsed.ether_type, EtherType::Arp);
        let arp = match parsed.payload.as_deref() {
            Some(Frame::Arp(arp)) => arp,
            other => panic!("expected ARP payload, got {:?}", other),
        };
        assert_eq!(arp.operation, ArpOperation::Request);
        assert_eq!(arp.sender_hardware_addr, sender_mac);
        assert_eq!(arp.sender_protocol_addr, sender_ip);
        assert_eq!(arp.target_protocol_addr, target_ip);
    }

    #[test]
    fn test_ipv4_fragmentation_reassembles_through_socket() {
        let local = Ipv4Addr::new(10, 0, 0, 2);
        let remote = Ipv4Addr::new(10, 0, 0, 1);
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();

        let mut udp = UdpFrame::builder()
            .source_port(5353)
            .destination_port(9000)
            .payload(Frame::raw(&payload))
            .build()
            .unwrap();
        let pseudo = checksum::ipv4_pseudo_header(remote, local, 17, udp.length() as u16);
        udp.checksum = udp.calculate_checksum(&pseudo);

        let ip = Ipv4Frame::builder()
            .protocol(IpProtocol::Udp)
            .source(remote)
            .destination(local)
            .identification(0x1234)
            .payload(Frame::Udp(udp))
            .build()
            .unwrap();

        let fragments = fragment(&Frame::Ipv4(ip), 576).unwrap();
        assert!(fragments.len() > 1);
        assert!(fragments.iter().all(|f| f.len() <= 576));

        let socket = UdpSocket::bind(IpAddr::V4(local), 9000);
        // deliver in reverse to exercise offset-indexed writes
        for fragment in fragments.iter().rev() {
            assert!(socket.push_up(fragment));
        }
        let datagram = socket.receive().expect("reassembled datagram");
        assert_eq!(datagram.payload, payload);
        assert_eq!(datagram.source_port, 5353);
    }

    #[test]
    fn test_truncated_frame_is_dropped_at_the_boundary() {
        let parser = FrameParser::ethernet("parser");
        let sink = Arc::new(TrafficAnalyzer::new("sink", |_: &Frame| Ok(())));
        parser.set_output(Some(sink.clone()));
        parser.start().unwrap();
        sink.start().unwrap();
        let mut events = parser.core().events().subscribe();

        parser.push_traffic(Frame::raw(&[0u8; 10]));

        assert_eq!(sink.core().stats().received, 0);
        assert_eq!(parser.core().stats().dropped, 1);
        assert!(matches!(
            events.try_recv(),
            Ok(event::HandlerEvent::FrameDropped { .. })
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_dumper_writes_pcap_global_header() {
        let path = std::env::temp_dir().join(format!("pktflow-header-{}.pcap", std::process::id()));
        let dumper = LibCapDumper::new();
        dumper.start_logging(&path).unwrap();
        dumper.stop_logging().unwrap();

        let written = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(
            &written[..24],
            &[
                0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
            ]
        );
    }
}
