//! IP fragmentation.
//!
//! Fragment payloads are 8-byte aligned (except the last) and every
//! fragment, headers included, fits the MTU. Reassembly lives with the
//! sockets that consume the datagrams, see [`crate::socket::ip`].

use tracing::trace;

use crate::frame::{self, Frame};
use crate::ip::{IpProtocol, Ipv4Frame};
use crate::ipv6::{FRAGMENT_HEADER_LENGTH, Ipv6FragmentHeader, Ipv6Frame, Ipv6RoutingHeader};
use crate::{Codec, FrameError};

/// Splits an IPv4 or IPv6 frame so that every piece fits `mtu`.
///
/// A frame that already fits is returned unchanged as the only element.
/// IPv6 fragments get a random identification.
///
/// # Returns
/// - `Ok(Vec<Frame>)` - The fragments in ascending offset order
/// - `Err(FrameError)` - If the frame is not IP, has DF set, or the MTU cannot carry any data
pub fn fragment(frame: &Frame, mtu: usize) -> Result<Vec<Frame>, FrameError> {
    match frame {
        Frame::Ipv4(ip) => Ok(fragment_ipv4(ip, mtu)?.into_iter().map(Frame::Ipv4).collect()),
        Frame::Ipv6(ip) => Ok(fragment_ipv6(ip, mtu, None)?.into_iter().map(Frame::Ipv6).collect()),
        other => Err(FrameError::UnsupportedProtocol(format!(
            "cannot fragment {:?} frames",
            other.frame_type()
        ))),
    }
}

/// Fragments an IPv4 datagram.
///
/// Every fragment copies the header (options included). Offsets continue
/// from the datagram's own offset, so fragments can be fragmented again;
/// the last piece keeps the original more-fragments flag.
pub fn fragment_ipv4(ip: &Ipv4Frame, mtu: usize) -> Result<Vec<Ipv4Frame>, FrameError> {
    let length = ip.length();
    if length <= mtu {
        return Ok(vec![ip.clone()]);
    }
    if ip.flags.dont_fragment {
        return Err(FrameError::DontFragment { length, mtu });
    }

    let header_length = ip.header_length();
    let chunk_size = mtu.saturating_sub(header_length) & !7;
    if chunk_size == 0 {
        return Err(FrameError::invalid_length(
            "ipv4",
            format!("MTU {} leaves no room for data after a {}-byte header", mtu, header_length),
        ));
    }

    let payload = frame::payload_bytes(&ip.payload);
    let chunks: Vec<&[u8]> = payload.chunks(chunk_size).collect();
    let last = chunks.len() - 1;
    let fragments = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut piece = ip.clone();
            piece.payload = Some(Box::new(Frame::raw(chunk)));
            piece.fragment_offset = ip.fragment_offset + ((index * chunk_size) / 8) as u16;
            piece.flags.more_fragments = index != last || ip.flags.more_fragments;
            piece
        })
        .collect::<Vec<_>>();

    trace!(
        "fragmented IPv4 datagram {} of {} bytes into {} pieces",
        ip.identification,
        length,
        fragments.len()
    );
    Ok(fragments)
}

/// Fragments an IPv6 datagram.
///
/// Routing headers directly after the base header are unfragmentable and
/// repeated in every fragment; the Fragment header is inserted after them.
/// A random identification is drawn when none is supplied.
pub fn fragment_ipv6(ip: &Ipv6Frame, mtu: usize, identification: Option<u32>) -> Result<Vec<Ipv6Frame>, FrameError> {
    if ip.length() <= mtu {
        return Ok(vec![ip.clone()]);
    }

    let mut base = ip.clone();
    base.payload = None;

    // split the chain into the unfragmentable routing headers and the rest
    let mut routing: Vec<Ipv6RoutingHeader> = Vec::new();
    let mut next_header = ip.next_header;
    let mut rest = ip.payload.as_deref();
    while let Some(Frame::Ipv6Routing(header)) = rest {
        let mut copy = header.clone();
        copy.payload = None;
        next_header = header.next_header;
        routing.push(copy);
        rest = header.payload.as_deref();
    }
    let fragmentable = rest.map(Frame::to_bytes).unwrap_or_default();

    match routing.last_mut() {
        Some(last) => last.next_header = IpProtocol::Ipv6Fragment,
        None => base.next_header = IpProtocol::Ipv6Fragment,
    }

    let unfragmentable_length = base.header_length() + routing.iter().map(|header| header.header_length()).sum::<usize>();
    let chunk_size = mtu.saturating_sub(unfragmentable_length + FRAGMENT_HEADER_LENGTH) & !7;
    if chunk_size == 0 {
        return Err(FrameError::invalid_length(
            "ipv6",
            format!("MTU {} leaves no room for data after the unfragmentable part", mtu),
        ));
    }

    let identification = identification.unwrap_or_else(rand::random);
    let chunks: Vec<&[u8]> = fragmentable.chunks(chunk_size).collect();
    let last = chunks.len().saturating_sub(1);
    let fragments = chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut header = Ipv6FragmentHeader::new(next_header, identification);
            header.fragment_offset = ((index * chunk_size) / 8) as u16;
            header.more_fragments = index != last;
            header.payload = Some(Box::new(Frame::raw(chunk)));

            let mut inner = Frame::Ipv6Fragment(header);
            for routing_header in routing.iter().rev() {
                let mut copy = routing_header.clone();
                copy.payload = Some(Box::new(inner));
                inner = Frame::Ipv6Routing(copy);
            }
            let mut piece = base.clone();
            piece.payload = Some(Box::new(inner));
            piece
        })
        .collect::<Vec<_>>();

    trace!(
        "fragmented IPv6 datagram {:#x} into {} pieces",
        identification,
        fragments.len()
    );
    Ok(fragments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::Ipv4Flags;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn pattern(length: usize) -> Vec<u8> {
        (0..length).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn ipv4(length: usize) -> Ipv4Frame {
        let mut ip = Ipv4Frame::new(IpProtocol::Udp, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
            .with_payload(Frame::raw(&pattern(length)));
        ip.identification = 99;
        ip
    }

    #[test]
    fn test_small_frame_is_unchanged() {
        let ip = ipv4(100);
        let fragments = fragment(&Frame::Ipv4(ip.clone()), 1500).unwrap();
        assert_eq!(fragments, vec![Frame::Ipv4(ip)]);
    }

    #[test]
    fn test_ipv4_fragment_properties() {
        let ip = ipv4(3000);
        let fragments = fragment_ipv4(&ip, 576).unwrap();
        assert_eq!(fragments.len(), 6);

        let mut reassembled = Vec::new();
        let mut expected_offset = 0;
        for (index, piece) in fragments.iter().enumerate() {
            assert!(piece.length() <= 576);
            assert_eq!(piece.identification, 99);
            assert_eq!(piece.fragment_offset as usize * 8, expected_offset);
            assert_eq!(piece.flags.more_fragments, index != fragments.len() - 1);
            let data = frame::payload_bytes(&piece.payload);
            if index != fragments.len() - 1 {
                assert_eq!(data.len() % 8, 0);
            }
            expected_offset += data.len();
            reassembled.extend_from_slice(&data);
        }
        assert_eq!(reassembled, pattern(3000));
    }

    #[test]
    fn test_dont_fragment_fails() {
        let mut ip = ipv4(2000);
        ip.flags = Ipv4Flags::new(true, false);
        assert!(matches!(
            fragment_ipv4(&ip, 1500),
            Err(FrameError::DontFragment { length: 2020, mtu: 1500 })
        ));
    }

    #[test]
    fn test_refragmenting_keeps_offsets_and_flag() {
        let ip = ipv4(3000);
        let first = fragment_ipv4(&ip, 1500).unwrap();
        let again = fragment_ipv4(&first[0], 576).unwrap();
        assert!(again.iter().all(|piece| piece.flags.more_fragments));
        let second = fragment_ipv4(&first[1], 576).unwrap();
        assert_eq!(second[0].fragment_offset, first[1].fragment_offset);
    }

    #[test]
    fn test_ipv6_inserts_fragment_header_after_routing() {
        let source: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let destination: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let mut routing = Ipv6RoutingHeader::new(IpProtocol::Udp, 0, 0, vec![0; 4]);
        routing.payload = Some(Box::new(Frame::raw(&pattern(4000))));
        let ip = Ipv6Frame::new(IpProtocol::Ipv6Routing, source, destination).with_payload(Frame::Ipv6Routing(routing));

        let fragments = fragment_ipv6(&ip, 1280, Some(0xfeed)).unwrap();
        let mut reassembled = Vec::new();
        for (index, piece) in fragments.iter().enumerate() {
            assert!(piece.length() <= 1280);
            assert_eq!(piece.next_header, IpProtocol::Ipv6Routing);
            let Some(Frame::Ipv6Routing(routing)) = piece.payload.as_deref() else {
                panic!("routing header must stay first");
            };
            assert_eq!(routing.next_header, IpProtocol::Ipv6Fragment);
            let Some(Frame::Ipv6Fragment(header)) = routing.payload.as_deref() else {
                panic!("fragment header must follow the routing header");
            };
            assert_eq!(header.identification, 0xfeed);
            assert_eq!(header.next_header, IpProtocol::Udp);
            assert_eq!(header.fragment_offset as usize * 8, reassembled.len());
            assert_eq!(header.more_fragments, index != fragments.len() - 1);
            reassembled.extend_from_slice(&frame::payload_bytes(&header.payload));
        }
        assert_eq!(reassembled, pattern(4000));
    }
}
