//! One direction of a TCP connection reconstructed into a byte stream.

use std::net::SocketAddr;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::Codec;
use crate::frame::Frame;
use crate::ip::IpProtocol;
use crate::socket::ProtocolSocket;
use crate::socket::ip::{Delivery, IpSocket};
use crate::stream::StreamPipe;
use crate::tcp::TcpFrame;

/// Out-of-order bytes kept per stream before segments are dropped.
pub const MAX_OUT_OF_ORDER_BYTES: usize = 1 << 20;

/// Signed distance from `b` to `a` in sequence space.
fn sequence_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[derive(Debug, Default)]
struct StreamState {
    next_sequence: Option<u32>,
    /// Segments waiting for the gap before them to fill
    out_of_order: Vec<(u32, Vec<u8>)>,
    fin_sequence: Option<u32>,
}

impl StreamState {
    fn buffered(&self) -> usize {
        self.out_of_order.iter().map(|(_, data)| data.len()).sum()
    }
}

/// Orders the segments `remote` sends to `local` by sequence number and
/// writes their data to a [`StreamPipe`].
///
/// A SYN fixes the initial sequence number; without one the first segment
/// seen does. Retransmitted bytes are written once. FIN closes the pipe
/// once every byte before it has arrived; RST closes it at once.
#[derive(Debug)]
pub struct TcpStreamSocket {
    ip: IpSocket,
    local: SocketAddr,
    remote: SocketAddr,
    state: Mutex<StreamState>,
    pipe: StreamPipe,
}

impl TcpStreamSocket {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self::with_pipe(local, remote, StreamPipe::new())
    }

    /// Feeds an existing pipe, e.g. one owned by a stream monitor.
    pub fn with_pipe(local: SocketAddr, remote: SocketAddr, pipe: StreamPipe) -> Self {
        Self {
            ip: IpSocket::bind(local.ip(), IpProtocol::Tcp).with_remote(remote.ip()),
            local,
            remote,
            state: Mutex::new(StreamState::default()),
            pipe,
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn pipe(&self) -> &StreamPipe {
        &self.pipe
    }

    pub fn is_closed(&self) -> bool {
        self.pipe.is_closed()
    }

    fn accept_segment(&self, segment: &TcpFrame) {
        if segment.flags.rst {
            debug!(remote = %self.remote, "Stream reset");
            self.pipe.close();
            return;
        }

        let data = segment.payload_bytes();
        let data_sequence = segment.sequence_number.wrapping_add(segment.flags.syn as u32);
        let mut state = self.state.lock();
        if segment.flags.syn || state.next_sequence.is_none() {
            state.next_sequence = Some(data_sequence);
        }
        if segment.flags.fin {
            state.fin_sequence = Some(data_sequence.wrapping_add(data.len() as u32));
        }
        if !data.is_empty() {
            if state.buffered() + data.len() > MAX_OUT_OF_ORDER_BYTES {
                debug!(remote = %self.remote, "Out-of-order buffer full, dropping segment");
            } else {
                state.out_of_order.push((data_sequence, data));
            }
        }
        self.flush(&mut state);
    }

    /// Writes every segment that starts at or before the next expected byte.
    fn flush(&self, state: &mut StreamState) {
        let Some(mut next) = state.next_sequence else {
            return;
        };
        while let Some(index) = state
            .out_of_order
            .iter()
            .position(|(sequence, _)| sequence_diff(*sequence, next) <= 0)
        {
            let (sequence, data) = state.out_of_order.swap_remove(index);
            let end = sequence.wrapping_add(data.len() as u32);
            if sequence_diff(end, next) <= 0 {
                continue; // pure retransmission
            }
            let skip = next.wrapping_sub(sequence) as usize;
            trace!(remote = %self.remote, bytes = data.len() - skip, "Stream data in order");
            if self.pipe.write(&data[skip..]).is_err() {
                state.out_of_order.clear();
                return;
            }
            next = end;
        }
        state.next_sequence = Some(next);

        if state.fin_sequence == Some(next) {
            debug!(remote = %self.remote, "Stream finished");
            self.pipe.close();
        }
    }
}

impl ProtocolSocket for TcpStreamSocket {
    fn push_up(&self, frame: &Frame) -> bool {
        let datagram = match self.ip.deliver(frame) {
            Delivery::Ignored => return false,
            Delivery::Pending | Delivery::Dropped => return true,
            Delivery::Complete(datagram) => datagram,
        };
        let segment = match datagram.payload {
            Frame::Tcp(segment) => segment,
            Frame::Raw(raw) => match TcpFrame::parse(&raw.data) {
                Ok(segment) => segment,
                Err(_) => return false,
            },
            _ => return false,
        };
        if segment.source_port != self.remote.port() || segment.destination_port != self.local.port() {
            return false;
        }
        self.accept_segment(&segment);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip::Ipv4Frame;
    use crate::tcp::TcpFlags;
    use std::io::Read;
    use std::net::{IpAddr, Ipv4Addr};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn socket() -> TcpStreamSocket {
        TcpStreamSocket::new(
            SocketAddr::new(IpAddr::V4(SERVER), 80),
            SocketAddr::new(IpAddr::V4(CLIENT), 40000),
        )
    }

    fn segment(sequence: u32, flags: TcpFlags, data: &[u8]) -> Frame {
        let mut tcp = TcpFrame::new(40000, 80).with_sequence(sequence).with_flags(flags);
        if !data.is_empty() {
            tcp = tcp.with_payload(Frame::raw(data));
        }
        Frame::Ipv4(Ipv4Frame::new(IpProtocol::Tcp, CLIENT, SERVER).with_payload(Frame::Tcp(tcp)))
    }

    fn fin() -> TcpFlags {
        TcpFlags {
            fin: true,
            ..TcpFlags::default()
        }
    }

    fn read_all(socket: &TcpStreamSocket) -> String {
        let mut text = String::new();
        socket.pipe().reader().read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn test_orders_segments_and_closes_on_fin() {
        let socket = socket();
        let none = TcpFlags::default();
        assert!(socket.push_up(&segment(99, TcpFlags::syn(), b"")));
        assert!(socket.push_up(&segment(106, fin(), b"world")));
        assert!(socket.push_up(&segment(100, none, b"hello ")));
        // retransmission overlapping delivered data
        assert!(socket.push_up(&segment(100, none, b"hello ")));

        assert!(socket.is_closed());
        assert_eq!(read_all(&socket), "hello world");
    }

    #[test]
    fn test_partial_overlap_is_trimmed() {
        let socket = socket();
        socket.push_up(&segment(0, TcpFlags::default(), b"abcd"));
        socket.push_up(&segment(2, TcpFlags::default(), b"cdef"));
        socket.push_up(&segment(6, fin(), b""));
        assert_eq!(read_all(&socket), "abcdef");
    }

    #[test]
    fn test_sequence_wraparound() {
        let socket = socket();
        socket.push_up(&segment(u32::MAX - 1, TcpFlags::default(), b"ab"));
        socket.push_up(&segment(2, fin(), b"ef"));
        socket.push_up(&segment(0, TcpFlags::default(), b"cd"));
        assert_eq!(read_all(&socket), "abcdef");
    }

    #[test]
    fn test_reset_closes_immediately() {
        let socket = socket();
        socket.push_up(&segment(0, TcpFlags::default(), b"abc"));
        socket.push_up(&segment(10, TcpFlags::default(), b"gap"));
        socket.push_up(&segment(
            3,
            TcpFlags {
                rst: true,
                ..TcpFlags::default()
            },
            b"",
        ));
        assert_eq!(read_all(&socket), "abc");
    }

    #[test]
    fn test_other_connections_are_ignored() {
        let socket = socket();
        let mut frame = segment(0, TcpFlags::default(), b"x");
        if let Some(Frame::Tcp(tcp)) = frame.find_mut(crate::frame::FrameType::Tcp) {
            tcp.destination_port = 443;
        }
        assert!(!socket.push_up(&frame));
    }
}
