//! Protocol sockets: frames in, application data out.
//!
//! A socket claims the frames matching its binding. Claiming is reported
//! as a `bool` so that a demultiplexer can pass unclaimed frames on.

pub mod ip;
pub mod tcp;
pub mod udp;

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;
use crate::frame::Frame;
use crate::handler::{HandlerCore, TrafficHandler};

/// A binding that consumes matching frames.
pub trait ProtocolSocket: Send + Sync {
    /// Offers a frame to the socket.
    ///
    /// # Returns
    /// `true` if the frame matched the binding and was consumed, `false`
    /// if it belongs to someone else.
    fn push_up(&self, frame: &Frame) -> bool;
}

/// Handler delivering frames to the first socket that claims them.
///
/// Frames no socket claims are forwarded to the output.
pub struct SocketDemultiplexer {
    core: HandlerCore,
    sockets: RwLock<Vec<Arc<dyn ProtocolSocket>>>,
}

impl SocketDemultiplexer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: HandlerCore::new(name),
            sockets: RwLock::new(Vec::new()),
        }
    }

    pub fn add_socket(&self, socket: Arc<dyn ProtocolSocket>) {
        self.sockets.write().push(socket);
    }

    pub fn remove_socket(&self, socket: &Arc<dyn ProtocolSocket>) {
        self.sockets.write().retain(|bound| !Arc::ptr_eq(bound, socket));
    }
}

impl TrafficHandler for SocketDemultiplexer {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let sockets = self.sockets.read().clone();
        if !sockets.iter().any(|socket| socket.push_up(&frame)) {
            self.core.notify_next(frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::udp::UdpSocket;
    use super::*;
    use crate::handler::test_util::Collector;
    use crate::ip::{IpProtocol, Ipv4Frame};
    use crate::udp::UdpFrame;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_unclaimed_frames_pass_through() {
        let local = Ipv4Addr::new(10, 1, 1, 1);
        let socket = Arc::new(UdpSocket::bind(IpAddr::V4(local), 7));
        let demux = SocketDemultiplexer::new("demux");
        let rest = Collector::started("rest");
        demux.add_socket(socket.clone());
        demux.set_output(Some(rest.clone()));
        demux.start().unwrap();

        let to = |port: u16| {
            Frame::Ipv4(
                Ipv4Frame::new(IpProtocol::Udp, Ipv4Addr::new(10, 1, 1, 2), local)
                    .with_payload(Frame::Udp(UdpFrame::new(1000, port).with_payload(Frame::raw(b"echo")))),
            )
        };
        demux.push_traffic(to(7));
        demux.push_traffic(to(8));

        assert_eq!(socket.receive().unwrap().payload, b"echo");
        assert_eq!(rest.take(), vec![to(8)]);
    }
}
