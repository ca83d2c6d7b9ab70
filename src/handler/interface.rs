//! IP interfaces: the bridge between a capture device and the pipeline.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::Codec;
use crate::arp::{ArpFrame, Operation};
use crate::device::{CaptureDevice, random_mac};
use crate::error::{Error, FrameError, Result};
use crate::ethernet::{EtherType, EthernetFrame, MacAddress};
use crate::event::HandlerEvent;
use crate::fragment::fragment;
use crate::frame::{Frame, TrafficDescriptionFrame};
use crate::handler::{HandlerCore, HandlerState, TrafficHandler};
use crate::hosts::HostTable;
use crate::icmpv6::{self, Icmpv6Frame, Icmpv6Message};
use crate::ip::IpProtocol;
use crate::ipv6::Ipv6Frame;
use crate::worker::{StopSignal, Worker};

pub const DEFAULT_MTU: usize = 1500;
/// Frames waiting for address resolution, across all next hops.
pub const MAX_PENDING_RESOLUTION: usize = 128;
/// How long a frame waits for its next hop to answer.
pub const RESOLUTION_TIMEOUT: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
const ND_HOP_LIMIT: u8 = 255;

#[derive(Debug)]
struct PendingFrame {
    next_hop: IpAddr,
    ether_type: EtherType,
    frame: Frame,
    expires: Instant,
}

struct Inner {
    core: HandlerCore,
    device: Arc<dyn CaptureDevice>,
    mac: MacAddress,
    mtu: AtomicUsize,
    addresses: RwLock<Vec<IpNetwork>>,
    hosts: Arc<HostTable>,
    pending: Mutex<Vec<PendingFrame>>,
}

impl Inner {
    fn capture_loop(&self, signal: &StopSignal) {
        while !signal.is_stopped() {
            match self.device.receive(POLL_INTERVAL) {
                Ok(Some(bytes)) => self.captured(&bytes),
                Ok(None) => {}
                Err(err) => {
                    if !signal.is_stopped() {
                        warn!(interface = %self.core.name(), error = %err, "Capture failed");
                        self.core.report_exception(format!("capture failed: {}", err));
                    }
                    break;
                }
            }
            self.expire_pending(Instant::now());
        }
        trace!(interface = %self.core.name(), "Capture loop finished");
    }

    fn captured(&self, bytes: &[u8]) {
        self.core.record_received();
        let state = self.core.state();
        if state != HandlerState::Running {
            self.core.drop_frame(format!("handler is {:?}", state));
            return;
        }
        self.core.run_guarded(|| self.process_captured(bytes));
    }

    fn process_captured(&self, bytes: &[u8]) -> Result<()> {
        let ethernet = EthernetFrame::parse(bytes)?;
        if ethernet.source == self.mac {
            // our own transmission seen again by a promiscuous device
            return Ok(());
        }
        self.learn_binding(&ethernet);
        self.answer_resolution(&ethernet)?;
        self.core.notify_next(Frame::TrafficDescription(TrafficDescriptionFrame::new(
            self.core.name(),
            Frame::Ethernet(ethernet),
        )));
        Ok(())
    }

    fn learn_binding(&self, ethernet: &EthernetFrame) {
        match ethernet.payload.as_deref() {
            Some(Frame::Arp(arp)) if !arp.sender_protocol_addr.is_unspecified() => {
                self.learned(IpAddr::V4(arp.sender_protocol_addr), arp.sender_hardware_addr);
            }
            Some(Frame::Ipv6(ip)) => {
                let Some(Frame::Icmpv6(icmp)) = ip.upper_layer() else {
                    return;
                };
                let Some(mac) = icmp.link_layer_address() else {
                    return;
                };
                match &icmp.message {
                    Icmpv6Message::NeighborSolicitation { .. } if !ip.source.is_unspecified() => {
                        self.learned(IpAddr::V6(ip.source), mac);
                    }
                    Icmpv6Message::NeighborAdvertisement { target, .. } => {
                        self.learned(IpAddr::V6(*target), mac);
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    /// Records a binding and releases the frames that were waiting for it.
    fn learned(&self, ip: IpAddr, mac: MacAddress) {
        self.hosts.learn(ip, mac);
        let Some(mac) = self.hosts.lookup_mac(ip) else {
            return;
        };
        let ready: Vec<PendingFrame> = {
            let mut pending = self.pending.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|entry| entry.next_hop == ip);
            *pending = waiting;
            ready
        };
        if !ready.is_empty() {
            debug!(interface = %self.core.name(), next_hop = %ip, frames = ready.len(), "Address resolved");
        }
        for entry in ready {
            if let Err(err) = self.send_ethernet(mac, entry.ether_type, entry.frame) {
                warn!(interface = %self.core.name(), error = %err, "Sending resolved frame failed");
            }
        }
    }

    fn answer_resolution(&self, ethernet: &EthernetFrame) -> Result<()> {
        match ethernet.payload.as_deref() {
            Some(Frame::Arp(arp))
                if arp.operation == Operation::Request && self.owns(IpAddr::V4(arp.target_protocol_addr)) =>
            {
                trace!(interface = %self.core.name(), target = %arp.target_protocol_addr, "Answering ARP request");
                let reply = ArpFrame::reply(
                    self.mac,
                    arp.target_protocol_addr,
                    arp.sender_hardware_addr,
                    arp.sender_protocol_addr,
                );
                self.send_ethernet(arp.sender_hardware_addr, EtherType::Arp, Frame::Arp(reply))
            }
            Some(Frame::Ipv6(ip)) => {
                let Some(Frame::Icmpv6(icmp)) = ip.upper_layer() else {
                    return Ok(());
                };
                let Icmpv6Message::NeighborSolicitation { target, .. } = &icmp.message else {
                    return Ok(());
                };
                let target = *target;
                if !self.owns(IpAddr::V6(target)) {
                    return Ok(());
                }
                trace!(interface = %self.core.name(), target = %target, "Answering neighbor solicitation");
                let solicited = !ip.source.is_unspecified();
                let destination = if solicited { ip.source } else { ALL_NODES };
                let mut reply = Ipv6Frame::new(IpProtocol::Icmpv6, target, destination).with_payload(Frame::Icmpv6(
                    Icmpv6Frame::neighbor_advertisement(target, self.mac, solicited),
                ));
                reply.hop_limit = ND_HOP_LIMIT;
                reply.update_transport_checksum();
                let mac = if solicited {
                    icmp.link_layer_address().unwrap_or(ethernet.source)
                } else {
                    icmpv6::multicast_mac(ALL_NODES)
                };
                self.send_ethernet(mac, EtherType::Ipv6, Frame::Ipv6(reply))
            }
            _ => Ok(()),
        }
    }

    fn owns(&self, ip: IpAddr) -> bool {
        self.addresses.read().iter().any(|network| network.ip() == ip)
    }

    /// Our address of the same family as `target`, preferring one on its subnet.
    fn source_for(&self, target: IpAddr) -> Option<IpAddr> {
        let addresses = self.addresses.read();
        let same_family = || addresses.iter().filter(|network| network.is_ipv4() == target.is_ipv4());
        same_family()
            .find(|network| network.contains(target))
            .or_else(|| same_family().next())
            .map(|network| network.ip())
    }

    /// Link-layer destination of a next hop, without consulting the wire.
    fn resolve(&self, next_hop: IpAddr) -> Option<MacAddress> {
        match next_hop {
            IpAddr::V4(ip) if ip.is_broadcast() || self.is_subnet_broadcast(ip) => Some(MacAddress::BROADCAST),
            IpAddr::V4(ip) if ip.is_multicast() => {
                let octets = ip.octets();
                Some(MacAddress::new([0x01, 0x00, 0x5e, octets[1] & 0x7f, octets[2], octets[3]]))
            }
            IpAddr::V6(ip) if ip.is_multicast() => Some(icmpv6::multicast_mac(ip)),
            ip => self.hosts.lookup_mac(ip),
        }
    }

    fn is_subnet_broadcast(&self, ip: Ipv4Addr) -> bool {
        self.addresses.read().iter().any(|network| match network {
            IpNetwork::V4(network) => network.prefix() < 31 && network.broadcast() == ip,
            IpNetwork::V6(_) => false,
        })
    }

    fn transmit_ip(&self, frame: Frame, next_hop: Option<IpAddr>) -> Result<()> {
        let ether_type = match frame {
            Frame::Ipv4(_) => EtherType::Ipv4,
            Frame::Ipv6(_) => EtherType::Ipv6,
            ref other => {
                return Err(FrameError::UnsupportedProtocol(format!("cannot route {:?} frames", other.frame_type())).into());
            }
        };
        let destination = frame
            .destination_ip()
            .ok_or_else(|| Error::routing("frame has no destination address"))?;
        let next_hop = next_hop.unwrap_or(destination);
        let fragments = fragment(&frame, self.mtu.load(Ordering::Relaxed))?;

        if let Some(mac) = self.resolve(next_hop) {
            for fragment in fragments {
                self.send_ethernet(mac, ether_type, fragment)?;
            }
            return Ok(());
        }

        let queued = {
            let mut pending = self.pending.lock();
            if pending.len() + fragments.len() > MAX_PENDING_RESOLUTION {
                false
            } else {
                let expires = Instant::now() + RESOLUTION_TIMEOUT;
                pending.extend(fragments.into_iter().map(|frame| PendingFrame {
                    next_hop,
                    ether_type,
                    frame,
                    expires,
                }));
                true
            }
        };
        if !queued {
            self.core.drop_frame(format!("resolution queue full, dropping frame for {}", next_hop));
            return Ok(());
        }
        self.solicit(next_hop)
    }

    /// Asks the link who owns `next_hop`.
    fn solicit(&self, next_hop: IpAddr) -> Result<()> {
        let source = self
            .source_for(next_hop)
            .ok_or_else(|| Error::routing(format!("interface {} has no address to resolve {}", self.core.name(), next_hop)))?;
        debug!(interface = %self.core.name(), next_hop = %next_hop, "Resolving next hop");
        match (source, next_hop) {
            (IpAddr::V4(source), IpAddr::V4(target)) => self.send_ethernet(
                MacAddress::BROADCAST,
                EtherType::Arp,
                Frame::Arp(ArpFrame::request(self.mac, source, target)),
            ),
            (IpAddr::V6(source), IpAddr::V6(target)) => {
                let group = icmpv6::solicited_node_multicast(target);
                let mut solicitation = Ipv6Frame::new(IpProtocol::Icmpv6, source, group)
                    .with_payload(Frame::Icmpv6(Icmpv6Frame::neighbor_solicitation(target, self.mac)));
                solicitation.hop_limit = ND_HOP_LIMIT;
                solicitation.update_transport_checksum();
                self.send_ethernet(icmpv6::multicast_mac(group), EtherType::Ipv6, Frame::Ipv6(solicitation))
            }
            _ => Err(Error::routing("address family mismatch")),
        }
    }

    fn expire_pending(&self, now: Instant) {
        let expired: Vec<PendingFrame> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return;
            }
            let (expired, waiting): (Vec<_>, Vec<_>) = pending.drain(..).partition(|entry| entry.expires <= now);
            *pending = waiting;
            expired
        };
        for entry in expired {
            self.core
                .drop_frame(format!("address resolution for {} timed out", entry.next_hop));
        }
    }

    fn send_ethernet(&self, destination: MacAddress, ether_type: EtherType, payload: Frame) -> Result<()> {
        let frame = EthernetFrame::new(destination, self.mac, ether_type).with_payload(payload);
        self.send_bytes(&frame.to_bytes())
    }

    fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.device.send(bytes)?;
        trace!(interface = %self.core.name(), bytes = bytes.len(), "Frame transmitted");
        Ok(())
    }
}

/// An Ethernet interface with IP addresses, bound to a [`CaptureDevice`].
///
/// While running, a capture worker reads the device, learns ARP and
/// neighbor discovery bindings, answers resolution requests for the
/// interface's own addresses and forwards every frame, wrapped in a
/// [`TrafficDescriptionFrame`], to the output.
///
/// Frames pushed into the interface are transmitted. IP frames are
/// encapsulated in Ethernet, fragmented to the MTU and sent to the MAC of
/// their destination, which is resolved on the link when it is not yet in
/// the host table.
pub struct IpInterface {
    inner: Arc<Inner>,
    capture: Mutex<Option<Worker>>,
}

impl IpInterface {
    pub fn new(name: impl Into<String>, device: Arc<dyn CaptureDevice>) -> Self {
        Self::with_host_table(name, device, Arc::new(HostTable::default()))
    }

    /// Creates an interface sharing an existing host table.
    pub fn with_host_table(name: impl Into<String>, device: Arc<dyn CaptureDevice>, hosts: Arc<HostTable>) -> Self {
        let mac = device.mac_address().unwrap_or_else(random_mac);
        Self::with_mac_address(name, device, hosts, mac)
    }

    /// Creates an interface sending from `mac` regardless of the device's own address.
    pub fn with_mac_address(
        name: impl Into<String>,
        device: Arc<dyn CaptureDevice>,
        hosts: Arc<HostTable>,
        mac: MacAddress,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: HandlerCore::new(name),
                device,
                mac,
                mtu: AtomicUsize::new(DEFAULT_MTU),
                addresses: RwLock::new(Vec::new()),
                hosts,
                pending: Mutex::new(Vec::new()),
            }),
            capture: Mutex::new(None),
        }
    }

    pub fn with_mtu(self, mtu: usize) -> Self {
        self.set_mtu(mtu);
        self
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.inner.mtu.store(mtu, Ordering::Relaxed);
    }

    pub fn mtu(&self) -> usize {
        self.inner.mtu.load(Ordering::Relaxed)
    }

    pub fn mac_address(&self) -> MacAddress {
        self.inner.mac
    }

    pub fn device(&self) -> &Arc<dyn CaptureDevice> {
        &self.inner.device
    }

    pub fn hosts(&self) -> &Arc<HostTable> {
        &self.inner.hosts
    }

    pub fn addresses(&self) -> Vec<IpNetwork> {
        self.inner.addresses.read().clone()
    }

    pub fn has_address(&self, ip: IpAddr) -> bool {
        self.inner.owns(ip)
    }

    /// Assigns an address with its prefix, e.g. `192.168.1.1/24`.
    ///
    /// # Returns
    /// - `Ok(())` - The address was added and [`HandlerEvent::AddressAdded`] published
    /// - `Err(Error::InvalidOperation)` - If the interface already has it
    pub fn add_address(&self, address: IpNetwork) -> Result<()> {
        {
            let mut addresses = self.inner.addresses.write();
            if addresses.contains(&address) {
                return Err(Error::invalid_operation(format!(
                    "{} is already assigned to {}",
                    address,
                    self.name()
                )));
            }
            addresses.push(address);
        }
        debug!(interface = %self.name(), address = %address, "Address added");
        self.inner.core.events().publish(HandlerEvent::AddressAdded {
            interface: self.name().to_string(),
            address,
        });
        Ok(())
    }

    pub fn remove_address(&self, address: &IpNetwork) -> bool {
        let removed = {
            let mut addresses = self.inner.addresses.write();
            let before = addresses.len();
            addresses.retain(|assigned| assigned != address);
            addresses.len() != before
        };
        if removed {
            debug!(interface = %self.name(), address = %address, "Address removed");
            self.inner.core.events().publish(HandlerEvent::AddressRemoved {
                interface: self.name().to_string(),
                address: *address,
            });
        }
        removed
    }

    /// Sends an IP frame towards `next_hop`, or towards its destination
    /// when `next_hop` is `None`.
    pub fn transmit_ip(&self, frame: Frame, next_hop: Option<IpAddr>) -> Result<()> {
        self.inner.transmit_ip(frame, next_hop)
    }

    /// Frames waiting for their next hop to be resolved.
    pub fn pending_resolution(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl std::fmt::Debug for IpInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpInterface")
            .field("core", &self.inner.core)
            .field("device", &self.inner.device.name())
            .field("mac", &self.inner.mac)
            .field("addresses", &*self.inner.addresses.read())
            .finish()
    }
}

impl TrafficHandler for IpInterface {
    fn core(&self) -> &HandlerCore {
        &self.inner.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let frame = frame
            .into_described()
            .ok_or_else(|| FrameError::InvalidFieldValue("empty traffic description".into()))?;
        match frame {
            Frame::Ipv4(_) | Frame::Ipv6(_) => self.inner.transmit_ip(frame, None),
            other => self.inner.send_bytes(&other.to_bytes()),
        }
    }

    fn on_start(&self) -> Result<()> {
        if self.inner.device.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device is closed").into());
        }
        let inner = self.inner.clone();
        let worker = Worker::spawn(format!("{}-capture", self.name()), move |signal| {
            inner.capture_loop(&signal)
        })?;
        *self.capture.lock() = Some(worker);
        Ok(())
    }

    fn on_stop(&self) {
        let worker = self.capture.lock().take();
        if let Some(mut worker) = worker {
            worker.stop();
            self.inner.device.close();
            worker.stop_and_join();
        } else {
            self.inner.device.close();
        }
        self.inner.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::handler::test_util::Collector;
    use crate::ip::Ipv4Frame;
    use crate::udp::UdpFrame;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    fn interface(address: &str) -> (Arc<IpInterface>, Arc<MemoryDevice>) {
        let (local, peer) = MemoryDevice::pair("eth0", "peer");
        let iface = Arc::new(IpInterface::new("eth0", Arc::new(local)));
        iface.add_address(address.parse().unwrap()).unwrap();
        (iface, Arc::new(peer))
    }

    fn receive_ethernet(device: &MemoryDevice) -> EthernetFrame {
        let bytes = device.receive(WAIT).unwrap().expect("no frame sent");
        EthernetFrame::parse(&bytes).unwrap()
    }

    fn wait_for<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + WAIT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_answers_arp_and_forwards_capture() {
        let (iface, peer) = interface("192.168.1.1/24");
        let sink = Collector::started("sink");
        iface.set_output(Some(sink.clone()));
        iface.start().unwrap();

        let peer_mac = peer.mac_address().unwrap();
        let peer_ip = Ipv4Addr::new(192, 168, 1, 2);
        let request = EthernetFrame::new(MacAddress::BROADCAST, peer_mac, EtherType::Arp).with_payload(Frame::Arp(
            ArpFrame::request(peer_mac, peer_ip, Ipv4Addr::new(192, 168, 1, 1)),
        ));
        peer.send(&request.to_bytes()).unwrap();

        let reply = receive_ethernet(&peer);
        assert_eq!(reply.destination, peer_mac);
        let Some(Frame::Arp(arp)) = reply.payload.as_deref() else {
            panic!("expected an ARP reply");
        };
        assert_eq!(arp.operation, Operation::Reply);
        assert_eq!(arp.sender_hardware_addr, iface.mac_address());

        wait_for(|| !sink.frames.lock().is_empty());
        let frames = sink.take();
        let Frame::TrafficDescription(description) = &frames[0] else {
            panic!("captured frames are described");
        };
        assert_eq!(description.source_interface, "eth0");
        assert_eq!(iface.hosts().lookup_mac(IpAddr::V4(peer_ip)), Some(peer_mac));
        iface.stop().unwrap();
    }

    #[test]
    fn test_unresolved_next_hop_is_queued_until_reply() {
        let (iface, peer) = interface("10.0.0.1/24");
        iface.start().unwrap();

        let peer_ip = Ipv4Addr::new(10, 0, 0, 9);
        let datagram = Frame::Ipv4(
            Ipv4Frame::new(IpProtocol::Udp, Ipv4Addr::new(10, 0, 0, 1), peer_ip)
                .with_payload(Frame::Udp(UdpFrame::new(1, 2).with_payload(Frame::raw(b"queued")))),
        );
        iface.push_traffic(datagram.clone());
        assert_eq!(iface.pending_resolution(), 1);

        let request = receive_ethernet(&peer);
        assert!(request.destination.is_broadcast());
        let peer_mac = peer.mac_address().unwrap();
        let reply = EthernetFrame::new(iface.mac_address(), peer_mac, EtherType::Arp).with_payload(Frame::Arp(
            ArpFrame::reply(peer_mac, peer_ip, iface.mac_address(), Ipv4Addr::new(10, 0, 0, 1)),
        ));
        peer.send(&reply.to_bytes()).unwrap();

        let delivered = receive_ethernet(&peer);
        assert_eq!(delivered.destination, peer_mac);
        assert_eq!(delivered.payload.as_deref(), Some(&datagram));
        assert_eq!(iface.pending_resolution(), 0);
        iface.stop().unwrap();
    }

    #[test]
    fn test_large_datagram_is_fragmented_to_mtu() {
        let (iface, peer) = interface("10.0.0.1/24");
        iface.set_mtu(576);
        let peer_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        iface.hosts().add_static(peer_ip, peer.mac_address().unwrap());

        let datagram = Frame::Ipv4(
            Ipv4Frame::new(IpProtocol::Udp, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
                .with_payload(Frame::Udp(UdpFrame::new(1, 2).with_payload(Frame::raw(&[7u8; 1400])))),
        );
        iface.transmit_ip(datagram, None).unwrap();

        let mut count = 0;
        while let Ok(Some(bytes)) = peer.receive(Duration::from_millis(20)) {
            assert!(bytes.len() <= 576 + 14);
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn test_broadcast_needs_no_resolution() {
        let (iface, peer) = interface("10.0.0.1/24");
        let datagram = Frame::Ipv4(Ipv4Frame::new(
            IpProtocol::Udp,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 255),
        ));
        iface.transmit_ip(datagram, None).unwrap();
        assert!(receive_ethernet(&peer).destination.is_broadcast());
    }

    #[test]
    fn test_neighbor_solicitation_is_answered() {
        let (iface, peer) = interface("2001:db8::1/64");
        iface.start().unwrap();

        let peer_mac = peer.mac_address().unwrap();
        let peer_ip: Ipv6Addr = "2001:db8::2".parse().unwrap();
        let target: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let group = icmpv6::solicited_node_multicast(target);
        let mut solicitation = Ipv6Frame::new(IpProtocol::Icmpv6, peer_ip, group)
            .with_payload(Frame::Icmpv6(Icmpv6Frame::neighbor_solicitation(target, peer_mac)));
        solicitation.hop_limit = 255;
        solicitation.update_transport_checksum();
        let frame = EthernetFrame::new(icmpv6::multicast_mac(group), peer_mac, EtherType::Ipv6)
            .with_payload(Frame::Ipv6(solicitation));
        peer.send(&frame.to_bytes()).unwrap();

        let reply = receive_ethernet(&peer);
        assert_eq!(reply.destination, peer_mac);
        let Some(Frame::Ipv6(ip)) = reply.payload.as_deref() else {
            panic!("expected IPv6");
        };
        assert_eq!(ip.destination, peer_ip);
        assert!(matches!(
            ip.upper_layer(),
            Some(Frame::Icmpv6(Icmpv6Frame {
                message: Icmpv6Message::NeighborAdvertisement { solicited: true, .. },
                ..
            }))
        ));
        wait_for(|| iface.hosts().lookup_mac(IpAddr::V6(peer_ip)).is_some());
        iface.stop().unwrap();
    }

    #[test]
    fn test_stop_closes_device_and_joins() {
        let (iface, _peer) = interface("10.0.0.1/24");
        iface.start().unwrap();
        iface.stop().unwrap();
        assert!(iface.device().is_closed());
        assert!(iface.start().is_err());
        assert_eq!(iface.core().state(), HandlerState::Stopped);
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let (iface, _peer) = interface("10.0.0.1/24");
        let mut events = iface.core().events().subscribe();
        assert!(iface.add_address("10.0.0.1/24".parse().unwrap()).is_err());
        assert!(iface.remove_address(&"10.0.0.1/24".parse().unwrap()));
        assert!(matches!(events.try_recv(), Ok(HandlerEvent::AddressRemoved { .. })));
    }
}
