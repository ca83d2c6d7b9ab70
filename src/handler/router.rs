//! Routing between interfaces.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Weak};

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{Error, FrameError, Result};
use crate::event::HandlerEvent;
use crate::frame::{Frame, FrameType};
use crate::handler::interface::IpInterface;
use crate::handler::{HandlerCore, TrafficHandler};
use crate::icmp::IcmpFrame;
use crate::ip::{IpProtocol, Ipv4Frame};
use crate::routing::{RoutingEntry, RoutingTable};

/// Connected route of an interface address, e.g. `10.0.0.0/24` for `10.0.0.1/24`.
fn connected_network(address: &IpNetwork) -> IpNetwork {
    IpNetwork::new(address.network(), address.prefix()).unwrap_or(*address)
}

/// Unwraps descriptions and link headers down to the IP frame.
fn into_ip(mut frame: Frame) -> Option<Frame> {
    loop {
        match frame {
            Frame::Ipv4(_) | Frame::Ipv6(_) => return Some(frame),
            _ => frame = frame.take_encapsulated()?,
        }
    }
}

#[derive(Debug)]
struct Forwarder {
    routing: Arc<RoutingTable>,
    interfaces: RwLock<HashMap<String, Arc<IpInterface>>>,
}

impl Forwarder {
    fn interface(&self, name: &str) -> Option<Arc<IpInterface>> {
        self.interfaces.read().get(name).cloned()
    }

    fn is_local(&self, destination: IpAddr) -> bool {
        match destination {
            IpAddr::V4(ip) if ip.is_broadcast() || ip.is_multicast() => return true,
            IpAddr::V6(ip) if ip.is_multicast() => return true,
            _ => {}
        }
        self.interfaces.read().values().any(|iface| {
            iface.addresses().iter().any(|network| {
                network.ip() == destination
                    || matches!((network, destination), (IpNetwork::V4(net), IpAddr::V4(ip)) if net.prefix() < 31 && net.broadcast() == ip)
            })
        })
    }

    /// Sends an IP frame out of the interface its best route names.
    ///
    /// A missing route or interface drops the frame with a notification.
    fn forward(&self, core: &HandlerCore, frame: Frame) -> Result<()> {
        let destination = frame
            .destination_ip()
            .ok_or_else(|| FrameError::UnsupportedProtocol("frame carries no IP header".into()))?;
        let Some(route) = self.routing.lookup(destination) else {
            core.drop_frame(format!("no route to {}", destination));
            return Ok(());
        };
        // a gateway route without an interface leaves through the gateway's own route
        let interface = route.interface.clone().or_else(|| {
            route
                .next_hop
                .and_then(|hop| self.routing.lookup(hop))
                .and_then(|gateway| gateway.interface)
        });
        let Some(iface) = interface.as_deref().and_then(|name| self.interface(name)) else {
            core.drop_frame(format!("route to {} has no usable interface", destination));
            return Ok(());
        };
        trace!(router = %core.name(), destination = %destination, interface = %iface.name(), "Forwarding");
        iface.transmit_ip(frame, Some(route.gateway_for(destination)))
    }

    fn address_changed(&self, event: &HandlerEvent) {
        match event {
            HandlerEvent::AddressAdded { interface, address } if self.interface(interface).is_some() => {
                if let Err(err) = self.routing.add(RoutingEntry::connected(connected_network(address), interface)) {
                    debug!(interface = %interface, error = %err, "Connected route not added");
                }
            }
            HandlerEvent::AddressRemoved { interface, address } if self.interface(interface).is_some() => {
                self.routing
                    .remove(&RoutingEntry::connected(connected_network(address), interface));
            }
            _ => {}
        }
    }
}

/// Forwards IP traffic between [`IpInterface`]s by longest-prefix match.
///
/// Interfaces push captured frames into the router. Frames addressed to
/// one of the router's own addresses, or to a broadcast or multicast
/// group, are delivered to the output. Everything else is forwarded with
/// the TTL (hop limit) decremented; an IPv4 frame whose TTL runs out is
/// answered with an ICMP time-exceeded message.
pub struct Router {
    core: HandlerCore,
    forwarder: Arc<Forwarder>,
}

impl Router {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_routing_table(name, Arc::new(RoutingTable::new()))
    }

    pub fn with_routing_table(name: impl Into<String>, routing: Arc<RoutingTable>) -> Self {
        Self {
            core: HandlerCore::new(name),
            forwarder: Arc::new(Forwarder {
                routing,
                interfaces: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.forwarder.routing
    }

    pub fn interfaces(&self) -> Vec<Arc<IpInterface>> {
        self.forwarder.interfaces.read().values().cloned().collect()
    }

    pub fn interface(&self, name: &str) -> Option<Arc<IpInterface>> {
        self.forwarder.interface(name)
    }

    /// Attaches an interface and installs connected routes for its addresses.
    ///
    /// Addresses assigned later add and remove their connected routes too.
    /// The caller still wires the interface's output to the router.
    pub fn add_interface(&self, iface: Arc<IpInterface>) -> Result<()> {
        let name = iface.name().to_string();
        {
            let mut interfaces = self.forwarder.interfaces.write();
            if interfaces.contains_key(&name) {
                return Err(Error::invalid_operation(format!("interface '{}' is already attached", name)));
            }
            interfaces.insert(name.clone(), iface.clone());
        }
        for address in iface.addresses() {
            if let Err(err) = self.forwarder.routing.add(RoutingEntry::connected(connected_network(&address), &name)) {
                debug!(interface = %name, error = %err, "Connected route not added");
            }
        }

        let forwarder: Weak<Forwarder> = Arc::downgrade(&self.forwarder);
        iface.core().events().add_listener(move |event| {
            if let Some(forwarder) = forwarder.upgrade() {
                forwarder.address_changed(event);
            }
        });
        debug!(router = %self.core.name(), interface = %name, "Interface attached");
        Ok(())
    }

    /// Detaches an interface and removes every route through it.
    pub fn remove_interface(&self, name: &str) -> Option<Arc<IpInterface>> {
        let removed = self.forwarder.interfaces.write().remove(name);
        if removed.is_some() {
            self.forwarder.routing.remove_by_interface(name);
            debug!(router = %self.core.name(), interface = %name, "Interface detached");
        }
        removed
    }

    /// A handler sending locally originated frames through this router's
    /// routes and interfaces.
    pub fn direct_io(&self, name: impl Into<String>) -> DirectInterfaceIo {
        DirectInterfaceIo {
            core: HandlerCore::new(name),
            forwarder: self.forwarder.clone(),
        }
    }

    fn send_time_exceeded(&self, original: &Ipv4Frame, arrived_on: Option<&str>) {
        let source = arrived_on
            .and_then(|name| self.forwarder.interface(name))
            .and_then(|iface| {
                iface.addresses().iter().find_map(|network| match network.ip() {
                    IpAddr::V4(ip) => Some(ip),
                    IpAddr::V6(_) => None,
                })
            });
        let Some(source) = source else {
            return;
        };
        let reply = Ipv4Frame::new(IpProtocol::Icmp, source, original.source)
            .with_payload(Frame::Icmp(IcmpFrame::time_exceeded(original)));
        if let Err(err) = self.forwarder.forward(&self.core, Frame::Ipv4(reply)) {
            debug!(router = %self.core.name(), error = %err, "Time exceeded not sent");
        }
    }

    /// True when the link layer addressed the frame to the receiving interface.
    fn addressed_to_us(&self, frame: &Frame, arrived_on: Option<&str>) -> bool {
        let (Some(Frame::Ethernet(ethernet)), Some(iface)) = (
            frame.find(FrameType::Ethernet),
            arrived_on.and_then(|name| self.forwarder.interface(name)),
        ) else {
            return true;
        };
        ethernet.destination == iface.mac_address() || ethernet.destination.is_multicast()
    }
}

impl TrafficHandler for Router {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let Some(destination) = frame.destination_ip() else {
            // ARP and other link traffic
            self.core.notify_next(frame);
            return Ok(());
        };
        if self.forwarder.is_local(destination) {
            self.core.notify_next(frame);
            return Ok(());
        }

        let arrived_on = match &frame {
            Frame::TrafficDescription(description) => Some(description.source_interface.clone()),
            _ => None,
        };
        if !self.addressed_to_us(&frame, arrived_on.as_deref()) {
            self.core.drop_frame("frame not addressed to the router");
            return Ok(());
        }
        let Some(mut ip) = into_ip(frame) else {
            return Ok(());
        };

        match &mut ip {
            Frame::Ipv4(v4) => {
                if v4.ttl <= 1 {
                    self.core.drop_frame(format!("TTL expired for {}", destination));
                    self.send_time_exceeded(v4, arrived_on.as_deref());
                    return Ok(());
                }
                v4.ttl -= 1;
            }
            Frame::Ipv6(v6) => {
                if v6.hop_limit <= 1 {
                    self.core.drop_frame(format!("hop limit expired for {}", destination));
                    return Ok(());
                }
                v6.hop_limit -= 1;
            }
            _ => {}
        }
        self.forwarder.forward(&self.core, ip)
    }
}

/// Sends frames originated on this host through the router's table.
///
/// Unlike the [`Router`] it leaves the TTL alone and never delivers
/// locally.
pub struct DirectInterfaceIo {
    core: HandlerCore,
    forwarder: Arc<Forwarder>,
}

impl DirectInterfaceIo {
    /// The first IPv4 address of the interface a route to `destination` leaves through.
    pub fn source_address_for(&self, destination: Ipv4Addr) -> Option<Ipv4Addr> {
        let route = self.forwarder.routing.lookup(IpAddr::V4(destination))?;
        let iface = self.forwarder.interface(route.interface.as_deref()?)?;
        iface.addresses().iter().find_map(|network| match network.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
    }
}

impl TrafficHandler for DirectInterfaceIo {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let ip = into_ip(frame).ok_or_else(|| FrameError::UnsupportedProtocol("frame carries no IP header".into()))?;
        self.forwarder.forward(&self.core, ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Codec;
    use crate::device::{CaptureDevice, MemoryDevice};
    use crate::ethernet::{EtherType, EthernetFrame};
    use crate::frame::TrafficDescriptionFrame;
    use crate::handler::test_util::Collector;
    use crate::icmp::IcmpType;
    use crate::udp::UdpFrame;
    use std::time::Duration;

    struct Lab {
        router: Arc<Router>,
        eth0: Arc<IpInterface>,
        peer0: MemoryDevice,
        peer1: MemoryDevice,
        local: Arc<Collector>,
    }

    const HOST0: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const HOST1: Ipv4Addr = Ipv4Addr::new(10, 0, 1, 2);

    fn lab() -> Lab {
        let router = Arc::new(Router::new("router"));
        let (dev0, peer0) = MemoryDevice::pair("eth0", "peer0");
        let (dev1, peer1) = MemoryDevice::pair("eth1", "peer1");
        let eth0 = Arc::new(IpInterface::new("eth0", Arc::new(dev0)));
        let eth1 = Arc::new(IpInterface::new("eth1", Arc::new(dev1)));
        eth0.add_address("10.0.0.1/24".parse().unwrap()).unwrap();
        eth1.add_address("10.0.1.1/24".parse().unwrap()).unwrap();
        eth0.hosts().add_static(IpAddr::V4(HOST0), peer0.mac_address().unwrap());
        eth1.hosts().add_static(IpAddr::V4(HOST1), peer1.mac_address().unwrap());
        router.add_interface(eth0.clone()).unwrap();
        router.add_interface(eth1).unwrap();

        let local = Collector::started("local");
        router.set_output(Some(local.clone()));
        router.start().unwrap();
        Lab {
            router,
            eth0,
            peer0,
            peer1,
            local,
        }
    }

    fn captured(lab: &Lab, destination: Ipv4Addr, ttl: u8) -> Frame {
        let mut ip = Ipv4Frame::new(IpProtocol::Udp, HOST0, destination)
            .with_payload(Frame::Udp(UdpFrame::new(5000, 6000).with_payload(Frame::raw(b"routed"))));
        ip.ttl = ttl;
        let ethernet = EthernetFrame::new(lab.eth0.mac_address(), lab.peer0.mac_address().unwrap(), EtherType::Ipv4)
            .with_payload(Frame::Ipv4(ip));
        Frame::TrafficDescription(TrafficDescriptionFrame::new("eth0", Frame::Ethernet(ethernet)))
    }

    fn received_ip(device: &MemoryDevice) -> Ipv4Frame {
        let bytes = device.receive(Duration::from_secs(1)).unwrap().expect("nothing sent");
        match EthernetFrame::parse(&bytes).unwrap().payload.map(|frame| *frame) {
            Some(Frame::Ipv4(ip)) => ip,
            other => panic!("expected IPv4, got {:?}", other),
        }
    }

    #[test]
    fn test_connected_routes_installed() {
        let lab = lab();
        let table = lab.router.routing_table();
        assert_eq!(table.len(), 2);
        let route = table.lookup(IpAddr::V4(HOST1)).unwrap();
        assert_eq!(route.interface.as_deref(), Some("eth1"));
        assert_eq!(route.destination, "10.0.1.0/24".parse::<IpNetwork>().unwrap());

        lab.eth0.add_address("172.16.0.1/16".parse().unwrap()).unwrap();
        assert_eq!(table.len(), 3);
        lab.router.remove_interface("eth0");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_forwards_and_decrements_ttl() {
        let lab = lab();
        lab.router.push_traffic(captured(&lab, HOST1, 64));
        let ip = received_ip(&lab.peer1);
        assert_eq!(ip.ttl, 63);
        assert_eq!(ip.destination, HOST1);
        assert!(lab.local.take().is_empty());
    }

    #[test]
    fn test_local_destination_goes_to_output() {
        let lab = lab();
        let frame = captured(&lab, Ipv4Addr::new(10, 0, 1, 1), 64);
        lab.router.push_traffic(frame.clone());
        assert_eq!(lab.local.take(), vec![frame]);
    }

    #[test]
    fn test_expired_ttl_answers_time_exceeded() {
        let lab = lab();
        lab.router.push_traffic(captured(&lab, HOST1, 1));
        let reply = received_ip(&lab.peer0);
        assert_eq!(reply.destination, HOST0);
        assert_eq!(reply.source, Ipv4Addr::new(10, 0, 0, 1));
        assert!(matches!(
            reply.payload.as_deref(),
            Some(Frame::Icmp(icmp)) if icmp.icmp_type == IcmpType::TimeExceeded
        ));
        assert_eq!(lab.router.core().stats().dropped, 1);
    }

    #[test]
    fn test_missing_route_drops_with_event() {
        let lab = lab();
        let mut events = lab.router.core().events().subscribe();
        lab.router.push_traffic(captured(&lab, Ipv4Addr::new(192, 168, 9, 9), 64));
        assert!(matches!(
            events.try_recv(),
            Ok(HandlerEvent::FrameDropped { reason, .. }) if reason.contains("no route")
        ));
    }

    #[test]
    fn test_direct_io_keeps_ttl() {
        let lab = lab();
        let direct = lab.router.direct_io("direct");
        direct.start().unwrap();
        assert_eq!(direct.source_address_for(HOST1), Some(Ipv4Addr::new(10, 0, 1, 1)));

        let ip = Ipv4Frame::new(IpProtocol::Udp, Ipv4Addr::new(10, 0, 1, 1), HOST1)
            .with_payload(Frame::Udp(UdpFrame::new(1, 2)));
        direct.push_traffic(Frame::Ipv4(ip));
        assert_eq!(received_ip(&lab.peer1).ttl, 64);
    }
}
