//! Passive HTTP observation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Result;
use crate::frame::{Frame, FrameType};
use crate::handler::{HandlerCore, TrafficHandler};
use crate::socket::ProtocolSocket;
use crate::socket::tcp::TcpStreamSocket;
use crate::stream::{Direction, HttpConversation, HttpExchange, NetworkStreamMonitor};

/// Ports treated as HTTP servers unless configured otherwise.
pub const DEFAULT_HTTP_PORTS: [u16; 2] = [80, 8080];
/// Connections followed at once; traffic of further connections only passes through.
pub const MAX_CONNECTIONS: usize = 256;
/// Connections without traffic for this long are dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// An exchange together with the connection it was seen on.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedExchange {
    pub client: SocketAddr,
    pub server: SocketAddr,
    pub exchange: HttpExchange,
}

type ExchangeCallback = Arc<dyn Fn(ObservedExchange) + Send + Sync>;

struct Connection {
    monitor: NetworkStreamMonitor,
    to_server: TcpStreamSocket,
    to_client: TcpStreamSocket,
    conversation: Arc<HttpConversation>,
    last_seen: Mutex<Instant>,
}

impl Connection {
    fn open(name: &str, client: SocketAddr, server: SocketAddr, callback: ExchangeCallback) -> Result<Self> {
        let monitor = NetworkStreamMonitor::new(format!("{}-{}-{}", name, client, server));
        let to_server = TcpStreamSocket::with_pipe(server, client, monitor.pipe(Direction::ClientToServer).clone());
        let to_client = TcpStreamSocket::with_pipe(client, server, monitor.pipe(Direction::ServerToClient).clone());
        let conversation = Arc::new(HttpConversation::new());
        monitor.start_http(conversation.clone(), move |exchange| {
            callback(ObservedExchange {
                client,
                server,
                exchange,
            })
        })?;
        Ok(Self {
            monitor,
            to_server,
            to_client,
            conversation,
            last_seen: Mutex::new(Instant::now()),
        })
    }

    /// True when the connection went quiet or both readers gave up.
    fn is_stale(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.duration_since(*self.last_seen.lock()) >= idle_timeout || self.monitor.is_finished()
    }

    fn push_up(&self, frame: &Frame) {
        *self.last_seen.lock() = Instant::now();
        if !self.to_server.push_up(frame) {
            self.to_client.push_up(frame);
        }
    }

    fn is_closed(&self) -> bool {
        self.to_server.is_closed() && self.to_client.is_closed()
    }
}

/// Reports the HTTP exchanges of the TCP connections it sees.
///
/// Traffic passes through unchanged. Each connection to one of the server
/// ports gets its own stream monitor; the callback runs on that monitor's
/// reader threads.
pub struct HttpMonitor {
    core: HandlerCore,
    ports: RwLock<Vec<u16>>,
    connections: Mutex<HashMap<(SocketAddr, SocketAddr), Arc<Connection>>>,
    idle_timeout: Duration,
    on_exchange: ExchangeCallback,
}

impl HttpMonitor {
    pub fn new<F>(name: impl Into<String>, on_exchange: F) -> Self
    where
        F: Fn(ObservedExchange) + Send + Sync + 'static,
    {
        Self {
            core: HandlerCore::new(name),
            ports: RwLock::new(DEFAULT_HTTP_PORTS.to_vec()),
            connections: Mutex::new(HashMap::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            on_exchange: Arc::new(on_exchange),
        }
    }

    pub fn with_ports(self, ports: impl IntoIterator<Item = u16>) -> Self {
        *self.ports.write() = ports.into_iter().collect();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn ports(&self) -> Vec<u16> {
        self.ports.read().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Conversation of a followed connection.
    pub fn conversation(&self, client: SocketAddr, server: SocketAddr) -> Option<Arc<HttpConversation>> {
        self.connections
            .lock()
            .get(&(client, server))
            .map(|connection| connection.conversation.clone())
    }

    /// Client and server endpoints of a TCP frame to or from a server port.
    fn endpoints(&self, frame: &Frame) -> Option<(SocketAddr, SocketAddr)> {
        let Some(Frame::Tcp(tcp)) = frame.find(FrameType::Tcp) else {
            return None;
        };
        let source = SocketAddr::new(frame.source_ip()?, tcp.source_port);
        let destination = SocketAddr::new(frame.destination_ip()?, tcp.destination_port);
        let ports = self.ports.read();
        if ports.contains(&destination.port()) {
            Some((source, destination))
        } else if ports.contains(&source.port()) {
            Some((destination, source))
        } else {
            None
        }
    }

    fn connection(&self, client: SocketAddr, server: SocketAddr) -> Result<Option<Arc<Connection>>> {
        let (connection, stale) = {
            let mut connections = self.connections.lock();
            if let Some(connection) = connections.get(&(client, server)) {
                return Ok(Some(connection.clone()));
            }
            let now = Instant::now();
            let stale_keys: Vec<(SocketAddr, SocketAddr)> = connections
                .iter()
                .filter(|(_, connection)| connection.is_stale(now, self.idle_timeout))
                .map(|(key, _)| *key)
                .collect();
            let stale: Vec<Arc<Connection>> = stale_keys.iter().filter_map(|key| connections.remove(key)).collect();

            if connections.len() >= MAX_CONNECTIONS {
                debug!(handler = %self.core.name(), client = %client, "Connection limit reached, not following");
                (None, stale)
            } else {
                let connection = Arc::new(Connection::open(self.core.name(), client, server, self.on_exchange.clone())?);
                info!(handler = %self.core.name(), client = %client, server = %server, "Following HTTP connection");
                connections.insert((client, server), connection.clone());
                (Some(connection), stale)
            }
        };
        for connection in stale {
            debug!(handler = %self.core.name(), stream = %connection.monitor.name(), "Dropping stale HTTP connection");
            connection.monitor.stop();
        }
        Ok(connection)
    }

    fn observe(&self, client: SocketAddr, server: SocketAddr, frame: &Frame) -> Result<()> {
        let Some(connection) = self.connection(client, server)? else {
            return Ok(());
        };
        connection.push_up(frame);
        if connection.is_closed() {
            let finished = self.connections.lock().remove(&(client, server));
            if let Some(finished) = finished {
                debug!(handler = %self.core.name(), client = %client, server = %server, "HTTP connection closed");
                finished.monitor.stop();
            }
        }
        Ok(())
    }
}

impl TrafficHandler for HttpMonitor {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        if let Some((client, server)) = self.endpoints(&frame) {
            self.observe(client, server, &frame)?;
        }
        self.core.notify_next(frame);
        Ok(())
    }

    fn on_stop(&self) {
        let connections: Vec<Arc<Connection>> = self.connections.lock().drain().map(|(_, connection)| connection).collect();
        for connection in connections {
            connection.monitor.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_util::Collector;
    use crate::ip::{IpProtocol, Ipv4Frame};
    use crate::tcp::{TcpFlags, TcpFrame};
    use std::net::{IpAddr, Ipv4Addr};

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 10);
    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);

    fn segment(from_client: bool, sequence: u32, flags: TcpFlags, data: &[u8]) -> Frame {
        let (source, destination, source_port, destination_port) = if from_client {
            (CLIENT, SERVER, 51000, 80)
        } else {
            (SERVER, CLIENT, 80, 51000)
        };
        let mut tcp = TcpFrame::new(source_port, destination_port)
            .with_sequence(sequence)
            .with_flags(flags);
        if !data.is_empty() {
            tcp = tcp.with_payload(Frame::raw(data));
        }
        Frame::Ipv4(Ipv4Frame::new(IpProtocol::Tcp, source, destination).with_payload(Frame::Tcp(tcp)))
    }

    fn fin() -> TcpFlags {
        TcpFlags {
            fin: true,
            ..TcpFlags::default()
        }
    }

    #[test]
    fn test_reports_exchange_and_passes_traffic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let monitor = HttpMonitor::new("http", move |observed| sink_seen.lock().push(observed));
        let next = Collector::started("next");
        monitor.set_output(Some(next.clone()));
        monitor.start().unwrap();

        let request = b"GET / HTTP/1.1\r\nHost: router.local\r\n\r\n";
        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let frames = vec![
            segment(true, 1000, TcpFlags::syn(), b""),
            segment(false, 5000, TcpFlags::syn(), b""),
            segment(true, 1001, TcpFlags::default(), request),
            segment(false, 5001, TcpFlags::default(), response),
            segment(true, 1001 + request.len() as u32, fin(), b""),
            segment(false, 5001 + response.len() as u32, fin(), b""),
        ];
        for frame in &frames {
            monitor.push_traffic(frame.clone());
        }

        assert_eq!(next.take(), frames);
        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().is_empty() {
            assert!(Instant::now() < deadline, "no exchange reported");
            std::thread::sleep(Duration::from_millis(5));
        }
        let observed = seen.lock()[0].clone();
        assert_eq!(observed.client, SocketAddr::new(IpAddr::V4(CLIENT), 51000));
        assert_eq!(observed.server.port(), 80);
        assert_eq!(observed.exchange.request.header("host"), Some("router.local"));
        assert_eq!(observed.exchange.response.body, b"hello");
        assert_eq!(monitor.connection_count(), 0);
        monitor.stop().unwrap();
    }

    #[test]
    fn test_other_ports_are_not_followed() {
        let monitor = HttpMonitor::new("http", |_| {}).with_ports([8443]);
        monitor.start().unwrap();
        monitor.push_traffic(segment(true, 1, TcpFlags::syn(), b""));
        assert_eq!(monitor.connection_count(), 0);
        assert_eq!(monitor.ports(), vec![8443]);
        monitor.stop().unwrap();
    }

    #[test]
    fn test_stale_connections_make_room() {
        let monitor = HttpMonitor::new("http", |_| {}).with_idle_timeout(Duration::from_millis(20));
        monitor.start().unwrap();
        monitor.push_traffic(segment(true, 1000, TcpFlags::syn(), b""));
        assert_eq!(monitor.connection_count(), 1);

        std::thread::sleep(Duration::from_millis(50));
        let other = {
            let tcp = TcpFrame::new(52000, 80).with_sequence(7).with_flags(TcpFlags::syn());
            Frame::Ipv4(Ipv4Frame::new(IpProtocol::Tcp, Ipv4Addr::new(192, 168, 0, 11), SERVER).with_payload(Frame::Tcp(tcp)))
        };
        monitor.push_traffic(other);
        assert_eq!(monitor.connection_count(), 1);
        assert!(monitor
            .conversation(SocketAddr::new(IpAddr::V4(CLIENT), 51000), SocketAddr::new(IpAddr::V4(SERVER), 80))
            .is_none());
        monitor.stop().unwrap();
    }

    #[test]
    fn test_connection_with_failed_readers_is_dropped() {
        let monitor = HttpMonitor::new("http", |_| {});
        monitor.start().unwrap();
        monitor.push_traffic(segment(true, 1000, TcpFlags::syn(), b""));
        monitor.push_traffic(segment(false, 5000, TcpFlags::syn(), b""));
        monitor.push_traffic(segment(true, 1001, TcpFlags::default(), b"garbage\r\n"));
        monitor.push_traffic(segment(false, 5001, TcpFlags::default(), b"garbage\r\n"));

        let client = SocketAddr::new(IpAddr::V4(CLIENT), 51000);
        let server = SocketAddr::new(IpAddr::V4(SERVER), 80);
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let finished = monitor.connections.lock().get(&(client, server)).is_some_and(|c| c.monitor.is_finished());
            if finished {
                break;
            }
            assert!(Instant::now() < deadline, "readers still running");
            std::thread::sleep(Duration::from_millis(5));
        }

        let other = {
            let tcp = TcpFrame::new(52000, 80).with_sequence(7).with_flags(TcpFlags::syn());
            Frame::Ipv4(Ipv4Frame::new(IpProtocol::Tcp, Ipv4Addr::new(192, 168, 0, 11), SERVER).with_payload(Frame::Tcp(tcp)))
        };
        monitor.push_traffic(other);
        assert!(monitor.conversation(client, server).is_none());
        assert_eq!(monitor.connection_count(), 1);
        monitor.stop().unwrap();
    }
}
