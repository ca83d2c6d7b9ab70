//! Router and interface configuration loaded from TOML.
//!
//! ```toml
//! [[interfaces]]
//! name = "eth0"
//! mac = "02:00:00:00:00:01"
//! addresses = ["10.0.0.1/24"]
//! mtu = 1500
//!
//! [[routes]]
//! destination = "0.0.0.0/0"
//! gateway = "10.0.0.254"
//!
//! [[hosts]]
//! ip = "10.0.0.254"
//! mac = "02:00:00:00:00:fe"
//!
//! [host_table]
//! entry_timeout_secs = 300
//!
//! [shaping]
//! bytes_per_tick = 125000
//! tick_ms = 10
//! ```

use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::de::Unexpected;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::device::{CaptureDevice, MAX_FRAME_SIZE};
use crate::error::{Error, Result};
use crate::ethernet::MacAddress;
use crate::handler::TrafficHandler;
use crate::handler::interface::{DEFAULT_MTU, IpInterface};
use crate::handler::router::Router;
use crate::handler::shaper::{DEFAULT_QUEUE_CAPACITY, PacketReorderer, SpeedConstrainer};
use crate::hosts::{DEFAULT_ENTRY_TIMEOUT, DEFAULT_SWEEP_INTERVAL, HostTable};
use crate::routing::{RouteOwner, RoutingEntry, RoutingTable};
use crate::socket::ip::{DEFAULT_MAX_PENDING, DEFAULT_REASSEMBLY_TIMEOUT, ReassemblyConfig};

/// Smallest MTU an IPv4 link may have.
const MIN_MTU: usize = 68;
const DEFAULT_METRIC: u32 = 1;

/// Top-level configuration of a software router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub interfaces: Vec<InterfaceConfig>,
    pub routes: Vec<RouteConfig>,
    pub hosts: Vec<StaticHostConfig>,
    pub host_table: HostTableConfig,
    pub reassembly: ReassemblySettings,
    pub shaping: Option<ShapingConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    /// Overrides the device's own address
    #[serde(default, deserialize_with = "deserialize_optional_mac", serialize_with = "serialize_optional_mac")]
    pub mac: Option<MacAddress>,
    #[serde(default)]
    pub addresses: Vec<IpNetwork>,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

/// A static route. Without an interface, frames leave through the
/// interface that reaches the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub destination: IpNetwork,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_metric")]
    pub metric: u32,
}

impl RouteConfig {
    pub fn to_entry(&self) -> RoutingEntry {
        let entry = RoutingEntry::new(self.destination, self.gateway, self.metric, RouteOwner::Static);
        match &self.interface {
            Some(interface) => entry.with_interface(interface.as_str()),
            None => entry,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticHostConfig {
    pub ip: IpAddr,
    #[serde(deserialize_with = "deserialize_mac", serialize_with = "serialize_mac")]
    pub mac: MacAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostTableConfig {
    pub entry_timeout_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for HostTableConfig {
    fn default() -> Self {
        Self {
            entry_timeout_secs: DEFAULT_ENTRY_TIMEOUT.as_secs(),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
        }
    }
}

impl HostTableConfig {
    pub fn entry_timeout(&self) -> Duration {
        Duration::from_secs(self.entry_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblySettings {
    pub timeout_secs: u64,
    pub max_pending: usize,
}

impl Default for ReassemblySettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_REASSEMBLY_TIMEOUT.as_secs(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl From<ReassemblySettings> for ReassemblyConfig {
    fn from(settings: ReassemblySettings) -> Self {
        ReassemblyConfig {
            timeout: Duration::from_secs(settings.timeout_secs),
            max_pending: settings.max_pending,
        }
    }
}

/// Rate limit and optional jitter applied to outgoing traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapingConfig {
    pub bytes_per_tick: usize,
    pub tick_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Frames are delayed by up to this much, which reorders them
    #[serde(default)]
    pub max_jitter_ms: Option<u64>,
}

impl ShapingConfig {
    pub fn speed_constrainer(&self, name: impl Into<String>) -> SpeedConstrainer {
        SpeedConstrainer::with_capacity(
            name,
            self.bytes_per_tick,
            Duration::from_millis(self.tick_ms),
            self.queue_capacity,
        )
    }

    pub fn reorderer(&self, name: impl Into<String>) -> Option<PacketReorderer> {
        self.max_jitter_ms
            .map(|jitter| PacketReorderer::with_capacity(name, Duration::from_millis(jitter), self.queue_capacity))
    }
}

fn default_mtu() -> usize {
    DEFAULT_MTU
}

fn default_metric() -> u32 {
    DEFAULT_METRIC
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn serialize_mac<S>(mac: &MacAddress, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&mac.to_string())
}

fn deserialize_mac<'de, D>(deserializer: D) -> std::result::Result<MacAddress, D::Error>
where
    D: Deserializer<'de>,
{
    let mac_string = String::deserialize(deserializer)?;
    MacAddress::from_str(&mac_string)
        .map_err(|_| serde::de::Error::invalid_value(Unexpected::Str(&mac_string), &"a MAC address like 02:00:00:00:00:01"))
}

fn serialize_optional_mac<S>(mac: &Option<MacAddress>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match mac {
        Some(mac) => serialize_mac(mac, serializer),
        None => serializer.serialize_none(),
    }
}

fn deserialize_optional_mac<'de, D>(deserializer: D) -> std::result::Result<Option<MacAddress>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_mac(deserializer).map(Some)
}

impl NetworkConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: NetworkConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let toml_str = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&toml_str)?;
        info!(
            path = %path.display(),
            interfaces = config.interfaces.len(),
            routes = config.routes.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| Error::Config(err.to_string()))
    }

    /// Checks the values serde cannot: uniqueness, ranges and references.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for interface in &self.interfaces {
            if interface.name.is_empty() {
                return Err(Error::Config("interface without a name".into()));
            }
            if !names.insert(interface.name.as_str()) {
                return Err(Error::Config(format!("interface '{}' is defined twice", interface.name)));
            }
            if !(MIN_MTU..=MAX_FRAME_SIZE).contains(&interface.mtu) {
                return Err(Error::Config(format!(
                    "interface '{}': MTU {} outside {}..={}",
                    interface.name, interface.mtu, MIN_MTU, MAX_FRAME_SIZE
                )));
            }
            let mut addresses = HashSet::new();
            for address in &interface.addresses {
                if !addresses.insert(address.ip()) {
                    return Err(Error::Config(format!(
                        "interface '{}': address {} is assigned twice",
                        interface.name, address
                    )));
                }
            }
        }

        for route in &self.routes {
            if route.gateway.is_none() && route.interface.is_none() {
                return Err(Error::Config(format!(
                    "route to {} needs a gateway or an interface",
                    route.destination
                )));
            }
            if let Some(gateway) = route.gateway {
                if gateway.is_ipv4() != route.destination.is_ipv4() {
                    return Err(Error::Config(format!(
                        "route to {}: gateway {} is of another address family",
                        route.destination, gateway
                    )));
                }
            }
            if let Some(interface) = &route.interface {
                if !names.contains(interface.as_str()) {
                    return Err(Error::Config(format!(
                        "route to {} uses unknown interface '{}'",
                        route.destination, interface
                    )));
                }
            }
        }

        if self.host_table.entry_timeout_secs == 0 {
            return Err(Error::Config("host table entry timeout must be positive".into()));
        }
        if self.host_table.sweep_interval_ms == 0 {
            return Err(Error::Config("host table sweep interval must be positive".into()));
        }
        if self.reassembly.timeout_secs == 0 || self.reassembly.max_pending == 0 {
            return Err(Error::Config("reassembly timeout and limit must be positive".into()));
        }
        if let Some(shaping) = &self.shaping {
            if shaping.bytes_per_tick == 0 || shaping.tick_ms == 0 || shaping.queue_capacity == 0 {
                return Err(Error::Config("shaping rate, tick and queue capacity must be positive".into()));
            }
        }
        Ok(())
    }

    pub fn interface(&self, name: &str) -> Option<&InterfaceConfig> {
        self.interfaces.iter().find(|interface| interface.name == name)
    }

    pub fn routing_entries(&self) -> Vec<RoutingEntry> {
        self.routes.iter().map(RouteConfig::to_entry).collect()
    }

    pub fn reassembly(&self) -> ReassemblyConfig {
        self.reassembly.into()
    }

    /// A host table holding the static hosts.
    pub fn host_table(&self) -> HostTable {
        let hosts = HostTable::new(self.host_table.entry_timeout());
        for host in &self.hosts {
            hosts.add_static(host.ip, host.mac);
        }
        hosts
    }

    /// Creates an interface on `device` with the configured MAC, MTU and addresses.
    pub fn build_interface(
        &self,
        config: &InterfaceConfig,
        device: Arc<dyn CaptureDevice>,
        hosts: Arc<HostTable>,
    ) -> Result<IpInterface> {
        let interface = match config.mac {
            Some(mac) => IpInterface::with_mac_address(config.name.as_str(), device, hosts, mac),
            None => IpInterface::with_host_table(config.name.as_str(), device, hosts),
        }
        .with_mtu(config.mtu);
        for address in &config.addresses {
            interface.add_address(*address)?;
        }
        Ok(interface)
    }

    /// Creates a router with every configured interface, connected and
    /// static routes, and a shared host table whose sweeper is running.
    ///
    /// `open_device` supplies the capture device of each interface. The
    /// interfaces' outputs are wired to the router; nothing is started.
    pub fn build_router<F>(&self, name: impl Into<String>, mut open_device: F) -> Result<Arc<Router>>
    where
        F: FnMut(&InterfaceConfig) -> Result<Arc<dyn CaptureDevice>>,
    {
        let router = Arc::new(Router::with_routing_table(name, Arc::new(RoutingTable::new())));
        let hosts = Arc::new(self.host_table());
        hosts.start_sweeper(self.host_table.sweep_interval())?;

        for config in &self.interfaces {
            let device = open_device(config)?;
            let interface = Arc::new(self.build_interface(config, device, hosts.clone())?);
            interface.set_output(Some(router.clone()));
            router.add_interface(interface)?;
        }
        for entry in self.routing_entries() {
            debug!(router = %router.name(), destination = %entry.destination, "Adding static route");
            router.routing_table().add(entry)?;
        }
        Ok(router)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use std::net::Ipv4Addr;

    const SAMPLE: &str = r#"
        [[interfaces]]
        name = "eth0"
        mac = "02:00:00:00:00:01"
        addresses = ["10.0.0.1/24"]

        [[interfaces]]
        name = "eth1"
        addresses = ["10.0.1.1/24", "fd00::1/64"]
        mtu = 576

        [[routes]]
        destination = "0.0.0.0/0"
        gateway = "10.0.0.254"

        [[routes]]
        destination = "192.168.0.0/16"
        interface = "eth1"
        metric = 5

        [[hosts]]
        ip = "10.0.0.254"
        mac = "02:00:00:00:00:fe"

        [reassembly]
        timeout_secs = 10

        [shaping]
        bytes_per_tick = 1500
        tick_ms = 10
        max_jitter_ms = 5
    "#;

    #[test]
    fn test_parses_sample() {
        let config = NetworkConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.interfaces.len(), 2);
        assert_eq!(config.interfaces[0].mac, Some(MacAddress::new([2, 0, 0, 0, 0, 1])));
        assert_eq!(config.interfaces[0].mtu, DEFAULT_MTU);
        assert_eq!(config.interface("eth1").unwrap().mtu, 576);
        assert_eq!(config.routes[0].metric, DEFAULT_METRIC);
        assert_eq!(config.host_table, HostTableConfig::default());
        assert_eq!(config.reassembly().timeout, Duration::from_secs(10));
        assert_eq!(config.reassembly().max_pending, DEFAULT_MAX_PENDING);

        let shaping = config.shaping.unwrap();
        assert_eq!(shaping.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(shaping.reorderer("jitter").is_some());

        let entries = config.routing_entries();
        assert_eq!(entries[0].owner, RouteOwner::Static);
        assert_eq!(entries[1].interface.as_deref(), Some("eth1"));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = NetworkConfig::from_toml_str("").unwrap();
        assert_eq!(config, NetworkConfig::default());
        assert_eq!(config.reassembly(), ReassemblyConfig::default());
    }

    #[test]
    fn test_rejects_invalid_documents() {
        let cases = [
            "[[interfaces]]\nname = \"eth0\"\nmac = \"zz:00:00:00:00:01\"",
            "[[interfaces]]\nname = \"eth0\"\n[[interfaces]]\nname = \"eth0\"",
            "[[interfaces]]\nname = \"eth0\"\nmtu = 20",
            "[[interfaces]]\nname = \"eth0\"\naddresses = [\"10.0.0.1/24\", \"10.0.0.1/16\"]",
            "[[routes]]\ndestination = \"10.0.0.0/8\"",
            "[[routes]]\ndestination = \"10.0.0.0/8\"\ngateway = \"fe80::1\"",
            "[[routes]]\ndestination = \"10.0.0.0/8\"\ninterface = \"eth9\"",
            "[reassembly]\nmax_pending = 0",
            "[shaping]\nbytes_per_tick = 0\ntick_ms = 10",
        ];
        for case in cases {
            let err = NetworkConfig::from_toml_str(case).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{}: {:?}", case, err);
        }
    }

    #[test]
    fn test_survives_toml_round_trip() {
        let config = NetworkConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml_string().unwrap();
        assert_eq!(NetworkConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_builds_router() {
        let config = NetworkConfig::from_toml_str(SAMPLE).unwrap();
        let mut peers = Vec::new();
        let router = config
            .build_router("router", |interface| {
                let (device, peer) = MemoryDevice::pair(interface.name.as_str(), "peer");
                peers.push(peer);
                Ok(Arc::new(device) as Arc<dyn CaptureDevice>)
            })
            .unwrap();

        let eth0 = router.interface("eth0").unwrap();
        assert_eq!(eth0.mac_address(), MacAddress::new([2, 0, 0, 0, 0, 1]));
        assert_eq!(router.interface("eth1").unwrap().mtu(), 576);
        assert_eq!(
            eth0.hosts().lookup_mac(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254))),
            Some(MacAddress::new([2, 0, 0, 0, 0, 0xfe]))
        );

        let table = router.routing_table();
        // three connected networks and two static routes
        assert_eq!(table.len(), 5);
        let default = table.lookup(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))).unwrap();
        assert_eq!(default.next_hop, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 254))));
        let connected = table.lookup(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 7))).unwrap();
        assert_eq!(connected.interface.as_deref(), Some("eth1"));
        eth0.hosts().stop_sweeper();
    }
}
