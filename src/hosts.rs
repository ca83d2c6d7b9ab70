//! ARP / neighbor host table.
//!
//! Maps IP addresses to MAC addresses. Dynamic entries are learned from
//! traffic and expire; static entries are configured and never evicted or
//! overwritten by learning.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::error::Result;
use crate::ethernet::MacAddress;
use crate::event::{EventBus, HandlerEvent};
use crate::worker::Worker;

/// Default lifetime of a learned entry.
pub const DEFAULT_ENTRY_TIMEOUT: Duration = Duration::from_secs(300);
/// Default period of the expiry sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: IpAddr,
    pub mac: MacAddress,
    pub is_static: bool,
    /// `None` for static entries
    pub expires: Option<Instant>,
}

impl HostEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

#[derive(Debug)]
struct Shared {
    entries: RwLock<Vec<HostEntry>>,
    events: EventBus,
    timeout: Duration,
}

impl Shared {
    /// Evicts expired dynamic entries, publishing after the lock is released.
    fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<HostEntry> = {
            let mut entries = self.entries.write();
            let (expired, kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|entry| entry.is_expired(now));
            *entries = kept;
            expired
        };
        for entry in &expired {
            trace!(ip = %entry.ip, mac = %entry.mac, "Host entry expired");
            self.events.publish(HandlerEvent::HostRemoved {
                ip: entry.ip,
                mac: entry.mac,
            });
        }
        expired.len()
    }
}

/// Thread-safe IP to MAC table with an optional background sweeper.
#[derive(Debug)]
pub struct HostTable {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Worker>>,
}

impl Default for HostTable {
    fn default() -> Self {
        Self::new(DEFAULT_ENTRY_TIMEOUT)
    }
}

impl HostTable {
    /// Creates a table whose learned entries live for `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(Vec::new()),
                events: EventBus::new(),
                timeout,
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn entries(&self) -> Vec<HostEntry> {
        self.shared.entries.read().clone()
    }

    /// Records a dynamic binding seen on the wire.
    ///
    /// Re-learning an existing binding only refreshes its expiry. A new
    /// binding replaces dynamic entries holding the same IP or the same
    /// MAC, and is ignored if a static entry holds either.
    pub fn learn(&self, ip: IpAddr, mac: MacAddress) {
        let expires = Instant::now() + self.shared.timeout;
        let mut removed = Vec::new();
        {
            let mut entries = self.shared.entries.write();
            if entries
                .iter()
                .any(|entry| entry.is_static && (entry.ip == ip || entry.mac == mac))
            {
                return;
            }
            if let Some(entry) = entries.iter_mut().find(|entry| entry.ip == ip && entry.mac == mac) {
                entry.expires = Some(expires);
                return;
            }
            entries.retain(|entry| {
                let conflicts = entry.ip == ip || entry.mac == mac;
                if conflicts {
                    removed.push(entry.clone());
                }
                !conflicts
            });
            entries.push(HostEntry {
                ip,
                mac,
                is_static: false,
                expires: Some(expires),
            });
        }
        self.publish_changes(removed, ip, mac);
    }

    /// Installs a static binding, replacing any entry for the same IP or MAC.
    pub fn add_static(&self, ip: IpAddr, mac: MacAddress) {
        let mut removed = Vec::new();
        {
            let mut entries = self.shared.entries.write();
            if entries
                .iter()
                .any(|entry| entry.is_static && entry.ip == ip && entry.mac == mac)
            {
                return;
            }
            entries.retain(|entry| {
                let conflicts = entry.ip == ip || entry.mac == mac;
                if conflicts {
                    removed.push(entry.clone());
                }
                !conflicts
            });
            entries.push(HostEntry {
                ip,
                mac,
                is_static: true,
                expires: None,
            });
        }
        self.publish_changes(removed, ip, mac);
    }

    fn publish_changes(&self, removed: Vec<HostEntry>, ip: IpAddr, mac: MacAddress) {
        for entry in removed {
            self.shared.events.publish(HandlerEvent::HostRemoved {
                ip: entry.ip,
                mac: entry.mac,
            });
        }
        debug!(ip = %ip, mac = %mac, "Host added");
        self.shared.events.publish(HandlerEvent::HostAdded { ip, mac });
    }

    /// Removes the entry for `ip`, static or not.
    pub fn remove(&self, ip: IpAddr) -> Option<HostEntry> {
        let removed = {
            let mut entries = self.shared.entries.write();
            entries
                .iter()
                .position(|entry| entry.ip == ip)
                .map(|index| entries.remove(index))
        };
        if let Some(entry) = &removed {
            self.shared.events.publish(HandlerEvent::HostRemoved {
                ip: entry.ip,
                mac: entry.mac,
            });
        }
        removed
    }

    /// MAC bound to `ip`, ignoring expired entries.
    pub fn lookup_mac(&self, ip: IpAddr) -> Option<MacAddress> {
        let now = Instant::now();
        self.shared
            .entries
            .read()
            .iter()
            .find(|entry| entry.ip == ip && !entry.is_expired(now))
            .map(|entry| entry.mac)
    }

    /// IP bound to `mac`, ignoring expired entries.
    pub fn lookup_ip(&self, mac: MacAddress) -> Option<IpAddr> {
        let now = Instant::now();
        self.shared
            .entries
            .read()
            .iter()
            .find(|entry| entry.mac == mac && !entry.is_expired(now))
            .map(|entry| entry.ip)
    }

    /// Evicts expired dynamic entries now.
    ///
    /// # Returns
    /// The number of evicted entries.
    pub fn sweep(&self) -> usize {
        self.shared.sweep(Instant::now())
    }

    /// Starts the background sweeper. Restarting replaces the running one.
    pub fn start_sweeper(&self, interval: Duration) -> Result<()> {
        let shared = self.shared.clone();
        let worker = Worker::periodic("host-table-sweeper", interval, move || {
            shared.sweep(Instant::now());
        })?;
        // the previous sweeper, if any, is joined on drop
        let previous = self.sweeper.lock().replace(worker);
        drop(previous);
        Ok(())
    }

    pub fn stop_sweeper(&self) {
        let worker = self.sweeper.lock().take();
        drop(worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([2, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_learning_is_idempotent() {
        let table = HostTable::default();
        let mut events = table.events().subscribe();
        table.learn(ip(1), mac(1));
        table.learn(ip(1), mac(1));

        assert_eq!(table.entries().len(), 1);
        assert_eq!(table.lookup_mac(ip(1)), Some(mac(1)));
        assert_eq!(table.lookup_ip(mac(1)), Some(ip(1)));
        assert_eq!(events.try_recv().unwrap(), HandlerEvent::HostAdded { ip: ip(1), mac: mac(1) });
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_one_dynamic_entry_per_ip_and_mac() {
        let table = HostTable::default();
        table.learn(ip(1), mac(1));
        table.learn(ip(2), mac(2));
        // ip 1 moves to mac 2: both old bindings go
        table.learn(ip(1), mac(2));

        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(table.lookup_mac(ip(1)), Some(mac(2)));
        assert_eq!(table.lookup_mac(ip(2)), None);
    }

    #[test]
    fn test_static_entries_win() {
        let table = HostTable::new(Duration::ZERO);
        table.add_static(ip(1), mac(1));
        table.learn(ip(1), mac(9));
        table.learn(ip(9), mac(1));
        assert_eq!(table.entries().len(), 1);

        assert_eq!(table.sweep(), 0);
        assert_eq!(table.lookup_mac(ip(1)), Some(mac(1)));
    }

    #[test]
    fn test_expired_entries_are_invisible_and_swept() {
        let table = HostTable::new(Duration::ZERO);
        let mut events = table.events().subscribe();
        table.learn(ip(3), mac(3));
        assert_eq!(table.lookup_mac(ip(3)), None);

        assert_eq!(table.sweep(), 1);
        assert!(table.entries().is_empty());
        assert!(matches!(events.try_recv(), Ok(HandlerEvent::HostAdded { .. })));
        assert_eq!(events.try_recv().unwrap(), HandlerEvent::HostRemoved { ip: ip(3), mac: mac(3) });
    }

    #[test]
    fn test_background_sweeper() {
        let table = HostTable::new(Duration::from_millis(1));
        table.learn(ip(4), mac(4));
        table.start_sweeper(Duration::from_millis(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !table.entries().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        table.stop_sweeper();
        assert!(table.entries().is_empty());
    }
}
