//! The routing table.

use std::net::IpAddr;

use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{EventBus, HandlerEvent};

/// Who installed a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteOwner {
    System,
    Static,
    /// Connected network of a local interface
    Interface,
    Ospf,
    Rip,
    Bgp,
    Eigrp,
    Other,
}

/// A route to a destination network.
///
/// Two entries are equal when destination, prefix, next hop, metric and
/// owner agree; the interface name is not part of the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub destination: IpNetwork,
    /// `None` for directly connected networks
    pub next_hop: Option<IpAddr>,
    /// Name of the interface the route leaves through
    pub interface: Option<String>,
    pub metric: u32,
    pub owner: RouteOwner,
}

impl PartialEq for RoutingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.destination.network() == other.destination.network()
            && self.destination.prefix() == other.destination.prefix()
            && self.next_hop == other.next_hop
            && self.metric == other.metric
            && self.owner == other.owner
    }
}

impl Eq for RoutingEntry {}

impl RoutingEntry {
    pub fn new(destination: IpNetwork, next_hop: Option<IpAddr>, metric: u32, owner: RouteOwner) -> Self {
        Self {
            destination,
            next_hop,
            interface: None,
            metric,
            owner,
        }
    }

    /// A connected route out of `interface`.
    pub fn connected(destination: IpNetwork, interface: impl Into<String>) -> Self {
        Self::new(destination, None, 0, RouteOwner::Interface).with_interface(interface)
    }

    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn matches(&self, address: IpAddr) -> bool {
        self.destination.contains(address)
    }

    /// The address frames for `destination` are sent to on the link.
    pub fn gateway_for(&self, destination: IpAddr) -> IpAddr {
        self.next_hop.unwrap_or(destination)
    }
}

/// Ordered, thread-safe collection of [`RoutingEntry`]s.
///
/// Every change publishes an event after the table lock is released.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: RwLock<Vec<RoutingEntry>>,
    events: EventBus,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Snapshot of the entries in insertion order.
    pub fn entries(&self) -> Vec<RoutingEntry> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Appends a route.
    ///
    /// # Returns
    /// - `Ok(())` - The route was added
    /// - `Err(Error::Routing)` - If an equal route is already present
    pub fn add(&self, entry: RoutingEntry) -> Result<()> {
        {
            let mut entries = self.entries.write();
            if entries.contains(&entry) {
                return Err(Error::routing(format!("route to {} already exists", entry.destination)));
            }
            entries.push(entry.clone());
        }
        debug!(destination = %entry.destination, owner = ?entry.owner, "Route added");
        self.events.publish(HandlerEvent::RouteAdded(entry));
        Ok(())
    }

    /// Removes the route equal to `entry`, returning whether one was found.
    pub fn remove(&self, entry: &RoutingEntry) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            entries
                .iter()
                .position(|existing| existing == entry)
                .map(|index| entries.remove(index))
        };
        match removed {
            Some(removed) => {
                debug!(destination = %removed.destination, "Route removed");
                self.events.publish(HandlerEvent::RouteRemoved(removed));
                true
            }
            None => false,
        }
    }

    /// Replaces `old` with `new` in place.
    pub fn update(&self, old: &RoutingEntry, new: RoutingEntry) -> Result<()> {
        let previous = {
            let mut entries = self.entries.write();
            let index = entries
                .iter()
                .position(|existing| existing == old)
                .ok_or_else(|| Error::routing(format!("no route to {} to update", old.destination)))?;
            std::mem::replace(&mut entries[index], new.clone())
        };
        self.events.publish(HandlerEvent::RouteUpdated { old: previous, new });
        Ok(())
    }

    /// Removes every route installed by `owner`, e.g. when a routing process detaches.
    pub fn remove_by_owner(&self, owner: RouteOwner) -> Vec<RoutingEntry> {
        let removed: Vec<RoutingEntry> = {
            let mut entries = self.entries.write();
            let (removed, kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|entry| entry.owner == owner);
            *entries = kept;
            removed
        };
        for entry in &removed {
            self.events.publish(HandlerEvent::RouteRemoved(entry.clone()));
        }
        removed
    }

    /// Removes every route leaving through `interface`.
    pub fn remove_by_interface(&self, interface: &str) -> Vec<RoutingEntry> {
        let removed: Vec<RoutingEntry> = {
            let mut entries = self.entries.write();
            let (removed, kept): (Vec<_>, Vec<_>) = entries
                .drain(..)
                .partition(|entry| entry.interface.as_deref() == Some(interface));
            *entries = kept;
            removed
        };
        for entry in &removed {
            self.events.publish(HandlerEvent::RouteRemoved(entry.clone()));
        }
        removed
    }

    /// Longest-prefix match; the lowest metric breaks ties.
    pub fn lookup(&self, address: IpAddr) -> Option<RoutingEntry> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.matches(address))
            .min_by(|a, b| {
                b.destination
                    .prefix()
                    .cmp(&a.destination.prefix())
                    .then(a.metric.cmp(&b.metric))
            })
            .cloned()
    }
}
