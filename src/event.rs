//! Asynchronous notifications.
//!
//! Every handler, table and socket owns an [`EventBus`]. Publishing never
//! blocks the publisher: events are posted to unbounded channels and the
//! receivers drain them whenever they like. Synchronous listeners run on
//! the publishing thread and are meant for cases where ordering matters.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::ethernet::MacAddress;
use crate::handler::HandlerState;
use crate::routing::RoutingEntry;

/// Notification fired by a pipeline component.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    /// A frame was discarded (parse failure, no route, full queue, ...)
    FrameDropped { handler: String, reason: String },
    /// Processing a frame failed for a reason other than a malformed frame
    Exception { handler: String, message: String },
    StateChanged { handler: String, state: HandlerState },
    HostAdded { ip: IpAddr, mac: MacAddress },
    HostRemoved { ip: IpAddr, mac: MacAddress },
    RouteAdded(RoutingEntry),
    RouteRemoved(RoutingEntry),
    RouteUpdated { old: RoutingEntry, new: RoutingEntry },
    AddressAdded { interface: String, address: IpNetwork },
    AddressRemoved { interface: String, address: IpNetwork },
    /// An external helper process (e.g. a live capture viewer) exited
    ProcessExited { handler: String, status: Option<i32> },
}

type Listener = Arc<dyn Fn(&HandlerEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    channels: Vec<UnboundedSender<HandlerEvent>>,
    listeners: Vec<Listener>,
}

/// Fan-out point for [`HandlerEvent`]s. Cloning yields a handle to the same bus.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.lock();
        f.debug_struct("EventBus")
            .field("channels", &subscribers.channels.len())
            .field("listeners", &subscribers.listeners.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new channel receiving every event published from now on.
    pub fn subscribe(&self) -> UnboundedReceiver<HandlerEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().channels.push(sender);
        receiver
    }

    /// Registers a listener invoked synchronously on the publishing thread.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&HandlerEvent) + Send + Sync + 'static,
    {
        self.subscribers.lock().listeners.push(Arc::new(listener));
    }

    /// Delivers `event` to every subscriber.
    ///
    /// Subscribers are snapshotted first, so no lock is held while
    /// listeners run. Channels whose receiver is gone are pruned.
    pub fn publish(&self, event: HandlerEvent) {
        let (channels, listeners) = {
            let mut subscribers = self.subscribers.lock();
            subscribers.channels.retain(|channel| !channel.is_closed());
            (subscribers.channels.clone(), subscribers.listeners.clone())
        };

        for listener in &listeners {
            listener(&event);
        }
        for channel in channels {
            // receiver dropped between the snapshot and now
            let _ = channel.send(event.clone());
        }
    }

    pub fn has_subscribers(&self) -> bool {
        let subscribers = self.subscribers.lock();
        !subscribers.listeners.is_empty() || subscribers.channels.iter().any(|channel| !channel.is_closed())
    }
}
