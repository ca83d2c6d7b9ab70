//! Rule-based fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::Result;
use crate::frame::{Frame, FrameType};
use crate::handler::{HandlerCore, TrafficHandler};

type Matcher = Box<dyn Fn(&Frame) -> bool + Send + Sync>;

/// Sends matching frames to a named port.
pub struct SplitRule {
    pub name: String,
    pub port: String,
    matcher: Matcher,
}

impl SplitRule {
    pub fn new<F>(name: impl Into<String>, port: impl Into<String>, matcher: F) -> Self
    where
        F: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            port: port.into(),
            matcher: Box::new(matcher),
        }
    }

    /// Matches frames whose chain contains a frame of `frame_type`.
    pub fn frame_type(name: impl Into<String>, port: impl Into<String>, frame_type: FrameType) -> Self {
        Self::new(name, port, move |frame| frame.find(frame_type).is_some())
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        (self.matcher)(frame)
    }
}

impl std::fmt::Debug for SplitRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitRule")
            .field("name", &self.name)
            .field("port", &self.port)
            .finish()
    }
}

/// Routes every frame to exactly one primary destination.
///
/// Rules are evaluated in order and the first match picks the port; frames
/// matching no rule go to the default output. Taps (typically analyzers)
/// additionally receive their own deep copy of every frame before the
/// primary destination does.
pub struct TrafficSplitter {
    core: HandlerCore,
    rules: RwLock<Vec<Arc<SplitRule>>>,
    ports: RwLock<HashMap<String, Arc<dyn TrafficHandler>>>,
    taps: RwLock<Vec<Arc<dyn TrafficHandler>>>,
}

impl TrafficSplitter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: HandlerCore::new(name),
            rules: RwLock::new(Vec::new()),
            ports: RwLock::new(HashMap::new()),
            taps: RwLock::new(Vec::new()),
        }
    }

    pub fn add_rule(&self, rule: SplitRule) {
        self.rules.write().push(Arc::new(rule));
    }

    /// Removes the rules called `name`, returning whether any existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|rule| rule.name != name);
        rules.len() != before
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.rules.read().iter().map(|rule| rule.name.clone()).collect()
    }

    pub fn clear_rules(&self) {
        self.rules.write().clear();
    }

    /// Connects a named port. Replaces any handler previously on that port.
    pub fn connect_port(&self, port: impl Into<String>, handler: Arc<dyn TrafficHandler>) {
        self.ports.write().insert(port.into(), handler);
    }

    pub fn disconnect_port(&self, port: &str) -> Option<Arc<dyn TrafficHandler>> {
        self.ports.write().remove(port)
    }

    pub fn add_tap(&self, tap: Arc<dyn TrafficHandler>) {
        self.taps.write().push(tap);
    }

    /// Port of the first matching rule.
    ///
    /// Matchers run on a snapshot, so they may change the rules themselves.
    fn select_port(&self, frame: &Frame) -> Option<String> {
        let rules = self.rules.read().clone();
        rules
            .iter()
            .find(|rule| rule.matches(frame))
            .map(|rule| rule.port.clone())
    }
}

impl TrafficHandler for TrafficSplitter {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let taps = self.taps.read().clone();
        for tap in taps {
            tap.push_traffic(frame.clone());
        }

        let Some(port) = self.select_port(&frame) else {
            self.core.notify_next(frame);
            return Ok(());
        };
        let destination = self.ports.read().get(&port).cloned();
        match destination {
            Some(handler) => {
                debug!(handler = %self.core.name(), port = %port, "Frame split");
                handler.push_traffic(frame);
            }
            None => self.core.drop_frame(format!("port '{}' is not connected", port)),
        }
        Ok(())
    }

    fn cleanup(&self) {
        if let Err(err) = self.stop() {
            debug!(handler = %self.core.name(), error = %err, "Stop during cleanup failed");
        }
        self.set_output(None);
        self.ports.write().clear();
        self.taps.write().clear();
    }
}
