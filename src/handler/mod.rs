//! The traffic handler pipeline.
//!
//! Handlers form a chain of responsibility: a frame pushed into a handler
//! is processed synchronously on the caller's thread and forwarded to the
//! handler's single output with [`HandlerCore::notify_next`]. Handlers that
//! own an I/O source (interfaces, shapers) run worker threads that push into
//! the same chain.
//!
//! Processing errors and panics never escape [`TrafficHandler::push_traffic`]:
//! the frame is dropped and an event is published on the handler's bus.

pub mod analyzer;
pub mod http_monitor;
pub mod interface;
pub mod modifier;
pub mod parser;
pub mod router;
pub mod shaper;
pub mod splitter;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::event::{EventBus, HandlerEvent};
use crate::frame::Frame;

/// Lifecycle state of a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandlerState {
    Created,
    Running,
    Paused,
    Stopped,
}

/// Point-in-time copy of a handler's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerStats {
    /// Frames accepted by `push_traffic`
    pub received: u64,
    /// Frames handed to the output
    pub forwarded: u64,
    /// Frames discarded for any reason
    pub dropped: u64,
    /// Processing failures other than malformed frames
    pub exceptions: u64,
}

#[derive(Debug, Default)]
struct StatsAccumulator {
    received: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    exceptions: AtomicU64,
}

impl StatsAccumulator {
    fn snapshot(&self) -> HandlerStats {
        HandlerStats {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            exceptions: self.exceptions.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every handler: name, lifecycle, output, events and counters.
pub struct HandlerCore {
    name: String,
    state: RwLock<HandlerState>,
    output: RwLock<Option<Arc<dyn TrafficHandler>>>,
    events: EventBus,
    stats: StatsAccumulator,
}

impl std::fmt::Debug for HandlerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCore")
            .field("name", &self.name)
            .field("state", &*self.state.read())
            .field("has_output", &self.output.read().is_some())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl HandlerCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(HandlerState::Created),
            output: RwLock::new(None),
            events: EventBus::new(),
            stats: StatsAccumulator::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> HandlerState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == HandlerState::Running
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> HandlerStats {
        self.stats.snapshot()
    }

    pub fn output(&self) -> Option<Arc<dyn TrafficHandler>> {
        self.output.read().clone()
    }

    pub fn set_output(&self, output: Option<Arc<dyn TrafficHandler>>) {
        *self.output.write() = output;
    }

    /// Forwards `frame` to the output, or drops it silently when there is none.
    pub fn notify_next(&self, frame: Frame) {
        let output = self.output();
        if let Some(next) = output {
            self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
            next.push_traffic(frame);
        }
    }

    /// Counts a discarded frame and publishes [`HandlerEvent::FrameDropped`].
    pub fn drop_frame(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(handler = %self.name, reason = %reason, "Frame dropped");
        self.events.publish(HandlerEvent::FrameDropped {
            handler: self.name.clone(),
            reason,
        });
    }

    /// Counts a processing failure and publishes [`HandlerEvent::Exception`].
    pub fn report_exception(&self, message: impl Into<String>) {
        let message = message.into();
        self.stats.exceptions.fetch_add(1, Ordering::Relaxed);
        warn!(handler = %self.name, error = %message, "Handler raised an exception");
        self.events.publish(HandlerEvent::Exception {
            handler: self.name.clone(),
            message,
        });
    }

    pub(crate) fn record_received(&self) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Moves from one of `from` to `to`.
    ///
    /// # Returns
    /// - `Ok(())` - The state changed and an event was published
    /// - `Err(Error::InvalidOperation)` - If the current state is not in `from`
    pub fn transition(&self, from: &[HandlerState], to: HandlerState) -> Result<()> {
        {
            let mut state = self.state.write();
            if !from.contains(&state) {
                return Err(Error::invalid_operation(format!(
                    "handler '{}' cannot go from {:?} to {:?}",
                    self.name, *state, to
                )));
            }
            *state = to;
        }
        info!(handler = %self.name, state = ?to, "Handler state changed");
        self.events.publish(HandlerEvent::StateChanged {
            handler: self.name.clone(),
            state: to,
        });
        Ok(())
    }

    /// Runs one unit of processing behind the exception boundary.
    ///
    /// A malformed frame publishes exactly one `FrameDropped`; any other
    /// error or a panic publishes an `Exception` and drops the frame.
    pub fn run_guarded<F>(&self, work: F)
    where
        F: FnOnce() -> Result<()>,
    {
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_parse_error() => self.drop_frame(err.to_string()),
            Ok(Err(err)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.report_exception(err.to_string());
            }
            Err(payload) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                self.report_exception(format!("panic: {}", panic_message(&payload)));
            }
        }
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A stage of the pipeline.
///
/// Implementors provide [`core`](Self::core) and
/// [`handle_traffic`](Self::handle_traffic); the lifecycle and the
/// exception boundary come from the default methods. Handlers that own
/// workers hook into [`on_start`](Self::on_start) and
/// [`on_stop`](Self::on_stop).
pub trait TrafficHandler: Send + Sync {
    fn core(&self) -> &HandlerCore;

    /// Processes one frame on the caller's thread.
    ///
    /// Returning an error drops the frame; see [`HandlerCore::run_guarded`].
    fn handle_traffic(&self, frame: Frame) -> Result<()>;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Entry point of the pipeline. Never fails and never panics.
    ///
    /// Frames pushed into a handler that is not running are dropped.
    fn push_traffic(&self, frame: Frame) {
        let core = self.core();
        core.record_received();
        let state = core.state();
        if state != HandlerState::Running {
            core.drop_frame(format!("handler is {:?}", state));
            return;
        }
        core.run_guarded(|| self.handle_traffic(frame));
    }

    fn set_output(&self, output: Option<Arc<dyn TrafficHandler>>) {
        self.core().set_output(output);
    }

    fn start(&self) -> Result<()> {
        let core = self.core();
        core.transition(&[HandlerState::Created, HandlerState::Stopped], HandlerState::Running)?;
        if let Err(err) = self.on_start() {
            warn!(handler = %core.name(), error = %err, "Handler failed to start");
            self.on_stop();
            core.transition(&[HandlerState::Running], HandlerState::Stopped)?;
            return Err(err);
        }
        Ok(())
    }

    /// Stops the handler. Stopping a stopped handler does nothing.
    fn stop(&self) -> Result<()> {
        let core = self.core();
        if core.state() == HandlerState::Stopped {
            return Ok(());
        }
        core.transition(
            &[HandlerState::Created, HandlerState::Running, HandlerState::Paused],
            HandlerState::Stopped,
        )?;
        self.on_stop();
        Ok(())
    }

    fn pause(&self) -> Result<()> {
        self.core().transition(&[HandlerState::Running], HandlerState::Paused)
    }

    fn resume(&self) -> Result<()> {
        self.core().transition(&[HandlerState::Paused], HandlerState::Running)
    }

    /// Stops the handler and detaches its output. Idempotent.
    fn cleanup(&self) {
        if let Err(err) = self.stop() {
            debug!(handler = %self.name(), error = %err, "Stop during cleanup failed");
        }
        self.set_output(None);
    }

    /// Starts workers and transports. Called after entering `Running`.
    fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// Closes transports, then joins workers. Called after entering `Stopped`.
    fn on_stop(&self) {}
}


#[cfg(test)]
mod tests {
    use super::test_util::Collector;
    use super::*;
    use crate::error::FrameError;

    struct Faulty {
        core: HandlerCore,
    }

    impl TrafficHandler for Faulty {
        fn core(&self) -> &HandlerCore {
            &self.core
        }

        fn handle_traffic(&self, frame: Frame) -> Result<()> {
            match frame.len() {
                0 => panic!("empty frame"),
                1 => Err(FrameError::InvalidFieldValue("one byte".into()).into()),
                2 => Err(Error::handler("faulty", "two bytes")),
                _ => {
                    self.core.notify_next(frame);
                    Ok(())
                }
            }
        }
    }

    #[test]
    fn test_lifecycle_transitions() {
        let handler = Collector::started("c");
        assert!(handler.start().is_err());
        handler.pause().unwrap();
        assert_eq!(handler.core().state(), HandlerState::Paused);
        assert!(handler.pause().is_err());
        handler.resume().unwrap();
        handler.stop().unwrap();
        handler.stop().unwrap();
        assert!(handler.resume().is_err());
        handler.start().unwrap();
        handler.cleanup();
        handler.cleanup();
        assert_eq!(handler.core().state(), HandlerState::Stopped);
    }

    #[test]
    fn test_exception_boundary() {
        let handler = Faulty {
            core: HandlerCore::new("faulty"),
        };
        let sink = Collector::started("sink");
        handler.set_output(Some(sink.clone()));
        handler.start().unwrap();
        let mut events = handler.core().events().subscribe();

        handler.push_traffic(Frame::raw(&[]));
        handler.push_traffic(Frame::raw(&[1]));
        handler.push_traffic(Frame::raw(&[1, 2]));
        handler.push_traffic(Frame::raw(&[1, 2, 3]));

        let stats = handler.core().stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.dropped, 3);
        assert_eq!(stats.exceptions, 2);
        assert_eq!(stats.forwarded, 1);
        assert_eq!(sink.take(), vec![Frame::raw(&[1, 2, 3])]);

        assert!(matches!(events.try_recv(), Ok(HandlerEvent::Exception { message, .. }) if message.contains("empty frame")));
        assert!(matches!(events.try_recv(), Ok(HandlerEvent::FrameDropped { .. })));
        assert!(matches!(events.try_recv(), Ok(HandlerEvent::Exception { .. })));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_stopped_handler_drops_frames() {
        let sink = Collector::started("sink");
        sink.stop().unwrap();
        sink.push_traffic(Frame::raw(&[1, 2, 3]));
        assert!(sink.take().is_empty());
        assert_eq!(sink.core().stats().dropped, 1);
    }

    #[test]
    fn test_notify_next_without_output_is_silent() {
        let core = HandlerCore::new("alone");
        let mut events = core.events().subscribe();
        core.notify_next(Frame::raw(&[1]));
        assert_eq!(core.stats(), HandlerStats::default());
        assert!(events.try_recv().is_err());
    }
}
