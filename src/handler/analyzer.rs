//! Read-only terminal handlers.

use tracing::debug;

use crate::error::Result;
use crate::frame::Frame;
use crate::handler::{HandlerCore, TrafficHandler};

/// Inspects frames without changing or forwarding them.
pub trait Analyze: Send + Sync {
    fn analyze(&self, frame: &Frame) -> Result<()>;
}

impl<F> Analyze for F
where
    F: Fn(&Frame) -> Result<()> + Send + Sync,
{
    fn analyze(&self, frame: &Frame) -> Result<()> {
        self(frame)
    }
}

/// Terminal handler running an [`Analyze`] implementation. It has no output.
pub struct TrafficAnalyzer<A> {
    core: HandlerCore,
    analyzer: A,
}

impl<F> TrafficAnalyzer<F>
where
    F: Fn(&Frame) -> Result<()> + Send + Sync,
{
    pub fn new(name: impl Into<String>, analyzer: F) -> Self {
        Self::with_analyzer(name, analyzer)
    }
}

impl<A: Analyze> TrafficAnalyzer<A> {
    pub fn with_analyzer(name: impl Into<String>, analyzer: A) -> Self {
        Self {
            core: HandlerCore::new(name),
            analyzer,
        }
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }
}

impl<A: Analyze> TrafficHandler for TrafficAnalyzer<A> {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        self.analyzer.analyze(&frame)
    }

    fn set_output(&self, output: Option<std::sync::Arc<dyn TrafficHandler>>) {
        if output.is_some() {
            debug!(handler = %self.core.name(), "Analyzers have no output, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_util::Collector;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_analyzer_sees_frames_and_never_forwards() {
        let bytes = Arc::new(AtomicUsize::new(0));
        let counter = bytes.clone();
        let analyzer = TrafficAnalyzer::new("counter", move |frame: &Frame| {
            counter.fetch_add(frame.len(), Ordering::SeqCst);
            Ok(())
        });
        let sink = Collector::started("sink");
        analyzer.set_output(Some(sink.clone()));
        analyzer.start().unwrap();

        analyzer.push_traffic(Frame::raw(&[0; 5]));
        analyzer.push_traffic(Frame::raw(&[0; 7]));

        assert_eq!(bytes.load(Ordering::SeqCst), 12);
        assert!(sink.take().is_empty());
        assert!(analyzer.core().output().is_none());
    }
}
