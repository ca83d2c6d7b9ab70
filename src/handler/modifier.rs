//! Handlers that rewrite, replace or swallow frames.

use crate::error::Result;
use crate::frame::Frame;
use crate::handler::{HandlerCore, TrafficHandler};

/// Rewrites a frame on its way through the pipeline.
pub trait Modify: Send + Sync {
    /// # Returns
    /// - `Ok(Some(frame))` - The frame to forward
    /// - `Ok(None)` - If the frame is consumed
    /// - `Err(Error)` - If processing failed; the frame is dropped
    fn modify_traffic(&self, frame: Frame) -> Result<Option<Frame>>;
}

impl<F> Modify for F
where
    F: Fn(Frame) -> Result<Option<Frame>> + Send + Sync,
{
    fn modify_traffic(&self, frame: Frame) -> Result<Option<Frame>> {
        self(frame)
    }
}

/// Applies a [`Modify`] implementation and forwards whatever it returns.
pub struct TrafficModifier<M> {
    core: HandlerCore,
    modifier: M,
}

impl<F> TrafficModifier<F>
where
    F: Fn(Frame) -> Result<Option<Frame>> + Send + Sync,
{
    pub fn new(name: impl Into<String>, modifier: F) -> Self {
        Self::with_modifier(name, modifier)
    }
}

impl<M: Modify> TrafficModifier<M> {
    pub fn with_modifier(name: impl Into<String>, modifier: M) -> Self {
        Self {
            core: HandlerCore::new(name),
            modifier,
        }
    }

    pub fn modifier(&self) -> &M {
        &self.modifier
    }
}

impl<M: Modify> TrafficHandler for TrafficModifier<M> {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        if let Some(frame) = self.modifier.modify_traffic(frame)? {
            self.core.notify_next(frame);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_util::Collector;

    #[test]
    fn test_modifier_rewrites_and_swallows() {
        let modifier = TrafficModifier::new("double", |frame: Frame| {
            let bytes = frame.to_bytes();
            if bytes.is_empty() {
                return Ok(None);
            }
            Ok(Some(Frame::raw(&[bytes.as_slice(), bytes.as_slice()].concat())))
        });
        let sink = Collector::started("sink");
        modifier.set_output(Some(sink.clone()));
        modifier.start().unwrap();

        modifier.push_traffic(Frame::raw(&[1, 2]));
        modifier.push_traffic(Frame::raw(&[]));

        assert_eq!(sink.take(), vec![Frame::raw(&[1, 2, 1, 2])]);
        assert_eq!(modifier.core().stats().forwarded, 1);
        assert_eq!(modifier.core().stats().dropped, 0);
    }
}
