//! Turns raw captured bytes into a protocol chain.

use crate::error::Result;
use crate::frame::{Frame, FrameType};
use crate::handler::{HandlerCore, TrafficHandler};

/// Re-parses incoming frames with the codec of `frame_type`.
///
/// A leading traffic description is kept and its payload parsed. Frames
/// that already have the target type pass through untouched; bytes the
/// codec rejects are dropped.
pub struct FrameParser {
    core: HandlerCore,
    frame_type: FrameType,
}

impl FrameParser {
    pub fn new(name: impl Into<String>, frame_type: FrameType) -> Self {
        Self {
            core: HandlerCore::new(name),
            frame_type,
        }
    }

    /// A parser producing Ethernet chains, the usual first stage after a device.
    pub fn ethernet(name: impl Into<String>) -> Self {
        Self::new(name, FrameType::Ethernet)
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    fn parse(&self, frame: Frame) -> Result<Frame> {
        if frame.frame_type() == self.frame_type {
            return Ok(frame);
        }
        Ok(frame.reparse_as(self.frame_type)?)
    }
}

impl TrafficHandler for FrameParser {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn handle_traffic(&self, frame: Frame) -> Result<()> {
        let parsed = match frame {
            Frame::TrafficDescription(mut description) => {
                if let Some(payload) = description.payload.take() {
                    description.payload = Some(Box::new(self.parse(*payload)?));
                }
                Frame::TrafficDescription(description)
            }
            other => self.parse(other)?,
        };
        self.core.notify_next(parsed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Codec;
    use crate::ethernet::{EtherType, EthernetFrame, MacAddress};
    use crate::frame::TrafficDescriptionFrame;
    use crate::handler::test_util::Collector;

    #[test]
    fn test_parses_description_payload() {
        let ethernet = EthernetFrame::new(MacAddress::BROADCAST, MacAddress::new([2, 0, 0, 0, 0, 1]), EtherType::Other(0x88b5))
            .with_payload(Frame::raw(&[7; 50]));
        let captured = Frame::TrafficDescription(TrafficDescriptionFrame::new("eth0", Frame::raw(&ethernet.to_bytes())));

        let parser = FrameParser::ethernet("parser");
        let sink = Collector::started("sink");
        parser.set_output(Some(sink.clone()));
        parser.start().unwrap();
        parser.push_traffic(captured);

        let frames = sink.take();
        assert_eq!(frames.len(), 1);
        let Frame::TrafficDescription(description) = &frames[0] else {
            panic!("description must be kept");
        };
        assert_eq!(description.source_interface, "eth0");
        assert_eq!(description.payload.as_deref(), Some(&Frame::Ethernet(ethernet)));
    }
}
