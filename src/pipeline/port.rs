//! Output port descriptors for the stage table.
//!
//! Each stage declares its output ports via static `PortDescriptor` arrays.
//! A port may carry a client stream, feed a downstream stage through memory,
//! or both; the graph builder uses these to decide which buffers a frame
//! needs.

use crate::pipeline::id::StageId;
use crate::types::StreamKind;

/// The kind of data leaving a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// Bayer raw image data.
    Raw,
    /// Processed YUV image data.
    Image,
    /// Per-frame metadata (statistics, detected faces).
    Metadata,
}

/// Static descriptor for a stage's output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortDescriptor {
    pub name: &'static str,
    /// Hardware port index, also the destination slot index on the entity.
    pub index: u8,
    pub kind: PortKind,
    /// Client stream this port can produce.
    pub stream: Option<StreamKind>,
    /// Downstream stage that consumes this port when linked through memory.
    pub feeds: Option<StageId>,
}

impl PortDescriptor {
    pub const fn stream(name: &'static str, index: u8, kind: PortKind, stream: StreamKind) -> Self {
        Self {
            name,
            index,
            kind,
            stream: Some(stream),
            feeds: None,
        }
    }

    pub const fn internal(name: &'static str, index: u8, kind: PortKind, feeds: StageId) -> Self {
        Self {
            name,
            index,
            kind,
            stream: None,
            feeds: Some(feeds),
        }
    }

    /// Builder-style: this port also feeds `stage`.
    pub const fn feeding(mut self, stage: StageId) -> Self {
        self.feeds = Some(stage);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_constructors() {
        let p = PortDescriptor::stream("preview", 0, PortKind::Image, StreamKind::Preview)
            .feeding(StageId::Sync);
        assert_eq!(p.stream, Some(StreamKind::Preview));
        assert_eq!(p.feeds, Some(StageId::Sync));

        let q = PortDescriptor::internal("bayer", 0, PortKind::Raw, StageId::Isp);
        assert_eq!(q.stream, None);
        assert_eq!(q.feeds, Some(StageId::Isp));
    }
}
