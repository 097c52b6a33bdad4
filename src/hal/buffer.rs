//! Buffers and the buffer authority boundary.
//!
//! The engine never allocates image memory itself. Every buffer comes from a
//! [`BufferAuthority`] and must go back to it exactly once, either directly
//! (internal buffers, errored or aborted outputs) or through the client
//! (delivered stream buffers returned via `Session::return_buffer`).

use crate::error::Result;
use crate::pipeline::id::StageId;
use crate::types::StreamKind;
use std::fmt;

/// Opaque buffer handle assigned by the authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Which pool a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTag {
    /// Client stream buffer, ownership passes to the client on delivery.
    Stream(StreamKind),
    /// Engine-internal buffer on a stage output port.
    Stage { stage: StageId, port: u8 },
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferTag::Stream(kind) => write!(f, "stream:{kind}"),
            BufferTag::Stage { stage, port } => write!(f, "{stage}:{port}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferStatus {
    /// Attached to a frame, not yet written by hardware.
    #[default]
    Pending,
    Ok,
    Error,
}

/// A hardware buffer. Not `Clone`: a buffer has exactly one owner.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    pub id: BufferId,
    pub tag: BufferTag,
    /// Stage whose output port this buffer is queued on.
    pub stage: Option<StageId>,
    /// Hardware port index the driver reports the buffer on.
    pub hw_port: u8,
    /// Batch slot within the frame.
    pub batch: usize,
    pub status: BufferStatus,
}

impl Buffer {
    pub fn new(id: BufferId, tag: BufferTag) -> Self {
        Self {
            id,
            tag,
            stage: None,
            hw_port: 0,
            batch: 0,
            status: BufferStatus::Pending,
        }
    }

    /// Point the buffer at a stage output port and batch slot.
    pub fn target(&mut self, stage: StageId, hw_port: u8, batch: usize) {
        self.stage = Some(stage);
        self.hw_port = hw_port;
        self.batch = batch;
    }

    pub fn is_error(&self) -> bool {
        self.status == BufferStatus::Error
    }
}

/// Supplier of buffers for client streams and internal stage ports.
#[cfg_attr(test, mockall::automock)]
pub trait BufferAuthority: Send + Sync {
    /// Take a free buffer from the pool for `tag`.
    fn acquire(&self, tag: BufferTag) -> Result<Buffer>;

    /// Give a buffer back to its pool.
    fn release(&self, buffer: Buffer);

    /// Free buffers currently available for `tag`.
    fn available_count(&self, tag: BufferTag) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_sets_port_fields() {
        let mut buf = Buffer::new(BufferId(3), BufferTag::Stream(StreamKind::Preview));
        buf.target(StageId::Mcsc, 0, 2);
        assert_eq!(buf.stage, Some(StageId::Mcsc));
        assert_eq!(buf.batch, 2);
        assert_eq!(buf.status, BufferStatus::Pending);
    }

    #[test]
    fn test_tag_display() {
        assert_eq!(
            BufferTag::Stage {
                stage: StageId::Sensor,
                port: 0
            }
            .to_string(),
            "sensor:0"
        );
        assert_eq!(BufferTag::Stream(StreamKind::Raw).to_string(), "stream:raw");
    }
}
