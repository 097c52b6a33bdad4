//! Stage driver boundary.
//!
//! A driver owns one lane's hardware: the lane leader and every stage joined
//! to it by a direct chain. Completion is the driver pushing the frame into the
//! lane's [`CompletionSink`], which may happen on the submitting thread or on
//! a hardware interrupt thread.

use crate::error::Result;
use crate::pipeline::frame::Frame;
use crate::pipeline::id::StageId;
use crossbeam_channel::Sender;

/// A frame the driver refused, handed back to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub frame: Frame,
    pub reason: String,
}

/// Producer side of a lane's completion queue.
#[derive(Debug, Clone)]
pub struct CompletionSink {
    stage: StageId,
    tx: Sender<Frame>,
}

impl CompletionSink {
    pub fn new(stage: StageId, tx: Sender<Frame>) -> Self {
        Self { stage, tx }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    /// Push a processed frame into the lane's queue.
    ///
    /// Returns the frame if the lane is gone so the caller can release it.
    pub fn complete(&self, frame: Frame) -> std::result::Result<(), Frame> {
        self.tx.send(frame).map_err(|e| e.into_inner())
    }
}

/// Hardware driver for one lane.
#[cfg_attr(test, mockall::automock)]
pub trait StageDriver: Send + Sync {
    /// Lane leader this driver serves.
    fn stage(&self) -> StageId;

    /// Start streaming; completions go to `sink`.
    fn start(&self, sink: CompletionSink) -> Result<()>;

    /// Graceful stop after the hardware has drained.
    fn stop(&self) -> Result<()>;

    /// Abort immediately and hand back frames still owned by the hardware.
    fn force_stop(&self) -> Vec<Frame>;

    /// Queue a frame whose lane entities are `Processing` with buffers attached.
    fn submit(&self, frame: Frame) -> std::result::Result<(), Rejected>;

    /// Put the sensor chain this driver roots into (or out of) standby.
    fn set_standby(&self, standby: bool) -> Result<()>;
}
