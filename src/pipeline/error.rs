//! Pipeline-specific error types.

use crate::pipeline::id::{FrameCount, StageId};
use thiserror::Error;

/// Errors that can occur within the orchestration engine.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Inconsistent connection table at {stage}: {reason}")]
    InconsistentTable { stage: StageId, reason: String },

    #[error("Stage {stage} error: {message}")]
    Stage { stage: StageId, message: String },

    #[error("Stage {stage} rejected frame {frame}: {reason}")]
    SubmitRejected {
        stage: StageId,
        frame: FrameCount,
        reason: String,
    },

    #[error("Frame {frame} at {stage}: entity in unexpected state {state}")]
    EntityState {
        frame: FrameCount,
        stage: StageId,
        state: &'static str,
    },

    #[error("Dual coordinator error: {0}")]
    Dual(String),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Channel receive error")]
    ChannelRecv,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Pipeline not running")]
    NotRunning,
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistent_table_names_stage() {
        let err = PipelineError::InconsistentTable {
            stage: StageId::Mcsc,
            reason: "upstream isp is not active".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mcsc"));
        assert!(msg.contains("upstream isp"));
    }
}
