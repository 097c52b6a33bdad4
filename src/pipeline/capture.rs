//! Still capture through the reprocessing pipeline.
//!
//! The reconciliation loop queues a [`CaptureJob`] for every request that asks
//! for the `Still` stream. The capture thread picks a retained raw frame from
//! the [`FrameSelector`], builds a `Reprocessing` frame around it and submits
//! it to the reprocessing network. The job owes its request exactly one
//! result: either the reprocessing frame reaching delivery, or an immediate
//! finish when selection fails.

use crate::hal::buffer::BufferAuthority;
use crate::pipeline::dual::OperationCoordinator;
use crate::pipeline::factory::{FrameFactory, FrameSpec, SlotRequest};
use crate::pipeline::frame::FrameKind;
use crate::pipeline::id::{RequestKey, StageId};
use crate::pipeline::network::NetworkShared;
use crate::pipeline::plan::GraphKey;
use crate::pipeline::request::{RequestParams, RequestTracker};
use crate::pipeline::selector::{FrameSelector, HistoryEntry, SelectError, SelectPolicy};
use crate::pipeline::state::{DeviceState, StateCell};
use crate::pipeline::thread::{LoopAction, LoopController};
use crate::types::StreamKind;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A still capture waiting for a source frame.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    pub key: RequestKey,
    pub policy: SelectPolicy,
    pub generation: u64,
    pub params: RequestParams,
}

pub struct CaptureContext {
    pub factory: Arc<FrameFactory>,
    pub selector: Arc<FrameSelector>,
    pub network: Arc<NetworkShared>,
    pub tracker: Arc<RequestTracker>,
    pub state: Arc<StateCell>,
    pub coordinator: Option<Arc<Mutex<OperationCoordinator>>>,
    /// How long a selection may wait for a matching frame.
    pub select_timeout: Duration,
}

impl CaptureContext {
    fn buffers(&self) -> &Arc<dyn BufferAuthority> {
        self.network.buffers()
    }

    fn unlock(&self) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.lock().unwrap_or_else(|e| e.into_inner()).unlock_capture();
        }
    }

    fn fail(&self, job: &CaptureJob) {
        self.network.report_buffer_error(job.key, StreamKind::Still);
        self.tracker.finish(&[job.key], &[job.key], false);
        self.unlock();
    }

    fn abort(&self, job: &CaptureJob) {
        self.tracker.finish(&[job.key], &[], true);
        self.unlock();
    }

    /// Run one job to the point where the reprocessing network owns it.
    pub fn run_job(&self, job: CaptureJob) {
        if job.generation < self.tracker.fence() || !self.state.is(DeviceState::Running) {
            tracing::debug!(key = %job.key, "Dropping stale capture job");
            self.abort(&job);
            return;
        }

        let entry = match self.selector.select(job.policy, self.select_timeout) {
            Ok(entry) => entry,
            Err(SelectError::NotFound) => {
                tracing::warn!(key = %job.key, policy = ?job.policy, "No source frame for still capture");
                self.fail(&job);
                return;
            }
            Err(SelectError::Cancelled) => {
                self.abort(&job);
                return;
            }
        };
        self.submit(job, entry);
    }

    fn submit(&self, job: CaptureJob, entry: HistoryEntry) {
        let HistoryEntry {
            frame: source,
            buffer,
            faces,
            sharpness,
            ..
        } = entry;

        let spec = FrameSpec {
            count: self.factory.next_count(),
            kind: FrameKind::Reprocessing,
            key: GraphKey::reprocessing(),
            generation: job.generation,
            slots: vec![SlotRequest {
                key: job.key,
                streams: vec![StreamKind::Still],
            }],
            params: job.params,
            retain_raw: false,
        };
        let mut frame = match self.factory.build(spec) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(key = %job.key, "Cannot build reprocessing frame: {}", e);
                self.buffers().release(buffer);
                self.fail(&job);
                return;
            }
        };

        match frame
            .entity_mut(StageId::BayerReprocessing)
            .and_then(|e| e.src.first_mut())
        {
            Some(slot) => slot.buffer = Some(buffer),
            None => self.buffers().release(buffer),
        }
        frame.metadata.faces = faces;
        frame.metadata.sharpness = sharpness;

        tracing::debug!(key = %job.key, frame = %frame.count, %source, "Reprocessing still capture");
        self.tracker.frame_dispatched();
        self.network.dispatch(frame, None);
    }
}

/// Spawn the capture thread. Jobs left in the queue on exit are aborted.
pub fn spawn_capture(
    ctx: Arc<CaptureContext>,
    rx: Receiver<CaptureJob>,
    poll: Duration,
) -> std::io::Result<LoopController> {
    let exit_ctx = Arc::clone(&ctx);
    let exit_rx = rx.clone();
    LoopController::spawn_with_exit(
        "capture",
        move || match rx.recv_timeout(poll) {
            Ok(job) => {
                ctx.run_job(job);
                LoopAction::Continue
            }
            Err(RecvTimeoutError::Timeout) => LoopAction::Continue,
            Err(RecvTimeoutError::Disconnected) => LoopAction::Stop,
        },
        move || {
            while let Ok(job) = exit_rx.try_recv() {
                exit_ctx.abort(&job);
            }
        },
    )
}
