//! Lane worker threads.
//!
//! Each lane runs one worker. The worker pops completed frames from the lane's
//! queue with a bounded timeout, puts dequeued buffers back into their slots,
//! marks the lane's entities `Done`, runs the lane's [`StageHandler`] and
//! forwards the frame to the next lane. Errors never leave the loop: a bad
//! buffer marks its stream errored and the frame keeps moving.
//!
//! # Handlers
//!
//! - [`StageHandler::Generic`] - Forward only
//! - [`StageHandler::Capture`] - Retain the consumed raw buffer in the frame selector
//! - [`StageHandler::FaceDetect`] - Copy detected faces into the selector history
//! - [`StageHandler::Sync`] - Pair primary and secondary frames by frame count

use crate::hal::buffer::BufferTag;
use crate::pipeline::frame::{DualRole, EntityState, Frame};
use crate::pipeline::id::{FrameCount, StageId};
use crate::pipeline::network::NetworkShared;
use crate::pipeline::selector::{FrameSelector, HistoryEntry};
use crate::pipeline::stage::{descriptor, RAW_PORT};
use crate::pipeline::thread::{LoopAction, LoopController};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Worker timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Queue pop timeout; a timeout is just a retry.
    pub poll: Duration,
    /// How long the sync lane waits for the other half of a pair.
    pub pair_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(50),
            pair_timeout: Duration::from_millis(100),
        }
    }
}

/// Frames more than this many counts behind the newest arrival are sent on unpaired.
const MAX_PAIR_LAG: u64 = 2;

/// Holds synchronized frames until their partner from the other chain arrives.
#[derive(Debug)]
pub struct SyncPairing {
    held: Vec<(Instant, Frame)>,
    timeout: Duration,
    paired: u64,
    unpaired: u64,
}

impl SyncPairing {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Vec::new(),
            timeout,
            paired: 0,
            unpaired: 0,
        }
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn paired(&self) -> u64 {
        self.paired
    }

    pub fn unpaired(&self) -> u64 {
        self.unpaired
    }

    fn on_frame(&mut self, frame: Frame) -> Vec<Frame> {
        let mut out = self.release_where(|f| f.count.0 + MAX_PAIR_LAG < frame.count.0);

        if !frame.plan.key.synchronized {
            out.push(frame);
            return out;
        }

        let partner = self
            .held
            .iter()
            .position(|(_, h)| h.count == frame.count && h.role != frame.role);
        match partner {
            Some(pos) => {
                let (_, other) = self.held.remove(pos);
                let (mut primary, secondary) = if frame.role == DualRole::Secondary {
                    (other, frame)
                } else {
                    (frame, other)
                };
                let mut secondary = secondary;
                pair(&mut primary, &mut secondary);
                self.paired += 1;
                out.push(secondary);
                out.push(primary);
            }
            None => self.held.push((Instant::now(), frame)),
        }
        out
    }

    fn on_idle(&mut self) -> Vec<Frame> {
        let timeout = self.timeout;
        let now = Instant::now();
        let expired: Vec<FrameCount> = self
            .held
            .iter()
            .filter(|(since, _)| now.duration_since(*since) >= timeout)
            .map(|(_, f)| f.count)
            .collect();
        self.release_where(|f| expired.contains(&f.count))
    }

    fn release_where(&mut self, stale: impl Fn(&Frame) -> bool) -> Vec<Frame> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.held.len() {
            if stale(&self.held[i].1) {
                let (_, frame) = self.held.remove(i);
                tracing::debug!(frame = %frame.count, role = ?frame.role, "Forwarding unpaired frame");
                self.unpaired += 1;
                out.push(frame);
            } else {
                i += 1;
            }
        }
        out
    }

    fn drain(&mut self) -> Vec<Frame> {
        self.held.drain(..).map(|(_, f)| f).collect()
    }
}

/// Move the secondary chain's image into the primary frame's fusion input.
fn pair(primary: &mut Frame, secondary: &mut Frame) {
    let image = secondary
        .entity_mut(StageId::McscSecondary)
        .and_then(|e| e.dst.iter_mut().find(|s| s.port == 0 && !s.error))
        .and_then(|s| s.buffer.take());
    let Some(image) = image else {
        tracing::debug!(frame = %primary.count, "Secondary frame has no image to fuse");
        return;
    };
    match primary
        .entity_mut(StageId::Fusion)
        .filter(|e| e.is_active())
        .and_then(|e| e.src.first_mut())
    {
        Some(slot) => {
            slot.buffer = Some(image);
            primary.metadata.paired_with = Some(secondary.count);
        }
        None => {
            // Leave it on the secondary frame; delivery releases it.
            if let Some(slot) = secondary
                .entity_mut(StageId::McscSecondary)
                .and_then(|e| e.dst.iter_mut().find(|s| s.port == 0))
            {
                slot.buffer = Some(image);
            }
        }
    }
}

/// Lane-specific post-processing, chosen when the network starts.
pub enum StageHandler {
    Generic,
    Capture(Arc<FrameSelector>),
    FaceDetect(Arc<FrameSelector>),
    Sync(SyncPairing),
}

impl StageHandler {
    fn name(&self) -> &'static str {
        match self {
            StageHandler::Generic => "generic",
            StageHandler::Capture(_) => "capture",
            StageHandler::FaceDetect(_) => "face_detect",
            StageHandler::Sync(_) => "sync",
        }
    }

    /// Post-process a frame whose lane just finished. Returns the frames to forward.
    fn on_frame(&mut self, leader: StageId, mut frame: Frame) -> Vec<Frame> {
        match self {
            StageHandler::Generic => vec![frame],
            StageHandler::Capture(selector) => {
                retain_raw(selector, leader, &mut frame);
                vec![frame]
            }
            StageHandler::FaceDetect(selector) => {
                if let Some(faces) = frame.metadata.faces {
                    selector.annotate(frame.count, Some(faces), None);
                }
                vec![frame]
            }
            StageHandler::Sync(pairing) => pairing.on_frame(frame),
        }
    }

    fn on_idle(&mut self) -> Vec<Frame> {
        match self {
            StageHandler::Sync(pairing) => pairing.on_idle(),
            _ => Vec::new(),
        }
    }

    fn drain(&mut self) -> Vec<Frame> {
        match self {
            StageHandler::Sync(pairing) => pairing.drain(),
            _ => Vec::new(),
        }
    }
}

/// Hand the sensor raw buffer to the selector once the stage reading it is done.
fn retain_raw(selector: &FrameSelector, leader: StageId, frame: &mut Frame) {
    if !frame.retain_raw {
        return;
    }
    let root = match frame.role {
        DualRole::Secondary => StageId::SensorSecondary,
        _ => StageId::Sensor,
    };
    let consumer = descriptor(root).port(RAW_PORT).and_then(|p| p.feeds);
    let consumed_here = consumer
        .and_then(|c| frame.entity(c))
        .is_some_and(|e| e.group == leader && e.state == EntityState::Done);
    if !consumed_here {
        return;
    }

    let buffer = frame
        .entity_mut(root)
        .and_then(|e| {
            e.dst
                .iter_mut()
                .find(|s| s.port == RAW_PORT && s.stream().is_none() && !s.error)
        })
        .and_then(|s| s.buffer.take());
    if let Some(buffer) = buffer {
        let mut entry = HistoryEntry::new(frame.count, frame.role, buffer);
        entry.sharpness = frame.metadata.sharpness;
        entry.faces = frame.metadata.faces;
        selector.push(entry);
        frame.retain_raw = false;
    }
}

struct Worker {
    leader: StageId,
    rx: Receiver<Frame>,
    shared: Arc<NetworkShared>,
    handler: StageHandler,
    renew: Option<Arc<AtomicU32>>,
    poll: Duration,
}

impl Worker {
    fn step(&mut self) -> LoopAction {
        match self.rx.recv_timeout(self.poll) {
            Ok(frame) => {
                self.process(frame);
                LoopAction::Continue
            }
            Err(RecvTimeoutError::Timeout) => {
                for frame in self.handler.on_idle() {
                    self.shared.dispatch(frame, Some(self.leader));
                }
                LoopAction::Continue
            }
            Err(RecvTimeoutError::Disconnected) => LoopAction::Stop,
        }
    }

    fn process(&mut self, mut frame: Frame) {
        if let Some(renew) = &self.renew {
            renew.store(0, Ordering::Relaxed);
        }

        let leader = self.leader;
        if !frame
            .lane_entities(leader)
            .any(|e| e.state == EntityState::Processing)
        {
            tracing::warn!(frame = %frame.count, lane = %leader, "Frame completed without processing entities");
        }

        let mut feed_failed = false;
        for buffer in std::mem::take(&mut frame.dequeued) {
            if buffer.is_error() {
                match buffer.tag {
                    BufferTag::Stream(stream) => {
                        if let Some(key) = frame.request(buffer.batch) {
                            self.shared.report_buffer_error(key, stream);
                        }
                    }
                    BufferTag::Stage { stage, port } => {
                        tracing::warn!(frame = %frame.count, stage = %stage, port, "Internal buffer error");
                        feed_failed |= descriptor(stage).port(port).is_some_and(|p| p.feeds.is_some());
                    }
                }
            }
            if let Err(buffer) = frame.retarget(buffer) {
                tracing::warn!(frame = %frame.count, lane = %leader, "No slot for dequeued {}", buffer.id);
                self.shared.buffers().release(buffer);
            }
        }
        if feed_failed {
            for (key, stream) in frame.fail_streams() {
                self.shared.report_buffer_error(key, stream);
            }
        }

        frame.set_lane_state(leader, EntityState::Processing, EntityState::Done);
        tracing::trace!(frame = %frame.count, lane = %leader, handler = self.handler.name(), "Lane done");

        for next in self.handler.on_frame(leader, frame) {
            self.shared.dispatch(next, Some(leader));
        }
    }

    fn finish(&mut self) {
        let held = self.handler.drain();
        if !held.is_empty() {
            tracing::debug!(lane = %self.leader, count = held.len(), "Releasing held frames on exit");
        }
        for frame in held {
            self.shared.complete(frame);
        }
    }
}

/// Spawn the worker thread for one lane.
pub fn spawn_worker(
    leader: StageId,
    rx: Receiver<Frame>,
    shared: Arc<NetworkShared>,
    handler: StageHandler,
    renew: Option<Arc<AtomicU32>>,
    settings: WorkerSettings,
) -> std::io::Result<LoopController> {
    let worker = Arc::new(Mutex::new(Worker {
        leader,
        rx,
        shared,
        handler,
        renew,
        poll: settings.poll,
    }));
    let exit = Arc::clone(&worker);
    LoopController::spawn_with_exit(
        &format!("lane-{leader}"),
        move || worker.lock().unwrap_or_else(|e| e.into_inner()).step(),
        move || exit.lock().unwrap_or_else(|e| e.into_inner()).finish(),
    )
}
