//! Simulated hardware for tests and the demo binary.
//!
//! This module provides stand-ins for every hardware boundary so the engine
//! can run end to end without a camera:
//!
//! - [`SimBufferPool`] - Counting buffer authority with per-tag limits and
//!   injected acquire failures
//! - [`SimStageDriver`] - Completes frames synchronously on the submitting
//!   thread; can fail ports, stall, reject frames or fail standby changes
//! - [`SimSensorClock`] - Free-running pacing at a fixed frame rate
//! - [`ManualPacing`] - Pacing driven one tick at a time by a test
//!
//! # Enabling
//!
//! Available with the `sim-hardware` feature (on by default):
//!
//! ```bash
//! cargo run --features sim-hardware -- --requests 30
//! ```

use crate::error::{CampipeError, Result};
use crate::hal::buffer::{Buffer, BufferAuthority, BufferId, BufferStatus, BufferTag};
use crate::hal::driver::{CompletionSink, Rejected, StageDriver};
use crate::hal::pacing::{Pacing, PacingSource};
use crate::hal::Hardware;
use crate::pipeline::frame::{EntityState, Frame};
use crate::pipeline::id::StageId;
use crate::pipeline::stage::descriptor;
use crossbeam_channel::{bounded, tick, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default number of buffers per tag.
pub const DEFAULT_POOL_DEPTH: usize = 16;

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub acquired: u64,
    pub released: u64,
    pub failed: u64,
    pub outstanding: usize,
}

#[derive(Default)]
struct PoolState {
    limits: HashMap<BufferTag, usize>,
    outstanding: HashMap<BufferTag, usize>,
    fail_next: HashMap<BufferTag, u32>,
    acquired: u64,
    released: u64,
    failed: u64,
}

/// Counting buffer authority.
pub struct SimBufferPool {
    depth: usize,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl SimBufferPool {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Override the pool depth for one tag.
    pub fn set_limit(&self, tag: BufferTag, limit: usize) {
        self.lock().limits.insert(tag, limit);
    }

    /// Make the next `count` acquisitions of `tag` fail.
    pub fn fail_next(&self, tag: BufferTag, count: u32) {
        self.lock().fail_next.insert(tag, count);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            acquired: state.acquired,
            released: state.released,
            failed: state.failed,
            outstanding: state.outstanding.values().sum(),
        }
    }
}

impl Default for SimBufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_DEPTH)
    }
}

impl BufferAuthority for SimBufferPool {
    fn acquire(&self, tag: BufferTag) -> Result<Buffer> {
        let mut state = self.lock();
        if let Some(n) = state.fail_next.get_mut(&tag) {
            if *n > 0 {
                *n -= 1;
                state.failed += 1;
                return Err(CampipeError::Buffer(format!("injected failure for {tag}")));
            }
        }
        let limit = state.limits.get(&tag).copied().unwrap_or(self.depth);
        let used = state.outstanding.entry(tag).or_insert(0);
        if *used >= limit {
            state.failed += 1;
            return Err(CampipeError::Buffer(format!("pool exhausted for {tag}")));
        }
        *used += 1;
        state.acquired += 1;
        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Buffer::new(id, tag))
    }

    fn release(&self, buffer: Buffer) {
        let mut state = self.lock();
        if let Some(used) = state.outstanding.get_mut(&buffer.tag) {
            *used = used.saturating_sub(1);
        }
        state.released += 1;
    }

    fn available_count(&self, tag: BufferTag) -> usize {
        let state = self.lock();
        let limit = state.limits.get(&tag).copied().unwrap_or(self.depth);
        limit.saturating_sub(state.outstanding.get(&tag).copied().unwrap_or(0))
    }
}

/// Fault switches for a simulated driver.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    /// Hold submitted frames until `force_stop`.
    pub stall: bool,
    /// Refuse every submission.
    pub reject: bool,
    /// Output ports whose buffers come back with an error status.
    pub error_ports: Vec<(StageId, u8)>,
    pub fail_standby: bool,
    /// Faces reported by the feature detector.
    pub faces: u32,
}

/// Simulated lane driver.
pub struct SimStageDriver {
    stage: StageId,
    sink: Mutex<Option<CompletionSink>>,
    held: Mutex<Vec<Frame>>,
    faults: Mutex<SimFaults>,
    submitted: AtomicU64,
    standby: AtomicBool,
}

impl SimStageDriver {
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            sink: Mutex::new(None),
            held: Mutex::new(Vec::new()),
            faults: Mutex::new(SimFaults::default()),
            submitted: AtomicU64::new(0),
            standby: AtomicBool::new(false),
        }
    }

    fn faults(&self) -> MutexGuard<'_, SimFaults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Update the fault switches.
    pub fn configure(&self, f: impl FnOnce(&mut SimFaults)) {
        f(&mut self.faults());
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn held(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn in_standby(&self) -> bool {
        self.standby.load(Ordering::Relaxed)
    }

    pub fn is_started(&self) -> bool {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Write every attached output buffer and dequeue it.
    fn process(&self, frame: &mut Frame, faults: &SimFaults) {
        let count = frame.count.0;
        let mut dequeued = Vec::new();
        let mut sharpness = None;
        let mut faces = None;
        let mut timestamp = None;

        for entity in frame.lane_entities_mut(self.stage) {
            if entity.state != EntityState::Processing {
                continue;
            }
            for slot in &mut entity.dst {
                if let Some(mut buffer) = slot.buffer.take() {
                    buffer.status = if faults.error_ports.contains(&(entity.stage, slot.port)) {
                        BufferStatus::Error
                    } else {
                        BufferStatus::Ok
                    };
                    dequeued.push(buffer);
                }
            }
            if descriptor(entity.stage).is_root() {
                timestamp = Some(count * 33_333_333);
                sharpness = Some(((count * 37) % 100) as f32 / 100.0);
            }
            if entity.stage == StageId::Vra {
                faces = Some(faults.faces);
            }
        }

        frame.dequeued.extend(dequeued);
        if timestamp.is_some() {
            frame.metadata.sensor_timestamp_ns = timestamp;
            frame.metadata.sharpness = sharpness;
        }
        if faces.is_some() {
            frame.metadata.faces = faces;
        }
    }
}

impl StageDriver for SimStageDriver {
    fn stage(&self) -> StageId {
        self.stage
    }

    fn start(&self, sink: CompletionSink) -> Result<()> {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
        tracing::trace!(stage = %self.stage, "Sim driver started");
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }

    fn force_stop(&self) -> Vec<Frame> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
        let held: Vec<Frame> = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        if !held.is_empty() {
            tracing::debug!(stage = %self.stage, count = held.len(), "Sim driver released held frames");
        }
        held
    }

    fn submit(&self, mut frame: Frame) -> std::result::Result<(), Rejected> {
        let Some(sink) = self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return Err(Rejected {
                frame,
                reason: "driver not started".into(),
            });
        };
        let faults = self.faults().clone();
        if faults.reject {
            return Err(Rejected {
                frame,
                reason: "injected rejection".into(),
            });
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
        if faults.stall {
            self.held.lock().unwrap_or_else(|e| e.into_inner()).push(frame);
            return Ok(());
        }
        self.process(&mut frame, &faults);
        sink.complete(frame).map_err(|frame| Rejected {
            frame,
            reason: "completion queue closed".into(),
        })
    }

    fn set_standby(&self, standby: bool) -> Result<()> {
        if self.faults().fail_standby {
            return Err(CampipeError::driver(self.stage, "standby request timed out"));
        }
        self.standby.store(standby, Ordering::Relaxed);
        Ok(())
    }
}

/// Free-running sensor clock.
pub struct SimSensorClock {
    ticks: Receiver<Instant>,
    stopped: AtomicBool,
}

impl SimSensorClock {
    pub fn new(fps: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
        Self {
            ticks: tick(period),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

impl PacingSource for SimSensorClock {
    fn wait(&self, timeout: Duration) -> Pacing {
        if self.stopped.load(Ordering::Relaxed) {
            return Pacing::Stopped;
        }
        match self.ticks.recv_timeout(timeout) {
            Ok(_) => Pacing::Ready,
            Err(RecvTimeoutError::Timeout) => Pacing::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Pacing::Stopped,
        }
    }
}

/// Pacing driven explicitly through a [`PacingHandle`].
pub struct ManualPacing {
    rx: Receiver<()>,
}

/// Test-side trigger for [`ManualPacing`]. Dropping it stops the source.
#[derive(Clone)]
pub struct PacingHandle {
    tx: Sender<()>,
}

impl ManualPacing {
    pub fn new() -> (Self, PacingHandle) {
        let (tx, rx) = bounded(256);
        (Self { rx }, PacingHandle { tx })
    }
}

impl PacingSource for ManualPacing {
    fn wait(&self, timeout: Duration) -> Pacing {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Pacing::Ready,
            Err(RecvTimeoutError::Timeout) => Pacing::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Pacing::Stopped,
        }
    }
}

impl PacingHandle {
    /// Signal one hardware-ready event. Returns false if the queue is full.
    pub fn tick(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => false,
        }
    }

    pub fn tick_n(&self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }
}

/// A full set of simulated hardware with handles kept for fault injection.
pub struct SimHardware {
    pub pool: Arc<SimBufferPool>,
    pub drivers: BTreeMap<StageId, Arc<SimStageDriver>>,
}

impl SimHardware {
    pub fn new(pool_depth: usize) -> Self {
        Self {
            pool: Arc::new(SimBufferPool::new(pool_depth)),
            drivers: StageId::ALL
                .iter()
                .map(|&s| (s, Arc::new(SimStageDriver::new(s))))
                .collect(),
        }
    }

    pub fn driver(&self, stage: StageId) -> Option<&Arc<SimStageDriver>> {
        self.drivers.get(&stage)
    }

    /// Hardware bundle for a session, sharing this simulator's handles.
    pub fn hardware(&self, pacing: Arc<dyn PacingSource>) -> Hardware {
        Hardware {
            buffers: Arc::clone(&self.pool) as Arc<dyn BufferAuthority>,
            drivers: self
                .drivers
                .iter()
                .map(|(&s, d)| (s, Arc::clone(d) as Arc<dyn StageDriver>))
                .collect(),
            pacing,
        }
    }
}

impl Default for SimHardware {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_DEPTH)
    }
}
