//! Stage network: one lane per memory-mediated (or root) stage.
//!
//! A lane owns a hardware driver, a completion queue and a worker thread.
//! Frames enter a network through [`NetworkShared::dispatch`], which finds the
//! next lane in the frame's plan that still has requested entities, attaches
//! destination buffers and submits the frame to that lane's driver. When no
//! lane is left the frame goes to result delivery.

use crate::error::{CampipeError, Result, ResultExt};
use crate::hal::buffer::BufferAuthority;
use crate::hal::driver::{CompletionSink, Rejected, StageDriver};
use crate::pipeline::bridge::{ClientEvent, EventSender};
use crate::pipeline::frame::{EntityState, Frame};
use crate::pipeline::id::{RequestKey, StageId};
use crate::pipeline::request::RequestTracker;
use crate::pipeline::stage::{descriptor, Chain, ConnectionTable, FeatureFlags};
use crate::pipeline::thread::LoopController;
use crate::pipeline::worker::{spawn_worker, StageHandler, WorkerSettings};
use crate::types::StreamKind;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

/// Which set of lanes a network serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Preview,
    Reprocessing,
}

impl NetworkKind {
    pub fn name(self) -> &'static str {
        match self {
            NetworkKind::Preview => "preview",
            NetworkKind::Reprocessing => "reprocessing",
        }
    }

    /// Lane leaders this network runs for the given table and flags.
    pub fn leaders(self, table: &ConnectionTable, flags: &FeatureFlags) -> Vec<StageId> {
        table
            .lane_leaders()
            .into_iter()
            .filter(|&stage| {
                let desc = descriptor(stage);
                let enabled = desc.feature.map_or(true, |f| flags.enables(f));
                let chain = match (self, desc.chain) {
                    (NetworkKind::Reprocessing, Chain::Reprocessing) => true,
                    (NetworkKind::Reprocessing, _) | (NetworkKind::Preview, Chain::Reprocessing) => false,
                    (NetworkKind::Preview, Chain::Primary) => true,
                    (NetworkKind::Preview, _) => flags.dual_sensor,
                };
                enabled && chain
            })
            .collect()
    }
}

/// State every lane of a network shares.
pub struct NetworkShared {
    kind: NetworkKind,
    drivers: HashMap<StageId, Arc<dyn StageDriver>>,
    buffers: Arc<dyn BufferAuthority>,
    results: Sender<Frame>,
    tracker: Arc<RequestTracker>,
    events: EventSender,
}

impl NetworkShared {
    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn buffers(&self) -> &Arc<dyn BufferAuthority> {
        &self.buffers
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Move `frame` to the next lane after `after`, or to result delivery.
    pub fn dispatch(&self, mut frame: Frame, after: Option<StageId>) {
        let mut after = after;
        loop {
            let Some(leader) = frame.next_lane(after) else {
                self.complete(frame);
                return;
            };
            let Some(driver) = self.drivers.get(&leader) else {
                tracing::warn!(frame = %frame.count, lane = %leader, "No lane for stage, skipping");
                self.fail_lane(&mut frame, leader, EntityState::Requested);
                after = Some(leader);
                continue;
            };

            self.attach(&mut frame, leader);
            frame.set_lane_state(leader, EntityState::Requested, EntityState::Processing);
            tracing::trace!(frame = %frame.count, lane = %leader, "Submitting frame");

            match driver.submit(frame) {
                Ok(()) => return,
                Err(Rejected { frame: rejected, reason }) => {
                    tracing::warn!(frame = %rejected.count, lane = %leader, "Driver rejected frame: {}", reason);
                    frame = rejected;
                    self.fail_lane(&mut frame, leader, EntityState::Processing);
                    after = Some(leader);
                }
            }
        }
    }

    /// Hand a finished frame to result delivery.
    pub fn complete(&self, frame: Frame) {
        if let Err(e) = self.results.send(frame) {
            let mut frame = e.into_inner();
            tracing::warn!(frame = %frame.count, "Result delivery is gone, releasing frame");
            for buffer in frame.take_buffers() {
                self.buffers.release(buffer);
            }
            self.tracker.frame_returned();
        }
    }

    /// Acquire a buffer for every empty destination slot of the lane.
    fn attach(&self, frame: &mut Frame, leader: StageId) {
        let requests = frame.requests.clone();
        let mut internal_failed = false;

        for entity in frame.lane_entities_mut(leader) {
            if entity.state != EntityState::Requested {
                continue;
            }
            let stage = entity.stage;
            for slot in entity.dst.iter_mut().filter(|s| !s.is_settled()) {
                match self.buffers.acquire(slot.tag) {
                    Ok(mut buffer) => {
                        buffer.target(stage, slot.port, slot.batch);
                        slot.buffer = Some(buffer);
                    }
                    Err(e) => {
                        tracing::warn!(stage = %stage, port = slot.port, "Buffer acquire failed: {}", e);
                        slot.error = true;
                        match slot.stream() {
                            Some(stream) => {
                                if let Some(&key) = requests.get(slot.batch) {
                                    self.report_buffer_error(key, stream);
                                }
                            }
                            None => internal_failed = true,
                        }
                    }
                }
            }
        }

        if internal_failed {
            // Without the internal hand-off nothing downstream can be produced.
            for (key, stream) in frame.fail_streams() {
                self.report_buffer_error(key, stream);
            }
        }
    }

    /// Give up on a lane: fail its stream slots and mark its entities done.
    fn fail_lane(&self, frame: &mut Frame, leader: StageId, from: EntityState) {
        let requests = frame.requests.clone();
        for entity in frame.lane_entities_mut(leader) {
            for slot in entity.dst.iter_mut().filter(|s| !s.error) {
                slot.error = true;
                if let (Some(stream), Some(&key)) = (slot.stream(), requests.get(slot.batch)) {
                    self.report_buffer_error(key, stream);
                }
            }
        }
        frame.set_lane_state(leader, from, EntityState::Done);
    }

    pub(crate) fn report_buffer_error(&self, key: RequestKey, stream: StreamKind) {
        self.events.send(ClientEvent::BufferError { key, stream });
        self.tracker.mark_error(key);
    }
}

struct Lane {
    leader: StageId,
    driver: Arc<dyn StageDriver>,
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
    worker: Option<LoopController>,
}

/// A set of lanes plus the shared dispatch state.
pub struct StageNetwork {
    shared: Arc<NetworkShared>,
    lanes: Vec<Lane>,
}

impl StageNetwork {
    /// Wire a network for `leaders`. Every leader needs a driver.
    pub fn new(
        kind: NetworkKind,
        leaders: &[StageId],
        drivers: &HashMap<StageId, Arc<dyn StageDriver>>,
        buffers: Arc<dyn BufferAuthority>,
        results: Sender<Frame>,
        tracker: Arc<RequestTracker>,
        events: EventSender,
    ) -> Result<Self> {
        let mut lanes = Vec::with_capacity(leaders.len());
        let mut lane_drivers = HashMap::with_capacity(leaders.len());
        for &leader in leaders {
            let driver = drivers
                .get(&leader)
                .cloned()
                .ok_or_else(|| CampipeError::driver(leader, "no driver for lane"))?;
            let (tx, rx) = unbounded();
            lane_drivers.insert(leader, Arc::clone(&driver));
            lanes.push(Lane {
                leader,
                driver,
                tx,
                rx,
                worker: None,
            });
        }

        tracing::debug!(network = kind.name(), lanes = ?leaders, "Stage network wired");
        Ok(Self {
            shared: Arc::new(NetworkShared {
                kind,
                drivers: lane_drivers,
                buffers,
                results,
                tracker,
                events,
            }),
            lanes,
        })
    }

    pub fn shared(&self) -> &Arc<NetworkShared> {
        &self.shared
    }

    pub fn leaders(&self) -> Vec<StageId> {
        self.lanes.iter().map(|l| l.leader).collect()
    }

    pub fn dispatch(&self, frame: Frame) {
        self.shared.dispatch(frame, None);
    }

    /// Start every driver and spawn one worker per lane.
    ///
    /// `handler` picks the post-processing for a lane; `renew` hands out the
    /// watchdog counter the worker resets.
    pub fn start(
        &mut self,
        settings: WorkerSettings,
        mut handler: impl FnMut(StageId) -> StageHandler,
        mut renew: impl FnMut(StageId) -> Option<Arc<AtomicU32>>,
    ) -> Result<()> {
        for lane in &mut self.lanes {
            if lane.worker.is_some() {
                continue;
            }
            let network = self.shared.kind.name();
            let leader = lane.leader;
            lane.driver
                .start(CompletionSink::new(leader, lane.tx.clone()))
                .with_context(|| format!("starting {network} lane {leader}"))?;
            let worker = spawn_worker(
                leader,
                lane.rx.clone(),
                Arc::clone(&self.shared),
                handler(leader),
                renew(leader),
                settings,
            )
            .with_context(|| format!("spawning {network} worker for {leader}"))?;
            lane.worker = Some(worker);
        }
        tracing::info!(network = self.shared.kind.name(), lanes = self.lanes.len(), "Stage network started");
        Ok(())
    }

    fn stop_workers(&mut self) {
        for lane in &self.lanes {
            if let Some(worker) = &lane.worker {
                worker.signal_stop();
            }
        }
        for lane in &mut self.lanes {
            if let Some(mut worker) = lane.worker.take() {
                worker.stop();
            }
        }
    }

    /// Graceful stop: stop drivers, then workers, then hand queued frames to delivery.
    pub fn stop(&mut self) -> usize {
        for lane in &self.lanes {
            if let Err(e) = lane.driver.stop() {
                tracing::warn!(lane = %lane.leader, "Driver stop failed: {}", e);
            }
        }
        self.stop_workers();
        self.drain_queues()
    }

    /// Abort every lane and hand all frames still inside the network to delivery.
    ///
    /// Returns how many frames were recovered.
    pub fn force_stop(&mut self) -> usize {
        let mut recovered = 0;
        for lane in &self.lanes {
            for frame in lane.driver.force_stop() {
                self.shared.complete(frame);
                recovered += 1;
            }
        }
        self.stop_workers();
        recovered += self.drain_queues();
        if recovered > 0 {
            tracing::warn!(network = self.shared.kind.name(), recovered, "Force-stopped network");
        }
        recovered
    }

    fn drain_queues(&self) -> usize {
        let mut drained = 0;
        for lane in &self.lanes {
            while let Ok(frame) = lane.rx.try_recv() {
                self.shared.complete(frame);
                drained += 1;
            }
        }
        drained
    }

    pub fn is_running(&self) -> bool {
        self.lanes.iter().any(|l| l.worker.as_ref().is_some_and(|w| w.is_running()))
    }
}

impl Drop for StageNetwork {
    fn drop(&mut self) {
        self.stop_workers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::buffer::MockBufferAuthority;
    use crate::hal::driver::MockStageDriver;
    use crate::pipeline::bridge::ClientBridge;

    fn network(driver: MockStageDriver) -> StageNetwork {
        let (_bridge, events) = ClientBridge::new();
        let (results, _rx) = unbounded();
        let mut drivers: HashMap<StageId, Arc<dyn StageDriver>> = HashMap::new();
        drivers.insert(StageId::Bayer, Arc::new(driver));
        StageNetwork::new(
            NetworkKind::Preview,
            &[StageId::Bayer],
            &drivers,
            Arc::new(MockBufferAuthority::new()),
            results,
            Arc::new(RequestTracker::new(events.clone())),
            events,
        )
        .unwrap()
    }

    #[test]
    fn test_missing_driver_is_refused() {
        let (_bridge, events) = ClientBridge::new();
        let (results, _rx) = unbounded();
        let err = StageNetwork::new(
            NetworkKind::Preview,
            &[StageId::Gdc],
            &HashMap::new(),
            Arc::new(MockBufferAuthority::new()),
            results,
            Arc::new(RequestTracker::new(events.clone())),
            events,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("gdc"));
    }

    #[test]
    fn test_driver_start_failure_names_lane() {
        let mut driver = MockStageDriver::new();
        driver
            .expect_start()
            .returning(|_| Err(CampipeError::driver(StageId::Bayer, "firmware not loaded")));
        let mut net = network(driver);

        let err = net
            .start(WorkerSettings::default(), |_| StageHandler::Generic, |_| None)
            .unwrap_err();
        assert!(matches!(err, CampipeError::WithContext { .. }));
        let msg = err.to_string();
        assert!(msg.starts_with("starting preview lane bayer: "), "{msg}");
        assert!(msg.contains("firmware not loaded"));
        assert!(!net.is_running());
    }
}
