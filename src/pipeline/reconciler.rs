//! Frame/request reconciliation loop.
//!
//! Runs once per pacing signal. Each iteration produces exactly one frame for
//! the display chain: a `Preview` frame carrying the next batch of waiting
//! requests, or an `Internal` filler when the batch is not ready (or the
//! pipeline is still settling). In dual-sensor sessions the coordinator is
//! consulted first and may add a companion frame for the other chain at the
//! same frame count.

use crate::hal::pacing::{Pacing, PacingSource};
use crate::pipeline::bridge::{ClientEvent, EventSender};
use crate::pipeline::capture::CaptureJob;
use crate::pipeline::dual::{Companion, ModeDecision, OperationCoordinator, StandbyOp};
use crate::pipeline::factory::{single_key, FrameFactory, FrameSpec, SlotRequest};
use crate::pipeline::frame::FrameKind;
use crate::pipeline::id::FrameCount;
use crate::pipeline::network::NetworkShared;
use crate::pipeline::plan::GraphKey;
use crate::pipeline::request::{PendingRequest, RequestQueue, RequestTracker};
use crate::pipeline::state::{DeviceState, StateCell};
use crate::pipeline::thread::{LoopAction, LoopController};
use crate::types::StreamKind;
use crossbeam_channel::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilerSettings {
    pub batch_size: usize,
    /// Filler frames built before requests are consumed.
    pub settle_frames: u64,
    pub pacing_timeout: Duration,
    /// Keep raw sensor buffers for still capture.
    pub retain_raw: bool,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            settle_frames: 0,
            pacing_timeout: Duration::from_millis(100),
            retain_raw: true,
        }
    }
}

pub struct ReconcilerContext {
    pub factory: Arc<FrameFactory>,
    pub waiting: Arc<RequestQueue>,
    pub tracker: Arc<RequestTracker>,
    pub events: EventSender,
    pub state: Arc<StateCell>,
    pub network: Arc<NetworkShared>,
    pub pacing: Arc<dyn PacingSource>,
    pub coordinator: Option<Arc<Mutex<OperationCoordinator>>>,
    pub standby: Option<Sender<StandbyOp>>,
    pub capture: Option<Sender<CaptureJob>>,
    pub settings: ReconcilerSettings,
}

struct Reconciler {
    ctx: ReconcilerContext,
    built: u64,
    zoom_ratio: f32,
}

impl Reconciler {
    fn step(&mut self) -> LoopAction {
        match self.ctx.pacing.wait(self.ctx.settings.pacing_timeout) {
            Pacing::Ready => {}
            Pacing::TimedOut => return LoopAction::Continue,
            Pacing::Stopped => {
                tracing::info!("Pacing source stopped");
                return LoopAction::Stop;
            }
        }
        if !self.ctx.state.is(DeviceState::Running) {
            return LoopAction::Continue;
        }
        self.iterate();
        LoopAction::Continue
    }

    /// One pacing signal's worth of work.
    fn iterate(&mut self) {
        let batch = if self.built >= self.ctx.settings.settle_frames {
            self.ctx.waiting.take_batch(self.ctx.settings.batch_size)
        } else {
            None
        };
        if let Some(first) = batch.as_ref().and_then(|b| b.first()) {
            self.zoom_ratio = first.request.params.zoom_ratio;
        }

        let decision = self.decide();
        let key = decision
            .as_ref()
            .map_or(single_key(), |d| GraphKey::preview(d.display, d.synchronized));
        let count = self.ctx.factory.next_count();
        let generation = self.ctx.tracker.fence();

        match batch {
            Some(batch) => self.service(batch, count, key, generation),
            None => self.pad(FrameKind::Internal, count, key, generation),
        }

        if let Some(decision) = decision {
            match decision.companion {
                Some(Companion::Internal(role)) => self.pad(
                    FrameKind::Internal,
                    count,
                    GraphKey::preview(role, decision.synchronized),
                    generation,
                ),
                Some(Companion::Transition(role)) => {
                    self.pad(FrameKind::Transition, count, GraphKey::preview(role, false), generation)
                }
                None => {}
            }
        }
        self.built += 1;
    }

    fn decide(&self) -> Option<ModeDecision> {
        let coordinator = self.ctx.coordinator.as_ref()?;
        let decision = coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .on_frame(self.zoom_ratio);
        if let Some(tx) = &self.ctx.standby {
            for op in &decision.standby {
                if tx.try_send(*op).is_err() {
                    tracing::warn!(?op, "Standby queue unavailable, dropping operation");
                }
            }
        }
        Some(decision)
    }

    /// Build a frame for a batch of requests.
    fn service(&self, batch: Vec<PendingRequest>, count: FrameCount, key: GraphKey, generation: u64) {
        let ctx = &self.ctx;
        let params = batch[0].request.params;
        let slots = batch
            .iter()
            .map(|p| SlotRequest {
                key: p.key,
                streams: p
                    .request
                    .streams
                    .iter()
                    .copied()
                    .filter(|&s| s != StreamKind::Still)
                    .collect(),
            })
            .collect();
        let spec = FrameSpec {
            count,
            kind: FrameKind::Preview,
            key,
            generation,
            slots,
            params,
            retain_raw: ctx.settings.retain_raw,
        };

        let frame = match ctx.factory.build(spec) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(frame = %count, "Cannot build frame for requests: {}", e);
                for p in &batch {
                    ctx.tracker.abort(p.key);
                }
                return;
            }
        };

        for p in &batch {
            ctx.tracker.add_outstanding(p.key);
            if p.request.wants(StreamKind::Still) {
                self.queue_still(p, generation);
            }
            ctx.tracker.admit(p.key);
        }
        tracing::debug!(
            frame = %count,
            requests = batch.len(),
            first = %batch[0].key,
            waited_ms = batch[0].arrived.elapsed().as_millis() as u64,
            "Servicing requests"
        );
        ctx.tracker.frame_dispatched();
        ctx.network.dispatch(frame, None);
    }

    fn queue_still(&self, pending: &PendingRequest, generation: u64) {
        let ctx = &self.ctx;
        let Some(tx) = &ctx.capture else {
            ctx.events.send(ClientEvent::BufferError {
                key: pending.key,
                stream: StreamKind::Still,
            });
            ctx.tracker.mark_error(pending.key);
            return;
        };

        ctx.tracker.add_outstanding(pending.key);
        if let Some(coordinator) = &ctx.coordinator {
            coordinator.lock().unwrap_or_else(|e| e.into_inner()).lock_capture();
        }
        let job = CaptureJob {
            key: pending.key,
            policy: pending.request.params.capture,
            generation,
            params: pending.request.params,
        };
        if tx.send(job).is_err() {
            tracing::warn!(key = %pending.key, "Capture path is gone");
            ctx.events.send(ClientEvent::BufferError {
                key: pending.key,
                stream: StreamKind::Still,
            });
            ctx.tracker.finish(&[pending.key], &[pending.key], false);
            if let Some(coordinator) = &ctx.coordinator {
                coordinator.lock().unwrap_or_else(|e| e.into_inner()).unlock_capture();
            }
        }
    }

    /// Build a frame with no client outputs.
    fn pad(&self, kind: FrameKind, count: FrameCount, key: GraphKey, generation: u64) {
        let mut spec = FrameSpec::internal(count, key, generation);
        spec.kind = kind;
        match self.ctx.factory.build(spec) {
            Ok(frame) => {
                tracing::trace!(frame = %count, ?kind, role = ?key.role, "Padding frame");
                self.ctx.tracker.frame_dispatched();
                self.ctx.network.dispatch(frame, None);
            }
            Err(e) => tracing::warn!(frame = %count, ?kind, "Cannot build filler frame: {}", e),
        }
    }
}

/// Spawn the reconciliation thread.
pub fn spawn_reconciler(ctx: ReconcilerContext) -> std::io::Result<LoopController> {
    tracing::info!(
        batch_size = ctx.settings.batch_size,
        settle_frames = ctx.settings.settle_frames,
        dual = ctx.coordinator.is_some(),
        "Starting reconciliation loop"
    );
    let mut reconciler = Reconciler {
        ctx,
        built: 0,
        zoom_ratio: 1.0,
    };
    LoopController::spawn("reconciler", move || reconciler.step())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::buffer::MockBufferAuthority;
    use crate::hal::buffer::{Buffer, BufferId};
    use crate::hal::driver::{MockStageDriver, Rejected, StageDriver};
    use crate::hal::pacing::MockPacingSource;
    use crate::pipeline::bridge::ClientBridge;
    use crate::pipeline::frame::Frame;
    use crate::pipeline::id::{RequestKey, StageId};
    use crate::pipeline::network::{NetworkKind, StageNetwork};
    use crate::pipeline::request::CaptureRequest;
    use crate::pipeline::stage::{ConnectionTable, FeatureFlags};
    use crate::types::Size;
    use crossbeam_channel::{unbounded, Receiver};
    use std::collections::HashMap;
    use std::time::Instant;

    /// A network whose root lane rejects everything, so frames fall straight
    /// through to the results channel.
    fn harness(
        settings: ReconcilerSettings,
    ) -> (Reconciler, Receiver<Frame>, ClientBridge, StageNetwork) {
        let (bridge, events) = ClientBridge::new();
        let tracker = Arc::new(RequestTracker::new(events.clone()));
        let table = ConnectionTable::default_single();
        let flags = FeatureFlags::default();

        let mut drivers: HashMap<StageId, Arc<dyn StageDriver>> = HashMap::new();
        for leader in NetworkKind::Preview.leaders(&table, &flags) {
            let mut driver = MockStageDriver::new();
            driver.expect_submit().returning(|frame| {
                Err(Rejected {
                    frame,
                    reason: "test".into(),
                })
            });
            drivers.insert(leader, Arc::new(driver));
        }
        let mut buffers = MockBufferAuthority::new();
        buffers
            .expect_acquire()
            .returning(|tag| Ok(Buffer::new(BufferId(1), tag)));

        let (results_tx, results_rx) = unbounded();
        let leaders = NetworkKind::Preview.leaders(&table, &flags);
        let network = StageNetwork::new(
            NetworkKind::Preview,
            &leaders,
            &drivers,
            Arc::new(buffers),
            results_tx,
            Arc::clone(&tracker),
            events.clone(),
        )
        .unwrap();

        let ctx = ReconcilerContext {
            factory: Arc::new(FrameFactory::new(table, flags, Size::new(4000, 3000))),
            waiting: Arc::new(RequestQueue::new()),
            tracker,
            events,
            state: Arc::new(StateCell::new(DeviceState::Running)),
            network: Arc::clone(network.shared()),
            pacing: Arc::new(MockPacingSource::new()),
            coordinator: None,
            standby: None,
            capture: None,
            settings,
        };
        let reconciler = Reconciler {
            ctx,
            built: 0,
            zoom_ratio: 1.0,
        };
        (reconciler, results_rx, bridge, network)
    }

    fn enqueue(r: &Reconciler, key: u64) {
        r.ctx.tracker.register(RequestKey(key));
        r.ctx.waiting.push(PendingRequest {
            key: RequestKey(key),
            request: CaptureRequest::new([StreamKind::Preview]),
            arrived: Instant::now(),
        });
    }

    #[test]
    fn test_pads_until_batch_is_full() {
        let (mut r, results, _bridge, _net) = harness(ReconcilerSettings {
            batch_size: 2,
            ..Default::default()
        });
        enqueue(&r, 1);
        r.iterate();
        let frame = results.try_recv().unwrap();
        assert_eq!(frame.kind, FrameKind::Internal);

        enqueue(&r, 2);
        r.iterate();
        let frame = results.try_recv().unwrap();
        assert_eq!(frame.kind, FrameKind::Preview);
        assert_eq!(frame.requests, vec![RequestKey(1), RequestKey(2)]);
        assert!(r.ctx.waiting.is_empty());
    }

    #[test]
    fn test_settle_frames_delay_consumption() {
        let (mut r, results, _bridge, _net) = harness(ReconcilerSettings {
            settle_frames: 2,
            ..Default::default()
        });
        enqueue(&r, 1);
        let kinds: Vec<_> = (0..3)
            .map(|_| {
                r.iterate();
                results.try_recv().unwrap().kind
            })
            .collect();
        assert_eq!(kinds, [FrameKind::Internal, FrameKind::Internal, FrameKind::Preview]);
    }

    #[test]
    fn test_one_frame_per_signal_with_monotonic_counts() {
        let (mut r, results, _bridge, _net) = harness(ReconcilerSettings::default());
        for key in 1..=3 {
            enqueue(&r, key);
        }
        let mut last = FrameCount(0);
        for _ in 0..5 {
            r.iterate();
            let frame = results.try_recv().unwrap();
            assert!(frame.count > last);
            last = frame.count;
            assert!(results.try_recv().is_err());
        }
    }

    #[test]
    fn test_still_without_capture_path_is_buffer_error() {
        let (mut r, _results, bridge, _net) = harness(ReconcilerSettings::default());
        r.ctx.tracker.register(RequestKey(1));
        r.ctx.waiting.push(PendingRequest {
            key: RequestKey(1),
            request: CaptureRequest::new([StreamKind::Still]),
            arrived: Instant::now(),
        });
        r.iterate();
        assert!(bridge.drain().any(|e| matches!(
            e,
            ClientEvent::BufferError {
                stream: StreamKind::Still,
                ..
            }
        )));
    }
}
