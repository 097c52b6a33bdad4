//! Camera sessions.
//!
//! A [`Session`] owns everything one open camera needs: the configuration,
//! the hardware handles, the request tracker and, while running, the engine
//! threads (reconciliation loop, lane workers, result delivery, capture path,
//! dual coordinator and monitor). The [`SessionRegistry`] maps camera ids to
//! open sessions.
//!
//! # Lifecycle
//!
//! ```text
//! open ──► Configured ──start──► Running ──flush──► Flushing ──► Running
//!              ▲                    │
//!              └───────stop─────────┘        (monitor) ──► Error ──close──► Closed
//! ```
//!
//! Stream and connection changes are only accepted while `Configured`.

use crate::config::PipelineConfig;
use crate::error::{CampipeError, Result};
use crate::hal::{Buffer, Hardware};
use crate::pipeline::bridge::{ClientBridge, EventSender};
use crate::pipeline::capture::{spawn_capture, CaptureContext, CaptureJob};
use crate::pipeline::delivery::{spawn_delivery, DeliveryContext, DeliveryStats};
use crate::pipeline::dual::{standby_queue, CoordinatorThread, OperationCoordinator};
use crate::pipeline::factory::{single_key, FrameFactory};
use crate::pipeline::frame::DualRole;
use crate::pipeline::id::{CameraId, RequestKey, StageId};
use crate::pipeline::monitor::{spawn_monitor, HealthSnapshot, MonitorContext, Watchdog};
use crate::pipeline::network::{NetworkKind, StageNetwork};
use crate::pipeline::plan::GraphKey;
use crate::pipeline::reconciler::{spawn_reconciler, ReconcilerContext};
use crate::pipeline::request::{CaptureRequest, PendingRequest, RequestQueue, RequestTracker};
use crate::pipeline::selector::{FrameSelector, SelectPolicy};
use crate::pipeline::stage::ConnectionTable;
use crate::pipeline::state::{DeviceState, StateCell};
use crate::pipeline::thread::LoopController;
use crate::pipeline::worker::{StageHandler, SyncPairing, WorkerSettings};
use crate::types::StreamConfig;
use crossbeam_channel::unbounded;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Engine threads of a running session.
struct Engine {
    preview: StageNetwork,
    reprocessing: Option<StageNetwork>,
    reconciler: Option<LoopController>,
    capture: Option<LoopController>,
    coordinator: Option<CoordinatorThread>,
    delivery: LoopController,
    monitor: LoopController,
    monitor_ctx: MonitorContext,
    delivery_ctx: Arc<DeliveryContext>,
    watchdog: Arc<Watchdog>,
}

/// One open camera.
pub struct Session {
    id: CameraId,
    config: Mutex<PipelineConfig>,
    hardware: Hardware,
    state: Arc<StateCell>,
    factory: Arc<FrameFactory>,
    waiting: Arc<RequestQueue>,
    tracker: Arc<RequestTracker>,
    events: EventSender,
    selector: Mutex<Option<Arc<FrameSelector>>>,
    coordinator: Mutex<Option<Arc<Mutex<OperationCoordinator>>>>,
    next_key: AtomicU64,
    engine: Mutex<Option<Engine>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn invalid_state(expected: &str, found: DeviceState) -> CampipeError {
    CampipeError::InvalidState {
        expected: expected.to_string(),
        found: found.to_string(),
    }
}

/// Pick the post-processing for a preview lane from the stages it runs.
fn lane_handler(
    table: &ConnectionTable,
    leader: StageId,
    selector: Option<&Arc<FrameSelector>>,
    pair_timeout: Duration,
) -> StageHandler {
    if leader == StageId::Sync {
        return StageHandler::Sync(SyncPairing::new(pair_timeout));
    }
    let Some(selector) = selector else {
        return StageHandler::Generic;
    };
    let members = table.lane_members(leader);
    if members
        .iter()
        .any(|m| matches!(m, StageId::Bayer | StageId::BayerSecondary))
    {
        StageHandler::Capture(Arc::clone(selector))
    } else if members.contains(&StageId::Vra) {
        StageHandler::FaceDetect(Arc::clone(selector))
    } else {
        StageHandler::Generic
    }
}

impl Session {
    /// Open a session in `Configured`. The returned bridge receives every client event.
    pub fn open(id: CameraId, config: PipelineConfig, hardware: Hardware) -> Result<(Self, ClientBridge)> {
        config.validate()?;
        let (bridge, events) = ClientBridge::new();

        let factory = FrameFactory::new(
            config.connections.clone(),
            config.features,
            config.pipeline.sensor_size,
        );
        factory.set_streams(config.streams.clone());

        let session = Self {
            id,
            hardware,
            state: Arc::new(StateCell::new(DeviceState::Configured)),
            factory: Arc::new(factory),
            waiting: Arc::new(RequestQueue::new()),
            tracker: Arc::new(RequestTracker::new(events.clone())),
            events,
            selector: Mutex::new(None),
            coordinator: Mutex::new(None),
            next_key: AtomicU64::new(1),
            engine: Mutex::new(None),
            config: Mutex::new(config),
        };
        session.rebuild_side_channels();

        tracing::info!(camera = %id, "Session opened");
        Ok((session, bridge))
    }

    pub fn id(&self) -> CameraId {
        self.id
    }

    pub fn state(&self) -> DeviceState {
        self.state.get()
    }

    pub fn config(&self) -> PipelineConfig {
        lock(&self.config).clone()
    }

    /// Wait up to `timeout` for the device to reach `state`.
    pub fn wait_for_state(&self, state: DeviceState, timeout: Duration) -> bool {
        self.state.wait_for(timeout, |s| s == state) == state
    }

    fn rebuild_side_channels(&self) {
        let config = lock(&self.config);

        let mut selector = lock(&self.selector);
        match (&*selector, config.selector.enabled) {
            (Some(existing), true) => existing.set_hold_count(config.selector.hold_count),
            (None, true) => {
                *selector = Some(Arc::new(FrameSelector::new(
                    config.selector.hold_count,
                    Arc::clone(&self.hardware.buffers),
                )))
            }
            (Some(existing), false) => {
                existing.clear();
                *selector = None;
            }
            (None, false) => {}
        }

        *lock(&self.coordinator) = config
            .features
            .dual_sensor
            .then(|| Arc::new(Mutex::new(OperationCoordinator::new(config.dual))));
    }

    fn require_configured(&self) -> Result<()> {
        match self.state.get() {
            DeviceState::Configured => Ok(()),
            other => Err(invalid_state("configured", other)),
        }
    }

    /// Replace the configured client streams.
    pub fn configure_streams(&self, streams: Vec<StreamConfig>) -> Result<()> {
        self.require_configured()?;
        let mut candidate = self.config();
        candidate.streams = streams;
        candidate.validate()?;

        self.factory.set_streams(candidate.streams.clone());
        tracing::info!(camera = %self.id, streams = candidate.streams.len(), "Streams configured");
        *lock(&self.config) = candidate;
        Ok(())
    }

    /// Swap in a new configuration. The sensor size is fixed for the session.
    pub fn reconfigure(&self, config: PipelineConfig) -> Result<()> {
        self.require_configured()?;
        config.validate()?;
        if config.pipeline.sensor_size != self.factory.sensor_size() {
            return Err(CampipeError::Config(format!(
                "sensor_size cannot change on an open session ({} -> {})",
                self.factory.sensor_size(),
                config.pipeline.sensor_size
            )));
        }

        self.factory
            .reconfigure(config.connections.clone(), config.features);
        self.factory.set_streams(config.streams.clone());
        *lock(&self.config) = config;
        self.rebuild_side_channels();
        tracing::info!(camera = %self.id, generation = self.factory.generation(), "Session reconfigured");
        Ok(())
    }

    fn start_networks(&self, engine: &mut Engine, settings: WorkerSettings) -> Result<()> {
        let table = self.factory.table();
        let selector = lock(&self.selector).clone();
        let watchdog = Arc::clone(&engine.watchdog);

        engine.preview.start(
            settings,
            |leader| lane_handler(&table, leader, selector.as_ref(), settings.pair_timeout),
            |leader| watchdog.lane(leader),
        )?;
        if let Some(network) = engine.reprocessing.as_mut() {
            network.start(settings, |_| StageHandler::Generic, |leader| watchdog.lane(leader))?;
        }
        Ok(())
    }

    /// Spawn the engine and move to `Running`.
    pub fn start(&self) -> Result<()> {
        let mut slot = lock(&self.engine);
        self.require_configured()?;

        let config = self.config();
        let table = self.factory.table();
        let flags = self.factory.flags();
        let selector = lock(&self.selector).clone();
        let coordinator = lock(&self.coordinator).clone();

        let preview_leaders = NetworkKind::Preview.leaders(&table, &flags);
        let reprocessing_leaders = if flags.reprocessing {
            NetworkKind::Reprocessing.leaders(&table, &flags)
        } else {
            Vec::new()
        };

        let check_key = if flags.dual_sensor {
            GraphKey::preview(DualRole::Primary, false)
        } else {
            single_key()
        };
        let error_check = self.factory.plan(check_key)?.error_check_lane();
        let watchdog = Arc::new(Watchdog::new(
            preview_leaders.iter().chain(&reprocessing_leaders).copied(),
            error_check,
        ));

        let (results_tx, results_rx) = unbounded();
        let preview = StageNetwork::new(
            NetworkKind::Preview,
            &preview_leaders,
            &self.hardware.drivers,
            Arc::clone(&self.hardware.buffers),
            results_tx.clone(),
            Arc::clone(&self.tracker),
            self.events.clone(),
        )?;
        let reprocessing = if reprocessing_leaders.is_empty() {
            None
        } else {
            Some(StageNetwork::new(
                NetworkKind::Reprocessing,
                &reprocessing_leaders,
                &self.hardware.drivers,
                Arc::clone(&self.hardware.buffers),
                results_tx,
                Arc::clone(&self.tracker),
                self.events.clone(),
            )?)
        };

        let delivery_ctx = Arc::new(DeliveryContext::new(
            Arc::clone(&self.tracker),
            self.events.clone(),
            Arc::clone(&self.hardware.buffers),
            Arc::clone(&watchdog),
            Arc::clone(&self.state),
            coordinator.clone(),
        ));
        let delivery = spawn_delivery(Arc::clone(&delivery_ctx), results_rx, config.result_timeout())?;

        let monitor_ctx = MonitorContext {
            state: Arc::clone(&self.state),
            tracker: Arc::clone(&self.tracker),
            waiting: Arc::clone(&self.waiting),
            watchdog: Arc::clone(&watchdog),
            events: self.events.clone(),
            selector: selector.clone(),
            coordinator: coordinator.clone(),
        };

        let mut engine = Engine {
            preview,
            reprocessing,
            reconciler: None,
            capture: None,
            coordinator: None,
            delivery,
            monitor: spawn_monitor(monitor_ctx.clone(), config.monitor_settings())?,
            monitor_ctx,
            delivery_ctx,
            watchdog: Arc::clone(&watchdog),
        };
        self.start_networks(&mut engine, config.worker_settings())?;

        let capture_tx = match (&engine.reprocessing, &selector) {
            (Some(network), Some(selector)) => {
                let (tx, rx) = unbounded::<CaptureJob>();
                let ctx = Arc::new(CaptureContext {
                    factory: Arc::clone(&self.factory),
                    selector: Arc::clone(selector),
                    network: Arc::clone(network.shared()),
                    tracker: Arc::clone(&self.tracker),
                    state: Arc::clone(&self.state),
                    coordinator: coordinator.clone(),
                    select_timeout: config.capture_timeout(),
                });
                engine.capture = Some(spawn_capture(ctx, rx, config.worker_settings().poll)?);
                Some(tx)
            }
            _ => None,
        };

        let standby_tx = match &coordinator {
            Some(coordinator) => {
                let driver = |stage: StageId| {
                    self.hardware
                        .drivers
                        .get(&stage)
                        .cloned()
                        .ok_or_else(|| CampipeError::driver(stage, "dual mode needs a sensor driver"))
                };
                let (tx, rx) = standby_queue();
                engine.coordinator = Some(CoordinatorThread::spawn(
                    Arc::clone(coordinator),
                    rx,
                    driver(StageId::Sensor)?,
                    driver(StageId::SensorSecondary)?,
                    Arc::clone(&watchdog),
                )?);
                Some(tx)
            }
            None => None,
        };

        if !self.state.transition(DeviceState::Configured, DeviceState::Running) {
            let found = self.state.get();
            self.shutdown(engine, config.flush_timeout());
            return Err(invalid_state("configured", found));
        }

        engine.reconciler = Some(spawn_reconciler(ReconcilerContext {
            factory: Arc::clone(&self.factory),
            waiting: Arc::clone(&self.waiting),
            tracker: Arc::clone(&self.tracker),
            events: self.events.clone(),
            state: Arc::clone(&self.state),
            network: Arc::clone(engine.preview.shared()),
            pacing: Arc::clone(&self.hardware.pacing),
            coordinator,
            standby: standby_tx,
            capture: capture_tx,
            settings: config.reconciler_settings(),
        })?);

        tracing::info!(
            camera = %self.id,
            lanes = ?engine.preview.leaders(),
            reprocessing = engine.reprocessing.is_some(),
            ?error_check,
            "Session started"
        );
        *slot = Some(engine);
        Ok(())
    }

    /// Stop engine threads, completing every outstanding request.
    fn shutdown(&self, mut engine: Engine, timeout: Duration) {
        if let Some(mut reconciler) = engine.reconciler.take() {
            reconciler.stop();
        }
        let selector = lock(&self.selector).clone();
        if let Some(selector) = &selector {
            selector.cancel();
        }
        if let Some(mut capture) = engine.capture.take() {
            capture.stop();
        }
        for pending in self.waiting.drain() {
            self.tracker.abort(pending.key);
        }
        if let Some(mut coordinator) = engine.coordinator.take() {
            coordinator.stop();
        }

        if self.tracker.wait_drained(timeout) {
            engine.preview.stop();
            if let Some(network) = engine.reprocessing.as_mut() {
                network.stop();
            }
        } else {
            tracing::warn!(in_flight = self.tracker.in_flight(), "Frames did not drain, forcing stop");
            engine.preview.force_stop();
            if let Some(network) = engine.reprocessing.as_mut() {
                network.force_stop();
            }
        }

        engine.delivery.stop();
        engine.monitor.stop();

        let aborted = self.tracker.abort_all();
        if aborted > 0 {
            tracing::warn!(aborted, "Aborted requests left after shutdown");
        }
        if let Some(selector) = &selector {
            selector.clear();
        }
    }

    /// Stop the engine and return to `Configured`. A session in `Error` stays there.
    pub fn stop(&self) -> Result<()> {
        let found = self.state.get();
        match found {
            DeviceState::Closed => return Err(invalid_state("running", found)),
            DeviceState::Running => {
                self.state.transition(DeviceState::Running, DeviceState::Flushing);
            }
            _ => {}
        }

        let engine = lock(&self.engine).take();
        if let Some(engine) = engine {
            let timeout = lock(&self.config).flush_timeout();
            self.shutdown(engine, timeout);
            tracing::info!(camera = %self.id, "Session stopped");
        }
        self.state.transition(DeviceState::Flushing, DeviceState::Configured);
        for pending in self.waiting.drain() {
            self.tracker.abort(pending.key);
        }
        Ok(())
    }

    /// Complete every in-flight and waiting request, then resume.
    ///
    /// Frames already inside the network finish as aborted. If they do not
    /// drain within the flush timeout the lanes are force-stopped and
    /// restarted.
    pub fn flush(&self) -> Result<()> {
        match self.state.get() {
            DeviceState::Running => {}
            DeviceState::Configured => return Ok(()),
            other => return Err(invalid_state("running", other)),
        }
        let mut engine = lock(&self.engine);
        if !self.state.transition(DeviceState::Running, DeviceState::Flushing) {
            return Err(invalid_state("running", self.state.get()));
        }

        let started = Instant::now();
        let fence = self.tracker.fence() + 1;
        self.tracker.set_fence(fence);

        let waiting = self.waiting.drain();
        for pending in &waiting {
            self.tracker.abort(pending.key);
        }
        let selector = lock(&self.selector).clone();
        if let Some(selector) = &selector {
            selector.cancel();
        }

        let config = self.config();
        let mut forced = false;
        if let Some(engine) = engine.as_mut() {
            if !self.tracker.wait_drained(config.flush_timeout()) {
                forced = true;
                tracing::warn!(in_flight = self.tracker.in_flight(), "Flush timed out, forcing lanes");
                engine.preview.force_stop();
                if let Some(network) = engine.reprocessing.as_mut() {
                    network.force_stop();
                }
                if !self.tracker.wait_drained(config.flush_timeout()) {
                    tracing::error!(in_flight = self.tracker.in_flight(), "Frames lost during forced flush");
                }
                self.start_networks(engine, config.worker_settings())?;
                engine.watchdog.reset();
            }
        }

        let leftover = self.tracker.abort_all();
        if let Some(selector) = &selector {
            selector.clear();
        }
        if !self.state.transition(DeviceState::Flushing, DeviceState::Running) {
            tracing::warn!(state = %self.state.get(), "Device left flushing during flush");
        }
        tracing::info!(
            camera = %self.id,
            fence,
            waiting = waiting.len(),
            leftover,
            forced,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Flush complete"
        );
        Ok(())
    }

    /// Tear everything down. Idempotent.
    pub fn close(&self) {
        if self.state.is(DeviceState::Closed) {
            return;
        }
        if let Err(e) = self.stop() {
            tracing::warn!(camera = %self.id, "Stop during close failed: {}", e);
        }
        self.state.set(DeviceState::Closed);
        self.tracker.abort_all();
        if let Some(selector) = lock(&self.selector).take() {
            selector.clear();
        }
        tracing::info!(camera = %self.id, "Session closed");
    }

    fn check_request(&self, key: RequestKey, request: &CaptureRequest) -> Result<()> {
        let reject = |reason: String| {
            Err(CampipeError::InvalidRequest {
                key: key.0,
                reason,
            })
        };
        let state = self.state.get();
        if state != DeviceState::Running {
            return reject(format!("device is {state}"));
        }
        if request.streams.is_empty() {
            return reject("no streams requested".into());
        }
        if let Some(stream) = request
            .streams
            .iter()
            .find(|&&s| self.factory.stream_config(s).is_none())
        {
            return reject(format!("stream {stream} is not configured"));
        }
        let params = &request.params;
        if let Some(crop) = params.crop {
            if !crop.fits_within(self.factory.sensor_size()) {
                return reject(format!("crop {crop:?} is outside the sensor"));
            }
        }
        if !params.zoom_ratio.is_finite() || params.zoom_ratio <= 0.0 {
            return reject(format!("zoom ratio {} is not positive", params.zoom_ratio));
        }
        if let SelectPolicy::BestSharpness { window: 0 } = params.capture {
            return reject("sharpness window is empty".into());
        }
        Ok(())
    }

    /// Queue a capture request.
    ///
    /// Always returns a key unless the session is closed. A request that
    /// cannot be serviced completes `Aborted` without building a frame.
    pub fn submit_request(&self, request: CaptureRequest) -> Result<RequestKey> {
        if self.state.is(DeviceState::Closed) {
            return Err(invalid_state("running", DeviceState::Closed));
        }
        let key = RequestKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.tracker.register(key);

        if let Err(e) = self.check_request(key, &request) {
            tracing::warn!("{}", e);
            self.tracker.abort(key);
            return Ok(key);
        }
        tracing::trace!(%key, streams = ?request.streams, "Request queued");
        self.waiting.push(PendingRequest {
            key,
            request,
            arrived: Instant::now(),
        });
        Ok(key)
    }

    /// Hand a client-owned buffer back to the buffer authority.
    pub fn return_buffer(&self, buffer: Buffer) {
        self.hardware.buffers.release(buffer);
    }

    /// Current health, while the engine is running.
    pub fn health(&self) -> Option<HealthSnapshot> {
        lock(&self.engine).as_ref().map(|e| e.monitor_ctx.snapshot())
    }

    pub fn delivery_stats(&self) -> Option<DeliveryStats> {
        lock(&self.engine).as_ref().map(|e| e.delivery_ctx.stats())
    }

    pub fn pending_requests(&self) -> usize {
        self.tracker.pending()
    }

    pub fn selector(&self) -> Option<Arc<FrameSelector>> {
        lock(&self.selector).clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let engine = lock(&self.engine).take();
        if let Some(engine) = engine {
            let timeout = lock(&self.config).flush_timeout();
            self.shutdown(engine, timeout);
        }
    }
}

/// Open sessions by camera id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<CameraId, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &self,
        id: CameraId,
        config: PipelineConfig,
        hardware: Hardware,
    ) -> Result<(Arc<Session>, ClientBridge)> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&id) {
            return Err(CampipeError::Config(format!("camera {id} is already open")));
        }
        let (session, bridge) = Session::open(id, config, hardware)?;
        let session = Arc::new(session);
        sessions.insert(id, Arc::clone(&session));
        Ok((session, bridge))
    }

    pub fn get(&self, id: CameraId) -> Option<Arc<Session>> {
        lock(&self.sessions).get(&id).cloned()
    }

    /// Close and forget a session. Returns false if it was not open.
    pub fn close(&self, id: CameraId) -> bool {
        let session = lock(&self.sessions).remove(&id);
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<CameraId> {
        let mut ids: Vec<_> = lock(&self.sessions).keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{ManualPacing, SimHardware};
    use crate::pipeline::bridge::{ClientEvent, RequestStatus};
    use crate::types::StreamKind;

    fn open() -> (Session, ClientBridge, crate::hal::sim::PacingHandle) {
        let sim = SimHardware::new(16);
        let (pacing, handle) = ManualPacing::new();
        let (session, bridge) =
            Session::open(CameraId(0), PipelineConfig::default(), sim.hardware(Arc::new(pacing)))
                .unwrap();
        (session, bridge, handle)
    }

    fn completions(bridge: &ClientBridge) -> Vec<(RequestKey, RequestStatus)> {
        bridge
            .drain()
            .filter_map(|e| match e {
                ClientEvent::RequestComplete { key, status } => Some((key, status)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_lane_handler_selection() {
        let table = ConnectionTable::default_single();
        let selector = Arc::new(FrameSelector::new(
            2,
            Arc::new(crate::hal::sim::SimBufferPool::new(4)),
        ));
        let timeout = Duration::from_millis(10);
        assert!(matches!(
            lane_handler(&table, StageId::Sensor, Some(&selector), timeout),
            StageHandler::Capture(_)
        ));
        assert!(matches!(
            lane_handler(&table, StageId::Vra, Some(&selector), timeout),
            StageHandler::FaceDetect(_)
        ));
        assert!(matches!(
            lane_handler(&table, StageId::Sensor, None, timeout),
            StageHandler::Generic
        ));
        assert!(matches!(
            lane_handler(&table, StageId::Sync, None, timeout),
            StageHandler::Sync(_)
        ));
    }

    #[test]
    fn test_request_before_start_is_aborted() {
        let (session, bridge, _handle) = open();
        let key = session
            .submit_request(CaptureRequest::new([StreamKind::Preview]))
            .unwrap();
        assert_eq!(completions(&bridge), vec![(key, RequestStatus::Aborted)]);
    }

    #[test]
    fn test_configure_requires_configured_state() {
        let (session, _bridge, _handle) = open();
        session.start().unwrap();
        let err = session.configure_streams(Vec::new()).unwrap_err();
        assert!(matches!(err, CampipeError::InvalidState { .. }));
        session.stop().unwrap();
        assert_eq!(session.state(), DeviceState::Configured);
    }

    #[test]
    fn test_reconfigure_rejects_sensor_change() {
        let (session, _bridge, _handle) = open();
        let mut config = PipelineConfig::default();
        config.pipeline.sensor_size = crate::types::Size::new(1920, 1080);
        for stream in &mut config.streams {
            stream.size = crate::types::Size::new(640, 480);
        }
        assert!(matches!(
            session.reconfigure(config),
            Err(CampipeError::Config(_))
        ));
    }

    #[test]
    fn test_invalid_request_aborts_with_key() {
        let (session, bridge, _handle) = open();
        session.start().unwrap();
        let empty = session.submit_request(CaptureRequest::new(Vec::new())).unwrap();
        let mut bad_zoom = CaptureRequest::new([StreamKind::Preview]);
        bad_zoom.params.zoom_ratio = 0.0;
        let zoom = session.submit_request(bad_zoom).unwrap();
        assert_eq!(
            completions(&bridge),
            vec![(empty, RequestStatus::Aborted), (zoom, RequestStatus::Aborted)]
        );
        session.close();
    }

    #[test]
    fn test_closed_session_refuses_requests() {
        let (session, _bridge, _handle) = open();
        session.close();
        assert_eq!(session.state(), DeviceState::Closed);
        assert!(session
            .submit_request(CaptureRequest::new([StreamKind::Preview]))
            .is_err());
        assert!(session.start().is_err());
    }

    #[test]
    fn test_registry_rejects_duplicate_ids() {
        let registry = SessionRegistry::new();
        let sim = SimHardware::new(4);
        let (pacing, _handle) = ManualPacing::new();
        registry
            .open(CameraId(1), PipelineConfig::default(), sim.hardware(Arc::new(pacing)))
            .unwrap();
        let (pacing, _handle2) = ManualPacing::new();
        assert!(registry
            .open(CameraId(1), PipelineConfig::default(), sim.hardware(Arc::new(pacing)))
            .is_err());
        assert_eq!(registry.ids(), vec![CameraId(1)]);
        assert!(registry.close(CameraId(1)));
        assert!(registry.get(CameraId(1)).is_none());
    }
}
