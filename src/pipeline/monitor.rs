//! Monitor/watchdog.
//!
//! The monitor thread wakes every interval and bumps renewal counters that the
//! lane workers and result delivery reset whenever they make progress. A
//! counter that outgrows its limit, or a stall raised by another component,
//! is fatal: the monitor is the only component that moves the device into
//! `Error`, and it does so exactly once.

use crate::pipeline::bridge::{ClientEvent, EventSender};
use crate::pipeline::dual::{OperationCoordinator, OperationMode};
use crate::pipeline::id::StageId;
use crate::pipeline::request::{RequestQueue, RequestTracker};
use crate::pipeline::selector::{FrameSelector, SelectorStats};
use crate::pipeline::state::{DeviceState, StateCell};
use crate::pipeline::thread::{LoopAction, LoopController};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Monitor tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub stage_stall_ticks: u32,
    pub result_stall_ticks: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            stage_stall_ticks: 15,
            result_stall_ticks: 25,
        }
    }
}

/// Renewal counters and the external stall flag.
pub struct Watchdog {
    lanes: BTreeMap<StageId, Arc<AtomicU32>>,
    result: AtomicU32,
    error_check: Option<StageId>,
    stall: Mutex<Option<String>>,
    last_latency_us: AtomicU64,
}

impl Watchdog {
    pub fn new(lanes: impl IntoIterator<Item = StageId>, error_check: Option<StageId>) -> Self {
        Self {
            lanes: lanes
                .into_iter()
                .map(|l| (l, Arc::new(AtomicU32::new(0))))
                .collect(),
            result: AtomicU32::new(0),
            error_check,
            stall: Mutex::new(None),
            last_latency_us: AtomicU64::new(0),
        }
    }

    /// Renewal counter for a lane worker.
    pub fn lane(&self, leader: StageId) -> Option<Arc<AtomicU32>> {
        self.lanes.get(&leader).cloned()
    }

    pub fn renew_result(&self, latency: Duration) {
        self.result.store(0, Ordering::Relaxed);
        self.last_latency_us
            .store(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Report a stall from outside the monitor. The first reason wins.
    pub fn raise(&self, reason: &str) {
        let mut stall = self.stall.lock().unwrap_or_else(|e| e.into_inner());
        if stall.is_none() {
            tracing::error!("Stall raised: {}", reason);
            *stall = Some(reason.to_string());
        }
    }

    pub(crate) fn take_stall(&self) -> Option<String> {
        self.stall.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn tick(&self) {
        for counter in self.lanes.values() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.result.fetch_add(1, Ordering::Relaxed);
    }

    /// Clear every counter, e.g. after a restart.
    pub fn reset(&self) {
        for counter in self.lanes.values() {
            counter.store(0, Ordering::Relaxed);
        }
        self.result.store(0, Ordering::Relaxed);
    }

    /// Check counters against the limits; returns the stall reason if any.
    fn check(&self, settings: &MonitorSettings) -> Option<String> {
        if let Some(reason) = self.take_stall() {
            return Some(reason);
        }
        if let Some(lane) = self.error_check {
            let renew = self.lanes.get(&lane).map_or(0, |c| c.load(Ordering::Relaxed));
            if renew > settings.stage_stall_ticks {
                return Some(format!("stage {lane} stopped completing frames ({renew} ticks)"));
            }
        }
        let result = self.result.load(Ordering::Relaxed);
        if result > settings.result_stall_ticks {
            return Some(format!("result delivery stopped ({result} ticks)"));
        }
        None
    }
}

/// Per-lane entry of a health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LaneHealth {
    pub stage: StageId,
    pub renew: u32,
}

/// Point-in-time view of engine health.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub state: DeviceState,
    pub lanes: Vec<LaneHealth>,
    pub error_check_lane: Option<StageId>,
    pub result_renew: u32,
    pub frames_in_flight: usize,
    pub pending_requests: usize,
    pub completed_requests: u64,
    pub last_result_latency_ms: f64,
    pub selector: Option<SelectorStats>,
    pub operation_mode: Option<OperationMode>,
}

/// Everything the monitor touches.
#[derive(Clone)]
pub struct MonitorContext {
    pub state: Arc<StateCell>,
    pub tracker: Arc<RequestTracker>,
    pub waiting: Arc<RequestQueue>,
    pub watchdog: Arc<Watchdog>,
    pub events: EventSender,
    pub selector: Option<Arc<FrameSelector>>,
    pub coordinator: Option<Arc<Mutex<OperationCoordinator>>>,
}

impl MonitorContext {
    pub fn snapshot(&self) -> HealthSnapshot {
        let w = &self.watchdog;
        HealthSnapshot {
            timestamp: Utc::now(),
            state: self.state.get(),
            lanes: w
                .lanes
                .iter()
                .map(|(stage, c)| LaneHealth {
                    stage: *stage,
                    renew: c.load(Ordering::Relaxed),
                })
                .collect(),
            error_check_lane: w.error_check,
            result_renew: w.result.load(Ordering::Relaxed),
            frames_in_flight: self.tracker.in_flight(),
            pending_requests: self.tracker.pending(),
            completed_requests: self.tracker.completed(),
            last_result_latency_ms: w.last_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            selector: self.selector.as_ref().map(|s| s.stats()),
            operation_mode: self
                .coordinator
                .as_ref()
                .map(|c| c.lock().unwrap_or_else(|e| e.into_inner()).mode()),
        }
    }

    /// Enter `Error`, notify the client once and abort every pending request.
    pub fn declare_fatal(&self, reason: &str) -> bool {
        if !self.state.enter_error() {
            return false;
        }
        tracing::error!("Device error: {}", reason);
        self.events.send(ClientEvent::DeviceError {
            reason: reason.to_string(),
        });
        let waiting = self.waiting.drain();
        let aborted = self.tracker.abort_all();
        if let Some(selector) = &self.selector {
            selector.cancel();
        }
        tracing::warn!(
            waiting = waiting.len(),
            aborted,
            "Aborted pending requests after device error"
        );
        true
    }

    /// One monitor tick.
    fn run_once(&self, settings: &MonitorSettings) {
        if self.state.get() != DeviceState::Running {
            return;
        }
        if self.tracker.in_flight() > 0 {
            self.watchdog.tick();
        }
        if let Some(reason) = self.watchdog.check(settings) {
            self.declare_fatal(&reason);
        }
    }
}

/// Spawn the monitor thread.
pub fn spawn_monitor(ctx: MonitorContext, settings: MonitorSettings) -> std::io::Result<LoopController> {
    tracing::info!(interval_ms = settings.interval.as_millis() as u64, "Starting monitor");
    LoopController::spawn("monitor", move || {
        thread::sleep(settings.interval);
        ctx.run_once(&settings);
        if matches!(ctx.state.get(), DeviceState::Error | DeviceState::Closed) {
            LoopAction::Stop
        } else {
            LoopAction::Continue
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bridge::ClientBridge;
    use crate::pipeline::id::RequestKey;

    fn context() -> (MonitorContext, ClientBridge) {
        let (bridge, tx) = ClientBridge::new();
        let ctx = MonitorContext {
            state: Arc::new(StateCell::new(DeviceState::Running)),
            tracker: Arc::new(RequestTracker::new(tx.clone())),
            waiting: Arc::new(RequestQueue::new()),
            watchdog: Arc::new(Watchdog::new(
                [StageId::Sensor, StageId::Bayer],
                Some(StageId::Bayer),
            )),
            events: tx,
            selector: None,
            coordinator: None,
        };
        (ctx, bridge)
    }

    fn settings() -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_millis(1),
            stage_stall_ticks: 2,
            result_stall_ticks: 100,
        }
    }

    #[test]
    fn test_idle_engine_never_stalls() {
        let (ctx, bridge) = context();
        for _ in 0..10 {
            ctx.run_once(&settings());
        }
        assert_eq!(ctx.state.get(), DeviceState::Running);
        assert!(bridge.try_recv().is_none());
    }

    #[test]
    fn test_stage_stall_is_fatal_once() {
        let (ctx, bridge) = context();
        ctx.tracker.register(RequestKey(1));
        ctx.tracker.frame_dispatched();
        for _ in 0..5 {
            ctx.run_once(&settings());
        }
        assert_eq!(ctx.state.get(), DeviceState::Error);
        let events: Vec<_> = bridge.drain().collect();
        let device_errors = events
            .iter()
            .filter(|e| matches!(e, ClientEvent::DeviceError { .. }))
            .count();
        assert_eq!(device_errors, 1);
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::RequestComplete {
                key: RequestKey(1),
                ..
            }
        )));
    }

    #[test]
    fn test_renewal_prevents_stall() {
        let (ctx, _bridge) = context();
        ctx.tracker.frame_dispatched();
        let lane = ctx.watchdog.lane(StageId::Bayer).unwrap();
        for _ in 0..10 {
            ctx.run_once(&settings());
            lane.store(0, Ordering::Relaxed);
        }
        assert_eq!(ctx.state.get(), DeviceState::Running);
    }

    #[test]
    fn test_raised_stall_is_fatal() {
        let (ctx, bridge) = context();
        ctx.watchdog.raise("result delivery timed out");
        ctx.run_once(&settings());
        assert_eq!(ctx.state.get(), DeviceState::Error);
        assert!(matches!(
            bridge.try_recv(),
            Some(ClientEvent::DeviceError { reason }) if reason.contains("timed out")
        ));
    }

    #[test]
    fn test_snapshot_serializes() {
        let (ctx, _bridge) = context();
        let json = serde_json::to_string(&ctx.snapshot()).unwrap();
        assert!(json.contains("\"state\":\"running\""));
        assert!(json.contains("\"error_check_lane\":\"bayer\""));
    }
}
