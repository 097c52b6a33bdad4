//! Dual-sensor operation coordinator.
//!
//! [`OperationCoordinator`] is a pure state machine consulted once per pacing
//! signal by the reconciliation loop. It decides the operation mode from the
//! zoom ratio, applies the settling window, chooses the display chain and
//! says which companion frame (if any) the other chain gets. Standby
//! operations it requests are executed by [`CoordinatorThread`], which
//! reports the outcome back.

use crate::hal::driver::StageDriver;
use crate::pipeline::frame::DualRole;
use crate::pipeline::monitor::Watchdog;
use crate::pipeline::thread::{LoopAction, LoopController};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    IndependentPrimary,
    IndependentSecondary,
    Synchronized,
}

impl OperationMode {
    /// Chain that stays awake in an independent mode.
    fn awake_role(self) -> Option<DualRole> {
        match self {
            OperationMode::IndependentPrimary => Some(DualRole::Primary),
            OperationMode::IndependentSecondary => Some(DualRole::Secondary),
            OperationMode::Synchronized => None,
        }
    }
}

/// Tunables for the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DualConfig {
    pub min_sync_zoom: f32,
    pub max_sync_zoom: f32,
    /// Frames that must pass after a committed transition before leaving sync.
    pub settling_window: u32,
    /// Warm-up frames a chain leaving standby produces.
    pub transition_frames: u32,
    pub standby_failure_limit: u32,
    /// Stay synchronized regardless of zoom.
    pub force_synchronized: bool,
}

impl Default for DualConfig {
    fn default() -> Self {
        Self {
            min_sync_zoom: 1.5,
            max_sync_zoom: 4.0,
            settling_window: 30,
            transition_frames: 3,
            standby_failure_limit: 3,
            force_synchronized: false,
        }
    }
}

/// Standby change for one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyOp {
    pub role: DualRole,
    pub standby: bool,
}

/// Extra frame for the non-display chain in this iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Companion {
    /// Paired internal frame at the same frame count.
    Internal(DualRole),
    /// Warm-up frame on a chain leaving standby.
    Transition(DualRole),
}

/// What the loop should do for one pacing signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode: OperationMode,
    /// Chain that carries client frames.
    pub display: DualRole,
    /// Build frames on the synchronized graphs.
    pub synchronized: bool,
    pub companion: Option<Companion>,
    pub standby: Vec<StandbyOp>,
    /// A mode transition was committed this iteration.
    pub transitioned: bool,
}

/// Result of reporting a standby outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandbyOutcome {
    Applied,
    /// Failed; the coordinator fell back to synchronized mode.
    Recovered,
    /// Failed too many times in a row.
    Escalate,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChainState {
    standby: bool,
    transition_left: u32,
}

#[derive(Debug)]
pub struct OperationCoordinator {
    config: DualConfig,
    mode: OperationMode,
    since_transition: u32,
    transitions: u64,
    primary: ChainState,
    secondary: ChainState,
    capture_locks: u32,
    standby_failures: u32,
    /// Ops requested by failure recovery, handed out with the next decision.
    queued: Vec<StandbyOp>,
}

impl OperationCoordinator {
    /// Start synchronized with both chains awake.
    pub fn new(config: DualConfig) -> Self {
        Self {
            config,
            mode: OperationMode::Synchronized,
            since_transition: config.settling_window,
            transitions: 0,
            primary: ChainState::default(),
            secondary: ChainState::default(),
            capture_locks: 0,
            standby_failures: 0,
            queued: Vec::new(),
        }
    }

    pub fn mode(&self) -> OperationMode {
        self.mode
    }

    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    pub fn config(&self) -> &DualConfig {
        &self.config
    }

    fn chain(&mut self, role: DualRole) -> &mut ChainState {
        match role {
            DualRole::Secondary => &mut self.secondary,
            _ => &mut self.primary,
        }
    }

    fn chain_ref(&self, role: DualRole) -> &ChainState {
        match role {
            DualRole::Secondary => &self.secondary,
            _ => &self.primary,
        }
    }

    /// Mode the zoom ratio asks for.
    pub fn desired_mode(&self, zoom_ratio: f32) -> OperationMode {
        if self.config.force_synchronized {
            OperationMode::Synchronized
        } else if zoom_ratio < self.config.min_sync_zoom {
            OperationMode::IndependentPrimary
        } else if zoom_ratio > self.config.max_sync_zoom {
            OperationMode::IndependentSecondary
        } else {
            OperationMode::Synchronized
        }
    }

    pub fn lock_capture(&mut self) {
        self.capture_locks += 1;
    }

    pub fn unlock_capture(&mut self) {
        self.capture_locks = self.capture_locks.saturating_sub(1);
    }

    pub fn capture_locked(&self) -> bool {
        self.capture_locks > 0
    }

    fn commit(&mut self, target: OperationMode, ops: &mut Vec<StandbyOp>) {
        let from = self.mode;
        match target.awake_role() {
            None => {
                // Wake whichever chain is asleep.
                for role in [DualRole::Primary, DualRole::Secondary] {
                    let transition_frames = self.config.transition_frames;
                    let chain = self.chain(role);
                    if chain.standby {
                        chain.standby = false;
                        chain.transition_left = transition_frames;
                        ops.push(StandbyOp {
                            role,
                            standby: false,
                        });
                    }
                }
            }
            Some(awake) => {
                if let Some(other) = awake.other() {
                    let chain = self.chain(other);
                    chain.standby = true;
                    chain.transition_left = 0;
                    ops.push(StandbyOp {
                        role: other,
                        standby: true,
                    });
                }
            }
        }
        self.mode = target;
        self.since_transition = 0;
        self.transitions += 1;
        tracing::info!(?from, to = ?target, "Dual operation mode transition");
    }

    /// Advance one pacing signal.
    pub fn on_frame(&mut self, zoom_ratio: f32) -> ModeDecision {
        let mut standby = std::mem::take(&mut self.queued);
        let desired = self.desired_mode(zoom_ratio);
        let mut transitioned = false;

        if desired != self.mode {
            // One step at a time: independent to independent goes through sync.
            let target = if self.mode == OperationMode::Synchronized {
                desired
            } else {
                OperationMode::Synchronized
            };
            // Entering sync is immediate; only leaving it waits out the window.
            let settled = target == OperationMode::Synchronized
                || self.since_transition >= self.config.settling_window;
            let locked = self.mode == OperationMode::Synchronized && self.capture_locked();
            if settled && !locked {
                self.commit(target, &mut standby);
                transitioned = true;
            }
        }
        self.since_transition = self.since_transition.saturating_add(1);

        let display = match self.mode {
            OperationMode::IndependentPrimary => DualRole::Primary,
            OperationMode::IndependentSecondary => DualRole::Secondary,
            OperationMode::Synchronized => {
                if self.primary.transition_left > 0 {
                    DualRole::Secondary
                } else {
                    DualRole::Primary
                }
            }
        };

        let mut companion = None;
        let mut synchronized = false;
        if self.mode == OperationMode::Synchronized {
            if let Some(other) = display.other() {
                let display_warm = self.chain_ref(display).transition_left == 0;
                let other_chain = *self.chain_ref(other);
                if other_chain.standby {
                    companion = None;
                } else if other_chain.transition_left > 0 {
                    self.chain(other).transition_left -= 1;
                    companion = Some(Companion::Transition(other));
                } else {
                    synchronized = display_warm;
                    companion = Some(Companion::Internal(other));
                }
            }
        }

        ModeDecision {
            mode: self.mode,
            display,
            synchronized,
            companion,
            standby,
            transitioned,
        }
    }

    /// Record the outcome of a standby operation.
    pub fn report_standby(&mut self, op: StandbyOp, ok: bool) -> StandbyOutcome {
        if ok {
            self.standby_failures = 0;
            return StandbyOutcome::Applied;
        }

        self.standby_failures += 1;
        tracing::warn!(
            role = ?op.role,
            standby = op.standby,
            failures = self.standby_failures,
            "Standby operation failed, forcing synchronized mode"
        );
        if op.standby {
            // The chain never went to sleep.
            self.chain(op.role).standby = false;
        }
        if self.mode != OperationMode::Synchronized {
            let mut ops = Vec::new();
            self.commit(OperationMode::Synchronized, &mut ops);
            self.queued.extend(ops);
        }

        if self.standby_failures >= self.config.standby_failure_limit {
            StandbyOutcome::Escalate
        } else {
            StandbyOutcome::Recovered
        }
    }
}

/// Queue between the reconciliation loop and the coordinator thread.
pub fn standby_queue() -> (Sender<StandbyOp>, Receiver<StandbyOp>) {
    bounded(16)
}

/// Dedicated thread executing standby operations against the sensor drivers.
pub struct CoordinatorThread {
    controller: LoopController,
}

impl CoordinatorThread {
    pub fn spawn(
        coordinator: Arc<Mutex<OperationCoordinator>>,
        ops: Receiver<StandbyOp>,
        primary: Arc<dyn StageDriver>,
        secondary: Arc<dyn StageDriver>,
        watchdog: Arc<Watchdog>,
    ) -> std::io::Result<Self> {
        let controller = LoopController::spawn("dual", move || {
            let op = match ops.recv_timeout(Duration::from_millis(50)) {
                Ok(op) => op,
                Err(RecvTimeoutError::Timeout) => return LoopAction::Continue,
                Err(RecvTimeoutError::Disconnected) => return LoopAction::Stop,
            };
            let driver = match op.role {
                DualRole::Secondary => &secondary,
                _ => &primary,
            };
            let result = driver.set_standby(op.standby);
            if let Err(e) = &result {
                tracing::warn!("Standby on {} failed: {}", driver.stage(), e);
            }
            let outcome = coordinator
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .report_standby(op, result.is_ok());
            if outcome == StandbyOutcome::Escalate {
                watchdog.raise("recurring sensor standby failures");
            }
            LoopAction::Continue
        })?;
        Ok(Self { controller })
    }

    pub fn stop(&mut self) {
        self.controller.stop();
    }
}
