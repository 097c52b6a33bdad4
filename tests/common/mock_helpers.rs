//! Simulated-hardware rigs and event collection

use super::test_timeout;
use campipe::config::PipelineConfig;
use campipe::hal::sim::{ManualPacing, PacingHandle, SimHardware};
use campipe::pipeline::{
    CameraId, ClientBridge, ClientEvent, FrameCount, RequestKey, RequestStatus, Session,
};
use campipe::types::StreamKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A client event with the buffer already handed back
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Buffer { key: RequestKey, stream: StreamKind },
    BufferError { key: RequestKey, stream: StreamKind },
    Metadata { key: RequestKey, frame: FrameCount },
    Complete { key: RequestKey, status: RequestStatus },
    DeviceError(String),
}

/// A session on simulated hardware with manual pacing
pub struct SimRig {
    pub sim: SimHardware,
    pub pacing: PacingHandle,
    pub session: Session,
    pub bridge: ClientBridge,
    pub seen: Vec<Seen>,
}

impl SimRig {
    pub fn new(config: PipelineConfig) -> Self {
        let sim = SimHardware::new(16);
        let (pacing, handle) = ManualPacing::new();
        let (session, bridge) = Session::open(CameraId(0), config, sim.hardware(Arc::new(pacing)))
            .expect("session should open");
        Self {
            sim,
            pacing: handle,
            session,
            bridge,
            seen: Vec::new(),
        }
    }

    /// Open and start
    pub fn running(config: PipelineConfig) -> Self {
        let rig = Self::new(config);
        rig.session.start().expect("session should start");
        rig
    }

    pub fn tick(&self, n: usize) {
        self.pacing.tick_n(n);
    }

    fn record(&mut self, event: ClientEvent) {
        let seen = match event {
            ClientEvent::BufferComplete { key, stream, buffer } => {
                self.session.return_buffer(buffer);
                Seen::Buffer { key, stream }
            }
            ClientEvent::BufferError { key, stream } => Seen::BufferError { key, stream },
            ClientEvent::Metadata { key, frame, .. } => Seen::Metadata { key, frame },
            ClientEvent::RequestComplete { key, status } => Seen::Complete { key, status },
            ClientEvent::DeviceError { reason } => Seen::DeviceError(reason),
        };
        self.seen.push(seen);
    }

    /// Pull whatever is queued right now
    pub fn drain(&mut self) {
        let events: Vec<_> = self.bridge.drain().collect();
        for event in events {
            self.record(event);
        }
    }

    /// Collect events until `done` holds or the test timeout passes
    pub fn wait_until(&mut self, done: impl Fn(&[Seen]) -> bool) -> bool {
        let deadline = Instant::now() + test_timeout();
        while !done(&self.seen) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if let Some(event) = self.bridge.recv_timeout((deadline - now).min(Duration::from_millis(20))) {
                self.record(event);
            }
        }
        true
    }

    /// Wait for `n` request completions
    pub fn wait_completions(&mut self, n: usize) -> Vec<(RequestKey, RequestStatus)> {
        self.wait_until(|seen| completions(seen).len() >= n);
        completions(&self.seen)
    }

    pub fn completions(&self) -> Vec<(RequestKey, RequestStatus)> {
        completions(&self.seen)
    }
}

impl Drop for SimRig {
    fn drop(&mut self) {
        self.session.close();
    }
}

pub fn completions(seen: &[Seen]) -> Vec<(RequestKey, RequestStatus)> {
    seen.iter()
        .filter_map(|s| match s {
            Seen::Complete { key, status } => Some((*key, *status)),
            _ => None,
        })
        .collect()
}
