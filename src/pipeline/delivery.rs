//! Result delivery.
//!
//! Every frame leaving a stage network ends up here exactly once. Delivery
//! hands filled stream buffers to the client, releases everything else to the
//! buffer authority, emits per-request metadata and tells the tracker which
//! requests the frame has finished.

use crate::hal::buffer::BufferAuthority;
use crate::pipeline::bridge::{ClientEvent, EventSender};
use crate::pipeline::dual::OperationCoordinator;
use crate::pipeline::frame::{Frame, FrameKind};
use crate::pipeline::id::RequestKey;
use crate::pipeline::monitor::Watchdog;
use crate::pipeline::request::RequestTracker;
use crate::pipeline::state::{DeviceState, StateCell};
use crate::pipeline::thread::{LoopAction, LoopController};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consecutive empty waits with frames in flight before delivery reports a stall.
pub const DELIVERY_TIMEOUT_LIMIT: u32 = 3;

/// Counters kept by the delivery thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub frames: u64,
    pub aborted_frames: u64,
    pub buffers_delivered: u64,
    pub buffers_failed: u64,
}

pub struct DeliveryContext {
    pub tracker: Arc<RequestTracker>,
    pub events: EventSender,
    pub buffers: Arc<dyn BufferAuthority>,
    pub watchdog: Arc<Watchdog>,
    pub state: Arc<StateCell>,
    pub coordinator: Option<Arc<Mutex<OperationCoordinator>>>,
    stats: Mutex<DeliveryStats>,
}

impl DeliveryContext {
    pub fn new(
        tracker: Arc<RequestTracker>,
        events: EventSender,
        buffers: Arc<dyn BufferAuthority>,
        watchdog: Arc<Watchdog>,
        state: Arc<StateCell>,
        coordinator: Option<Arc<Mutex<OperationCoordinator>>>,
    ) -> Self {
        Self {
            tracker,
            events,
            buffers,
            watchdog,
            state,
            coordinator,
            stats: Mutex::new(DeliveryStats::default()),
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver one finished frame.
    pub fn deliver(&self, mut frame: Frame) {
        let aborted = frame.generation < self.tracker.fence()
            || matches!(self.state.get(), DeviceState::Error | DeviceState::Closed);
        self.watchdog.renew_result(frame.created.elapsed());

        // Anything the hardware dequeued that never reached a worker.
        for buffer in std::mem::take(&mut frame.dequeued) {
            if let Err(buffer) = frame.retarget(buffer) {
                self.buffers.release(buffer);
            }
        }

        let requests = frame.requests.clone();
        let mut errored: Vec<RequestKey> = Vec::new();
        let mut delivered = 0u64;
        let mut failed = 0u64;

        for entity in frame.entities_mut() {
            for slot in &mut entity.dst {
                let (Some(stream), Some(&key)) = (slot.stream(), requests.get(slot.batch)) else {
                    continue;
                };
                match slot.buffer.take() {
                    Some(buffer) if !aborted && !slot.error => {
                        delivered += 1;
                        self.events.send(ClientEvent::BufferComplete { key, stream, buffer });
                    }
                    taken => {
                        if let Some(buffer) = taken {
                            self.buffers.release(buffer);
                        }
                        if !slot.error {
                            self.events.send(ClientEvent::BufferError { key, stream });
                            slot.error = true;
                        }
                        failed += 1;
                        if !errored.contains(&key) {
                            errored.push(key);
                        }
                    }
                }
            }
        }

        for buffer in frame.take_buffers() {
            self.buffers.release(buffer);
        }

        let mut keys = requests;
        keys.dedup();

        if frame.kind == FrameKind::Preview && !aborted {
            for &key in &keys {
                self.events.send(ClientEvent::Metadata {
                    key,
                    frame: frame.count,
                    metadata: frame.metadata.clone(),
                });
            }
        }
        if frame.kind == FrameKind::Reprocessing {
            if let Some(coordinator) = &self.coordinator {
                coordinator.lock().unwrap_or_else(|e| e.into_inner()).unlock_capture();
            }
        }

        tracing::trace!(
            frame = %frame.count,
            kind = ?frame.kind,
            aborted,
            delivered,
            failed,
            "Frame delivered"
        );
        if !keys.is_empty() {
            self.tracker.finish(&keys, &errored, aborted);
        }
        self.tracker.frame_returned();

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.frames += 1;
        stats.aborted_frames += aborted as u64;
        stats.buffers_delivered += delivered;
        stats.buffers_failed += failed;
    }
}

/// Spawn the delivery thread. It drains `rx` on exit.
pub fn spawn_delivery(
    ctx: Arc<DeliveryContext>,
    rx: Receiver<Frame>,
    timeout: Duration,
) -> std::io::Result<LoopController> {
    let exit_ctx = Arc::clone(&ctx);
    let exit_rx = rx.clone();
    let mut timeouts = 0u32;

    LoopController::spawn_with_exit(
        "delivery",
        move || match rx.recv_timeout(timeout) {
            Ok(frame) => {
                timeouts = 0;
                ctx.deliver(frame);
                LoopAction::Continue
            }
            Err(RecvTimeoutError::Timeout) => {
                if ctx.state.is(DeviceState::Running) && ctx.tracker.in_flight() > 0 {
                    timeouts += 1;
                    tracing::debug!(timeouts, in_flight = ctx.tracker.in_flight(), "Result wait timed out");
                    if timeouts >= DELIVERY_TIMEOUT_LIMIT {
                        ctx.watchdog.raise("result delivery timed out");
                        timeouts = 0;
                    }
                } else {
                    timeouts = 0;
                }
                LoopAction::Continue
            }
            Err(RecvTimeoutError::Disconnected) => LoopAction::Stop,
        },
        move || {
            while let Ok(frame) = exit_rx.try_recv() {
                exit_ctx.deliver(frame);
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::buffer::{Buffer, BufferId, MockBufferAuthority};
    use crate::pipeline::bridge::{ClientBridge, RequestStatus};
    use crate::pipeline::factory::{single_key, FrameFactory, FrameSpec, SlotRequest};
    use crate::pipeline::id::StageId;
    use crate::pipeline::request::RequestParams;
    use crate::pipeline::stage::{ConnectionTable, FeatureFlags};
    use crate::types::{Size, StreamKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (DeliveryContext, ClientBridge, Arc<AtomicUsize>) {
        let (bridge, events) = ClientBridge::new();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let mut mock = MockBufferAuthority::new();
        mock.expect_release().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let ctx = DeliveryContext::new(
            Arc::new(RequestTracker::new(events.clone())),
            events,
            Arc::new(mock),
            Arc::new(Watchdog::new([StageId::Sensor], None)),
            Arc::new(StateCell::new(DeviceState::Running)),
            None,
        );
        (ctx, bridge, released)
    }

    fn preview_frame(generation: u64) -> Frame {
        let f = FrameFactory::new(
            ConnectionTable::default_single(),
            FeatureFlags::default(),
            Size::new(4000, 3000),
        );
        let mut frame = f
            .build(FrameSpec {
                count: f.next_count(),
                kind: FrameKind::Preview,
                key: single_key(),
                generation,
                slots: vec![SlotRequest {
                    key: RequestKey(1),
                    streams: vec![StreamKind::Preview],
                }],
                params: RequestParams::default(),
                retain_raw: false,
            })
            .unwrap();
        for entity in frame.entities_mut() {
            for slot in &mut entity.dst {
                slot.buffer = Some(Buffer::new(BufferId(slot.port as u64 + 100), slot.tag));
            }
        }
        frame
    }

    #[test]
    fn test_delivers_stream_and_releases_internal() {
        let (ctx, bridge, released) = setup();
        ctx.tracker.register(RequestKey(1));
        ctx.tracker.add_outstanding(RequestKey(1));
        ctx.tracker.admit(RequestKey(1));
        ctx.tracker.frame_dispatched();

        ctx.deliver(preview_frame(0));

        let events: Vec<_> = bridge.drain().collect();
        assert!(matches!(
            events[0],
            ClientEvent::BufferComplete {
                stream: StreamKind::Preview,
                ..
            }
        ));
        assert!(matches!(events[1], ClientEvent::Metadata { .. }));
        assert!(matches!(
            events[2],
            ClientEvent::RequestComplete {
                status: RequestStatus::Complete,
                ..
            }
        ));
        // sensor raw hand-off buffer
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.tracker.in_flight(), 0);
    }

    #[test]
    fn test_fenced_frame_is_aborted() {
        let (ctx, bridge, released) = setup();
        ctx.tracker.register(RequestKey(1));
        ctx.tracker.add_outstanding(RequestKey(1));
        ctx.tracker.admit(RequestKey(1));
        ctx.tracker.set_fence(1);

        ctx.deliver(preview_frame(0));

        let events: Vec<_> = bridge.drain().collect();
        assert!(events
            .iter()
            .all(|e| !matches!(e, ClientEvent::BufferComplete { .. } | ClientEvent::Metadata { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            ClientEvent::RequestComplete {
                status: RequestStatus::Aborted,
                ..
            }
        )));
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.stats().aborted_frames, 1);
    }

    #[test]
    fn test_errored_slot_is_partial() {
        let (ctx, bridge, _released) = setup();
        ctx.tracker.register(RequestKey(1));
        ctx.tracker.add_outstanding(RequestKey(1));
        ctx.tracker.admit(RequestKey(1));

        let mut frame = preview_frame(0);
        frame.entity_mut(StageId::Mcsc).unwrap().dst[0].error = true;
        ctx.deliver(frame);

        let last = bridge.drain().last().unwrap();
        assert!(matches!(
            last,
            ClientEvent::RequestComplete {
                status: RequestStatus::PartialComplete,
                ..
            }
        ));
    }
}
