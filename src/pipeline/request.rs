//! Capture requests, the waiting list and in-order completion tracking.
//!
//! The [`RequestTracker`] is the single place that emits
//! `ClientEvent::RequestComplete`. A request finishes once it has been
//! admitted (all of its frames built or it was aborted up front) and every
//! frame or capture job it is waiting on has been accounted for; completions
//! are then released strictly in [`RequestKey`] order.

use crate::pipeline::bridge::{ClientEvent, EventSender, RequestStatus};
use crate::pipeline::id::RequestKey;
use crate::pipeline::selector::SelectPolicy;
use crate::types::{Rect, StreamKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Per-frame parameters carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestParams {
    /// Sensor crop; full frame when absent.
    pub crop: Option<Rect>,
    pub zoom_ratio: f32,
    pub face_detect: bool,
    /// How a still capture picks its source frame.
    pub capture: SelectPolicy,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            crop: None,
            zoom_ratio: 1.0,
            face_detect: false,
            capture: SelectPolicy::Latest,
        }
    }
}

/// What the client submits.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub streams: Vec<StreamKind>,
    pub params: RequestParams,
}

impl CaptureRequest {
    pub fn new(streams: impl Into<Vec<StreamKind>>) -> Self {
        Self {
            streams: streams.into(),
            params: RequestParams::default(),
        }
    }

    pub fn with_params(mut self, params: RequestParams) -> Self {
        self.params = params;
        self
    }

    pub fn wants(&self, stream: StreamKind) -> bool {
        self.streams.contains(&stream)
    }
}

/// A validated request waiting for a frame.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub key: RequestKey,
    pub request: CaptureRequest,
    pub arrived: Instant,
}

/// FIFO of requests waiting for the reconciliation loop.
#[derive(Default)]
pub struct RequestQueue {
    waiting: Mutex<VecDeque<PendingRequest>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingRequest>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, pending: PendingRequest) {
        self.lock().push_back(pending);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop exactly `batch` requests if that many are waiting.
    pub fn take_batch(&self, batch: usize) -> Option<Vec<PendingRequest>> {
        let mut waiting = self.lock();
        if batch == 0 || waiting.len() < batch {
            return None;
        }
        Some(waiting.drain(..batch).collect())
    }

    pub fn drain(&self) -> Vec<PendingRequest> {
        self.lock().drain(..).collect()
    }
}

#[derive(Debug, Default)]
struct Record {
    outstanding: u32,
    admitted: bool,
    errored: bool,
    aborted: bool,
}

impl Record {
    fn finished(&self) -> bool {
        self.admitted && self.outstanding == 0
    }

    fn status(&self) -> RequestStatus {
        if self.aborted {
            RequestStatus::Aborted
        } else if self.errored {
            RequestStatus::PartialComplete
        } else {
            RequestStatus::Complete
        }
    }
}

#[derive(Default)]
struct TrackerState {
    records: BTreeMap<RequestKey, Record>,
    in_flight: usize,
    /// Frames built below this generation complete as aborted.
    fence: u64,
    completed: u64,
}

/// Request bookkeeping shared by the loop, the capture path and delivery.
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    drained: Condvar,
    events: EventSender,
}

impl RequestTracker {
    pub fn new(events: EventSender) -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            drained: Condvar::new(),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    /// Start tracking a request that has been assigned a key.
    pub fn register(&self, key: RequestKey) {
        self.lock().records.insert(key, Record::default());
    }

    /// One more frame or capture job now owes this request a result.
    pub fn add_outstanding(&self, key: RequestKey) {
        if let Some(record) = self.lock().records.get_mut(&key) {
            record.outstanding += 1;
        }
    }

    /// Every frame the request needs has been built.
    pub fn admit(&self, key: RequestKey) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(&key) {
            record.admitted = true;
        }
        self.emit_ready(&mut state);
    }

    /// Complete a request as aborted once its outstanding work returns.
    pub fn abort(&self, key: RequestKey) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(&key) {
            record.admitted = true;
            record.aborted = true;
        }
        self.emit_ready(&mut state);
    }

    /// A frame or job finished for these requests.
    pub fn finish(&self, keys: &[RequestKey], errored: &[RequestKey], aborted: bool) {
        let mut state = self.lock();
        for key in keys {
            if let Some(record) = state.records.get_mut(key) {
                record.outstanding = record.outstanding.saturating_sub(1);
                record.aborted |= aborted;
                record.errored |= errored.contains(key);
            }
        }
        self.emit_ready(&mut state);
    }

    /// Mark a stream failure without finishing anything.
    pub fn mark_error(&self, key: RequestKey) {
        if let Some(record) = self.lock().records.get_mut(&key) {
            record.errored = true;
        }
    }

    /// Force-complete every tracked request as aborted, in order.
    pub fn abort_all(&self) -> usize {
        let mut state = self.lock();
        let records = std::mem::take(&mut state.records);
        let count = records.len();
        for key in records.into_keys() {
            state.completed += 1;
            self.events.send(ClientEvent::RequestComplete {
                key,
                status: RequestStatus::Aborted,
            });
        }
        count
    }

    fn emit_ready(&self, state: &mut TrackerState) {
        while let Some(entry) = state.records.first_entry() {
            if !entry.get().finished() {
                break;
            }
            let key = *entry.key();
            let status = entry.remove().status();
            state.completed += 1;
            tracing::trace!(%key, ?status, "Request complete");
            self.events.send(ClientEvent::RequestComplete { key, status });
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().records.len()
    }

    pub fn completed(&self) -> u64 {
        self.lock().completed
    }

    pub fn frame_dispatched(&self) {
        self.lock().in_flight += 1;
    }

    pub fn frame_returned(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 {
            self.drained.notify_all();
        }
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Wait until no frame is in flight. Returns false on timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let state = self.lock();
        let (state, result) = self
            .drained
            .wait_timeout_while(state, timeout, |s| s.in_flight > 0)
            .unwrap_or_else(|e| e.into_inner());
        drop(state);
        !result.timed_out()
    }

    pub fn fence(&self) -> u64 {
        self.lock().fence
    }

    pub fn set_fence(&self, generation: u64) {
        self.lock().fence = generation;
    }
}
