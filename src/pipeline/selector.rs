//! Capture/reprocessing frame selector.
//!
//! A bounded history of raw sensor buffers from client-visible frames. The
//! sensor path pushes entries as frames finish with their raw buffer; the
//! capture worker picks one by policy and takes ownership of its buffer.
//! Evicted entries go straight back to the buffer authority.

use crate::hal::buffer::{Buffer, BufferAuthority};
use crate::pipeline::frame::DualRole;
use crate::pipeline::id::FrameCount;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// How to pick a history entry for a still capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectPolicy {
    /// Newest valid entry.
    #[default]
    Latest,
    /// Newest valid entry with at least one detected face.
    WithFaces,
    /// Sharpest of the newest `window` valid entries.
    BestSharpness { window: usize },
    /// The entry for one specific frame.
    FrameCount(FrameCount),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SelectError {
    #[error("no history entry matched the selection policy")]
    NotFound,
    #[error("selection was cancelled")]
    Cancelled,
}

/// One retained raw frame.
#[derive(Debug)]
pub struct HistoryEntry {
    pub frame: FrameCount,
    pub role: DualRole,
    pub buffer: Buffer,
    pub valid: bool,
    pub faces: Option<u32>,
    pub sharpness: Option<f32>,
}

impl HistoryEntry {
    pub fn new(frame: FrameCount, role: DualRole, buffer: Buffer) -> Self {
        Self {
            frame,
            role,
            buffer,
            valid: true,
            faces: None,
            sharpness: None,
        }
    }
}

/// Selector counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SelectorStats {
    pub held: usize,
    pub hold_count: usize,
    pub inserted: u64,
    pub evicted: u64,
    pub selected: u64,
}

struct SelectorState {
    ring: VecDeque<HistoryEntry>,
    hold_count: usize,
    cancel_epoch: u64,
    inserted: u64,
    evicted: u64,
    selected: u64,
}

pub struct FrameSelector {
    state: Mutex<SelectorState>,
    arrived: Condvar,
    authority: Arc<dyn BufferAuthority>,
}

impl FrameSelector {
    pub fn new(hold_count: usize, authority: Arc<dyn BufferAuthority>) -> Self {
        Self {
            state: Mutex::new(SelectorState {
                ring: VecDeque::with_capacity(hold_count),
                hold_count,
                cancel_epoch: 0,
                inserted: 0,
                evicted: 0,
                selected: 0,
            }),
            arrived: Condvar::new(),
            authority,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SelectorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an entry, evicting oldest-first beyond the hold count.
    ///
    /// Evicted buffers are released before this returns.
    pub fn push(&self, entry: HistoryEntry) {
        let evicted = {
            let mut state = self.lock();
            state.ring.push_back(entry);
            state.inserted += 1;
            let evicted = Self::trim(&mut state);
            self.arrived.notify_all();
            evicted
        };
        self.release_all(evicted);
    }

    fn trim(state: &mut SelectorState) -> Vec<HistoryEntry> {
        let mut out = Vec::new();
        while state.ring.len() > state.hold_count {
            if let Some(old) = state.ring.pop_front() {
                state.evicted += 1;
                out.push(old);
            }
        }
        out
    }

    fn release_all(&self, entries: Vec<HistoryEntry>) {
        for entry in entries {
            tracing::trace!(frame = %entry.frame, buffer = %entry.buffer.id, "Releasing history entry");
            self.authority.release(entry.buffer);
        }
    }

    fn find(ring: &VecDeque<HistoryEntry>, policy: SelectPolicy) -> Option<usize> {
        let newest_valid = || ring.iter().enumerate().rev().filter(|(_, e)| e.valid);
        match policy {
            SelectPolicy::Latest => newest_valid().map(|(i, _)| i).next(),
            SelectPolicy::WithFaces => newest_valid()
                .find(|(_, e)| e.faces.is_some_and(|n| n > 0))
                .map(|(i, _)| i),
            SelectPolicy::BestSharpness { window } => {
                let mut best: Option<(usize, f32)> = None;
                for (i, e) in newest_valid().take(window.max(1)) {
                    let score = e.sharpness.unwrap_or(0.0);
                    // Newest wins ties.
                    if best.map_or(true, |(_, s)| score > s) {
                        best = Some((i, score));
                    }
                }
                best.map(|(i, _)| i)
            }
            SelectPolicy::FrameCount(n) => newest_valid().find(|(_, e)| e.frame == n).map(|(i, _)| i),
        }
    }

    /// Whether waiting could ever satisfy `policy`.
    fn can_arrive(ring: &VecDeque<HistoryEntry>, policy: SelectPolicy) -> bool {
        match policy {
            SelectPolicy::FrameCount(n) => ring.back().map_or(true, |e| e.frame < n),
            _ => true,
        }
    }

    /// Take the entry matching `policy`, waiting up to `timeout` for one to arrive.
    pub fn select(&self, policy: SelectPolicy, timeout: Duration) -> Result<HistoryEntry, SelectError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        let epoch = state.cancel_epoch;

        loop {
            if state.cancel_epoch != epoch {
                return Err(SelectError::Cancelled);
            }
            if let Some(index) = Self::find(&state.ring, policy) {
                state.selected += 1;
                return state.ring.remove(index).ok_or(SelectError::NotFound);
            }
            if !Self::can_arrive(&state.ring, policy) {
                return Err(SelectError::NotFound);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SelectError::NotFound);
            }
            let (guard, _) = self
                .arrived
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// Wake every blocked `select` with `Cancelled`.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.cancel_epoch += 1;
        self.arrived.notify_all();
    }

    /// Exclude an entry from selection without releasing it yet.
    pub fn invalidate(&self, frame: FrameCount) -> bool {
        let mut state = self.lock();
        match state.ring.iter_mut().find(|e| e.frame == frame) {
            Some(entry) => {
                entry.valid = false;
                true
            }
            None => false,
        }
    }

    /// Attach externally evaluated metadata to an entry.
    pub fn annotate(&self, frame: FrameCount, faces: Option<u32>, sharpness: Option<f32>) {
        let mut state = self.lock();
        if let Some(entry) = state.ring.iter_mut().find(|e| e.frame == frame) {
            if faces.is_some() {
                entry.faces = faces;
            }
            if sharpness.is_some() {
                entry.sharpness = sharpness;
            }
            self.arrived.notify_all();
        }
    }

    /// Release every entry.
    pub fn clear(&self) {
        let drained: Vec<HistoryEntry> = {
            let mut state = self.lock();
            state.ring.drain(..).collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "Clearing frame selector");
        }
        self.release_all(drained);
    }

    pub fn set_hold_count(&self, hold_count: usize) {
        let evicted = {
            let mut state = self.lock();
            state.hold_count = hold_count;
            Self::trim(&mut state)
        };
        self.release_all(evicted);
    }

    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SelectorStats {
        let state = self.lock();
        SelectorStats {
            held: state.ring.len(),
            hold_count: state.hold_count,
            inserted: state.inserted,
            evicted: state.evicted,
            selected: state.selected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::buffer::{BufferId, BufferTag, MockBufferAuthority};
    use crate::pipeline::id::StageId;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn buffer(id: u64) -> Buffer {
        Buffer::new(
            BufferId(id),
            BufferTag::Stage {
                stage: StageId::Sensor,
                port: 0,
            },
        )
    }

    fn counting_authority() -> (Arc<dyn BufferAuthority>, Arc<AtomicUsize>) {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let mut mock = MockBufferAuthority::new();
        mock.expect_release().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (Arc::new(mock), released)
    }

    fn entry(n: u64) -> HistoryEntry {
        HistoryEntry::new(FrameCount(n), DualRole::Single, buffer(n))
    }

    #[test]
    fn test_eviction_releases_oldest() {
        let (authority, released) = counting_authority();
        let sel = FrameSelector::new(2, authority);
        for n in 1..=4 {
            sel.push(entry(n));
        }
        assert_eq!(released.load(Ordering::SeqCst), 2);
        let got = sel.select(SelectPolicy::Latest, Duration::ZERO).unwrap();
        assert_eq!(got.frame, FrameCount(4));
        let got = sel.select(SelectPolicy::Latest, Duration::ZERO).unwrap();
        assert_eq!(got.frame, FrameCount(3));
    }

    #[test]
    fn test_policies() {
        let (authority, _) = counting_authority();
        let sel = FrameSelector::new(8, authority);
        for n in 1..=5 {
            sel.push(entry(n));
        }
        sel.annotate(FrameCount(2), Some(1), None);
        sel.annotate(FrameCount(3), None, Some(0.9));
        sel.annotate(FrameCount(5), None, Some(0.4));

        let faces = sel.select(SelectPolicy::WithFaces, Duration::ZERO).unwrap();
        assert_eq!(faces.frame, FrameCount(2));

        let sharp = sel
            .select(SelectPolicy::BestSharpness { window: 3 }, Duration::ZERO)
            .unwrap();
        assert_eq!(sharp.frame, FrameCount(3));

        let exact = sel
            .select(SelectPolicy::FrameCount(FrameCount(1)), Duration::ZERO)
            .unwrap();
        assert_eq!(exact.frame, FrameCount(1));
    }

    #[test]
    fn test_invalidated_entries_are_skipped() {
        let (authority, _) = counting_authority();
        let sel = FrameSelector::new(4, authority);
        sel.push(entry(1));
        sel.push(entry(2));
        assert!(sel.invalidate(FrameCount(2)));
        let got = sel.select(SelectPolicy::Latest, Duration::ZERO).unwrap();
        assert_eq!(got.frame, FrameCount(1));
        assert_eq!(
            sel.select(SelectPolicy::Latest, Duration::ZERO).unwrap_err(),
            SelectError::NotFound
        );
    }

    #[test]
    fn test_past_frame_count_fails_fast() {
        let (authority, _) = counting_authority();
        let sel = FrameSelector::new(4, authority);
        sel.push(entry(10));
        let start = Instant::now();
        let err = sel
            .select(SelectPolicy::FrameCount(FrameCount(3)), Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err, SelectError::NotFound);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_select_waits_for_arrival() {
        let (authority, _) = counting_authority();
        let sel = Arc::new(FrameSelector::new(4, authority));
        let producer = Arc::clone(&sel);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push(entry(1));
        });
        let got = sel.select(SelectPolicy::Latest, Duration::from_secs(2)).unwrap();
        assert_eq!(got.frame, FrameCount(1));
        handle.join().unwrap();
    }

    #[test]
    fn test_cancel_wakes_select() {
        let (authority, _) = counting_authority();
        let sel = Arc::new(FrameSelector::new(4, authority));
        let waiter = Arc::clone(&sel);
        let handle = thread::spawn(move || waiter.select(SelectPolicy::WithFaces, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        sel.cancel();
        assert_eq!(handle.join().unwrap().unwrap_err(), SelectError::Cancelled);
    }

    #[test]
    fn test_clear_and_shrink_release() {
        let (authority, released) = counting_authority();
        let sel = FrameSelector::new(4, authority);
        for n in 1..=4 {
            sel.push(entry(n));
        }
        sel.set_hold_count(1);
        assert_eq!(released.load(Ordering::SeqCst), 3);
        sel.clear();
        assert_eq!(released.load(Ordering::SeqCst), 4);
        assert!(sel.is_empty());
        assert_eq!(sel.stats().evicted, 3);
    }

    proptest! {
        #[test]
        fn prop_eviction_never_leaks(hold in 1usize..8, pushes in 0u64..40, takes in 0usize..5) {
            let (authority, released) = counting_authority();
            let sel = FrameSelector::new(hold, authority);
            for n in 0..pushes {
                sel.push(entry(n));
            }
            let mut taken = 0usize;
            for _ in 0..takes {
                if sel.select(SelectPolicy::Latest, Duration::ZERO).is_ok() {
                    taken += 1;
                }
            }
            let stats = sel.stats();
            prop_assert!(stats.held <= hold);
            prop_assert_eq!(stats.evicted as usize, released.load(Ordering::SeqCst));
            prop_assert_eq!(
                pushes as usize,
                released.load(Ordering::SeqCst) + stats.held + taken
            );
        }
    }
}
