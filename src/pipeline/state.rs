//! Device state shared between the session and the engine threads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    /// Streams configured, engine threads not running.
    Configured,
    Running,
    Flushing,
    /// Fatal error; only `close` is accepted.
    Error,
    Closed,
}

impl DeviceState {
    pub fn name(self) -> &'static str {
        match self {
            DeviceState::Configured => "configured",
            DeviceState::Running => "running",
            DeviceState::Flushing => "flushing",
            DeviceState::Error => "error",
            DeviceState::Closed => "closed",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `DeviceState` behind a mutex with a condvar for state waits.
pub struct StateCell {
    state: Mutex<DeviceState>,
    changed: Condvar,
}

impl StateCell {
    pub fn new(initial: DeviceState) -> Self {
        Self {
            state: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> DeviceState {
        *self.lock()
    }

    pub fn is(&self, state: DeviceState) -> bool {
        self.get() == state
    }

    pub fn set(&self, next: DeviceState) -> DeviceState {
        let mut state = self.lock();
        let prev = std::mem::replace(&mut *state, next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "Device state change");
            self.changed.notify_all();
        }
        prev
    }

    /// Move from `from` to `to`; returns false if the state was something else.
    pub fn transition(&self, from: DeviceState, to: DeviceState) -> bool {
        let mut state = self.lock();
        if *state != from {
            return false;
        }
        *state = to;
        tracing::debug!(from = %from, to = %to, "Device state change");
        self.changed.notify_all();
        true
    }

    /// Enter `Error` unless already there or closed. True exactly once.
    pub fn enter_error(&self) -> bool {
        let mut state = self.lock();
        if matches!(*state, DeviceState::Error | DeviceState::Closed) {
            return false;
        }
        *state = DeviceState::Error;
        self.changed.notify_all();
        true
    }

    /// Wait until the state satisfies `pred`. Returns the state seen last.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(DeviceState) -> bool) -> DeviceState {
        let state = self.lock();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| !pred(*s))
            .unwrap_or_else(|e| e.into_inner());
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_error_once() {
        let cell = StateCell::new(DeviceState::Running);
        assert!(cell.enter_error());
        assert!(!cell.enter_error());
        assert_eq!(cell.get(), DeviceState::Error);
    }

    #[test]
    fn test_transition_checks_source() {
        let cell = StateCell::new(DeviceState::Configured);
        assert!(!cell.transition(DeviceState::Running, DeviceState::Flushing));
        assert!(cell.transition(DeviceState::Configured, DeviceState::Running));
        assert_eq!(
            cell.wait_for(Duration::from_millis(1), |s| s == DeviceState::Running),
            DeviceState::Running
        );
    }
}
