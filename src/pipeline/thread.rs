//! Lifecycle for the engine's dedicated loop threads.
//!
//! Every engine thread runs the same shape of loop: check the stop signal,
//! run one iteration (which blocks with a timeout), repeat. The iteration
//! closure owns its state and decides whether to keep going.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Returned by a loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Stop,
}

/// Handle to a running loop thread.
pub struct LoopController {
    handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl LoopController {
    /// Spawn `name` running `step` until it returns `Stop` or the controller stops it.
    pub fn spawn<F>(name: &str, mut step: F) -> std::io::Result<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
    {
        Self::spawn_with_exit(name, move || step(), || {})
    }

    /// Like [`spawn`](Self::spawn), running `on_exit` on the loop thread after the last iteration.
    pub fn spawn_with_exit<F, E>(name: &str, mut step: F, on_exit: E) -> std::io::Result<Self>
    where
        F: FnMut() -> LoopAction + Send + 'static,
        E: FnOnce() + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_signal);
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("campipe-{name}"))
            .spawn(move || {
                debug!(name = %thread_name, "Loop thread started");
                while !stop.load(Ordering::SeqCst) {
                    if step() == LoopAction::Stop {
                        debug!(name = %thread_name, "Loop requested stop");
                        break;
                    }
                }
                on_exit();
                debug!(name = %thread_name, "Loop thread exiting");
            })?;

        Ok(Self {
            handle: Some(handle),
            stop_signal,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the loop to stop after its current iteration.
    pub fn signal_stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop and join.
    pub fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "Loop thread panicked");
            }
        }
    }
}

impl Drop for LoopController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[test]
    fn test_loop_stops_on_signal() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let mut ctl = LoopController::spawn("test", move || {
            c.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            LoopAction::Continue
        })
        .unwrap();
        thread::sleep(Duration::from_millis(20));
        ctl.stop();
        let seen = count.load(Ordering::SeqCst);
        assert!(seen > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_loop_exit_hook_runs() {
        let exited = Arc::new(AtomicBool::new(false));
        let e = Arc::clone(&exited);
        let mut ctl =
            LoopController::spawn_with_exit("once", || LoopAction::Stop, move || e.store(true, Ordering::SeqCst))
                .unwrap();
        ctl.stop();
        assert!(exited.load(Ordering::SeqCst));
    }
}
