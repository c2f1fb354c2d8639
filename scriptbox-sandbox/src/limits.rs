//! Deadline tracking and enforcement for a single execution

use crate::clock::{duration_ms, MonoClock};
use crate::engine::Interrupt;
use crate::lock_unpoisoned;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Monotonic elapsed-time tracker, created at call start and dropped at call end.
#[derive(Debug, Clone, Copy)]
pub struct ScriptLimiter {
    started: Instant,
}

impl ScriptLimiter {
    pub fn start() -> Self {
        Self {
            started: MonoClock::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn elapsed_ms(&self) -> u64 {
        duration_ms(self.elapsed())
    }

    /// True once more than `timeout_ms` has elapsed. A non-positive timeout never expires.
    pub fn exceeded(&self, timeout_ms: i64) -> bool {
        match u64::try_from(timeout_ms) {
            Ok(0) | Err(_) => false,
            Ok(limit) => self.elapsed() > Duration::from_millis(limit),
        }
    }

    /// Time left before `timeout_ms` expires; None when there is no limit
    pub fn remaining(&self, timeout_ms: i64) -> Option<Duration> {
        match u64::try_from(timeout_ms) {
            Ok(0) | Err(_) => None,
            Ok(limit) => Some(Duration::from_millis(limit).saturating_sub(self.elapsed())),
        }
    }
}

#[derive(Debug, Default)]
struct WatchState {
    done: bool,
    fired: bool,
}

/// Polls a [`ScriptLimiter`] and interrupts the running isolate once the deadline passes.
///
/// The interrupt is delivered under the same lock that [`Watchdog::disarm`] takes,
/// so it can never land after the run has been marked done.
pub struct Watchdog {
    state: Arc<Mutex<WatchState>>,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Start watching. Must be called from within a tokio runtime.
    pub fn arm(
        limiter: ScriptLimiter,
        timeout_ms: i64,
        cadence: Duration,
        interrupter: Arc<dyn Interrupt>,
    ) -> Self {
        let state = Arc::new(Mutex::new(WatchState::default()));
        if timeout_ms <= 0 {
            return Self { state, task: None };
        }

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut state = lock_unpoisoned(&shared);
                if state.done {
                    return;
                }
                if limiter.exceeded(timeout_ms) {
                    state.fired = true;
                    interrupter.interrupt();
                    tracing::warn!(
                        timeout_ms,
                        elapsed_ms = limiter.elapsed_ms(),
                        "Deadline exceeded, isolate interrupted"
                    );
                    return;
                }
            }
        });

        Self {
            state,
            task: Some(task),
        }
    }

    /// Mark the run as finished. Returns whether the deadline fired.
    pub fn disarm(&self) -> bool {
        let mut state = lock_unpoisoned(&self.state);
        state.done = true;
        state.fired
    }

    pub fn fired(&self) -> bool {
        lock_unpoisoned(&self.state).fired
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        lock_unpoisoned(&self.state).done = true;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
