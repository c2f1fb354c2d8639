//! Scriptbox - embedded JavaScript execution in pooled, policy-checked isolates
//!
//! Callers hand code and variables to an [`ExecutionBridge`]. Each call is
//! validated against a [`SandboxPolicy`], runs in an isolate borrowed from a
//! bounded [`IsolateManager`] pool under a watchdog-enforced deadline, and the
//! result comes back as a `serde_json::Value`.

mod bridge;
mod clock;
mod config;
pub mod engine;
mod error;
pub mod fakes;
mod limits;
mod policy;
mod pool;
mod registry;
mod types;
pub mod value;

pub use bridge::{ExecutionBridge, ScriptExecutor};
pub use clock::{ExecutionId, IsolateId, MonoClock, ScriptId};
pub use config::{PoolConfig, SandboxConfig};
#[cfg(feature = "v8")]
pub use engine::{V8Engine, V8EngineConfig};
pub use engine::{EngineIsolate, Interrupt, ScriptEngine};
pub use error::{
    EngineError, ErrorKind, Exhaustion, PolicyViolation, SandboxError, SandboxResult,
    ScriptFailure,
};
pub use limits::{ScriptLimiter, Watchdog};
pub use policy::{SandboxGuard, SandboxPolicy, DEFAULT_MAX_CPU_MILLIS, DEFAULT_MAX_HEAP_BYTES};
pub use pool::{IsolateLease, IsolateManager, PoolStats};
pub use registry::{ScriptHandle, ScriptRegistry};
pub use types::{ExecutionOptions, ExecutionRequest, RunGrants, RunRequest, Variables};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
