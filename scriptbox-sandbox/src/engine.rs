//! Script engine abstraction and implementations

#[cfg(feature = "v8")]
pub mod v8;

use crate::error::{EngineError, ScriptFailure};
use crate::policy::SandboxPolicy;
use crate::types::RunRequest;
use std::sync::Arc;

#[cfg(feature = "v8")]
pub use v8::{V8Engine, V8EngineConfig, V8Isolate};

/// Best-effort interruption of a running script, callable from any thread
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// Factory for isolates
pub trait ScriptEngine: Send + Sync + 'static {
    type Isolate: EngineIsolate;

    /// Get engine name
    fn name(&self) -> &str;

    /// Create a fresh isolate whose hard limits and installed capabilities come from `policy`
    fn create_isolate(&self, policy: &SandboxPolicy) -> Result<Self::Isolate, EngineError>;
}

/// A single stateful execution context. Never used by two callers at once.
pub trait EngineIsolate: Send + 'static {
    /// Parse `source` without running it
    fn check_syntax(&mut self, source: &str) -> Result<(), ScriptFailure>;

    /// Run `request.source` with `request.variables` visible as globals.
    /// Whatever the run declares or assigns globally is gone before the next run.
    fn run(&mut self, request: &RunRequest) -> Result<serde_json::Value, ScriptFailure>;

    /// Handle the watchdog uses to stop a run in progress
    fn interrupter(&self) -> Arc<dyn Interrupt>;

    /// True once the engine considers this isolate unsafe to reuse
    fn is_corrupted(&self) -> bool {
        false
    }

    /// Release native resources
    fn destroy(self);
}
