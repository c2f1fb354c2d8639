//! V8 JavaScript engine using deno_core
//!
//! V8 isolates are `!Send`, so each isolate lives on a dedicated thread with its
//! own single-threaded tokio runtime. [`V8Isolate`] is the `Send` handle the pool
//! owns: it forwards jobs over a channel and keeps a thread-safe isolate handle
//! so the watchdog can terminate a run from outside.

mod host;
mod ops;

use super::{EngineIsolate, Interrupt, ScriptEngine};
use crate::error::{EngineError, ScriptFailure};
use crate::policy::SandboxPolicy;
use crate::types::RunRequest;
use deno_core::v8;
use host::{IsolateSettings, Job};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Settings shared by every isolate the engine creates
#[derive(Debug, Clone, Default)]
pub struct V8EngineConfig {
    /// Scripts run once in each new isolate, after the sandbox bootstrap
    pub prelude: Vec<String>,
}

/// V8 JavaScript engine
#[derive(Debug, Clone, Default)]
pub struct V8Engine {
    config: V8EngineConfig,
}

impl V8Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: V8EngineConfig) -> Self {
        Self { config }
    }

    /// Add initialization code run in every new isolate
    pub fn with_prelude(mut self, code: impl Into<String>) -> Self {
        self.config.prelude.push(code.into());
        self
    }
}

impl ScriptEngine for V8Engine {
    type Isolate = V8Isolate;

    fn name(&self) -> &str {
        "v8"
    }

    fn create_isolate(&self, policy: &SandboxPolicy) -> Result<V8Isolate, EngineError> {
        let settings = IsolateSettings {
            max_heap_bytes: policy.max_heap_bytes,
            io: policy.allow_io,
            network: policy.allow_network,
            prelude: self.config.prelude.clone(),
        };

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (job_tx, job_rx) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("scriptbox-isolate".to_string())
            .spawn(move || host::isolate_main(settings, ready_tx, job_rx))
            .map_err(|e| EngineError(format!("Failed to spawn isolate thread: {}", e)))?;

        let startup = match ready_rx.recv() {
            Ok(result) => result,
            Err(_) => Err("isolate thread exited during startup".to_string()),
        };

        match startup {
            Ok(handle) => Ok(V8Isolate {
                jobs: Some(job_tx),
                interrupter: Arc::new(V8Interrupter { handle }),
                thread: Some(thread),
                corrupted: false,
            }),
            Err(reason) => {
                drop(job_tx);
                let _ = thread.join();
                Err(EngineError(reason))
            }
        }
    }
}

/// Terminates whatever the isolate is currently running
pub struct V8Interrupter {
    handle: v8::IsolateHandle,
}

impl Interrupt for V8Interrupter {
    fn interrupt(&self) {
        self.handle.terminate_execution();
    }
}

/// Handle to an isolate thread
pub struct V8Isolate {
    jobs: Option<mpsc::Sender<Job>>,
    interrupter: Arc<V8Interrupter>,
    thread: Option<JoinHandle<()>>,
    corrupted: bool,
}

impl V8Isolate {
    fn submit<T>(
        &mut self,
        job: impl FnOnce(mpsc::Sender<Result<T, ScriptFailure>>) -> Job,
    ) -> Result<T, ScriptFailure> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let sent = match &self.jobs {
            Some(jobs) => jobs.send(job(reply_tx)).is_ok(),
            None => false,
        };
        if !sent {
            self.corrupted = true;
            return Err(ScriptFailure::fatal("Isolate thread is gone"));
        }

        let outcome = reply_rx
            .recv()
            .unwrap_or_else(|_| Err(ScriptFailure::fatal("Isolate thread exited mid-run")));
        if matches!(&outcome, Err(failure) if failure.fatal) {
            self.corrupted = true;
        }
        outcome
    }
}

impl EngineIsolate for V8Isolate {
    fn check_syntax(&mut self, source: &str) -> Result<(), ScriptFailure> {
        let source = source.to_string();
        self.submit(|reply| Job::CheckSyntax { source, reply })
    }

    fn run(&mut self, request: &RunRequest) -> Result<serde_json::Value, ScriptFailure> {
        let request = request.clone();
        self.submit(|reply| Job::Run { request, reply })
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.interrupter.clone()
    }

    fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    fn destroy(self) {
        drop(self);
    }
}

impl Drop for V8Isolate {
    fn drop(&mut self) {
        // Closing the job channel ends the thread's serve loop
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("Isolate thread panicked");
            }
        }
    }
}
