//! The thread that owns one `JsRuntime`

use super::ops::{bootstrap_source, sandbox_extension, EVALUATOR_JS};
use crate::error::ScriptFailure;
use crate::types::{RunGrants, RunRequest, Variables};
use crate::value;
use deno_core::{v8, JsRuntime, PollEventLoopOptions, RuntimeOptions};
use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, SyncSender};

/// Fixed at isolate creation
pub(super) struct IsolateSettings {
    pub max_heap_bytes: u64,
    pub io: bool,
    pub network: bool,
    pub prelude: Vec<String>,
}

pub(super) enum Job {
    Run {
        request: RunRequest,
        reply: Sender<Result<serde_json::Value, ScriptFailure>>,
    },
    CheckSyntax {
        source: String,
        reply: Sender<Result<(), ScriptFailure>>,
    },
}

/// One own property of the global object as it stood after startup
struct BaselineGlobal {
    key: v8::Global<v8::String>,
    value: v8::Global<v8::Value>,
    read_only: bool,
    dont_enum: bool,
    dont_delete: bool,
}

impl BaselineGlobal {
    fn attributes(&self) -> v8::PropertyAttribute {
        let mut attributes = v8::PropertyAttribute::NONE;
        if self.read_only {
            attributes = attributes | v8::PropertyAttribute::READ_ONLY;
        }
        if self.dont_enum {
            attributes = attributes | v8::PropertyAttribute::DONT_ENUM;
        }
        attributes
    }
}

/// What every run starts from: the globals left by bootstrap and prelude, and
/// the function that evaluates run source.
struct Baseline {
    evaluate: v8::Global<v8::Function>,
    names: HashSet<String>,
    globals: Vec<BaselineGlobal>,
}

/// State for the near-heap-limit callback.
struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates execution and grants 1MB grace for the termination to propagate.
extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points to the boxed HeapLimitState owned by `serve`, which
    // drops the runtime before the box.
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Thread entry point. Reports readiness (or the startup failure) on `ready`,
/// then serves jobs until the sender side is dropped or a run leaves the isolate unusable.
pub(super) fn isolate_main(
    settings: IsolateSettings,
    ready: SyncSender<Result<v8::IsolateHandle, String>>,
    jobs: Receiver<Job>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to build isolate runtime: {}", e)));
            return;
        }
    };
    rt.block_on(serve(settings, ready, jobs));
}

async fn serve(
    settings: IsolateSettings,
    ready: SyncSender<Result<v8::IsolateHandle, String>>,
    jobs: Receiver<Job>,
) {
    let max_bytes = usize::try_from(settings.max_heap_bytes).unwrap_or(usize::MAX);
    // Initial heap: 10MB or 10% of max, whichever is smaller
    let initial_bytes = (max_bytes / 10).min(10 * 1024 * 1024);

    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![sandbox_extension()],
        create_params: Some(v8::CreateParams::default().heap_limits(initial_bytes, max_bytes)),
        ..Default::default()
    });

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut c_void,
    );

    let baseline = match bootstrap(&mut runtime, &settings) {
        Ok(baseline) => baseline,
        Err(reason) => {
            let _ = ready.send(Err(reason));
            drop(runtime);
            drop(heap_state);
            return;
        }
    };
    if ready
        .send(Ok(runtime.v8_isolate().thread_safe_handle()))
        .is_err()
    {
        drop(baseline);
        drop(runtime);
        drop(heap_state);
        return;
    }

    while let Ok(job) = jobs.recv() {
        let unusable = match job {
            Job::Run { request, reply } => {
                let outcome = run_script(&mut runtime, &baseline, &request, &heap_state).await;
                let fatal = matches!(&outcome, Err(failure) if failure.fatal);
                let _ = reply.send(outcome);
                fatal
            }
            Job::CheckSyntax { source, reply } => {
                let _ = reply.send(check_syntax(&mut runtime, &source));
                false
            }
        };
        if unusable {
            tracing::debug!("Isolate thread exiting after fatal failure");
            break;
        }
    }

    // Globals must go before the isolate they point into
    drop(baseline);
    drop(runtime);
    drop(heap_state);
}

fn bootstrap(runtime: &mut JsRuntime, settings: &IsolateSettings) -> Result<Baseline, String> {
    runtime
        .execute_script(
            "[scriptbox:bootstrap]",
            bootstrap_source(settings.io, settings.network),
        )
        .map_err(|e| format!("Bootstrap failed: {}", e))?;
    let evaluator = runtime
        .execute_script("[scriptbox:evaluator]", EVALUATOR_JS)
        .map_err(|e| format!("Bootstrap failed: {}", e))?;

    for code in &settings.prelude {
        runtime
            .execute_script("[scriptbox:prelude]", code.clone())
            .map_err(|e| format!("Prelude failed: {}", e))?;
    }

    let scope = &mut runtime.handle_scope();
    let evaluate = v8::Local::new(scope, &evaluator);
    let evaluate = v8::Local::<v8::Function>::try_from(evaluate)
        .map_err(|_| "Bootstrap failed: evaluator is not a function".to_string())?;

    let global = scope.get_current_context().global(scope);
    let mut names = HashSet::new();
    let mut globals = Vec::new();
    for (key, name) in own_global_keys(scope, global) {
        let attributes = global
            .get_property_attributes(scope, key.into())
            .unwrap_or_default();
        if let Some(value) = global.get(scope, key.into()) {
            globals.push(BaselineGlobal {
                key: v8::Global::new(scope, key),
                value: v8::Global::new(scope, value),
                read_only: attributes.is_read_only(),
                dont_enum: attributes.is_dont_enum(),
                dont_delete: attributes.is_dont_delete(),
            });
        }
        names.insert(name);
    }

    Ok(Baseline {
        evaluate: v8::Global::new(scope, evaluate),
        names,
        globals,
    })
}

/// String keys of the global object's own properties, enumerable or not
fn own_global_keys<'s>(
    scope: &mut v8::HandleScope<'s>,
    global: v8::Local<'s, v8::Object>,
) -> Vec<(v8::Local<'s, v8::String>, String)> {
    let args = v8::GetPropertyNamesArgs {
        mode: v8::KeyCollectionMode::OwnOnly,
        property_filter: v8::PropertyFilter::ALL_PROPERTIES | v8::PropertyFilter::SKIP_SYMBOLS,
        index_filter: v8::IndexFilter::IncludeIndices,
        key_conversion: v8::KeyConversionMode::ConvertToString,
    };
    let Some(names) = global.get_own_property_names(scope, args) else {
        return Vec::new();
    };

    let mut keys = Vec::new();
    for index in 0..names.length() {
        let Some(key) = names.get_index(scope, index) else {
            continue;
        };
        let Ok(key) = v8::Local::<v8::String>::try_from(key) else {
            continue;
        };
        let name = key.to_rust_string_lossy(scope);
        keys.push((key, name));
    }
    keys
}

async fn run_script(
    runtime: &mut JsRuntime,
    baseline: &Baseline,
    request: &RunRequest,
    heap: &HeapLimitState,
) -> Result<serde_json::Value, ScriptFailure> {
    runtime.op_state().borrow_mut().put(request.grants);

    let outcome = match inject_variables(runtime, baseline, &request.variables) {
        Ok(()) => evaluate(runtime, baseline, request).await,
        Err(failure) => Err(failure),
    };

    if heap.triggered.load(Ordering::SeqCst) {
        return Err(ScriptFailure::fatal("Heap limit exceeded"));
    }
    let terminated = runtime.v8_isolate().is_execution_terminating()
        || matches!(&outcome, Err(f) if f.message.contains("execution terminated"));
    if terminated {
        return Err(ScriptFailure::fatal("Execution terminated"));
    }

    restore_globals(runtime, baseline);
    runtime.op_state().borrow_mut().put(RunGrants::default());
    outcome
}

async fn evaluate(
    runtime: &mut JsRuntime,
    baseline: &Baseline,
    request: &RunRequest,
) -> Result<serde_json::Value, ScriptFailure> {
    let completion = start(runtime, baseline, &request.source)?;

    // Promise results are awaited with the event loop; plain values resolve immediately
    let pending = Box::pin(runtime.resolve(completion));
    let driven = runtime.with_event_loop_promise(pending, PollEventLoopOptions::default());
    let resolved = match request.deadline {
        Some(deadline) => tokio::time::timeout(deadline, driven).await.map_err(|_| {
            ScriptFailure::timed_out(format!(
                "Pending operations did not settle within {}ms",
                deadline.as_millis()
            ))
        })?,
        None => driven.await,
    }
    .map_err(|e| ScriptFailure::error(e.to_string()))?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, resolved);
    value::from_v8(scope, local)
        .map_err(|e| ScriptFailure::error(format!("Result cannot be returned: {}", e)))
}

/// Run the synchronous part of `source` through the strict evaluator.
/// Declarations stay local to the run.
fn start(
    runtime: &mut JsRuntime,
    baseline: &Baseline,
    source: &str,
) -> Result<v8::Global<v8::Value>, ScriptFailure> {
    let scope = &mut runtime.handle_scope();
    let code =
        v8::String::new(scope, source).ok_or_else(|| ScriptFailure::error("Source too long"))?;
    let evaluate = v8::Local::new(scope, &baseline.evaluate);
    let receiver: v8::Local<v8::Value> = v8::undefined(scope).into();

    let tc = &mut v8::TryCatch::new(scope);
    match evaluate.call(tc, receiver, &[code.into()]) {
        Some(completion) => Ok(v8::Global::new(tc, completion)),
        None => Err(caught(tc)),
    }
}

fn caught(tc: &mut v8::TryCatch<v8::HandleScope>) -> ScriptFailure {
    if tc.has_terminated() {
        return ScriptFailure::fatal("Execution terminated");
    }
    if let Some(message) = tc.message() {
        let text = message.get(tc);
        return ScriptFailure::error(text.to_rust_string_lossy(tc));
    }
    let text = match tc.exception() {
        Some(exception) => exception.to_rust_string_lossy(tc),
        None => "Uncaught exception".to_string(),
    };
    ScriptFailure::error(text)
}

fn inject_variables(
    runtime: &mut JsRuntime,
    baseline: &Baseline,
    variables: &Variables,
) -> Result<(), ScriptFailure> {
    if variables.is_empty() {
        return Ok(());
    }
    if let Some(name) = variables.keys().find(|name| baseline.names.contains(*name)) {
        return Err(ScriptFailure::error(format!(
            "Cannot inject '{}': a global of that name already exists",
            name
        )));
    }

    let scope = &mut runtime.handle_scope();
    let context = scope.get_current_context();
    let global = context.global(scope);
    for (name, value) in variables {
        let key = v8::String::new(scope, name)
            .ok_or_else(|| ScriptFailure::error(format!("Invalid variable name: {}", name)))?;
        let local = value::to_v8(scope, value)
            .map_err(|e| ScriptFailure::error(format!("Cannot inject '{}': {}", name, e)))?;
        global.set(scope, key.into(), local);
    }
    Ok(())
}

/// Put the global object back the way bootstrap and prelude left it: drop what
/// the run added (injected variables included) and undo what it replaced.
fn restore_globals(runtime: &mut JsRuntime, baseline: &Baseline) {
    let scope = &mut runtime.handle_scope();
    let global = scope.get_current_context().global(scope);
    let tc = &mut v8::TryCatch::new(scope);

    for (key, name) in own_global_keys(tc, global) {
        if !baseline.names.contains(&name) {
            global.delete(tc, key.into());
        }
    }

    for entry in &baseline.globals {
        let key = v8::Local::new(tc, &entry.key);
        let value = v8::Local::new(tc, &entry.value);
        if !entry.dont_delete {
            global.define_own_property(tc, key.into(), value, entry.attributes());
        } else if !entry.read_only {
            global.set(tc, key.into(), value);
        }
    }

    if tc.has_caught() {
        tracing::debug!("Global reset left some properties in place");
    }
}

fn check_syntax(runtime: &mut JsRuntime, source: &str) -> Result<(), ScriptFailure> {
    let scope = &mut runtime.handle_scope();
    // Runs are strict-mode code, so check them as such
    let strict = format!("\"use strict\";{}", source);
    let code =
        v8::String::new(scope, &strict).ok_or_else(|| ScriptFailure::error("Source too long"))?;
    let tc = &mut v8::TryCatch::new(scope);
    if v8::Script::compile(tc, code, None).is_some() {
        return Ok(());
    }

    let message = tc
        .exception()
        .map(|e| e.to_rust_string_lossy(tc))
        .unwrap_or_else(|| "Syntax error".to_string());
    Err(ScriptFailure::error(message))
}
