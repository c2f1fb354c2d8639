//! In-process fake engine (testing only)
//!
//! `ScriptedEngine` satisfies the engine traits without V8. A script is a list of
//! instructions separated by `;`; the last one's result is the run's result:
//!
//! | source               | behavior                                         |
//! |----------------------|--------------------------------------------------|
//! | `value <json>`       | returns the JSON value                           |
//! | `var <name>`         | returns an injected variable                     |
//! | `add <name> <n>`     | returns the numeric variable plus `n`            |
//! | `set <name> <json>`  | stores a global, dropped when the run ends       |
//! | `get <name>`         | returns a stored global (null when absent)       |
//! | `grants`             | returns the run's capability grants              |
//! | `sleep <ms>`         | sleeps, honoring interrupts, then returns null   |
//! | `spin`               | loops until interrupted                          |
//! | `throw <message>`    | ordinary script error                            |
//! | `corrupt <message>`  | fatal error that poisons the isolate             |
//! | `panic`              | panics inside the engine                         |

use crate::engine::{EngineIsolate, Interrupt, ScriptEngine};
use crate::error::{EngineError, ScriptFailure};
use crate::policy::SandboxPolicy;
use crate::types::RunRequest;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SPIN_STEP: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct Counters {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    fail_create: AtomicBool,
    create_delay_ms: AtomicU64,
    policies: Mutex<Vec<SandboxPolicy>>,
}

/// Engine whose isolates interpret one-line instructions
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    counters: Arc<Counters>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Isolates created so far
    pub fn created(&self) -> usize {
        self.counters.created.load(Ordering::SeqCst)
    }

    /// Isolates destroyed so far
    pub fn destroyed(&self) -> usize {
        self.counters.destroyed.load(Ordering::SeqCst)
    }

    /// Make subsequent `create_isolate` calls fail
    pub fn fail_creation(&self, fail: bool) {
        self.counters.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make `create_isolate` block for `delay` before returning
    pub fn set_creation_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.counters.create_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Policies isolates were created with, in creation order
    pub fn creation_policies(&self) -> Vec<SandboxPolicy> {
        self.counters
            .policies
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

impl ScriptEngine for ScriptedEngine {
    type Isolate = ScriptedIsolate;

    fn name(&self) -> &str {
        "scripted"
    }

    fn create_isolate(&self, policy: &SandboxPolicy) -> Result<ScriptedIsolate, EngineError> {
        let delay = self.counters.create_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        if self.counters.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError("scripted engine refused to create isolate".into()));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut policies) = self.counters.policies.lock() {
            policies.push(*policy);
        }
        Ok(ScriptedIsolate {
            counters: Arc::clone(&self.counters),
            interrupt: Arc::new(FlagInterrupt::default()),
            globals: HashMap::new(),
            corrupted: false,
        })
    }
}

/// Sets a flag that running instructions poll
#[derive(Debug, Default)]
pub struct FlagInterrupt {
    raised: AtomicBool,
}

impl FlagInterrupt {
    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}

impl Interrupt for FlagInterrupt {
    fn interrupt(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Instruction {
    Value(Value),
    Var(String),
    Add(String, f64),
    Set(String, Value),
    Get(String),
    Grants,
    Sleep(Duration),
    Spin,
    Throw(String),
    Corrupt(String),
    Panic,
}

fn parse_all(source: &str) -> Result<Vec<Instruction>, ScriptFailure> {
    source
        .split(';')
        .filter(|part| !part.trim().is_empty())
        .map(parse)
        .collect()
}

fn parse(source: &str) -> Result<Instruction, ScriptFailure> {
    let source = source.trim();
    let (op, rest) = source.split_once(char::is_whitespace).unwrap_or((source, ""));
    let rest = rest.trim();

    let json = |text: &str| {
        serde_json::from_str::<Value>(text)
            .map_err(|e| ScriptFailure::error(format!("SyntaxError: bad literal: {}", e)))
    };
    let name = |text: &str| {
        if text.is_empty() || text.contains(char::is_whitespace) {
            Err(ScriptFailure::error(format!(
                "SyntaxError: expected a name after '{}'",
                op
            )))
        } else {
            Ok(text.to_string())
        }
    };

    match op {
        "value" => Ok(Instruction::Value(json(rest)?)),
        "var" => Ok(Instruction::Var(name(rest)?)),
        "get" => Ok(Instruction::Get(name(rest)?)),
        "add" | "set" => {
            let (target, operand) = rest.split_once(char::is_whitespace).ok_or_else(|| {
                ScriptFailure::error(format!("SyntaxError: '{}' takes two operands", op))
            })?;
            let target = name(target)?;
            if op == "set" {
                return Ok(Instruction::Set(target, json(operand.trim())?));
            }
            let amount = operand.trim().parse::<f64>().map_err(|_| {
                ScriptFailure::error(format!("SyntaxError: '{}' is not a number", operand))
            })?;
            Ok(Instruction::Add(target, amount))
        }
        "grants" => Ok(Instruction::Grants),
        "sleep" => rest
            .parse::<u64>()
            .map(|ms| Instruction::Sleep(Duration::from_millis(ms)))
            .map_err(|_| ScriptFailure::error("SyntaxError: sleep takes milliseconds")),
        "spin" => Ok(Instruction::Spin),
        "throw" => Ok(Instruction::Throw(rest.to_string())),
        "corrupt" => Ok(Instruction::Corrupt(rest.to_string())),
        "panic" => Ok(Instruction::Panic),
        other => Err(ScriptFailure::error(format!(
            "SyntaxError: unknown instruction '{}'",
            other
        ))),
    }
}

/// Isolate created by [`ScriptedEngine`]
#[derive(Debug)]
pub struct ScriptedIsolate {
    counters: Arc<Counters>,
    interrupt: Arc<FlagInterrupt>,
    globals: HashMap<String, Value>,
    corrupted: bool,
}

impl ScriptedIsolate {
    fn terminated() -> ScriptFailure {
        ScriptFailure::fatal("Execution terminated")
    }

    fn wait(&self, duration: Option<Duration>) -> Result<(), ScriptFailure> {
        let started = std::time::Instant::now();
        loop {
            if self.interrupt.is_raised() {
                return Err(Self::terminated());
            }
            if duration.is_some_and(|d| started.elapsed() >= d) {
                return Ok(());
            }
            std::thread::sleep(SPIN_STEP);
        }
    }
}

impl ScriptedIsolate {
    fn step(
        &mut self,
        instruction: Instruction,
        request: &RunRequest,
    ) -> Result<Value, ScriptFailure> {
        let variable = |name: &str| {
            request.variables.get(name).cloned().ok_or_else(|| {
                ScriptFailure::error(format!("ReferenceError: {} is not defined", name))
            })
        };

        match instruction {
            Instruction::Value(value) => Ok(value),
            Instruction::Var(name) => variable(&name),
            Instruction::Add(name, amount) => {
                let base = variable(&name)?.as_f64().ok_or_else(|| {
                    ScriptFailure::error(format!("TypeError: {} is not a number", name))
                })?;
                Ok(crate::value::number_to_host(base + amount))
            }
            Instruction::Set(name, value) => {
                self.globals.insert(name, value.clone());
                Ok(value)
            }
            Instruction::Get(name) => Ok(self.globals.get(&name).cloned().unwrap_or(Value::Null)),
            Instruction::Grants => serde_json::to_value(request.grants)
                .map_err(|e| ScriptFailure::error(e.to_string())),
            Instruction::Sleep(duration) => self.wait(Some(duration)).map(|()| Value::Null),
            Instruction::Spin => self.wait(None).map(|()| Value::Null),
            Instruction::Throw(message) => Err(ScriptFailure::error(format!("Error: {}", message))),
            Instruction::Corrupt(message) => {
                self.corrupted = true;
                Err(ScriptFailure::fatal(message))
            }
            Instruction::Panic => panic!("scripted isolate panicked"),
        }
    }
}

impl EngineIsolate for ScriptedIsolate {
    fn check_syntax(&mut self, source: &str) -> Result<(), ScriptFailure> {
        parse_all(source).map(|_| ())
    }

    /// Globals set during the run are dropped when it ends, whatever the outcome
    fn run(&mut self, request: &RunRequest) -> Result<Value, ScriptFailure> {
        if self.interrupt.is_raised() {
            return Err(Self::terminated());
        }

        let instructions = parse_all(&request.source)?;
        let mut result = Ok(Value::Null);
        for instruction in instructions {
            result = self.step(instruction, request);
            if result.is_err() {
                break;
            }
        }
        self.globals.clear();
        result
    }

    fn interrupter(&self) -> Arc<dyn Interrupt> {
        self.interrupt.clone()
    }

    fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    fn destroy(self) {
        drop(self);
    }
}

impl Drop for ScriptedIsolate {
    fn drop(&mut self) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}
