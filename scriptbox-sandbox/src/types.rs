//! Core types for script execution

use crate::error::{SandboxError, SandboxResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

/// Named values injected into the script's global scope
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Globals the sandbox installs itself; scripts cannot shadow them through injection
pub const RESERVED_NAMES: &[&str] = &["Deno", "console", "fetch", "io", "globalThis"];

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier pattern"));

/// Per-call execution options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Request file access for this run
    #[serde(default)]
    pub allow_io: bool,

    /// Request network access for this run
    #[serde(default)]
    pub allow_network: bool,

    /// Requested heap ceiling in bytes (None = policy ceiling)
    #[serde(default)]
    pub max_heap_bytes: Option<u64>,

    /// Timeout in milliseconds (<= 0 = policy ceiling)
    #[serde(default)]
    pub timeout_ms: i64,

    /// Variables to inject
    #[serde(default)]
    pub variables: Variables,
}

impl ExecutionOptions {
    /// Reject option sets that can never run, independent of any policy
    pub fn check(&self) -> SandboxResult<()> {
        if self.max_heap_bytes == Some(0) {
            return Err(SandboxError::Configuration(
                "heap ceiling must be greater than zero".to_string(),
            ));
        }

        for name in self.variables.keys() {
            if !IDENTIFIER.is_match(name) {
                return Err(SandboxError::Configuration(format!(
                    "variable name '{}' is not a valid identifier",
                    name
                )));
            }
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(SandboxError::Configuration(format!(
                    "variable name '{}' is reserved",
                    name
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn grants(&self) -> RunGrants {
        RunGrants {
            io: self.allow_io,
            network: self.allow_network,
        }
    }
}

/// Request to execute code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The code to execute
    pub code: String,

    #[serde(flatten)]
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    /// Create a simple execution request
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            options: ExecutionOptions::default(),
        }
    }

    /// Inject a variable into the script scope
    pub fn with_variable(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.options.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.options.variables.extend(variables);
        self
    }

    /// Set timeout in milliseconds
    pub fn with_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.options.timeout_ms = timeout_ms;
        self
    }

    pub fn with_io(mut self) -> Self {
        self.options.allow_io = true;
        self
    }

    pub fn with_network(mut self) -> Self {
        self.options.allow_network = true;
        self
    }

    pub fn with_max_heap_bytes(mut self, bytes: u64) -> Self {
        self.options.max_heap_bytes = Some(bytes);
        self
    }
}

/// Capabilities granted to a single run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunGrants {
    pub io: bool,
    pub network: bool,
}

/// Everything an isolate needs to run one script
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub source: String,
    pub variables: Variables,
    pub grants: RunGrants,
    /// Deadline for the whole run, if any
    pub deadline: Option<Duration>,
}
