//! Error types for script execution

use std::fmt;

/// A requested capability exceeds what the policy grants.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyViolation {
    #[error("IO access requested but not permitted by policy")]
    IoNotPermitted,

    #[error("network access requested but not permitted by policy")]
    NetworkNotPermitted,

    #[error("requested heap ceiling {requested} bytes exceeds policy limit {limit} bytes")]
    HeapCeilingExceeded { requested: u64, limit: u64 },
}

/// Why `acquire()` could not hand out an isolate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exhaustion {
    /// No isolate became available within the acquire timeout
    Timeout { waited_ms: u64 },
    /// The pool has been shut down
    Closed,
    /// The engine could not create a new isolate
    Engine(String),
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhaustion::Timeout { waited_ms } => {
                write!(f, "no isolate available after {}ms", waited_ms)
            }
            Exhaustion::Closed => write!(f, "pool is closed"),
            Exhaustion::Engine(reason) => write!(f, "engine could not create isolate: {}", reason),
        }
    }
}

/// Errors produced by the execution bridge.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("policy violation: {0}")]
    PolicyViolation(#[from] PolicyViolation),

    #[error("isolate pool exhausted: {0}")]
    PoolExhausted(Exhaustion),

    #[error("script failed: {message}")]
    Script { message: String, discarded: bool },

    #[error("script execution timed out after {elapsed_ms}ms (limit {timeout_ms}ms)")]
    Timeout { timeout_ms: u64, elapsed_ms: u64 },
}

/// Coarse error classification for callers that branch on failure type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    PolicyViolation,
    PoolExhausted,
    Script,
    Timeout,
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::Configuration(_) => ErrorKind::Configuration,
            SandboxError::PolicyViolation(_) => ErrorKind::PolicyViolation,
            SandboxError::PoolExhausted(_) => ErrorKind::PoolExhausted,
            SandboxError::Script { .. } => ErrorKind::Script,
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Whether the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SandboxError::PoolExhausted(Exhaustion::Timeout { .. })
        )
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

/// Failure to create an isolate
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

/// Failure reported by an isolate while parsing or running a script
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ScriptFailure {
    pub message: String,
    /// The isolate can no longer be trusted and must be discarded
    pub fatal: bool,
    /// The engine itself gave up on the deadline
    pub timed_out: bool,
}

impl ScriptFailure {
    /// Ordinary script error (syntax, thrown exception, unmappable result)
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
            timed_out: false,
        }
    }

    /// Error that leaves the isolate in an untrusted state
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
            timed_out: false,
        }
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
            timed_out: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_distinct() {
        let errors = [
            SandboxError::Configuration("x".into()),
            SandboxError::PolicyViolation(PolicyViolation::IoNotPermitted),
            SandboxError::PoolExhausted(Exhaustion::Closed),
            SandboxError::Script {
                message: "boom".into(),
                discarded: false,
            },
            SandboxError::Timeout {
                timeout_ms: 100,
                elapsed_ms: 120,
            },
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(|e| e.kind()).collect();
        assert_eq!(kinds.len(), errors.len());
    }

    #[test]
    fn test_only_wait_timeouts_are_retryable() {
        assert!(SandboxError::PoolExhausted(Exhaustion::Timeout { waited_ms: 5 }).is_retryable());
        assert!(!SandboxError::PoolExhausted(Exhaustion::Closed).is_retryable());
        assert!(!SandboxError::Timeout {
            timeout_ms: 1,
            elapsed_ms: 2
        }
        .is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = SandboxError::from(PolicyViolation::HeapCeilingExceeded {
            requested: 10,
            limit: 5,
        });
        assert!(err.to_string().contains("exceeds policy limit 5"));
        assert_eq!(
            SandboxError::PoolExhausted(Exhaustion::Closed).to_string(),
            "isolate pool exhausted: pool is closed"
        );
    }
}
