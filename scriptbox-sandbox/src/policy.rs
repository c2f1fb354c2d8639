//! Sandbox policy and pre-flight validation

use crate::error::PolicyViolation;
use crate::types::ExecutionOptions;
use serde::{Deserialize, Serialize};

/// Default CPU budget per execution
pub const DEFAULT_MAX_CPU_MILLIS: i64 = 3_000;

/// Default heap budget per isolate (64 MiB)
pub const DEFAULT_MAX_HEAP_BYTES: u64 = 64 * 1024 * 1024;

/// Capability ceiling every execution request is checked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Scripts may read and write files
    pub allow_io: bool,

    /// Scripts may issue HTTP requests
    pub allow_network: bool,

    /// Wall-clock budget per execution (<= 0 = unlimited)
    pub max_cpu_millis: i64,

    /// Heap budget per isolate
    pub max_heap_bytes: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::strict()
    }
}

impl SandboxPolicy {
    /// No IO, no network, 3 s, 64 MiB
    pub fn strict() -> Self {
        Self {
            allow_io: false,
            allow_network: false,
            max_cpu_millis: DEFAULT_MAX_CPU_MILLIS,
            max_heap_bytes: DEFAULT_MAX_HEAP_BYTES,
        }
    }

    pub fn with_io(mut self, allow: bool) -> Self {
        self.allow_io = allow;
        self
    }

    pub fn with_network(mut self, allow: bool) -> Self {
        self.allow_network = allow;
        self
    }

    pub fn with_max_cpu_millis(mut self, millis: i64) -> Self {
        self.max_cpu_millis = millis;
        self
    }

    pub fn with_max_heap_bytes(mut self, bytes: u64) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    /// True when this policy grants nothing beyond `ceiling`
    pub fn is_within(&self, ceiling: &SandboxPolicy) -> bool {
        let io_ok = !self.allow_io || ceiling.allow_io;
        let network_ok = !self.allow_network || ceiling.allow_network;
        let heap_ok = self.max_heap_bytes <= ceiling.max_heap_bytes;
        let cpu_ok = match (self.max_cpu_millis > 0, ceiling.max_cpu_millis > 0) {
            (_, false) => true,
            (false, true) => false,
            (true, true) => self.max_cpu_millis <= ceiling.max_cpu_millis,
        };
        io_ok && network_ok && heap_ok && cpu_ok
    }

    /// Timeout actually enforced for `options`; <= 0 means no deadline
    pub fn effective_timeout_ms(&self, options: &ExecutionOptions) -> i64 {
        match (options.timeout_ms > 0, self.max_cpu_millis > 0) {
            (true, true) => options.timeout_ms.min(self.max_cpu_millis),
            (true, false) => options.timeout_ms,
            (false, _) => self.max_cpu_millis,
        }
    }
}

/// Validates requested execution options against a policy.
pub struct SandboxGuard;

impl SandboxGuard {
    /// Reject options that ask for more than `policy` grants.
    ///
    /// A missing side is a no-op; execution boundaries always pass a policy.
    pub fn validate(
        options: Option<&ExecutionOptions>,
        policy: Option<&SandboxPolicy>,
    ) -> Result<(), PolicyViolation> {
        let (Some(options), Some(policy)) = (options, policy) else {
            return Ok(());
        };

        if options.allow_io && !policy.allow_io {
            return Err(PolicyViolation::IoNotPermitted);
        }

        if options.allow_network && !policy.allow_network {
            return Err(PolicyViolation::NetworkNotPermitted);
        }

        if let Some(requested) = options.max_heap_bytes {
            if requested > policy.max_heap_bytes {
                return Err(PolicyViolation::HeapCeilingExceeded {
                    requested,
                    limit: policy.max_heap_bytes,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(io: bool, network: bool, heap: Option<u64>) -> ExecutionOptions {
        ExecutionOptions {
            allow_io: io,
            allow_network: network,
            max_heap_bytes: heap,
            ..Default::default()
        }
    }

    #[test]
    fn test_default_policy_is_strict() {
        let policy = SandboxPolicy::default();
        assert!(!policy.allow_io);
        assert!(!policy.allow_network);
        assert_eq!(policy.max_cpu_millis, 3_000);
        assert_eq!(policy.max_heap_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_subset_requests_never_raise() {
        let heaps = [None, Some(1), Some(DEFAULT_MAX_HEAP_BYTES)];
        for policy_io in [false, true] {
            for policy_net in [false, true] {
                let policy = SandboxPolicy::strict()
                    .with_io(policy_io)
                    .with_network(policy_net);
                for io in [false, policy_io] {
                    for net in [false, policy_net] {
                        for heap in heaps {
                            let opts = options(io, net, heap);
                            assert!(
                                SandboxGuard::validate(Some(&opts), Some(&policy)).is_ok(),
                                "{:?} should fit {:?}",
                                opts,
                                policy
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_io_request_against_strict_policy() {
        let policy = SandboxPolicy::strict();
        assert_eq!(
            SandboxGuard::validate(Some(&options(true, false, None)), Some(&policy)),
            Err(PolicyViolation::IoNotPermitted)
        );
    }

    #[test]
    fn test_network_request_against_strict_policy() {
        let policy = SandboxPolicy::strict();
        assert_eq!(
            SandboxGuard::validate(Some(&options(false, true, None)), Some(&policy)),
            Err(PolicyViolation::NetworkNotPermitted)
        );
    }

    #[test]
    fn test_heap_ceiling_exceeded() {
        let policy = SandboxPolicy::strict().with_max_heap_bytes(1024);
        assert_eq!(
            SandboxGuard::validate(Some(&options(false, false, Some(2048))), Some(&policy)),
            Err(PolicyViolation::HeapCeilingExceeded {
                requested: 2048,
                limit: 1024
            })
        );
    }

    #[test]
    fn test_missing_side_is_noop() {
        let opts = options(true, true, Some(u64::MAX));
        assert!(SandboxGuard::validate(Some(&opts), None).is_ok());
        assert!(SandboxGuard::validate(None, Some(&SandboxPolicy::strict())).is_ok());
        assert!(SandboxGuard::validate(None, None).is_ok());
    }

    #[test]
    fn test_is_within() {
        let deployment = SandboxPolicy::strict();
        assert!(deployment.is_within(&deployment));
        assert!(SandboxPolicy::strict()
            .with_max_cpu_millis(100)
            .is_within(&deployment));
        assert!(!SandboxPolicy::strict().with_io(true).is_within(&deployment));
        assert!(!SandboxPolicy::strict()
            .with_max_cpu_millis(0)
            .is_within(&deployment));
        assert!(!SandboxPolicy::strict()
            .with_max_heap_bytes(DEFAULT_MAX_HEAP_BYTES + 1)
            .is_within(&deployment));
    }

    #[test]
    fn test_effective_timeout() {
        let policy = SandboxPolicy::strict();
        let mut opts = ExecutionOptions::default();
        assert_eq!(policy.effective_timeout_ms(&opts), 3_000);
        opts.timeout_ms = 100;
        assert_eq!(policy.effective_timeout_ms(&opts), 100);
        opts.timeout_ms = 10_000;
        assert_eq!(policy.effective_timeout_ms(&opts), 3_000);

        let unlimited = policy.with_max_cpu_millis(0);
        assert_eq!(unlimited.effective_timeout_ms(&opts), 10_000);
        opts.timeout_ms = -5;
        assert_eq!(unlimited.effective_timeout_ms(&opts), 0);
    }
}
