//! Execution bridge - main entry point

use crate::clock::ExecutionId;
use crate::config::SandboxConfig;
use crate::engine::{EngineIsolate, ScriptEngine};
use crate::error::{ScriptFailure, SandboxError, SandboxResult};
use crate::limits::{ScriptLimiter, Watchdog};
use crate::policy::{SandboxGuard, SandboxPolicy};
use crate::pool::{IsolateManager, PoolStats};
use crate::types::{ExecutionRequest, RunRequest, Variables};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Anything that can run scripts on behalf of a caller
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Execute a request and return its result value
    async fn execute_request(&self, request: ExecutionRequest) -> SandboxResult<Value>;

    /// Parse code without running it
    async fn check_syntax(&self, code: &str) -> SandboxResult<()>;
}

/// Runs scripts in pooled isolates under a deployment policy
pub struct ExecutionBridge<E: ScriptEngine> {
    pool: IsolateManager<E>,
    policy: SandboxPolicy,
    watchdog_interval: Duration,
}

#[cfg(feature = "v8")]
impl ExecutionBridge<crate::engine::V8Engine> {
    /// Bridge over V8 isolates, running the configured prelude in each one
    pub fn v8(config: &SandboxConfig) -> SandboxResult<Self> {
        let engine = crate::engine::V8Engine::with_config(crate::engine::V8EngineConfig {
            prelude: config.pool.prelude.clone(),
        });
        Self::new(engine, config)
    }
}

impl<E: ScriptEngine> ExecutionBridge<E> {
    pub fn new(engine: E, config: &SandboxConfig) -> SandboxResult<Self> {
        config.validate()?;
        Ok(Self {
            pool: IsolateManager::new(engine, config.policy, &config.pool)?,
            policy: config.policy,
            watchdog_interval: config.pool.watchdog_interval,
        })
    }

    /// Deployment policy every call is checked against
    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    pub fn pool(&self) -> &IsolateManager<E> {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Execute code with default options
    pub async fn execute(&self, code: &str) -> SandboxResult<Value> {
        self.execute_request(ExecutionRequest::new(code)).await
    }

    /// Execute code with variables injected as globals
    pub async fn execute_with(&self, code: &str, variables: Variables) -> SandboxResult<Value> {
        self.execute_request(ExecutionRequest::new(code).with_variables(variables))
            .await
    }

    /// Execute a request under the deployment policy
    pub async fn execute_request(&self, request: ExecutionRequest) -> SandboxResult<Value> {
        let policy = self.policy;
        self.execute_with_policy(request, &policy).await
    }

    /// Execute a request under a call-site policy, which may only be stricter
    /// than the deployment policy
    pub async fn execute_with_policy(
        &self,
        request: ExecutionRequest,
        policy: &SandboxPolicy,
    ) -> SandboxResult<Value> {
        let execution_id = ExecutionId::new();

        if !policy.is_within(&self.policy) {
            return Err(SandboxError::Configuration(
                "call-site policy is laxer than the deployment policy".to_string(),
            ));
        }
        request.options.check()?;
        SandboxGuard::validate(Some(&request.options), Some(policy)).map_err(|violation| {
            tracing::warn!(execution_id = %execution_id, %violation, "Request rejected by policy");
            violation
        })?;

        let timeout_ms = policy.effective_timeout_ms(&request.options);
        let mut lease = self.pool.acquire().await?;
        let isolate_id = lease.id();

        tracing::info!(
            execution_id = %execution_id,
            isolate_id = %isolate_id,
            timeout_ms,
            code_len = request.code.len(),
            variables = request.options.variables.len(),
            "Executing script"
        );

        let limiter = ScriptLimiter::start();
        let grants = request.options.grants();
        let run = RunRequest {
            source: request.code,
            variables: request.options.variables,
            grants,
            deadline: limiter.remaining(timeout_ms),
        };
        let watchdog = lease.interrupter().map(|interrupter| {
            Watchdog::arm(limiter, timeout_ms, self.watchdog_interval, interrupter)
        });

        // The lease and watchdog move into the blocking task so a cancelled caller
        // still releases the isolate once the run ends
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = match lease.isolate_mut() {
                Some(isolate) => isolate.run(&run),
                None => Err(ScriptFailure::fatal("lease holds no isolate")),
            };
            let fired = watchdog.as_ref().is_some_and(Watchdog::disarm);
            let fatal = matches!(&outcome, Err(failure) if failure.fatal);
            if fired || fatal {
                lease.discard();
            }
            drop(lease);
            (outcome, fired)
        })
        .await;

        let elapsed_ms = limiter.elapsed_ms();
        let (outcome, fired) = match joined {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    execution_id = %execution_id,
                    isolate_id = %isolate_id,
                    error = %e,
                    "Script engine panicked"
                );
                return Err(SandboxError::Script {
                    message: format!("script engine panicked: {}", e),
                    discarded: true,
                });
            }
        };

        let timed_out = fired || matches!(&outcome, Err(failure) if failure.timed_out);
        if timed_out {
            tracing::warn!(
                execution_id = %execution_id,
                isolate_id = %isolate_id,
                timeout_ms,
                elapsed_ms,
                "Script timed out, isolate discarded"
            );
            return Err(SandboxError::Timeout {
                timeout_ms: u64::try_from(timeout_ms).unwrap_or(0),
                elapsed_ms,
            });
        }

        match outcome {
            Ok(value) => {
                tracing::debug!(
                    execution_id = %execution_id,
                    isolate_id = %isolate_id,
                    elapsed_ms,
                    "Script completed"
                );
                Ok(value)
            }
            Err(failure) => {
                tracing::debug!(
                    execution_id = %execution_id,
                    isolate_id = %isolate_id,
                    elapsed_ms,
                    discarded = failure.fatal,
                    error = %failure.message,
                    "Script failed"
                );
                Err(SandboxError::Script {
                    message: failure.message,
                    discarded: failure.fatal,
                })
            }
        }
    }

    /// Parse code in a pooled isolate without running it
    pub async fn check_syntax(&self, code: &str) -> SandboxResult<()> {
        let mut lease = self.pool.acquire().await?;
        let source = code.to_string();

        let joined = tokio::task::spawn_blocking(move || {
            let outcome = match lease.isolate_mut() {
                Some(isolate) => isolate.check_syntax(&source),
                None => Err(ScriptFailure::fatal("lease holds no isolate")),
            };
            if matches!(&outcome, Err(failure) if failure.fatal) {
                lease.discard();
            }
            outcome
        })
        .await;

        match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(failure)) => Err(SandboxError::Script {
                message: failure.message,
                discarded: failure.fatal,
            }),
            Err(e) => Err(SandboxError::Script {
                message: format!("script engine panicked: {}", e),
                discarded: true,
            }),
        }
    }

    /// Close the pool. Running scripts are interrupted and later calls fail fast.
    pub fn shutdown(&self) {
        self.pool.close_all();
    }
}

#[async_trait]
impl<E: ScriptEngine> ScriptExecutor for ExecutionBridge<E> {
    async fn execute_request(&self, request: ExecutionRequest) -> SandboxResult<Value> {
        ExecutionBridge::execute_request(self, request).await
    }

    async fn check_syntax(&self, code: &str) -> SandboxResult<()> {
        ExecutionBridge::check_syntax(self, code).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::error::{Exhaustion, PolicyViolation};
    use crate::fakes::ScriptedEngine;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    fn bridge_with(
        policy: SandboxPolicy,
        capacity: usize,
    ) -> (ScriptedEngine, ExecutionBridge<ScriptedEngine>) {
        let engine = ScriptedEngine::new();
        let config = SandboxConfig {
            policy,
            pool: PoolConfig {
                capacity,
                acquire_timeout: Duration::from_millis(100),
                watchdog_interval: Duration::from_millis(2),
                prelude: Vec::new(),
            },
        };
        let bridge = ExecutionBridge::new(engine.clone(), &config).unwrap();
        (engine, bridge)
    }

    fn bridge() -> (ScriptedEngine, ExecutionBridge<ScriptedEngine>) {
        bridge_with(SandboxPolicy::strict(), 2)
    }

    #[tokio::test]
    async fn test_execute_returns_value() {
        let (_engine, bridge) = bridge();
        assert_eq!(bridge.execute("value 4").await.unwrap(), json!(4));
        assert_eq!(bridge.stats().borrowed, 0);
        assert_eq!(bridge.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_execute_with_variables() {
        let (_engine, bridge) = bridge();
        let mut variables = Variables::new();
        variables.insert("x".to_string(), json!(41));
        assert_eq!(
            bridge.execute_with("add x 1", variables).await.unwrap(),
            json!(42)
        );
    }

    #[tokio::test]
    async fn test_policy_violation_runs_nothing() {
        let (engine, bridge) = bridge();
        let result = bridge
            .execute_request(ExecutionRequest::new("value 1").with_io())
            .await;
        assert_matches!(
            result,
            Err(SandboxError::PolicyViolation(PolicyViolation::IoNotPermitted))
        );
        assert_eq!(engine.created(), 0);
    }

    #[tokio::test]
    async fn test_grants_forwarded() {
        let (_engine, bridge) = bridge_with(SandboxPolicy::strict().with_network(true), 1);
        let granted = bridge
            .execute_request(ExecutionRequest::new("grants").with_network())
            .await
            .unwrap();
        assert_eq!(granted, json!({"io": false, "network": true}));

        let default = bridge.execute("grants").await.unwrap();
        assert_eq!(default, json!({"io": false, "network": false}));
    }

    #[tokio::test]
    async fn test_laxer_call_site_policy_rejected() {
        let (_engine, bridge) = bridge();
        let lax = SandboxPolicy::strict().with_io(true);
        assert_matches!(
            bridge
                .execute_with_policy(ExecutionRequest::new("value 1"), &lax)
                .await,
            Err(SandboxError::Configuration(_))
        );

        let strict = SandboxPolicy::strict().with_max_cpu_millis(100);
        assert!(bridge
            .execute_with_policy(ExecutionRequest::new("value 1"), &strict)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_script_error_keeps_isolate() {
        let (engine, bridge) = bridge();
        assert_matches!(
            bridge.execute("throw nope").await,
            Err(SandboxError::Script { discarded: false, .. })
        );
        assert_eq!(bridge.execute("value 1").await.unwrap(), json!(1));
        assert_eq!(engine.created(), 1);
        assert_eq!(bridge.stats().discarded, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_discards_isolate() {
        let (engine, bridge) = bridge();
        assert_matches!(
            bridge.execute("corrupt out of memory").await,
            Err(SandboxError::Script { discarded: true, .. })
        );
        assert_eq!(engine.destroyed(), 1);
        assert_eq!(bridge.stats().live, 0);
    }

    #[tokio::test]
    async fn test_timeout_discards_isolate() {
        let (engine, bridge) = bridge();
        let started = std::time::Instant::now();
        let result = bridge
            .execute_request(ExecutionRequest::new("spin").with_timeout_ms(100))
            .await;
        assert_matches!(result, Err(SandboxError::Timeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() < Duration::from_secs(2));

        let stats = bridge.stats();
        assert_eq!(stats.borrowed, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(engine.destroyed(), 1);
    }

    #[tokio::test]
    async fn test_timeout_clamped_to_policy() {
        let (_engine, bridge) = bridge_with(SandboxPolicy::strict().with_max_cpu_millis(50), 1);
        let result = bridge
            .execute_request(ExecutionRequest::new("spin").with_timeout_ms(60_000))
            .await;
        assert_matches!(result, Err(SandboxError::Timeout { timeout_ms: 50, .. }));
    }

    #[tokio::test]
    async fn test_panic_discards_isolate() {
        let (engine, bridge) = bridge();
        assert_matches!(
            bridge.execute("panic").await,
            Err(SandboxError::Script { discarded: true, .. })
        );
        assert_eq!(engine.destroyed(), 1);
        assert_eq!(bridge.stats().borrowed, 0);
        assert_eq!(bridge.execute("value 2").await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_fails_fast() {
        let (_engine, bridge) = bridge();
        bridge.execute("value 1").await.unwrap();
        bridge.shutdown();
        assert_matches!(
            bridge.execute("value 1").await,
            Err(SandboxError::PoolExhausted(Exhaustion::Closed))
        );
    }

    #[tokio::test]
    async fn test_concurrent_calls_bounded_by_capacity() {
        let (engine, bridge) = bridge_with(SandboxPolicy::strict(), 2);
        let bridge = Arc::new(bridge);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let bridge = Arc::clone(&bridge);
            handles.push(tokio::spawn(async move { bridge.execute("sleep 300").await }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_matches!(
            bridge.execute("value 1").await,
            Err(SandboxError::PoolExhausted(Exhaustion::Timeout { .. }))
        );
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(engine.created(), 2);
        assert_eq!(bridge.execute("value 1").await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_check_syntax() {
        let (_engine, bridge) = bridge();
        assert!(bridge.check_syntax("value [1, 2]").await.is_ok());
        assert_matches!(
            bridge.check_syntax("frobnicate").await,
            Err(SandboxError::Script { discarded: false, .. })
        );
    }

    #[tokio::test]
    async fn test_invalid_variable_name_is_configuration_error() {
        let (engine, bridge) = bridge();
        let result = bridge
            .execute_request(ExecutionRequest::new("value 1").with_variable("io", 1))
            .await;
        assert_matches!(result, Err(SandboxError::Configuration(_)));
        assert_eq!(engine.created(), 0);
    }
}
