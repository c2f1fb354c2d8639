//! Named, pre-checked scripts

use crate::bridge::ScriptExecutor;
use crate::clock::ScriptId;
use crate::error::{SandboxError, SandboxResult};
use crate::lock_unpoisoned;
use crate::types::{ExecutionRequest, Variables};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A registered script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptHandle {
    pub id: ScriptId,
    pub name: String,
    pub description: String,
    pub source: String,
}

/// Keeps scripts by name and runs them through an executor
pub struct ScriptRegistry {
    executor: Arc<dyn ScriptExecutor>,
    scripts: Mutex<BTreeMap<String, ScriptHandle>>,
}

impl ScriptRegistry {
    pub fn new(executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            executor,
            scripts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Syntax-check and store a script under a unique name
    pub async fn register(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        source: impl Into<String>,
    ) -> SandboxResult<ScriptHandle> {
        let name = name.into();
        let source = source.into();
        if name.trim().is_empty() {
            return Err(SandboxError::Configuration(
                "script name must not be empty".to_string(),
            ));
        }
        if lock_unpoisoned(&self.scripts).contains_key(&name) {
            return Err(SandboxError::Configuration(format!(
                "script '{}' is already registered",
                name
            )));
        }

        self.executor.check_syntax(&source).await?;

        let handle = ScriptHandle {
            id: ScriptId::new(),
            name: name.clone(),
            description: description.into(),
            source,
        };

        let mut scripts = lock_unpoisoned(&self.scripts);
        if scripts.contains_key(&name) {
            return Err(SandboxError::Configuration(format!(
                "script '{}' is already registered",
                name
            )));
        }
        scripts.insert(name, handle.clone());
        tracing::info!(script_id = %handle.id, name = %handle.name, "Script registered");
        Ok(handle)
    }

    pub fn get(&self, name: &str) -> Option<ScriptHandle> {
        lock_unpoisoned(&self.scripts).get(name).cloned()
    }

    /// All registered scripts, ordered by name
    pub fn list(&self) -> Vec<ScriptHandle> {
        lock_unpoisoned(&self.scripts).values().cloned().collect()
    }

    pub fn unregister(&self, name: &str) -> Option<ScriptHandle> {
        let removed = lock_unpoisoned(&self.scripts).remove(name);
        if let Some(handle) = &removed {
            tracing::info!(script_id = %handle.id, name = %handle.name, "Script unregistered");
        }
        removed
    }

    /// Run a registered script with the given variables
    pub async fn run(&self, name: &str, variables: Variables) -> SandboxResult<serde_json::Value> {
        let handle = self.get(name).ok_or_else(|| {
            SandboxError::Configuration(format!("no script registered as '{}'", name))
        })?;
        tracing::debug!(script_id = %handle.id, name = %handle.name, "Running registered script");

        let request = ExecutionRequest::new(handle.source).with_variables(variables);
        self.executor.execute_request(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ExecutionBridge;
    use crate::config::SandboxConfig;
    use crate::fakes::ScriptedEngine;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn registry() -> ScriptRegistry {
        let bridge =
            ExecutionBridge::new(ScriptedEngine::new(), &SandboxConfig::default()).unwrap();
        ScriptRegistry::new(Arc::new(bridge))
    }

    #[tokio::test]
    async fn test_register_and_run() {
        let registry = registry();
        let handle = registry
            .register("increment", "adds one to x", "add x 1")
            .await
            .unwrap();
        assert_eq!(registry.get("increment"), Some(handle));

        let mut variables = Variables::new();
        variables.insert("x".to_string(), json!(41));
        assert_eq!(registry.run("increment", variables).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = registry();
        registry.register("one", "", "value 1").await.unwrap();
        assert_matches!(
            registry.register("one", "", "value 2").await,
            Err(SandboxError::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_syntax_error_not_registered() {
        let registry = registry();
        assert_matches!(
            registry.register("broken", "", "nonsense here").await,
            Err(SandboxError::Script { .. })
        );
        assert!(registry.get("broken").is_none());
    }

    #[tokio::test]
    async fn test_list_and_unregister() {
        let registry = registry();
        registry.register("b", "", "value 2").await.unwrap();
        registry.register("a", "", "value 1").await.unwrap();

        let names: Vec<_> = registry.list().into_iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["a", "b"]);

        assert!(registry.unregister("a").is_some());
        assert!(registry.unregister("a").is_none());
        assert_matches!(
            registry.run("a", Variables::new()).await,
            Err(SandboxError::Configuration(_))
        );
    }
}
