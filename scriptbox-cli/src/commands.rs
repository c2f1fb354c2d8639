//! CLI command implementations

use crate::RunArgs;
use anyhow::{anyhow, Context, Result};
use scriptbox_sandbox::{ExecutionBridge, ExecutionRequest, SandboxConfig};
use std::path::Path;
use tracing::info;

/// Configuration file if given, defaults otherwise
pub fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    match path {
        Some(path) => SandboxConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(SandboxConfig::default()),
    }
}

/// Parse `name=<json>`. A value that is not JSON is taken as a string.
pub fn parse_var(raw: &str) -> Result<(String, serde_json::Value)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid --var '{}': expected NAME=JSON", raw))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Invalid --var '{}': empty name", raw));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Command-line grants widen the deployment policy: whoever runs the CLI is
/// the deployer. The request then asks for exactly those grants.
pub fn apply_overrides(config: &mut SandboxConfig, args: &RunArgs) {
    if args.allow_io {
        config.policy.allow_io = true;
    }
    if args.allow_network {
        config.policy.allow_network = true;
    }
    if let Some(bytes) = args.max_heap_bytes {
        config.policy.max_heap_bytes = bytes;
    }
    if let Some(timeout_ms) = args.timeout_ms.filter(|ms| *ms > 0) {
        config.policy.max_cpu_millis = timeout_ms;
    }
}

pub fn build_request(code: String, args: &RunArgs) -> Result<ExecutionRequest> {
    let mut request = ExecutionRequest::new(code);
    for raw in &args.vars {
        let (name, value) = parse_var(raw)?;
        request = request.with_variable(name, value);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        request = request.with_timeout_ms(timeout_ms);
    }
    if args.allow_io {
        request = request.with_io();
    }
    if args.allow_network {
        request = request.with_network();
    }
    if let Some(bytes) = args.max_heap_bytes {
        request = request.with_max_heap_bytes(bytes);
    }
    Ok(request)
}

async fn execute_code(config: Option<&Path>, code: String, args: &RunArgs) -> Result<()> {
    let mut config = load_config(config)?;
    apply_overrides(&mut config, args);
    let request = build_request(code, args)?;

    let bridge = ExecutionBridge::v8(&config)?;
    let outcome = bridge.execute_request(request).await;
    bridge.shutdown();

    let value = outcome?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Evaluate inline code
pub async fn execute_eval(config: Option<&Path>, code: String, args: &RunArgs) -> Result<()> {
    info!(code_len = code.len(), "Evaluating inline script");
    execute_code(config, code, args).await
}

/// Run a script file
pub async fn execute_run(config: Option<&Path>, file: &Path, args: &RunArgs) -> Result<()> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read script {}", file.display()))?;
    info!(file = %file.display(), "Running script file");
    execute_code(config, code, args).await
}

/// Check a script file for syntax errors
pub async fn execute_check(config: Option<&Path>, file: &Path) -> Result<()> {
    let config = load_config(config)?;
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read script {}", file.display()))?;

    let bridge = ExecutionBridge::v8(&config)?;
    let outcome = bridge.check_syntax(&code).await;
    bridge.shutdown();

    outcome.with_context(|| format!("{} has syntax errors", file.display()))?;
    println!("✓ {}", file.display());
    Ok(())
}

/// Print the effective configuration as TOML
pub fn execute_config(config: Option<&Path>) -> Result<()> {
    let config = load_config(config)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}
