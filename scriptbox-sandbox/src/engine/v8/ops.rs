//! Host operations behind the script-visible capabilities
//!
//! Ops are registered in every isolate. Whether a script can reach them is decided
//! twice: the bootstrap only exposes `fetch`/`io` when the isolate's policy allows
//! them, and every call checks the [`RunGrants`] of the current run.

use crate::types::RunGrants;
use deno_core::{op2, Extension, OpState};
use deno_error::JsErrorBox;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy)]
enum Capability {
    Io,
    Network,
}

fn ensure_granted(state: &OpState, capability: Capability) -> Result<(), JsErrorBox> {
    let grants = state.try_borrow::<RunGrants>().copied().unwrap_or_default();
    let allowed = match capability {
        Capability::Io => grants.io,
        Capability::Network => grants.network,
    };
    if allowed {
        Ok(())
    } else {
        Err(JsErrorBox::generic(format!(
            "Permission denied: {:?} access was not requested for this execution",
            capability
        )))
    }
}

/// console.* forwarded to tracing
#[op2]
fn op_scriptbox_log(#[string] level: String, #[serde] parts: Vec<String>) {
    let message = parts.join(" ");
    match level.as_str() {
        "error" => tracing::error!(target: "scriptbox::script", "{}", message),
        "warn" => tracing::warn!(target: "scriptbox::script", "{}", message),
        "debug" => tracing::debug!(target: "scriptbox::script", "{}", message),
        _ => tracing::info!(target: "scriptbox::script", "{}", message),
    }
}

#[op2(async)]
#[string]
async fn op_scriptbox_read_text(
    state: Rc<RefCell<OpState>>,
    #[string] path: String,
) -> Result<String, JsErrorBox> {
    ensure_granted(&state.borrow(), Capability::Io)?;
    tracing::debug!(path = %path, "Script reading file");

    tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| JsErrorBox::generic(format!("Failed to read {}: {}", path, e)))
}

#[op2(async)]
async fn op_scriptbox_write_text(
    state: Rc<RefCell<OpState>>,
    #[string] path: String,
    #[string] contents: String,
) -> Result<(), JsErrorBox> {
    ensure_granted(&state.borrow(), Capability::Io)?;
    tracing::debug!(path = %path, bytes = contents.len(), "Script writing file");

    tokio::fs::write(&path, contents)
        .await
        .map_err(|e| JsErrorBox::generic(format!("Failed to write {}: {}", path, e)))
}

/// HTTP request - GET, POST, headers, body
#[op2(async)]
#[string]
async fn op_scriptbox_fetch(
    state: Rc<RefCell<OpState>>,
    #[string] url: String,
    #[string] method: String,
    #[string] body: Option<String>,
    #[serde] headers: Option<serde_json::Value>,
) -> Result<String, JsErrorBox> {
    ensure_granted(&state.borrow(), Capability::Network)?;
    tracing::debug!(
        url = %url,
        method = %method,
        has_body = body.is_some(),
        "Script fetching URL"
    );

    let client = reqwest::Client::new();
    let mut request = match method.to_uppercase().as_str() {
        "GET" => client.get(&url),
        "POST" => client.post(&url),
        "PUT" => client.put(&url),
        "DELETE" => client.delete(&url),
        "PATCH" => client.patch(&url),
        "HEAD" => client.head(&url),
        _ => {
            return Err(JsErrorBox::type_error(format!(
                "Unsupported HTTP method: {}",
                method
            )))
        }
    };

    if let Some(headers_map) = headers.as_ref().and_then(|h| h.as_object()) {
        for (key, value) in headers_map {
            if let Some(val_str) = value.as_str() {
                request = request.header(key, val_str);
            }
        }
    }

    if let Some(body_str) = body {
        request = request.body(body_str);
    }

    let response = request
        .send()
        .await
        .map_err(|e| JsErrorBox::type_error(format!("Request failed: {}", e)))?;
    let status = response.status().as_u16();
    let response_body = response
        .text()
        .await
        .map_err(|e| JsErrorBox::type_error(format!("Failed to read response: {}", e)))?;

    Ok(serde_json::json!({
        "status": status,
        "body": response_body,
    })
    .to_string())
}

/// Extension registering every sandbox op
pub fn sandbox_extension() -> Extension {
    let ops = vec![
        op_scriptbox_log(),
        op_scriptbox_read_text(),
        op_scriptbox_write_text(),
        op_scriptbox_fetch(),
    ];

    Extension {
        name: "scriptbox",
        ops: std::borrow::Cow::Owned(ops),
        ..Default::default()
    }
}

/// Installs console/fetch/io on globalThis and removes `Deno` and `__bootstrap`.
/// `__CAPABILITIES__` is replaced with `{"io":bool,"network":bool}`.
const BOOTSTRAP_JS: &str = r#"
((ops, caps) => {
    const render = (args) => args.map((arg) => {
        if (typeof arg === 'string') return arg;
        try {
            const json = JSON.stringify(arg);
            return json === undefined ? String(arg) : json;
        } catch (_) {
            return String(arg);
        }
    });
    const logAt = (level) => (...args) => ops.op_scriptbox_log(level, render(args));

    globalThis.console = Object.freeze({
        log: logAt('info'),
        info: logAt('info'),
        warn: logAt('warn'),
        error: logAt('error'),
        debug: logAt('debug'),
    });

    if (caps.network) {
        const wrap = (data) => ({
            status: data.status,
            ok: data.status >= 200 && data.status < 300,
            text: async () => data.body,
            json: async () => JSON.parse(data.body),
        });

        globalThis.fetch = async function(url, options = {}) {
            const method = options.method || 'GET';
            const headers = options.headers || {};
            const body = options.body === undefined ? null : String(options.body);
            const response = await ops.op_scriptbox_fetch(String(url), method, body, headers);
            return wrap(JSON.parse(response));
        };
    }

    if (caps.io) {
        globalThis.io = Object.freeze({
            readText: (path) => ops.op_scriptbox_read_text(String(path)),
            writeText: (path, text) => ops.op_scriptbox_write_text(String(path), String(text)),
        });
    }

    delete globalThis.Deno;
    delete globalThis.__bootstrap;
})(Deno.core.ops, __CAPABILITIES__);
"#;

/// Evaluates run source as strict indirect eval, so `let`, `const`, `class`,
/// `var` and function declarations live and die with the run. Holds on to the
/// original `eval` before any script can replace it.
pub const EVALUATOR_JS: &str = r#"
((indirectEval) => (source) => indirectEval('"use strict";' + source))(globalThis.eval)
"#;

/// Bootstrap source for an isolate with the given installed capabilities
pub fn bootstrap_source(io: bool, network: bool) -> String {
    let caps = serde_json::json!({ "io": io, "network": network });
    BOOTSTRAP_JS.replace("__CAPABILITIES__", &caps.to_string())
}
