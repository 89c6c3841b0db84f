//! Agent-hook subcommands
//!
//! `hook evaluate` is the fast path invoked by the agent on every tool use:
//! it reads the event from stdin, POSTs it to the daemon over the local IPC
//! socket with a raw HTTP/1.1 exchange (no config load, no TLS stack, no
//! logger), and prints the decision in the agent's hook wire format. Any
//! failure prints an allow decision and exits 0: the hook must never break
//! the agent (fail-open).
//!
//! `install`/`uninstall`/`status` edit the agent's settings file to point
//! its PreToolUse/PostToolUse matchers at this binary.

use serde_json::{json, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Wall-clock budget for the whole evaluate exchange
const EVALUATE_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Print an allow decision in the agent wire format and succeed
fn print_allow(reason: &str) {
    let output = json!({
        "hookSpecificOutput": {
            "hookEventName": "PreToolUse",
            "permissionDecision": "allow",
            "permissionDecisionReason": reason,
        }
    });
    println!("{}", output);
}

/// `hook evaluate`: stdin event → IPC POST → stdout decision, fail-open
pub async fn evaluate(socket_path: Option<PathBuf>) -> i32 {
    let mut input = String::new();
    if std::io::stdin().read_to_string(&mut input).is_err() || input.trim().is_empty() {
        print_allow("no hook input");
        return 0;
    }

    // Minimal shape check; the daemon does the real parsing
    if serde_json::from_str::<Value>(&input).is_err() {
        print_allow("unparseable hook input");
        return 0;
    }

    let Some(socket_path) = socket_path else {
        print_allow("no IPC endpoint");
        return 0;
    };

    let result = tokio::time::timeout(EVALUATE_TIMEOUT, post_evaluate(&socket_path, &input)).await;
    match result {
        Ok(Ok(response)) => {
            let decision = response
                .get("decision")
                .and_then(|v| v.as_str())
                .unwrap_or("allow");
            let reason = response
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let output = json!({
                "hookSpecificOutput": {
                    "hookEventName": "PreToolUse",
                    "permissionDecision": decision,
                    "permissionDecisionReason": reason,
                }
            });
            println!("{}", output);
            0
        }
        _ => {
            print_allow("daemon unreachable");
            0
        }
    }
}

/// Raw HTTP/1.1 POST over the Unix socket
///
/// reqwest has no Unix-socket transport; a hand-rolled exchange keeps the
/// hot path free of connection-pool and TLS initialization.
#[cfg(unix)]
async fn post_evaluate(socket_path: &Path, body: &str) -> std::io::Result<Value> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::UnixStream::connect(socket_path).await?;

    let request = format!(
        "POST /api/v1/hooks/evaluate HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    let text = String::from_utf8_lossy(&raw);

    let (head, payload) = text
        .split_once("\r\n\r\n")
        .ok_or_else(|| std::io::Error::other("malformed HTTP response"))?;
    if !head.starts_with("HTTP/1.1 200") && !head.starts_with("HTTP/1.0 200") {
        return Err(std::io::Error::other("daemon returned non-200"));
    }

    // Strip chunked framing if present; axum uses content-length for JSON
    serde_json::from_str(payload.trim())
        .map_err(|e| std::io::Error::other(format!("bad JSON: {}", e)))
}

#[cfg(not(unix))]
async fn post_evaluate(_socket_path: &Path, _body: &str) -> std::io::Result<Value> {
    Err(std::io::Error::other("IPC is unavailable on this platform"))
}

/// Default agent settings file
pub fn default_settings_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".claude/settings.json"))
}

const HOOK_MATCHER: &str = "*";

fn hook_entry(event: &str) -> Value {
    json!({
        "matcher": HOOK_MATCHER,
        "hooks": [{
            "type": "command",
            "command": "mcpproxy hook evaluate",
            "_managed_by": format!("mcpproxy/{}", event),
        }]
    })
}

/// Install PreToolUse/PostToolUse matchers into the settings file
pub fn install(settings_path: &Path) -> anyhow::Result<()> {
    let mut settings: Value = match std::fs::read_to_string(settings_path) {
        Ok(content) => serde_json::from_str(&content)?,
        Err(_) => json!({}),
    };

    let hooks = settings
        .as_object_mut()
        .ok_or_else(|| anyhow::anyhow!("settings file is not a JSON object"))?
        .entry("hooks")
        .or_insert_with(|| json!({}));

    for event in ["PreToolUse", "PostToolUse"] {
        let entries = hooks
            .as_object_mut()
            .ok_or_else(|| anyhow::anyhow!("hooks is not a JSON object"))?
            .entry(event)
            .or_insert_with(|| json!([]));
        let list = entries
            .as_array_mut()
            .ok_or_else(|| anyhow::anyhow!("{} is not an array", event))?;
        if !list.iter().any(is_managed_entry) {
            list.push(hook_entry(event));
        }
    }

    if let Some(parent) = settings_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(settings_path, serde_json::to_string_pretty(&settings)?)?;
    Ok(())
}

/// Remove our matchers from the settings file
pub fn uninstall(settings_path: &Path) -> anyhow::Result<()> {
    let Ok(content) = std::fs::read_to_string(settings_path) else {
        return Ok(());
    };
    let mut settings: Value = serde_json::from_str(&content)?;

    if let Some(hooks) = settings.get_mut("hooks").and_then(|v| v.as_object_mut()) {
        for event in ["PreToolUse", "PostToolUse"] {
            if let Some(list) = hooks.get_mut(event).and_then(|v| v.as_array_mut()) {
                list.retain(|entry| !is_managed_entry(entry));
            }
        }
    }

    std::fs::write(settings_path, serde_json::to_string_pretty(&settings)?)?;
    Ok(())
}

/// Whether our matchers are present
pub fn is_installed(settings_path: &Path) -> bool {
    let Ok(content) = std::fs::read_to_string(settings_path) else {
        return false;
    };
    let Ok(settings) = serde_json::from_str::<Value>(&content) else {
        return false;
    };

    ["PreToolUse", "PostToolUse"].iter().all(|event| {
        settings
            .pointer(&format!("/hooks/{}", event))
            .and_then(|v| v.as_array())
            .is_some_and(|list| list.iter().any(is_managed_entry))
    })
}

fn is_managed_entry(entry: &Value) -> bool {
    entry
        .pointer("/hooks/0/_managed_by")
        .and_then(|v| v.as_str())
        .is_some_and(|owner| owner.starts_with("mcpproxy/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_uninstall_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");

        install(&settings).unwrap();
        assert!(is_installed(&settings));

        // Idempotent: a second install adds nothing
        install(&settings).unwrap();
        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(&settings).unwrap()).unwrap();
        assert_eq!(
            parsed.pointer("/hooks/PreToolUse").unwrap().as_array().unwrap().len(),
            1
        );

        uninstall(&settings).unwrap();
        assert!(!is_installed(&settings));
    }

    #[test]
    fn test_install_preserves_foreign_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let settings = dir.path().join("settings.json");
        std::fs::write(
            &settings,
            r#"{"hooks":{"PreToolUse":[{"matcher":"Bash","hooks":[{"type":"command","command":"other-tool"}]}]}}"#,
        )
        .unwrap();

        install(&settings).unwrap();
        uninstall(&settings).unwrap();

        let parsed: Value =
            serde_json::from_str(&std::fs::read_to_string(&settings).unwrap()).unwrap();
        let pre = parsed.pointer("/hooks/PreToolUse").unwrap().as_array().unwrap();
        assert_eq!(pre.len(), 1);
        assert_eq!(pre[0]["matcher"], "Bash");
    }
}
