//! Server and tool classification
//!
//! Decision order: agent-internal built-ins, then config overrides, then
//! server-name substring heuristics (external before internal before
//! hybrid), then the configured default. The function is pure: identical
//! inputs and config always produce identical results.

use serde::{Deserialize, Serialize};

use mcpproxy_config::{ClassificationConfig, ServerClass};

/// How a classification was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationMethod {
    Builtin,
    ConfigOverride,
    Heuristic,
    Default,
}

/// Classification result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class: ServerClass,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub method: ClassificationMethod,
    pub reason: String,
    pub can_exfiltrate: bool,
    pub can_read_data: bool,
}

impl Classification {
    fn new(
        class: ServerClass,
        confidence: f64,
        method: ClassificationMethod,
        reason: String,
    ) -> Self {
        let (can_exfiltrate, can_read_data) = match class {
            ServerClass::Internal => (false, true),
            ServerClass::External => (true, false),
            ServerClass::Hybrid => (true, true),
            ServerClass::Unknown => (false, false),
        };
        Self {
            class,
            confidence,
            method,
            reason,
            can_exfiltrate,
            can_read_data,
        }
    }
}

/// Agent-internal tools with a known class (hook-enhanced coverage)
const BUILTIN_TOOLS: &[(&str, ServerClass)] = &[
    ("WebSearch", ServerClass::External),
    ("WebFetch", ServerClass::External),
    ("Read", ServerClass::Internal),
    ("Write", ServerClass::Internal),
    ("Edit", ServerClass::Internal),
    ("Glob", ServerClass::Internal),
    ("Grep", ServerClass::Internal),
    ("Bash", ServerClass::Hybrid),
    ("Task", ServerClass::Hybrid),
];

/// Heuristics ordered external -> internal -> hybrid; first match wins
const EXTERNAL_HINTS: &[&str] = &[
    "slack", "mail", "smtp", "discord", "telegram", "twitter", "webhook", "web-search",
    "websearch", "fetch", "http", "browser", "pastebin",
];
const INTERNAL_HINTS: &[&str] = &[
    "file", "fs", "disk", "local", "sqlite", "postgres", "mysql", "database", "db", "vault",
    "secret", "keychain", "memory",
];
const HYBRID_HINTS: &[&str] = &[
    "github", "gitlab", "jira", "notion", "drive", "gdrive", "dropbox", "s3", "aws", "cloud",
];

/// Classify a `(server, tool)` pair
pub fn classify(server_name: &str, tool_name: &str, config: &ClassificationConfig) -> Classification {
    // Agent-internal built-ins carry no server name
    if server_name.is_empty() {
        if let Some((_, class)) = BUILTIN_TOOLS.iter().find(|(name, _)| *name == tool_name) {
            return Classification::new(
                *class,
                1.0,
                ClassificationMethod::Builtin,
                format!("agent built-in tool '{}'", tool_name),
            );
        }
    }

    if let Some(class) = config.server_overrides.get(server_name) {
        return Classification::new(
            *class,
            1.0,
            ClassificationMethod::ConfigOverride,
            format!("config override for '{}'", server_name),
        );
    }

    let lowered = server_name.to_lowercase();
    for (hints, class) in [
        (EXTERNAL_HINTS, ServerClass::External),
        (INTERNAL_HINTS, ServerClass::Internal),
        (HYBRID_HINTS, ServerClass::Hybrid),
    ] {
        if let Some(hint) = hints.iter().find(|hint| lowered.contains(**hint)) {
            return Classification::new(
                class,
                0.7,
                ClassificationMethod::Heuristic,
                format!("server name matches '{}'", hint),
            );
        }
    }

    Classification::new(
        config.default_unknown,
        0.3,
        ClassificationMethod::Default,
        "no rule matched".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClassificationConfig {
        ClassificationConfig::default()
    }

    #[test]
    fn test_builtin_lookup_wins() {
        let c = classify("", "WebSearch", &config());
        assert_eq!(c.class, ServerClass::External);
        assert_eq!(c.method, ClassificationMethod::Builtin);
        assert!(c.can_exfiltrate);
    }

    #[test]
    fn test_config_override_beats_heuristics() {
        let mut cfg = config();
        cfg.server_overrides
            .insert("slack".to_string(), ServerClass::Internal);
        let c = classify("slack", "post_message", &cfg);
        assert_eq!(c.class, ServerClass::Internal);
        assert_eq!(c.method, ClassificationMethod::ConfigOverride);
    }

    #[test]
    fn test_heuristic_order_external_first() {
        // "github-fetch" matches both external ("fetch") and hybrid ("github");
        // external is checked first.
        let c = classify("github-fetch", "x", &config());
        assert_eq!(c.class, ServerClass::External);

        assert_eq!(classify("slack", "x", &config()).class, ServerClass::External);
        assert_eq!(classify("fs-local", "x", &config()).class, ServerClass::Internal);
        assert_eq!(classify("github", "x", &config()).class, ServerClass::Hybrid);
    }

    #[test]
    fn test_default_applies_when_nothing_matches() {
        let c = classify("mystery", "x", &config());
        assert_eq!(c.class, ServerClass::Internal); // default_unknown default
        assert_eq!(c.method, ClassificationMethod::Default);
    }

    #[test]
    fn test_pure_function() {
        let cfg = config();
        let a = classify("github", "get_file", &cfg);
        let b = classify("github", "get_file", &cfg);
        assert_eq!(a, b);
    }
}
