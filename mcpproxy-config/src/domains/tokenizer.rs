//! Tokenizer configuration for token-count annotations

use serde::{Deserialize, Serialize};

/// Tokenizer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenizerConfig {
    /// Whether token counts are attached to activity records
    pub enabled: bool,

    /// Model name reported alongside counts
    pub default_model: String,

    /// BPE encoding name
    pub encoding: String,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_model: "gpt-4".to_string(),
            encoding: "cl100k_base".to_string(),
        }
    }
}
