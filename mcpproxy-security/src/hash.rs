//! Content hashing
//!
//! Origins and argument matches are keyed by the low 128 bits of a SHA-256
//! digest, hex-encoded to 32 characters. Three variants exist: the raw body,
//! a normalized form (trimmed, lower-cased) that survives whitespace and
//! case mangling, and per-field hashes over every long-enough string value
//! in a JSON document.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Length of a hex-encoded content hash
pub const HASH_HEX_LEN: usize = 32;

/// Hash arbitrary content to 32 hex chars (low 128 bits of SHA-256)
pub fn hash_content(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    hex::encode(&digest[16..])
}

/// Hash the normalized form of a string (trimmed, lower-cased)
pub fn hash_normalized(content: &str) -> String {
    hash_content(content.trim().to_lowercase().as_bytes())
}

/// Hash every string value in a JSON document whose length ≥ `min_length`
///
/// Returns `(hash, field_path)` pairs, path in dotted form with `[i]` array
/// segments.
pub fn hash_json_fields(value: &Value, min_length: usize) -> Vec<(String, String)> {
    let mut out = Vec::new();
    walk(value, "$", min_length, &mut out);
    out
}

fn walk(value: &Value, path: &str, min_length: usize, out: &mut Vec<(String, String)>) {
    match value {
        Value::String(s) => {
            if s.len() >= min_length {
                out.push((hash_content(s.as_bytes()), path.to_string()));
                out.push((hash_normalized(s), path.to_string()));
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                walk(item, &format!("{}[{}]", path, i), min_length, out);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                walk(item, &format!("{}.{}", path, key), min_length, out);
            }
        }
        _ => {}
    }
}

/// All hash variants of an outgoing payload: full body, normalized body, and
/// per-field hashes when the payload parses as JSON
pub fn hash_variants(content: &str, min_length: usize) -> Vec<String> {
    let mut hashes = Vec::new();
    if content.len() >= min_length {
        hashes.push(hash_content(content.as_bytes()));
        hashes.push(hash_normalized(content));
    }
    if let Ok(value) = serde_json::from_str::<Value>(content) {
        for (hash, _) in hash_json_fields(&value, min_length) {
            hashes.push(hash);
        }
    }
    hashes.sort_unstable();
    hashes.dedup();
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_32_hex_chars_and_deterministic() {
        let hash = hash_content(b"hello world");
        assert_eq!(hash.len(), HASH_HEX_LEN);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_content(b"hello world"));
        assert_ne!(hash, hash_content(b"hello worlds"));
    }

    #[test]
    fn test_normalized_hash_ignores_case_and_whitespace() {
        assert_eq!(hash_normalized("Secret Value"), hash_normalized("  secret value "));
        assert_ne!(hash_normalized("secret value"), hash_content(b"secret value"));
    }

    #[test]
    fn test_json_field_hashing_respects_min_length() {
        let value = json!({
            "short": "tiny",
            "long": "this string is definitely long enough",
            "nested": {"also_long": "another sufficiently long string here"}
        });
        let fields = hash_json_fields(&value, 20);
        let paths: Vec<&str> = fields.iter().map(|(_, p)| p.as_str()).collect();
        assert!(paths.contains(&"$.long"));
        assert!(paths.contains(&"$.nested.also_long"));
        assert!(!paths.iter().any(|p| p.contains("short")));
    }

    #[test]
    fn test_min_length_boundary() {
        let nineteen = "a".repeat(19);
        let twenty = "a".repeat(20);
        assert!(hash_json_fields(&json!({ "v": nineteen }), 20).is_empty());
        assert!(!hash_json_fields(&json!({ "v": twenty }), 20).is_empty());
    }

    #[test]
    fn test_variants_cover_embedded_json_fields() {
        let secret = "sk-proj-abc123def456ghi789jkl012mno345";
        let body = format!(r#"{{"text":"leaking {} here for fun"}}"#, secret);
        let variants = hash_variants(&body, 20);

        // The field value hash must be among the variants
        let field_hash = hash_content(format!("leaking {} here for fun", secret).as_bytes());
        assert!(variants.contains(&field_hash));
    }
}
