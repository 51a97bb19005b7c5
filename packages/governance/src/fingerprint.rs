//! ACGS-Governance: Policy Input Fingerprint
//!
//! SHA-256 over the canonicalized JSON of the policy input with stable
//! key ordering, recursively. Two inputs that differ only in key order or
//! formatting fingerprint identically, so they share a cache entry.

use sha2::{Digest, Sha256};

/// Canonical rendering: objects with sorted keys, no whitespace.
fn canonicalize(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Key encoding via serde_json keeps escapes consistent
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                canonicalize(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Stable fingerprint of `(policy_path, input)`.
pub fn policy_fingerprint(policy_path: &str, input: &serde_json::Value) -> String {
    let mut canonical = String::new();
    canonicalize(input, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(policy_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_order_is_irrelevant() {
        let a = serde_json::json!({"b": 1, "a": {"y": 2, "x": 3}});
        let b = serde_json::json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(
            policy_fingerprint("bus/allow", &a),
            policy_fingerprint("bus/allow", &b)
        );
    }

    #[test]
    fn test_value_changes_fingerprint() {
        let a = serde_json::json!({"action": "query"});
        let b = serde_json::json!({"action": "audit"});
        assert_ne!(
            policy_fingerprint("bus/allow", &a),
            policy_fingerprint("bus/allow", &b)
        );
    }

    #[test]
    fn test_path_is_part_of_key() {
        let input = serde_json::json!({"action": "query"});
        assert_ne!(
            policy_fingerprint("bus/allow", &input),
            policy_fingerprint("bus/deny", &input)
        );
    }

    #[test]
    fn test_arrays_keep_order() {
        let a = serde_json::json!({"seq": [1, 2]});
        let b = serde_json::json!({"seq": [2, 1]});
        assert_ne!(
            policy_fingerprint("p", &a),
            policy_fingerprint("p", &b)
        );
    }

    #[test]
    fn test_fingerprint_is_hex_sha256() {
        let fp = policy_fingerprint("p", &serde_json::json!({}));
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
