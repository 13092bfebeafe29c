//! # String Helpers

/// Returns `true` if `key` would force `variables` to be stored as a
/// string-encoded JSON blob rather than structured JSON (§3 "Key storage
/// constraint").
#[must_use]
pub fn is_reserved_key_char(key: &str) -> bool {
    key.contains(['%', '$', '.'])
}

/// Returns `true` if any object key, at any depth, of `value` contains a
/// character reserved by the storage layer (`%`, `$`, or `.`).
#[must_use]
pub fn has_reserved_keys(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            map.iter().any(|(k, v)| is_reserved_key_char(k) || has_reserved_keys(v))
        }
        serde_json::Value::Array(items) => items.iter().any(has_reserved_keys),
        _ => false,
    }
}

/// Constant-time equality, used to compare a presented `pre-authorized_code`
/// against the one stored on the exchange (§4.8 "Token endpoint").
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn detects_reserved_chars() {
        assert!(is_reserved_key_char("a.b"));
        assert!(is_reserved_key_char("a$b"));
        assert!(is_reserved_key_char("a%b"));
        assert!(!is_reserved_key_char("ab"));
    }

    #[test]
    fn walks_nested_objects() {
        let clean = json!({"a": {"b": 1}});
        assert!(!has_reserved_keys(&clean));

        let dirty = json!({"a": {"b.c": 1}});
        assert!(has_reserved_keys(&dirty));

        let dirty_array = json!({"a": [{"x$y": 1}]});
        assert!(has_reserved_keys(&dirty_array));
    }

    #[test]
    fn constant_time_eq_matches_regular_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
