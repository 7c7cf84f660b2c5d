//! Payload envelope and SQL quoting
//!
//! Payloads cross the wire as JSON text. Channel names are interpolated as
//! quoted identifiers and payloads as quoted literals, so arbitrary unicode
//! channel names are safe at every `LISTEN`/`UNLISTEN`/`NOTIFY` site.

use serde_json::Value;

/// Serialize a JSON value for transit.
pub fn pack(value: &Value) -> serde_json::Result<String> {
    serde_json::to_string(value)
}

/// Parse a payload received from the wire.
pub fn unpack(raw: &str) -> serde_json::Result<Value> {
    serde_json::from_str(raw)
}

/// Quote a channel name as a PostgreSQL identifier.
///
/// Double-quoted, embedded double quotes doubled.
pub fn quote_ident(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push('"');
    for ch in name.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a payload as a PostgreSQL string literal.
///
/// Single-quoted, embedded single quotes doubled. Backslashes force the
/// `E''` form with doubled backslashes so the result does not depend on the
/// server's `standard_conforming_strings` setting.
pub fn quote_literal(text: &str) -> String {
    let escape = text.contains('\\');
    let mut quoted = String::with_capacity(text.len() + 3);
    if escape {
        quoted.push('E');
    }
    quoted.push('\'');
    for ch in text.chars() {
        match ch {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let value = json!({
            "user": "alice",
            "text": "hi",
            "depth": [1, 2, {"nested": null, "flag": true}],
            "count": 42.5,
        });
        let packed = pack(&value).unwrap();
        assert_eq!(unpack(&packed).unwrap(), value);
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(unpack("not-json").is_err());
        assert!(unpack("{\"open\":").is_err());
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("room-42"), "\"room-42\"");
        assert_eq!(quote_ident("wei\"rd"), "\"wei\"\"rd\"");
        assert_eq!(quote_ident("émoji-чат"), "\"émoji-чат\"");
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\\b"), "E'a\\\\b'");
        assert_eq!(quote_literal("mix'\\"), "E'mix''\\\\'");
    }
}
