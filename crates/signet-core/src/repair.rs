// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Deterministic JSON repair tier.
//!
//! Cheap textual fixes applied before any model-backed fallback: trailing
//! commas, single-quoted strings, and doubly-escaped text. Repairs made
//! here consume no fallback tokens.

use serde_json::Value;

pub fn try_parse(s: &str) -> Option<Value> {
    serde_json::from_str(s).ok()
}

// Drops commas that directly precede a closing brace or bracket, modulo
// whitespace. Runs on raw text, so string contents like `",}"` can be
// touched; the result is only accepted if it parses.
fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Attempt deterministic repairs on malformed JSON text. Returns the parsed
/// value on the first strategy that yields valid JSON, or `None` when none
/// apply. An already-valid input parses on the first attempt.
pub fn repair_json_text(s: &str) -> Option<Value> {
    if let Some(v) = try_parse(s) {
        return Some(v);
    }
    let without_trailing = strip_trailing_commas(s);
    if let Some(v) = try_parse(&without_trailing) {
        return Some(v);
    }
    if s.contains('\'') {
        let requoted = without_trailing.replace('\'', "\"");
        if let Some(v) = try_parse(&requoted) {
            return Some(v);
        }
    }
    let unescaped = unescape_once(s);
    if unescaped != s {
        if let Some(v) = try_parse(&unescaped) {
            return Some(v);
        }
    }
    None
}

// Collapses one level of backslash escaping, for payloads that arrive
// double-encoded (e.g. `{\"k\":1}`).
fn unescape_once(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_json_passes_through() {
        let v = repair_json_text(r#"{"a":1}"#).unwrap();
        assert_eq!(v, json!({"a":1}));
    }

    #[test]
    fn trailing_commas_are_removed() {
        let v = repair_json_text(r#"{"a":1,"b":[1,2,],}"#).unwrap();
        assert_eq!(v, json!({"a":1,"b":[1,2]}));
    }

    #[test]
    fn single_quotes_are_requoted() {
        let v = repair_json_text(r#"{'invoice_id': 'INV-1', 'amount': 1000}"#).unwrap();
        assert_eq!(v, json!({"invoice_id":"INV-1","amount":1000}));
    }

    #[test]
    fn double_escaped_payloads_unwrap() {
        let v = repair_json_text(r#"{\"a\":1}"#).unwrap();
        assert_eq!(v, json!({"a":1}));
    }

    #[test]
    fn truncated_json_is_not_repairable_here() {
        assert!(repair_json_text(r#"{"invoice_id":"INV-2","amount":1000,"currency":"USD","#).is_none());
    }
}
