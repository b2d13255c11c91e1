// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! RFC 8785 JSON Canonicalization Scheme.
//!
//! Two semantically equal JSON values canonicalize to identical bytes:
//! object keys are sorted by their UTF-16 code-unit sequence (RFC 8785
//! §3.2.3), strings are NFC-normalized and minimally escaped, numbers
//! distinguish integral from fractional form, and no insignificant
//! whitespace is emitted.

use crate::error::{SignetError, SignetResult};
use serde_json::{Number, Value};
use unicode_normalization::UnicodeNormalization;

// Largest integer exactly representable in an f64 (2^53).
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

pub fn canonical_string(v: &Value) -> SignetResult<String> {
    let mut out = String::new();
    write_value(&mut out, v)?;
    Ok(out)
}

pub fn canonical_bytes(v: &Value) -> SignetResult<Vec<u8>> {
    Ok(canonical_string(v)?.into_bytes())
}

fn write_value(out: &mut String, v: &Value) -> SignetResult<()> {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&format_number(n)?),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(String, &Value)> = map
                .iter()
                .map(|(k, val)| (k.nfc().collect::<String>(), val))
                .collect();
            // RFC 8785 orders keys by UTF-16 code units, not code points:
            // supplementary-plane keys (surrogates from 0xD800) sort before
            // BMP keys in 0xE000..=0xFFFF.
            entries.sort_by(|a, b| a.0.encode_utf16().cmp(b.0.encode_utf16()));
            out.push('{');
            for (i, (key, val)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, val)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.nfc() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{0009}' => out.push_str("\\t"),
            '\u{000A}' => out.push_str("\\n"),
            '\u{000C}' => out.push_str("\\f"),
            '\u{000D}' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn format_number(n: &Number) -> SignetResult<String> {
    if let Some(i) = n.as_i64() {
        return Ok(i.to_string());
    }
    if let Some(u) = n.as_u64() {
        return Ok(u.to_string());
    }
    let f = n.as_f64().ok_or(SignetError::NonFiniteNumber)?;
    if !f.is_finite() {
        return Err(SignetError::NonFiniteNumber);
    }
    if f == 0.0 {
        // Covers negative zero, which serializes as plain 0.
        return Ok("0".to_string());
    }
    if f.fract() == 0.0 && f.abs() < MAX_SAFE_INTEGER {
        return Ok(format!("{}", f as i64));
    }
    // Rust's shortest round-trip formatting matches the RFC for the
    // fractional range this service handles; exponent extremes are
    // rejected upstream by payload validation.
    Ok(format!("{f}"))
}
