// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Semantic invariants between malformed input and repaired output.
//!
//! A model-backed repair must not change business meaning: monetary
//! amounts, currency codes, and identifiers recoverable from the original
//! text have to survive the repair unchanged, and schema-required fields
//! must not be dropped.

use regex::Regex;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantViolation {
    pub rule: &'static str,
    pub field: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: field {} expected {}, got {}",
            self.rule, self.field, self.expected, self.actual
        )
    }
}

/// Recover whatever key/value pairs the original text still exposes. Valid
/// JSON objects are flattened; malformed text falls back to tolerant
/// token-pair scanning so that a truncated payload still pins its values.
pub fn loose_extract(text: &str) -> BTreeMap<String, Value> {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        let mut out = BTreeMap::new();
        flatten("", &v, &mut out);
        return out;
    }
    scan_pairs(text)
}

fn scan_pairs(text: &str) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    let string_pair = match Regex::new(r#""([^"]+)"\s*:\s*"([^"]*)""#) {
        Ok(re) => re,
        Err(_) => return out,
    };
    let scalar_pair = match Regex::new(r#""([^"]+)"\s*:\s*(-?\d+(?:\.\d+)?|true|false|null)"#) {
        Ok(re) => re,
        Err(_) => return out,
    };
    for cap in string_pair.captures_iter(text) {
        out.insert(cap[1].to_string(), Value::String(cap[2].to_string()));
    }
    for cap in scalar_pair.captures_iter(text) {
        let raw = &cap[2];
        let value = match raw {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            "null" => Value::Null,
            _ => serde_json::from_str::<Value>(raw).unwrap_or(Value::String(raw.to_string())),
        };
        out.entry(cap[1].to_string()).or_insert(value);
    }
    out
}

fn flatten(prefix: &str, v: &Value, out: &mut BTreeMap<String, Value>) {
    match v {
        Value::Object(map) => {
            for (k, val) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                out.insert(path.clone(), val.clone());
                flatten(&path, val, out);
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let path = format!("{prefix}[{i}]");
                out.insert(path.clone(), item.clone());
                flatten(&path, item, out);
            }
        }
        _ => {}
    }
}

fn leaf_name(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

fn to_decimal(v: &Value) -> Option<Decimal> {
    match v {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Decimal::from_str(&cleaned).ok()
            }
        }
        _ => None,
    }
}

fn is_amount_field(name: &str) -> bool {
    name.to_ascii_lowercase().contains("amount")
}

fn is_currency_field(name: &str) -> bool {
    name.to_ascii_lowercase().contains("currency")
}

fn is_identifier_field(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "id" || lower.ends_with("_id") || lower.contains("uuid") || lower.contains("reference")
}

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate every invariant rule between the values recovered from the
/// original text and the repaired object.
pub fn check(
    original: &BTreeMap<String, Value>,
    repaired: &Value,
    required_fields: &[String],
) -> Vec<InvariantViolation> {
    let mut flat_repaired = BTreeMap::new();
    flatten("", repaired, &mut flat_repaired);

    let mut violations = Vec::new();

    for (path, orig_val) in original {
        let name = leaf_name(path);
        let Some(new_val) = lookup(&flat_repaired, path, name) else {
            continue;
        };

        if is_amount_field(name) {
            match (to_decimal(orig_val), to_decimal(new_val)) {
                (Some(a), Some(b)) if a != b => violations.push(InvariantViolation {
                    rule: "monetary_stability",
                    field: path.clone(),
                    expected: a.to_string(),
                    actual: b.to_string(),
                }),
                (Some(_), None) => violations.push(InvariantViolation {
                    rule: "monetary_stability",
                    field: path.clone(),
                    expected: render(orig_val),
                    actual: render(new_val),
                }),
                _ => {}
            }
        } else if is_currency_field(name) {
            if render(orig_val) != render(new_val) {
                violations.push(InvariantViolation {
                    rule: "currency_stability",
                    field: path.clone(),
                    expected: render(orig_val),
                    actual: render(new_val),
                });
            }
        } else if is_identifier_field(name) && render(orig_val) != render(new_val) {
            violations.push(InvariantViolation {
                rule: "identifier_immutability",
                field: path.clone(),
                expected: render(orig_val),
                actual: render(new_val),
            });
        }
    }

    // Minor-unit cross-check: an original `amount` must agree with a
    // repaired `<amount>_minor` at the fixed x100 scale.
    for (path, orig_val) in original {
        let name = leaf_name(path);
        if !is_amount_field(name) || name.ends_with("_minor") {
            continue;
        }
        let minor_name = format!("{name}_minor");
        if let Some(minor_val) = lookup(&flat_repaired, &minor_name, &minor_name) {
            if let (Some(major), Some(minor)) = (to_decimal(orig_val), to_decimal(minor_val)) {
                if major * Decimal::from(100) != minor {
                    violations.push(InvariantViolation {
                        rule: "monetary_stability",
                        field: minor_name.clone(),
                        expected: (major * Decimal::from(100)).to_string(),
                        actual: minor.to_string(),
                    });
                }
            }
        }
    }

    for field in required_fields {
        if original.contains_key(field) && !flat_repaired.contains_key(field) {
            violations.push(InvariantViolation {
                rule: "required_field_preservation",
                field: field.clone(),
                expected: "present".to_string(),
                actual: "missing".to_string(),
            });
        }
    }

    violations
}

// Paths recovered by loose scanning are bare names; repaired paths are
// dotted. Match the exact path first, then any repaired leaf of that name.
fn lookup<'a>(
    flat: &'a BTreeMap<String, Value>,
    path: &str,
    name: &str,
) -> Option<&'a Value> {
    if let Some(v) = flat.get(path) {
        return Some(v);
    }
    flat.iter()
        .find(|(k, _)| leaf_name(k) == name)
        .map(|(_, v)| v)
}

/// Top-level entry used by the pipeline after a model-backed repair.
pub fn validate_repair(
    original_text: &str,
    repaired: &Value,
    required_fields: &[String],
) -> Vec<InvariantViolation> {
    let original = loose_extract(original_text);
    check(&original, repaired, required_fields)
}
