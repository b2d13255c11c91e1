// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Static mapping registry.
//!
//! A mapping resolves a `(source type, target type)` pair to a pure
//! transform plus compiled input/output JSON Schemas. Transforms perform no
//! I/O and are deterministic for a given input.

use crate::error::{SignetError, SignetResult};
use jsonschema::Validator;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;

pub const INVOICE_SOURCE: &str = "openai.tooluse.invoice.v1";
pub const INVOICE_TARGET: &str = "invoice.iso20022.v1";

pub type TransformFn = fn(&Value) -> SignetResult<Value>;

pub struct Mapping {
    pub source: String,
    pub target: String,
    pub transform: TransformFn,
    input: Validator,
    output: Validator,
    input_schema_json: Value,
    required_input_fields: Vec<String>,
    payload_surface: Vec<String>,
}

impl Mapping {
    pub fn validate_input(&self, v: &Value) -> SignetResult<()> {
        validate(&self.input, v)
    }

    /// Raw input schema document, handed to repair providers.
    pub fn input_schema(&self) -> &Value {
        &self.input_schema_json
    }

    pub fn validate_output(&self, v: &Value) -> SignetResult<()> {
        validate(&self.output, v)
    }

    /// Field names the input schema marks as required; the semantic
    /// invariant checks use these to detect dropped fields.
    pub fn required_input_fields(&self) -> &[String] {
        &self.required_input_fields
    }

    /// Top-level payload keys this mapping declares as its input surface;
    /// everything else is stripped before validation.
    pub fn payload_surface(&self) -> &[String] {
        &self.payload_surface
    }
}

fn validate(validator: &Validator, v: &Value) -> SignetResult<()> {
    validator
        .validate(v)
        .map_err(|e| SignetError::SchemaValidation(e.to_string()))
}

#[derive(Default)]
pub struct MappingRegistry {
    entries: HashMap<(String, String), Mapping>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the invoice conversion.
    pub fn with_builtin() -> SignetResult<Self> {
        let mut registry = Self::new();
        registry.register(invoice_mapping()?);
        Ok(registry)
    }

    pub fn register(&mut self, mapping: Mapping) {
        self.entries
            .insert((mapping.source.clone(), mapping.target.clone()), mapping);
    }

    pub fn lookup(&self, source: &str, target: &str) -> SignetResult<&Mapping> {
        self.entries
            .get(&(source.to_string(), target.to_string()))
            .ok_or_else(|| SignetError::NoMapping {
                from: source.to_string(),
                target: target.to_string(),
            })
    }
}

fn compile(schema: &Value) -> SignetResult<Validator> {
    jsonschema::validator_for(schema)
        .map_err(|e| SignetError::Internal(format!("schema compile: {e}")))
}

fn invoice_mapping() -> SignetResult<Mapping> {
    let input_schema = json!({
        "type": "object",
        "required": ["invoice_id", "amount", "currency"],
        "properties": {
            "invoice_id": {"type": "string", "minLength": 1},
            "amount": {"type": "number"},
            "currency": {"type": "string", "minLength": 3, "maxLength": 3}
        },
        "additionalProperties": true
    });
    let output_schema = json!({
        "type": "object",
        "required": ["invoice_id", "amount_minor", "currency"],
        "properties": {
            "invoice_id": {"type": "string", "minLength": 1},
            "amount_minor": {"type": "integer"},
            "currency": {"type": "string", "minLength": 3, "maxLength": 3}
        },
        "additionalProperties": false
    });
    Ok(Mapping {
        source: INVOICE_SOURCE.to_string(),
        target: INVOICE_TARGET.to_string(),
        transform: invoice_transform,
        input: compile(&input_schema)?,
        output: compile(&output_schema)?,
        input_schema_json: input_schema.clone(),
        required_input_fields: vec![
            "invoice_id".to_string(),
            "amount".to_string(),
            "currency".to_string(),
        ],
        payload_surface: vec!["tool_calls".to_string()],
    })
}

/// `amount` in major units becomes `amount_minor` at the fixed x100 scale;
/// `invoice_id` and `currency` pass through verbatim. Amounts with more
/// than two decimal places do not land on an integer minor unit and are
/// rejected.
fn invoice_transform(args: &Value) -> SignetResult<Value> {
    let obj = args
        .as_object()
        .ok_or_else(|| SignetError::Transform("arguments must be an object".to_string()))?;
    let invoice_id = obj
        .get("invoice_id")
        .and_then(Value::as_str)
        .ok_or_else(|| SignetError::Transform("invoice_id missing".to_string()))?;
    let currency = obj
        .get("currency")
        .and_then(Value::as_str)
        .ok_or_else(|| SignetError::Transform("currency missing".to_string()))?;
    let amount = obj
        .get("amount")
        .and_then(|v| match v {
            Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
            _ => None,
        })
        .ok_or_else(|| SignetError::Transform("amount missing or not numeric".to_string()))?;

    let minor = amount * Decimal::from(100);
    if !minor.fract().is_zero() {
        return Err(SignetError::Transform(format!(
            "amount {amount} does not scale to integer minor units"
        )));
    }
    let minor = minor
        .to_i64()
        .ok_or_else(|| SignetError::Transform("amount out of range".to_string()))?;

    Ok(json!({
        "invoice_id": invoice_id,
        "amount_minor": minor,
        "currency": currency,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MappingRegistry {
        MappingRegistry::with_builtin().unwrap()
    }

    #[test]
    fn lookup_finds_the_invoice_mapping() {
        let r = registry();
        assert!(r.lookup(INVOICE_SOURCE, INVOICE_TARGET).is_ok());
        assert!(matches!(
            r.lookup("unknown.v1", INVOICE_TARGET),
            Err(SignetError::NoMapping { .. })
        ));
    }

    #[test]
    fn integer_amount_scales_to_minor_units() {
        let args = json!({"invoice_id":"INV-1","amount":1000,"currency":"USD"});
        let out = invoice_transform(&args).unwrap();
        assert_eq!(
            out,
            json!({"invoice_id":"INV-1","amount_minor":100000,"currency":"USD"})
        );
    }

    #[test]
    fn decimal_amount_scales_exactly() {
        let args = json!({"invoice_id":"INV-1","amount":10.10,"currency":"EUR"});
        let out = invoice_transform(&args).unwrap();
        assert_eq!(out["amount_minor"], json!(1010));
    }

    #[test]
    fn sub_cent_precision_is_rejected() {
        let args = json!({"invoice_id":"INV-1","amount":10.005,"currency":"USD"});
        assert!(invoice_transform(&args).is_err());
    }

    #[test]
    fn schemas_gate_both_directions() {
        let r = registry();
        let m = r.lookup(INVOICE_SOURCE, INVOICE_TARGET).unwrap();
        m.validate_input(&json!({"invoice_id":"INV-1","amount":5,"currency":"USD"}))
            .unwrap();
        assert!(m
            .validate_input(&json!({"invoice_id":"INV-1","currency":"USD"}))
            .is_err());
        m.validate_output(&json!({"invoice_id":"INV-1","amount_minor":500,"currency":"USD"}))
            .unwrap();
        assert!(m
            .validate_output(&json!({"invoice_id":"INV-1","amount_minor":5.5,"currency":"USD"}))
            .is_err());
    }

    #[test]
    fn transform_output_validates_against_output_schema() {
        let r = registry();
        let m = r.lookup(INVOICE_SOURCE, INVOICE_TARGET).unwrap();
        let out = (m.transform)(&json!({"invoice_id":"INV-7","amount":42,"currency":"SEK"}))
            .unwrap();
        m.validate_output(&out).unwrap();
    }
}
