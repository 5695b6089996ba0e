// SPDX-FileCopyrightText: © 2024-2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Statements served by an app and their canonical byte encoding.
//!
//! A statement is a flat JSON object whose values are strings, decimal
//! numbers or `{"timestamp": <unix seconds>}`. Decimals keep their literal
//! text, so `97234.00` and `97234` encode differently. The canonical form is
//! compact JSON with keys in byte order.

use std::{collections::BTreeMap, fmt};

use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer,
};
use serde_json::value::RawValue;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatementError {
    #[error("malformed statement: {0}")]
    Malformed(String),
    #[error("duplicate key {0:?}")]
    DuplicateKey(String),
    #[error("invalid decimal {literal:?} for key {key:?}")]
    InvalidDecimal { key: String, literal: String },
    #[error("unsupported value for key {key:?}: {kind}")]
    UnsupportedValue { key: String, kind: &'static str },
}

/// A decimal number kept as its validated literal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal(String);

impl Decimal {
    /// Accepts `-?(0|[1-9][0-9]*)(\.[0-9]+)?`, except negative zero.
    pub fn parse(literal: &str) -> Option<Self> {
        let unsigned = literal.strip_prefix('-').unwrap_or(literal);
        let (int, frac) = match unsigned.split_once('.') {
            Some((int, frac)) => (int, Some(frac)),
            None => (unsigned, None),
        };
        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if !digits(int) || (int.len() > 1 && int.starts_with('0')) {
            return None;
        }
        if let Some(frac) = frac {
            if !digits(frac) {
                return None;
            }
        }
        let is_zero = unsigned.bytes().all(|b| b == b'0' || b == b'.');
        if literal.starts_with('-') && is_zero {
            return None;
        }
        Some(Self(literal.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Decimal(Decimal),
    /// Unix seconds.
    Timestamp(u64),
}

impl Value {
    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::String(s) => out.push_str(&json_string(s)),
            Value::Decimal(d) => out.push_str(d.as_str()),
            Value::Timestamp(t) => {
                out.push_str("{\"timestamp\":");
                out.push_str(&t.to_string());
                out.push('}');
            }
        }
    }

    fn from_raw(key: &str, raw: &RawValue) -> Result<Self, StatementError> {
        let text = raw.get();
        let unsupported = |kind| StatementError::UnsupportedValue {
            key: key.to_string(),
            kind,
        };
        match text.as_bytes().first() {
            Some(b'"') => serde_json::from_str(text)
                .map(Value::String)
                .map_err(|e| StatementError::Malformed(e.to_string())),
            Some(b'{') => {
                #[derive(Deserialize)]
                #[serde(deny_unknown_fields)]
                struct Timestamp {
                    timestamp: u64,
                }
                serde_json::from_str::<Timestamp>(text)
                    .map(|t| Value::Timestamp(t.timestamp))
                    .map_err(|_| unsupported("object"))
            }
            Some(b'-' | b'0'..=b'9') => Decimal::parse(text)
                .map(Value::Decimal)
                .ok_or_else(|| StatementError::InvalidDecimal {
                    key: key.to_string(),
                    literal: text.to_string(),
                }),
            Some(b'[') => Err(unsupported("array")),
            Some(b't' | b'f') => Err(unsupported("bool")),
            Some(b'n') => Err(unsupported("null")),
            _ => Err(StatementError::Malformed(format!(
                "unexpected value for key {key:?}"
            ))),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

/// Object members in document order, duplicates included.
struct RawFields(Vec<(String, Box<RawValue>)>);

impl<'de> Deserialize<'de> for RawFields {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldsVisitor;

        impl<'de> Visitor<'de> for FieldsVisitor {
            type Value = RawFields;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut fields = Vec::new();
                while let Some(entry) = map.next_entry::<String, Box<RawValue>>()? {
                    fields.push(entry);
                }
                Ok(RawFields(fields))
            }
        }

        deserializer.deserialize_map(FieldsVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statement {
    fields: BTreeMap<String, Value>,
}

impl Statement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, StatementError> {
        let RawFields(fields) =
            serde_json::from_str(json).map_err(|e| StatementError::Malformed(e.to_string()))?;
        let mut statement = Self::new();
        for (key, raw) in fields {
            let value = Value::from_raw(&key, &raw)?;
            statement.insert(key, value)?;
        }
        Ok(statement)
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), StatementError> {
        let key = key.into();
        if self.fields.contains_key(&key) {
            return Err(StatementError::DuplicateKey(key));
        }
        self.fields.insert(key, value.into());
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn canonical_string(&self) -> String {
        let mut out = String::from("{");
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&json_string(key));
            out.push(':');
            value.write_canonical(&mut out);
        }
        out.push('}');
        out
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.canonical_string().into_bytes()
    }
}

impl<'de> Deserialize<'de> for Statement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let RawFields(fields) = RawFields::deserialize(deserializer)?;
        let mut statement = Self::new();
        for (key, raw) in fields {
            let value = Value::from_raw(&key, &raw).map_err(serde::de::Error::custom)?;
            statement
                .insert(key, value)
                .map_err(serde::de::Error::custom)?;
        }
        Ok(statement)
    }
}
