//! Execution context variables and condition evaluation.
//!
//! One flat map per execution record. String fields substitute
//! `{name}` occurrences; an unresolved name fails the block rather
//! than passing the placeholder to a device.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::error::{Error, Result};

/// Variable name the executor writes the most recent verification
/// output under, so conditions can branch on it.
pub const LAST_VERIFICATION: &str = "last_verification";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("invalid regex"));

/// The flat per-execution variable map.
#[derive(Debug, Clone, Default)]
pub struct VariableMap {
    values: HashMap<String, Value>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    fn render(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Replace every `{name}` in `template`. Unresolved names are an
    /// error so the calling block fails instead of running with a
    /// placeholder.
    pub fn substitute(&self, template: &str) -> Result<String> {
        let mut missing = None;
        let substituted = PLACEHOLDER.replace_all(template, |captures: &regex::Captures| {
            let name = &captures[1];
            match self.render(name) {
                Some(value) => value,
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(name) => Err(Error::invalid_input(format!(
                "unresolved variable {{{}}}",
                name
            ))),
            None => Ok(substituted.into_owned()),
        }
    }

    /// Substitute placeholders inside every string of a JSON value.
    pub fn substitute_value(&self, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::String(s) => Value::String(self.substitute(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.substitute_value(v))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.substitute_value(v)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }
}

/// Operand types an `evaluate_condition` block understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    Int,
    Str,
    Bool,
}

impl OperandType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "int" => Ok(Self::Int),
            "str" => Ok(Self::Str),
            "bool" => Ok(Self::Bool),
            other => Err(Error::invalid_input(format!(
                "unknown operand_type {:?}",
                other
            ))),
        }
    }
}

/// Evaluate a condition over two already-substituted operands.
///
/// Numeric orderings require `int`; `contains` / `starts_with` require
/// `str`; everything supports equality.
pub fn evaluate_condition(
    operand_type: OperandType,
    condition: &str,
    left: &str,
    right: &str,
) -> Result<bool> {
    match condition {
        "==" | "!=" => {
            let equal = match operand_type {
                OperandType::Int => parse_int(left)? == parse_int(right)?,
                OperandType::Str => left == right,
                OperandType::Bool => parse_bool(left)? == parse_bool(right)?,
            };
            Ok(if condition == "==" { equal } else { !equal })
        }
        "<" | "<=" | ">" | ">=" => {
            if operand_type != OperandType::Int {
                return Err(Error::invalid_input(format!(
                    "condition {:?} requires int operands",
                    condition
                )));
            }
            let (l, r) = (parse_int(left)?, parse_int(right)?);
            Ok(match condition {
                "<" => l < r,
                "<=" => l <= r,
                ">" => l > r,
                _ => l >= r,
            })
        }
        "contains" | "starts_with" => {
            if operand_type != OperandType::Str {
                return Err(Error::invalid_input(format!(
                    "condition {:?} requires str operands",
                    condition
                )));
            }
            Ok(if condition == "contains" {
                left.contains(right)
            } else {
                left.starts_with(right)
            })
        }
        other => Err(Error::invalid_input(format!(
            "unknown condition {:?}",
            other
        ))),
    }
}

fn parse_int(s: &str) -> Result<i64> {
    s.trim()
        .parse()
        .map_err(|_| Error::invalid_input(format!("{:?} is not an integer", s)))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::invalid_input(format!(
            "{:?} is not a boolean",
            other
        ))),
    }
}
