//! Named, typed query parameters.
//!
//! Every literal that reaches a statement is registered here and referenced
//! through a ClickHouse placeholder of the form `{name:Type}`.

use std::collections::BTreeMap;
use std::fmt;

use sea_query::{Expr, SimpleExpr};
use serde::Serialize;
use serde_json::Value;

use crate::error::{CompileError, CompileResult};

/// ClickHouse type attached to a bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChType {
    String,
    Int64,
    Float64,
    Bool,
    NullableString,
    ArrayString,
}

impl ChType {
    /// Derives the placeholder type from a literal value.
    pub fn of_value(value: &Value) -> CompileResult<Self> {
        match value {
            Value::String(_) => Ok(ChType::String),
            Value::Bool(_) => Ok(ChType::Bool),
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(ChType::Int64),
            Value::Number(_) => Ok(ChType::Float64),
            Value::Null => Ok(ChType::NullableString),
            Value::Array(_) => Err(CompileError::UnsupportedOperand(
                "array literal".to_string(),
            )),
            Value::Object(_) => Err(CompileError::UnsupportedOperand(
                "object literal".to_string(),
            )),
        }
    }
}

impl fmt::Display for ChType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChType::String => "String",
            ChType::Int64 => "Int64",
            ChType::Float64 => "Float64",
            ChType::Bool => "Bool",
            ChType::NullableString => "Nullable(String)",
            ChType::ArrayString => "Array(String)",
        };
        f.write_str(name)
    }
}

/// A value bound to a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundParam {
    pub value: Value,
    #[serde(rename = "type", serialize_with = "serialize_ch_type")]
    pub ch_type: ChType,
}

fn serialize_ch_type<S: serde::Serializer>(ty: &ChType, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(ty)
}

/// Allocates parameter names for a single render.
#[derive(Debug, Clone)]
pub struct ParamBuilder {
    prefix: String,
    params: BTreeMap<String, BoundParam>,
}

impl Default for ParamBuilder {
    fn default() -> Self {
        Self::new("pb")
    }
}

impl ParamBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            params: BTreeMap::new(),
        }
    }

    /// Registers `value` and returns its placeholder text.
    pub fn add_param(&mut self, value: impl Into<Value>, ch_type: ChType) -> String {
        let name = format!("{}_{}", self.prefix, self.params.len());
        let slot = param_slot(&name, ch_type);
        self.params.insert(
            name,
            BoundParam {
                value: value.into(),
                ch_type,
            },
        );
        slot
    }

    /// Registers a literal with a type derived from its value.
    pub fn add_literal(&mut self, value: &Value) -> CompileResult<String> {
        let ch_type = ChType::of_value(value)?;
        Ok(self.add_param(value.clone(), ch_type))
    }

    /// Placeholder for a list of strings.
    pub fn add_string_array(&mut self, values: &[String]) -> String {
        self.add_param(values.to_vec(), ChType::ArrayString)
    }

    /// Placeholder as an expression for use inside statements.
    pub fn slot_expr(&mut self, value: impl Into<Value>, ch_type: ChType) -> SimpleExpr {
        Expr::cust(self.add_param(value, ch_type))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn into_params(self) -> BTreeMap<String, BoundParam> {
        self.params
    }
}

fn param_slot(name: &str, ch_type: ChType) -> String {
    format!("{{{}:{}}}", name, ch_type)
}
