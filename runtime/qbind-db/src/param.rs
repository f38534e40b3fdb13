//! Parameter descriptors and typed bind values.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::QueryError;

/// Declared type of a parameter. Governs coercion and the bind variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    String,
    Number,
}

/// A parameter value as supplied by the host. JSON callers may send either
/// a string or a number; the compiler only ever looks at its text form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    Number(f64),
}

impl ParamValue {
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            ParamValue::Text(text) => Cow::Borrowed(text),
            ParamValue::Number(num) => Cow::Owned(num.to_string()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDescriptor {
    pub name: String,
    pub value: ParamValue,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub expand_as_list: bool,
}

impl ParameterDescriptor {
    pub fn new(name: impl Into<String>, value: impl Into<ParamValue>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            data_type,
            expand_as_list: false,
        }
    }

    pub fn text(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self::new(name, value, DataType::String)
    }

    pub fn number(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self::new(name, value, DataType::Number)
    }

    /// Marks this parameter as a comma-separated `IN (...)` list.
    pub fn expanded(mut self) -> Self {
        self.expand_as_list = true;
        self
    }
}

/// A coerced value ready to hand to a driver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindValue {
    Number(f64),
    Text(String),
}

impl DataType {
    /// Coerces one raw segment. Numbers ignore surrounding whitespace and an
    /// empty segment reads as zero.
    pub fn coerce(self, name: &str, raw: &str) -> Result<BindValue, QueryError> {
        match self {
            DataType::String => Ok(BindValue::Text(raw.to_string())),
            DataType::Number => {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    return Ok(BindValue::Number(0.0));
                }
                match trimmed.parse::<f64>() {
                    Ok(num) if num.is_finite() => Ok(BindValue::Number(num)),
                    _ => Err(QueryError::binding(
                        name,
                        format!("'{raw}' is not a valid number"),
                    )),
                }
            }
        }
    }
}
