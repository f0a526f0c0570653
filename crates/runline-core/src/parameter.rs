//! Job parameters.

use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Parameter values of a job execution, keyed by parameter name.
pub type ParameterValues = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum ParameterType {
    #[display("number")]
    Number,
    #[display("integer")]
    Integer,
    #[display("string")]
    String,
    #[display("boolean")]
    Boolean,
}

/// A parameter declared by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ParameterType,
    /// Allowed values for string parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Environment variable the value is exported as when a step runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            name: name.into(),
            kind,
            values: Vec::new(),
            default: None,
            description: None,
            environment: None,
        }
    }

    pub fn check_value(&self, value: &Value) -> Result<()> {
        let valid = match self.kind {
            ParameterType::Number => value.is_number(),
            ParameterType::Integer => value.is_i64() || value.is_u64(),
            ParameterType::String => match value.as_str() {
                Some(s) => self.values.is_empty() || self.values.iter().any(|v| v == s),
                None => false,
            },
            ParameterType::Boolean => value.is_boolean(),
        };

        if valid {
            Ok(())
        } else if self.kind == ParameterType::String && value.is_string() {
            Err(Error::InvalidInput(format!(
                "invalid value {} for parameter {:?}: must be one of {}",
                value,
                self.name,
                self.values.join(", ")
            )))
        } else {
            Err(Error::InvalidInput(format!(
                "invalid value {} for parameter {:?}: value is not a {}",
                value, self.name, self.kind
            )))
        }
    }

    /// Textual form of a value, as exported in environment variables.
    pub fn value_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Default values of every parameter that declares one.
pub fn default_values(parameters: &[Parameter]) -> ParameterValues {
    parameters
        .iter()
        .filter_map(|p| p.default.clone().map(|v| (p.name.clone(), v)))
        .collect()
}

/// Validate caller supplied values and complete them with defaults.
///
/// Unknown parameters, values of the wrong type and mandatory parameters
/// without a value are rejected.
pub fn check_values(parameters: &[Parameter], values: &ParameterValues) -> Result<ParameterValues> {
    for (name, value) in values {
        let parameter = parameters
            .iter()
            .find(|p| &p.name == name)
            .ok_or_else(|| Error::InvalidInput(format!("unknown parameter {:?}", name)))?;
        parameter.check_value(value)?;
    }

    let mut result = values.clone();
    for parameter in parameters {
        if result.contains_key(&parameter.name) {
            continue;
        }
        match &parameter.default {
            Some(default) => {
                result.insert(parameter.name.clone(), default.clone());
            }
            None => {
                return Err(Error::InvalidInput(format!(
                    "missing parameter {:?}",
                    parameter.name
                )));
            }
        }
    }

    Ok(result)
}
