//! Trigger filters evaluated against event payloads.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// A condition on one value of an event payload.
///
/// The value is located with a JSON pointer (RFC 6901). Every condition that
/// is set must hold; a missing or null value never matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_equal_to: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_not_equal_to: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub does_not_match: Option<String>,
}

impl Filter {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn is_equal_to(mut self, value: impl Into<Value>) -> Self {
        self.is_equal_to = Some(value.into());
        self
    }

    pub fn is_not_equal_to(mut self, value: impl Into<Value>) -> Self {
        self.is_not_equal_to = Some(value.into());
        self
    }

    pub fn matches(mut self, pattern: impl Into<String>) -> Self {
        self.matches = Some(pattern.into());
        self
    }

    pub fn does_not_match(mut self, pattern: impl Into<String>) -> Self {
        self.does_not_match = Some(pattern.into());
        self
    }

    /// Check that the path is a valid pointer and both patterns compile.
    pub fn validate(&self) -> Result<()> {
        if !self.path.is_empty() && !self.path.starts_with('/') {
            return Err(Error::InvalidInput(format!(
                "invalid filter path {:?}: json pointers must start with '/'",
                self.path
            )));
        }
        for pattern in [&self.matches, &self.does_not_match].into_iter().flatten() {
            compile(pattern)?;
        }
        Ok(())
    }

    pub fn matches_value(&self, data: &Value) -> Result<bool> {
        let value = match data.pointer(&self.path) {
            None | Some(Value::Null) => return Ok(false),
            Some(value) => value,
        };

        if let Some(expected) = &self.is_equal_to {
            if !json_equal(expected, value) {
                return Ok(false);
            }
        }

        if let Some(unexpected) = &self.is_not_equal_to {
            if json_equal(unexpected, value) {
                return Ok(false);
            }
        }

        if let Some(pattern) = &self.matches {
            match value.as_str() {
                Some(s) if compile(pattern)?.is_match(s) => {}
                _ => return Ok(false),
            }
        }

        if let Some(pattern) = &self.does_not_match {
            match value.as_str() {
                Some(s) if !compile(pattern)?.is_match(s) => {}
                _ => return Ok(false),
            }
        }

        Ok(true)
    }
}

/// True when every filter matches; an empty list always matches.
pub fn match_all(filters: &[Filter], data: &Value) -> Result<bool> {
    for filter in filters {
        if !filter.matches_value(data)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| Error::InvalidInput(format!("invalid regexp {:?}: {}", pattern, e)))
}

/// JSON equality where numbers compare by value, so `1` equals `1.0`.
fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| json_equal(x, y)))
        }
        _ => a == b,
    }
}
