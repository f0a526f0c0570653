//! Identities: credentials exported to steps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ResourceId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: ResourceId,
    pub project_id: ResourceId,
    pub name: String,
    pub connector: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl Identity {
    /// Environment variables exported by this identity.
    ///
    /// They come from the `environment` object of the identity data. Scalar
    /// values are converted to text, anything else is ignored.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let Some(vars) = self.data.get("environment").and_then(Value::as_object) else {
            return BTreeMap::new();
        };

        vars.iter()
            .filter_map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((name.clone(), value))
            })
            .collect()
    }
}
