use crate::schema::CapabilitySchema;
use fleetsim_error::schema::SchemaError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A capability model decorated with the id and name used by simulations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub capability_model: Value,
}

impl DeviceModel {
    #[inline]
    pub fn schema(&self) -> Result<CapabilitySchema, SchemaError> {
        CapabilitySchema::parse(&self.capability_model)
    }

    /// Model id announced at registration: the root interface `@id`, else the record id.
    pub fn model_id(&self) -> String {
        let root = match &self.capability_model {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        root.and_then(|r| r.get("@id"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_id_fallback() {
        let with_root = DeviceModel {
            id: "m1".into(),
            name: "Model".into(),
            capability_model: json!([{"@id": "dtmi:x;1"}]),
        };
        assert_eq!(with_root.model_id(), "dtmi:x;1");

        let without = DeviceModel {
            id: "m1".into(),
            name: "Model".into(),
            capability_model: json!([]),
        };
        assert_eq!(without.model_id(), "m1");
    }
}
