//! Flag state projection and its storage codecs.
//!
//! [`FlagState`] is the full typed state of one flag. All three storage
//! tiers persist it as a map from attribute name to an encoded string:
//! the Remote tier as hash fields, the Local tier as an in-process field
//! map, the Durable tier as one JSON object in the row's `data` column.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{AdapterError, MagickError, Result};
use crate::targeting::Targeting;
use crate::value::{FlagStatus, FlagType, FlagValue};

/// Attribute names used across all storage tiers.
pub mod attr {
    pub const TYPE: &str = "type";
    pub const STATUS: &str = "status";
    pub const VALUE: &str = "value";
    pub const DEFAULT_VALUE: &str = "default_value";
    pub const DESCRIPTION: &str = "description";
    pub const DISPLAY_NAME: &str = "display_name";
    pub const GROUP: &str = "group";
    pub const DEPENDENCIES: &str = "dependencies";
    pub const TARGETING: &str = "targeting";
    pub const VARIANTS: &str = "variants";
}

/// A weighted value alternative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub value: FlagValue,
    pub weight: f64,
}

impl Variant {
    pub fn new(name: impl Into<String>, value: impl Into<FlagValue>, weight: f64) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            weight,
        }
    }
}

/// In-memory projection of one flag's authoritative storage state.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagState {
    pub flag_type: FlagType,
    pub status: FlagStatus,
    pub value: FlagValue,
    pub default_value: FlagValue,
    pub description: Option<String>,
    pub display_name: Option<String>,
    pub group: Option<String>,
    pub dependencies: Vec<String>,
    pub targeting: Targeting,
    pub variants: Vec<Variant>,
}

impl FlagState {
    /// Fresh state for a newly registered flag: the value starts at the
    /// default, status active, no targeting.
    pub fn new(flag_type: FlagType, default_value: FlagValue) -> Self {
        Self {
            flag_type,
            status: FlagStatus::Active,
            value: default_value.clone(),
            default_value,
            description: None,
            display_name: None,
            group: None,
            dependencies: Vec::new(),
            targeting: Targeting::new(),
            variants: Vec::new(),
        }
    }

    /// Encode into the attribute field map shared by all tiers.
    pub fn to_fields(&self) -> Result<BTreeMap<String, String>> {
        let mut fields = BTreeMap::new();
        fields.insert(attr::TYPE.to_string(), self.flag_type.as_str().to_string());
        fields.insert(attr::STATUS.to_string(), self.status.as_str().to_string());
        fields.insert(attr::VALUE.to_string(), self.value.encode());
        fields.insert(
            attr::DEFAULT_VALUE.to_string(),
            self.default_value.encode(),
        );

        if let Some(description) = &self.description {
            fields.insert(attr::DESCRIPTION.to_string(), description.clone());
        }
        if let Some(display_name) = &self.display_name {
            fields.insert(attr::DISPLAY_NAME.to_string(), display_name.clone());
        }
        if let Some(group) = &self.group {
            fields.insert(attr::GROUP.to_string(), group.clone());
        }
        if !self.dependencies.is_empty() {
            let encoded = serde_json::to_string(&self.dependencies).map_err(AdapterError::from)?;
            fields.insert(attr::DEPENDENCIES.to_string(), encoded);
        }
        if !self.targeting.is_empty() {
            fields.insert(attr::TARGETING.to_string(), self.targeting.to_json()?);
        }
        if !self.variants.is_empty() {
            let encoded = serde_json::to_string(&self.variants).map_err(AdapterError::from)?;
            fields.insert(attr::VARIANTS.to_string(), encoded);
        }

        Ok(fields)
    }

    /// Decode from an attribute field map. The `type` field anchors the
    /// value decoding; a missing `value` falls back to the default, and
    /// a missing default to the type's off value.
    pub fn from_fields(name: &str, fields: &BTreeMap<String, String>) -> Result<Self> {
        let flag_type = fields
            .get(attr::TYPE)
            .map(|raw| FlagType::parse(raw))
            .transpose()?
            .ok_or_else(|| MagickError::invalid_value(name, "missing 'type' attribute"))?;

        let status = fields
            .get(attr::STATUS)
            .map(|raw| FlagStatus::parse(raw))
            .transpose()?
            .unwrap_or_default();

        let default_value = fields
            .get(attr::DEFAULT_VALUE)
            .map(|raw| FlagValue::decode(name, flag_type, raw))
            .transpose()?
            .unwrap_or_else(|| FlagValue::off_value(flag_type));

        let value = fields
            .get(attr::VALUE)
            .map(|raw| FlagValue::decode(name, flag_type, raw))
            .transpose()?
            .unwrap_or_else(|| default_value.clone());

        let dependencies = fields
            .get(attr::DEPENDENCIES)
            .map(|raw| serde_json::from_str::<Vec<String>>(raw).map_err(AdapterError::from))
            .transpose()?
            .unwrap_or_default();

        let targeting = fields
            .get(attr::TARGETING)
            .map(|raw| Targeting::from_json(raw))
            .transpose()?
            .unwrap_or_default();

        let variants = fields
            .get(attr::VARIANTS)
            .map(|raw| serde_json::from_str::<Vec<Variant>>(raw).map_err(AdapterError::from))
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            flag_type,
            status,
            value,
            default_value,
            description: fields.get(attr::DESCRIPTION).cloned(),
            display_name: fields.get(attr::DISPLAY_NAME).cloned(),
            group: fields.get(attr::GROUP).cloned(),
            dependencies,
            targeting,
            variants,
        })
    }

    /// Encode for the Durable tier's `data` column: one JSON object
    /// whose keys are attribute names.
    pub fn to_data_json(&self) -> Result<String> {
        let fields = self.to_fields()?;
        let object: serde_json::Map<String, JsonValue> = fields
            .into_iter()
            .map(|(k, v)| (k, JsonValue::String(v)))
            .collect();
        serde_json::to_string(&JsonValue::Object(object))
            .map_err(AdapterError::from)
            .map_err(Into::into)
    }

    /// Decode a Durable `data` column back into state.
    pub fn from_data_json(name: &str, raw: &str) -> Result<Self> {
        let object: serde_json::Map<String, JsonValue> =
            serde_json::from_str(raw).map_err(AdapterError::from)?;
        let fields: BTreeMap<String, String> = object
            .into_iter()
            .filter_map(|(k, v)| match v {
                JsonValue::String(s) => Some((k, s)),
                other => Some((k, other.to_string())),
            })
            .collect();
        Self::from_fields(name, &fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> FlagState {
        let mut state = FlagState::new(FlagType::String, FlagValue::string("v1"));
        state.status = FlagStatus::Deprecated;
        state.value = FlagValue::string("v2");
        state.description = Some("API version pin".to_string());
        state.group = Some("api".to_string());
        state.dependencies = vec!["base".to_string()];
        state.targeting.roles.insert("admin".to_string());
        state.variants = vec![
            Variant::new("control", "v1", 50.0),
            Variant::new("candidate", "v2", 50.0),
        ];
        state
    }

    #[test]
    fn test_field_round_trip() {
        let state = sample_state();
        let fields = state.to_fields().unwrap();
        let decoded = FlagState::from_fields("api_version", &fields).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_field_map_scalar_encodings() {
        let mut state = FlagState::new(FlagType::Boolean, FlagValue::Boolean(false));
        state.value = FlagValue::Boolean(true);
        let fields = state.to_fields().unwrap();

        assert_eq!(fields.get(attr::TYPE).unwrap(), "boolean");
        assert_eq!(fields.get(attr::VALUE).unwrap(), "true");
        assert_eq!(fields.get(attr::DEFAULT_VALUE).unwrap(), "false");
        assert_eq!(fields.get(attr::STATUS).unwrap(), "active");
        assert!(!fields.contains_key(attr::TARGETING));
        assert!(!fields.contains_key(attr::DEPENDENCIES));
    }

    #[test]
    fn test_missing_value_falls_back_to_default() {
        let mut fields = BTreeMap::new();
        fields.insert(attr::TYPE.to_string(), "number".to_string());
        fields.insert(attr::DEFAULT_VALUE.to_string(), "3".to_string());

        let state = FlagState::from_fields("retries", &fields).unwrap();
        assert_eq!(state.value, FlagValue::Number(3.0));
        assert_eq!(state.default_value, FlagValue::Number(3.0));
        assert_eq!(state.status, FlagStatus::Active);
    }

    #[test]
    fn test_missing_type_is_an_error() {
        let fields = BTreeMap::new();
        assert!(FlagState::from_fields("ghost", &fields).is_err());
    }

    #[test]
    fn test_data_json_round_trip() {
        let state = sample_state();
        let json = state.to_data_json().unwrap();
        let decoded = FlagState::from_data_json("api_version", &json).unwrap();
        assert_eq!(decoded, state);

        // The data column is an object keyed by attribute name.
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed.get(attr::TYPE).is_some());
        assert!(parsed.get(attr::TARGETING).is_some());
    }
}
