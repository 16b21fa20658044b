//! Typed flag values.
//!
//! A flag's `type` and its value domain are bound for the flag's whole
//! lifetime: boolean flags hold `true`/`false`, string flags hold UTF-8
//! strings, number flags hold finite reals.

use serde::{Deserialize, Serialize};

use crate::error::{MagickError, Result};

/// Declared type of a feature flag. Immutable after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    Boolean,
    String,
    Number,
}

impl FlagType {
    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Number => "number",
        }
    }

    /// Parse a wire name back into a type.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "boolean" => Ok(Self::Boolean),
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            other => Err(MagickError::InvalidType(other.to_string())),
        }
    }
}

/// A concrete flag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Boolean(bool),
    String(String),
    Number(f64),
}

impl FlagValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self::String(value.into())
    }

    /// The type this value belongs to.
    pub fn flag_type(&self) -> FlagType {
        match self {
            Self::Boolean(_) => FlagType::Boolean,
            Self::String(_) => FlagType::String,
            Self::Number(_) => FlagType::Number,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Truthiness used by `is_enabled`: `true`, a non-empty string, or a
    /// number greater than zero.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Boolean(b) => *b,
            Self::String(s) => !s.is_empty(),
            Self::Number(n) => *n > 0.0,
        }
    }

    /// The "on" value for a type. Only booleans have one; enabling a
    /// string or number flag is a type error at the call site.
    pub fn on_value(flag_type: FlagType) -> Option<Self> {
        match flag_type {
            FlagType::Boolean => Some(Self::Boolean(true)),
            FlagType::String | FlagType::Number => None,
        }
    }

    /// The "off" value for a type: `false`, `""`, or `0`.
    pub fn off_value(flag_type: FlagType) -> Self {
        match flag_type {
            FlagType::Boolean => Self::Boolean(false),
            FlagType::String => Self::String(String::new()),
            FlagType::Number => Self::Number(0.0),
        }
    }

    /// Validate the type/value binding, rejecting non-finite numbers.
    pub fn check_type(&self, feature: &str, flag_type: FlagType) -> Result<()> {
        if self.flag_type() != flag_type {
            return Err(MagickError::invalid_value(
                feature,
                format!(
                    "expected {} value, got {}",
                    flag_type.as_str(),
                    self.flag_type().as_str()
                ),
            ));
        }
        if let Self::Number(n) = self {
            if !n.is_finite() {
                return Err(MagickError::invalid_value(feature, "number must be finite"));
            }
        }
        Ok(())
    }

    /// Scalar wire encoding: `"true"`/`"false"`, a numeric literal, or
    /// the raw string. Used for storage fields across all tiers.
    pub fn encode(&self) -> String {
        match self {
            Self::Boolean(b) => b.to_string(),
            Self::String(s) => s.clone(),
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
        }
    }

    /// Decode a scalar wire encoding for a known type. `feature` names
    /// the flag in the error when the stored text is malformed.
    pub fn decode(feature: &str, flag_type: FlagType, raw: &str) -> Result<Self> {
        match flag_type {
            FlagType::Boolean => match raw {
                "true" => Ok(Self::Boolean(true)),
                "false" => Ok(Self::Boolean(false)),
                other => Err(MagickError::invalid_value(
                    feature,
                    format!("'{other}' is not a boolean"),
                )),
            },
            FlagType::String => Ok(Self::String(raw.to_string())),
            FlagType::Number => {
                let n: f64 = raw.parse().map_err(|_| {
                    MagickError::invalid_value(feature, format!("'{raw}' is not a number"))
                })?;
                if !n.is_finite() {
                    return Err(MagickError::invalid_value(feature, "number must be finite"));
                }
                Ok(Self::Number(n))
            }
        }
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// Lifecycle status of a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagStatus {
    #[default]
    Active,
    Inactive,
    Deprecated,
}

impl FlagStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Deprecated => "deprecated",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(MagickError::InvalidType(format!("status '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_value_binding() {
        assert!(FlagValue::Boolean(true).check_type("f", FlagType::Boolean).is_ok());
        assert!(FlagValue::Boolean(true).check_type("f", FlagType::String).is_err());
        assert!(FlagValue::Number(f64::NAN).check_type("f", FlagType::Number).is_err());
        assert!(FlagValue::Number(f64::INFINITY).check_type("f", FlagType::Number).is_err());
        assert!(FlagValue::Number(12.5).check_type("f", FlagType::Number).is_ok());
    }

    #[test]
    fn test_truthiness() {
        assert!(FlagValue::Boolean(true).is_truthy());
        assert!(!FlagValue::Boolean(false).is_truthy());
        assert!(FlagValue::string("v1").is_truthy());
        assert!(!FlagValue::string("").is_truthy());
        assert!(FlagValue::Number(0.5).is_truthy());
        assert!(!FlagValue::Number(0.0).is_truthy());
        assert!(!FlagValue::Number(-3.0).is_truthy());
    }

    #[test]
    fn test_scalar_wire_encoding() {
        assert_eq!(FlagValue::Boolean(true).encode(), "true");
        assert_eq!(FlagValue::Boolean(false).encode(), "false");
        assert_eq!(FlagValue::Number(42.0).encode(), "42");
        assert_eq!(FlagValue::Number(0.25).encode(), "0.25");
        assert_eq!(FlagValue::string("v2").encode(), "v2");
    }

    #[test]
    fn test_decode_round_trip() {
        let decoded = FlagValue::decode("f", FlagType::Number, "42").unwrap();
        assert_eq!(decoded, FlagValue::Number(42.0));
        assert_eq!(
            FlagValue::decode("f", FlagType::Boolean, "false").unwrap(),
            FlagValue::Boolean(false)
        );
        assert!(FlagValue::decode("f", FlagType::Boolean, "yes").is_err());
        assert!(FlagValue::decode("f", FlagType::Number, "abc").is_err());
    }

    #[test]
    fn test_off_values() {
        assert_eq!(FlagValue::off_value(FlagType::Boolean), FlagValue::Boolean(false));
        assert_eq!(FlagValue::off_value(FlagType::String), FlagValue::string(""));
        assert_eq!(FlagValue::off_value(FlagType::Number), FlagValue::Number(0.0));
        assert!(FlagValue::on_value(FlagType::String).is_none());
        assert_eq!(FlagValue::on_value(FlagType::Boolean), Some(FlagValue::Boolean(true)));
    }
}
