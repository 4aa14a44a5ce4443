use serde::{Deserialize, Serialize};
use std::fmt;

/// Declared type of an attribute definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    /// Calendar date, stored as `YYYY-MM-DD`
    Date,
    Enumeration {
        allowed: Vec<String>,
    },
}

impl ValueType {
    pub fn enumeration<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ValueType::Enumeration {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Date => "date",
            ValueType::Enumeration { .. } => "enumeration",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Enumeration { allowed } => {
                write!(f, "enumeration[{}]", allowed.join("|"))
            }
            other => f.write_str(other.name()),
        }
    }
}

/// How existing values are carried across a retype
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConversionPolicy {
    /// Every stored value must already satisfy the new type; otherwise nothing changes
    Strict,
    /// Convert what the validator's coercion rules can, flag the rest
    BestEffort,
}

/// Coercion strictness used by the value converter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoercionMode {
    /// Validator rules: tolerant parsing of strings and cross-scalar conversions
    Lenient,
    /// Exact textual round-trips only
    Strict,
}

impl From<ConversionPolicy> for CoercionMode {
    fn from(policy: ConversionPolicy) -> Self {
        match policy {
            ConversionPolicy::Strict => CoercionMode::Strict,
            ConversionPolicy::BestEffort => CoercionMode::Lenient,
        }
    }
}
