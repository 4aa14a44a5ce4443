use chrono::NaiveDate;
use serde_json::{Number, Value};

use crate::model::{CoercionMode, ValueType};

/// Why a value could not be coerced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoercionFailure {
    TypeMismatch,
    NotInEnumeration,
}

const DATE_FORMAT: &str = "%Y-%m-%d";
const LENIENT_DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"];

/// Convert `value` into the canonical representation of `value_type`.
///
/// Canonical outputs coerce to themselves in either mode, so a validated map
/// re-validates unchanged. Null is never coerced here; callers decide what an
/// absent value means.
pub fn coerce_value(
    value: &Value,
    value_type: &ValueType,
    mode: CoercionMode,
) -> Result<Value, CoercionFailure> {
    match value_type {
        ValueType::String => coerce_string(value),
        ValueType::Number => coerce_number(value, mode),
        ValueType::Boolean => coerce_boolean(value, mode),
        ValueType::Date => coerce_date(value, mode),
        ValueType::Enumeration { allowed } => coerce_enumeration(value, allowed, mode),
    }
}

/// Whether `value` already is the canonical form for `value_type`
pub fn conforms(value: &Value, value_type: &ValueType) -> bool {
    match coerce_value(value, value_type, CoercionMode::Strict) {
        Ok(canonical) => &canonical == value,
        Err(_) => false,
    }
}

fn coerce_string(value: &Value) -> Result<Value, CoercionFailure> {
    match value {
        Value::String(_) => Ok(value.clone()),
        Value::Number(n) => Ok(Value::String(n.to_string())),
        Value::Bool(b) => Ok(Value::String(b.to_string())),
        _ => Err(CoercionFailure::TypeMismatch),
    }
}

fn coerce_number(value: &Value, mode: CoercionMode) -> Result<Value, CoercionFailure> {
    match value {
        Value::Number(_) => Ok(value.clone()),
        Value::String(s) => {
            let parsed = match mode {
                // Only text that the parsed number prints back as exactly
                CoercionMode::Strict => parse_number(s).filter(|n| n.to_string() == *s),
                CoercionMode::Lenient => parse_number(s.trim()),
            };
            parsed.map(Value::Number).ok_or(CoercionFailure::TypeMismatch)
        }
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => {
            Err(CoercionFailure::TypeMismatch)
        }
    }
}

fn parse_number(text: &str) -> Option<Number> {
    if text.is_empty() {
        return None;
    }
    if let Ok(i) = text.parse::<i64>() {
        return Some(Number::from(i));
    }
    if let Ok(u) = text.parse::<u64>() {
        return Some(Number::from(u));
    }
    // An integer literal too wide for both would be rounded by f64
    let digits = text.strip_prefix(['+', '-']).unwrap_or(text);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Rust's float parser accepts "inf"/"NaN"; from_f64 rejects them
    text.parse::<f64>().ok().and_then(Number::from_f64)
}

fn coerce_boolean(value: &Value, mode: CoercionMode) -> Result<Value, CoercionFailure> {
    match (value, mode) {
        (Value::Bool(_), _) => Ok(value.clone()),
        (Value::String(s), CoercionMode::Strict) => match s.as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(CoercionFailure::TypeMismatch),
        },
        (Value::String(s), CoercionMode::Lenient) => {
            match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(CoercionFailure::TypeMismatch),
            }
        }
        (Value::Number(n), CoercionMode::Lenient) => match n.as_i64() {
            Some(1) => Ok(Value::Bool(true)),
            Some(0) => Ok(Value::Bool(false)),
            _ => Err(CoercionFailure::TypeMismatch),
        },
        _ => Err(CoercionFailure::TypeMismatch),
    }
}

fn coerce_date(value: &Value, mode: CoercionMode) -> Result<Value, CoercionFailure> {
    let Value::String(s) = value else {
        return Err(CoercionFailure::TypeMismatch);
    };

    let parsed = match mode {
        CoercionMode::Strict => NaiveDate::parse_from_str(s, DATE_FORMAT).ok(),
        CoercionMode::Lenient => {
            let text = s.trim();
            LENIENT_DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        }
    };

    match parsed {
        // Strict also insists on zero padding, i.e. the input is already canonical
        Some(date) if mode == CoercionMode::Strict && date.format(DATE_FORMAT).to_string() != *s => {
            Err(CoercionFailure::TypeMismatch)
        }
        Some(date) => Ok(Value::String(date.format(DATE_FORMAT).to_string())),
        None => Err(CoercionFailure::TypeMismatch),
    }
}

fn coerce_enumeration(
    value: &Value,
    allowed: &[String],
    mode: CoercionMode,
) -> Result<Value, CoercionFailure> {
    let literal = match (value, mode) {
        (Value::String(s), CoercionMode::Strict) => s.clone(),
        (Value::String(s), CoercionMode::Lenient) => s.trim().to_string(),
        (Value::Number(n), CoercionMode::Lenient) => n.to_string(),
        (Value::Bool(b), CoercionMode::Lenient) => b.to_string(),
        _ => return Err(CoercionFailure::TypeMismatch),
    };

    if allowed.iter().any(|a| *a == literal) {
        Ok(Value::String(literal))
    } else {
        Err(CoercionFailure::NotInEnumeration)
    }
}
