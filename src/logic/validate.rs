use std::collections::HashMap;

use serde_json::Value;

use crate::error::{SpecRejection, ValidationError};
use crate::logic::coerce::{coerce_value, CoercionFailure};
use crate::model::{
    AttributeDefinition, Category, CategoryRef, CoercionMode, OverflowRouting, SpecMap,
    ValidatedSpec, OVERFLOW_KEY,
};

/// The live definitions of one category at a given schema version
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub category: Category,
    /// Active and deprecated definitions in insertion order; retired ones are excluded
    pub definitions: Vec<AttributeDefinition>,
}

impl CatalogSnapshot {
    pub fn category_ref(&self) -> &CategoryRef {
        &self.category.category
    }

    pub fn schema_version(&self) -> i64 {
        self.category.schema_version
    }

    pub fn active(&self) -> impl Iterator<Item = &AttributeDefinition> {
        self.definitions.iter().filter(|d| d.is_active())
    }

    pub fn find(&self, key: &str) -> Option<&AttributeDefinition> {
        self.definitions.iter().find(|d| d.key == key)
    }

    pub fn find_active(&self, key: &str) -> Option<&AttributeDefinition> {
        self.active().find(|d| d.key == key)
    }
}

/// Checks candidate spec maps against a catalog snapshot.
///
/// Pure: no store access. Persisting the result is the instance service's job.
pub struct SpecValidator<'a> {
    snapshot: &'a CatalogSnapshot,
}

impl<'a> SpecValidator<'a> {
    pub fn new(snapshot: &'a CatalogSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn validate(
        &self,
        candidate: &SpecMap,
        routing: OverflowRouting,
    ) -> Result<ValidatedSpec, SpecRejection> {
        let active: HashMap<&str, &AttributeDefinition> =
            self.snapshot.active().map(|d| (d.key.as_str(), d)).collect();

        let mut errors = Vec::new();
        let mut formal = SpecMap::new();
        let mut overflow = SpecMap::new();

        // Entries explicitly placed in the overflow bucket
        if let Some(bucket) = candidate.get(OVERFLOW_KEY) {
            match bucket {
                Value::Object(entries) => {
                    for (key, value) in entries {
                        self.route_to_overflow(key, value, &mut overflow, &mut errors);
                    }
                }
                Value::Null => {}
                _ => errors.push(ValidationError::MalformedOverflow),
            }
        }

        for (key, value) in candidate {
            if key == OVERFLOW_KEY {
                continue;
            }

            match active.get(key.as_str()) {
                Some(def) => {
                    if let Some(coerced) = Self::check_formal(def, value, &mut errors) {
                        formal.insert(key.clone(), coerced);
                    }
                }
                None => match routing {
                    // Deprecated keys are not writable and cannot be parked in overflow either
                    OverflowRouting::RouteUnknown if self.snapshot.find(key).is_none() => {
                        self.route_to_overflow(key, value, &mut overflow, &mut errors);
                    }
                    _ => errors.push(ValidationError::UnknownAttributeKey(key.clone())),
                },
            }
        }

        let mut injected_defaults = Vec::new();
        for def in self.snapshot.active().filter(|d| d.required) {
            if formal.contains_key(&def.key) || candidate.contains_key(&def.key) {
                continue;
            }
            match &def.default_value {
                Some(default) => {
                    formal.insert(def.key.clone(), default.clone());
                    injected_defaults.push(def.key.clone());
                }
                None => errors.push(ValidationError::MissingRequired(def.key.clone())),
            }
        }

        if !errors.is_empty() {
            return Err(SpecRejection {
                category: self.snapshot.category_ref().clone(),
                errors,
            });
        }

        Ok(ValidatedSpec {
            category: self.snapshot.category_ref().clone(),
            schema_version: self.snapshot.schema_version(),
            formal,
            overflow,
            injected_defaults,
        })
    }

    /// Coerce one formal value. `None` with no error pushed means "absent".
    fn check_formal(
        def: &AttributeDefinition,
        value: &Value,
        errors: &mut Vec<ValidationError>,
    ) -> Option<Value> {
        if value.is_null() {
            if def.required {
                errors.push(ValidationError::TypeMismatch {
                    key: def.key.clone(),
                    expected: def.value_type.clone(),
                    got: Value::Null,
                });
            }
            return None;
        }

        match coerce_value(value, &def.value_type, CoercionMode::Lenient) {
            Ok(coerced) => Some(coerced),
            Err(CoercionFailure::NotInEnumeration) => {
                let allowed = match &def.value_type {
                    crate::model::ValueType::Enumeration { allowed } => allowed.clone(),
                    _ => Vec::new(),
                };
                errors.push(ValidationError::InvalidEnumValue {
                    key: def.key.clone(),
                    value: value.clone(),
                    allowed,
                });
                None
            }
            Err(CoercionFailure::TypeMismatch) => {
                errors.push(ValidationError::TypeMismatch {
                    key: def.key.clone(),
                    expected: def.value_type.clone(),
                    got: value.clone(),
                });
                None
            }
        }
    }

    fn route_to_overflow(
        &self,
        key: &str,
        value: &Value,
        overflow: &mut SpecMap,
        errors: &mut Vec<ValidationError>,
    ) {
        if key == OVERFLOW_KEY || self.snapshot.find(key).is_some() {
            errors.push(ValidationError::OverflowKeyConflict(key.to_string()));
            return;
        }
        overflow.insert(key.to_string(), value.clone());
    }
}
