use crate::model::{CategoryRef, Id, InstanceRef, SpecMap, OVERFLOW_KEY};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persisted spec document of one instance. The two sections are stored as
/// distinct named members and never merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecDocument {
    #[serde(default)]
    pub formal: SpecMap,
    #[serde(default)]
    pub overflow: SpecMap,
}

impl SpecDocument {
    pub fn is_empty(&self) -> bool {
        self.formal.is_empty() && self.overflow.is_empty()
    }

    /// Key-wise overflow merge: null removes, anything else inserts/replaces,
    /// unmentioned keys are kept
    pub fn merge_overflow(&mut self, patch: &SpecMap) {
        for (key, value) in patch {
            if value.is_null() {
                self.overflow.remove(key);
            } else {
                self.overflow.insert(key.clone(), value.clone());
            }
        }
    }

    /// Keys present in both sections (always empty for a consistent document)
    pub fn overlapping_keys(&self) -> Vec<String> {
        self.formal
            .keys()
            .filter(|k| self.overflow.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Candidate map equivalent to this document, overflow under the reserved key
    pub fn to_candidate(&self) -> SpecMap {
        let mut candidate = self.formal.clone();
        if !self.overflow.is_empty() {
            candidate.insert(
                OVERFLOW_KEY.to_string(),
                serde_json::Value::Object(self.overflow.clone().into_iter().collect()),
            );
        }
        candidate
    }
}

/// Marker left on an instance whose value could not be converted by a
/// best-effort retype. The value stays untouched until remediated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecFlag {
    pub key: String,
    pub reason: String,
    pub propagation_id: Id,
    pub flagged_at: DateTime<Utc>,
}

/// The spec attached to one material or equipment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub instance: InstanceRef,
    /// Category name within the instance's namespace
    pub category: String,
    pub document: SpecDocument,
    #[serde(default)]
    pub flags: Vec<SpecFlag>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceSpec {
    pub fn new(instance: InstanceRef, category: String) -> Self {
        Self {
            instance,
            category,
            document: SpecDocument::default(),
            flags: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn category_ref(&self) -> CategoryRef {
        CategoryRef::new(self.instance.kind, self.category.clone())
    }

    pub fn is_flagged(&self, key: &str) -> bool {
        self.flags.iter().any(|f| f.key == key)
    }
}

/// Whether unknown keys of a candidate are rejected or sent to the overflow bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowRouting {
    #[default]
    Reject,
    RouteUnknown,
}

/// Output of the validator: a complete formal partition plus an overflow patch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedSpec {
    pub category: CategoryRef,
    /// Catalog version the candidate was checked against
    pub schema_version: i64,
    pub formal: SpecMap,
    /// Overflow entries to merge; null values mark removals
    pub overflow: SpecMap,
    /// Required keys that were absent and received their default
    pub injected_defaults: Vec<String>,
}

impl ValidatedSpec {
    /// Candidate map that re-validates to this spec
    pub fn to_candidate(&self) -> SpecMap {
        SpecDocument {
            formal: self.formal.clone(),
            overflow: self.overflow.clone(),
        }
        .to_candidate()
    }
}

/// How a stored attribute relates to the current catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeStatus {
    Active,
    Deprecated,
    Flagged,
    Overflow,
    /// Formal key without any live definition (only seen on corrupted data)
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeReading {
    pub key: String,
    pub value: serde_json::Value,
    pub status: AttributeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}
