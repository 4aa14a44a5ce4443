use crate::model::{CategoryRef, Id, ValueType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default user for rows written without an acting user
fn default_user() -> String {
    "system".to_string()
}

/// Catalog entry describing one legal attribute of a category.
///
/// The `id` is the stable identity of the definition; a rename changes `key`
/// on the same record. Definitions are never physically removed: they are
/// deactivated, and later retired once no instance carries the key in its
/// formal partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDefinition {
    pub id: Id,

    pub category: CategoryRef,

    /// Key used in instance spec maps (e.g. "flow_rate")
    pub key: String,

    /// Label for display; defaults to the key
    pub display_name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,

    pub value_type: ValueType,

    pub required: bool,

    /// Backfill value; always `Some` for required definitions
    pub default_value: Option<serde_json::Value>,

    pub active: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,

    #[serde(default = "default_user")]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_user")]
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle state derived from the `active` / `retired_at` fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionState {
    Active,
    /// Deactivated but still carried by historical instances
    Deprecated,
    /// Archived; no instance holds the key any more
    Retired,
}

impl AttributeDefinition {
    pub fn from_new(category: CategoryRef, new_def: NewAttributeDefinition, user_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: crate::model::generate_id(),
            category,
            display_name: new_def.display_name.unwrap_or_else(|| new_def.key.clone()),
            key: new_def.key,
            unit: new_def.unit,
            description: new_def.description,
            sort_order: new_def.sort_order,
            value_type: new_def.value_type,
            required: new_def.required,
            default_value: new_def.default_value.filter(|v| !v.is_null()),
            active: true,
            retired_at: None,
            created_by: user_id.clone(),
            created_at: now,
            updated_by: user_id,
            updated_at: now,
        }
    }

    pub fn state(&self) -> DefinitionState {
        if self.retired_at.is_some() {
            DefinitionState::Retired
        } else if self.active {
            DefinitionState::Active
        } else {
            DefinitionState::Deprecated
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() == DefinitionState::Active
    }

    /// Active or deprecated: the key may still appear in formal partitions
    pub fn is_live(&self) -> bool {
        self.retired_at.is_none()
    }

    /// Returns a copy with the audit fields stamped for an update
    pub fn touched(&self, user_id: &str) -> Self {
        let mut next = self.clone();
        next.updated_by = user_id.to_string();
        next.updated_at = Utc::now();
        next
    }
}

/// Input for `create_definition`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAttributeDefinition {
    pub key: String,
    pub value_type: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort_order: Option<i32>,
}

impl NewAttributeDefinition {
    pub fn new(key: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            key: key.into(),
            value_type,
            required: false,
            default_value: None,
            display_name: None,
            unit: None,
            description: None,
            sort_order: None,
        }
    }

    pub fn required(mut self, default_value: serde_json::Value) -> Self {
        self.required = true;
        self.default_value = Some(default_value);
        self
    }

    pub fn with_default(mut self, default_value: serde_json::Value) -> Self {
        self.default_value = Some(default_value);
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_new_fills_display_name_and_drops_null_default() {
        let def = AttributeDefinition::from_new(
            CategoryRef::equipment("pump"),
            NewAttributeDefinition::new("flow_rate", ValueType::Number).with_default(json!(null)),
            "admin".to_string(),
        );

        assert_eq!(def.display_name, "flow_rate");
        assert_eq!(def.default_value, None);
        assert_eq!(def.state(), DefinitionState::Active);
        assert_eq!(def.created_by, "admin");
    }

    #[test]
    fn test_state_transitions() {
        let mut def = AttributeDefinition::from_new(
            CategoryRef::material("steel"),
            NewAttributeDefinition::new("grade", ValueType::String),
            "admin".to_string(),
        );
        def.active = false;
        assert_eq!(def.state(), DefinitionState::Deprecated);
        assert!(def.is_live());

        def.retired_at = Some(Utc::now());
        assert_eq!(def.state(), DefinitionState::Retired);
        assert!(!def.is_live());
    }
}
