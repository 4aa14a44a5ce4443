use crate::model::{CategoryRef, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A category scoping which attribute definitions apply to its instances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    #[serde(flatten)]
    pub category: CategoryRef,

    pub description: Option<String>,

    /// Bumped by every catalog mutation; instance writes validated against an
    /// older version are refused at commit time
    pub schema_version: i64,

    /// Propagation currently rewriting this category's instances, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_propagation: Option<Id>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Category {
    pub fn new(category: CategoryRef, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            category,
            description,
            schema_version: 0,
            active_propagation: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_propagating(&self) -> bool {
        self.active_propagation.is_some()
    }
}
