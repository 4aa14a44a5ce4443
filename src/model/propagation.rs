use crate::model::{AttributeDefinition, CategoryRef, ConversionPolicy, Id, ValueType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A catalog transition. Variants that touch stored instances run through the
/// propagation protocol; the rest are applied to the catalog directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CatalogMutation {
    /// New definition. Same-named overflow entries are promoted, and required
    /// definitions backfill their default
    Create {
        key: String,
        value_type: ValueType,
        required: bool,
        default_value: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        promote: Option<Promotion>,
    },
    /// required false -> true, backfilling the default
    RequireOn {
        key: String,
        default_value: serde_json::Value,
    },
    Rename {
        old_key: String,
        new_key: String,
    },
    Retype {
        key: String,
        new_type: ValueType,
        policy: ConversionPolicy,
    },
    /// Moves deprecated values into the overflow bucket, then archives the definition
    Retire { key: String },
    Deactivate { key: String },
    RequireOff { key: String },
    UpdateDefault {
        key: String,
        default_value: Option<serde_json::Value>,
    },
}

/// An overflow entry of one instance promoted into a new definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Promotion {
    pub instance_id: Id,
    pub overflow_key: String,
}

impl CatalogMutation {
    pub fn needs_instance_pass(&self) -> bool {
        matches!(
            self,
            CatalogMutation::Create { .. }
                | CatalogMutation::RequireOn { .. }
                | CatalogMutation::Rename { .. }
                | CatalogMutation::Retype { .. }
                | CatalogMutation::Retire { .. }
        )
    }

    pub fn label(&self) -> String {
        match self {
            CatalogMutation::Create { key, .. } => format!("create '{}'", key),
            CatalogMutation::RequireOn { key, .. } => format!("require '{}'", key),
            CatalogMutation::Rename { old_key, new_key } => {
                format!("rename '{}' -> '{}'", old_key, new_key)
            }
            CatalogMutation::Retype { key, new_type, policy } => {
                format!("retype '{}' to {} ({:?})", key, new_type, policy)
            }
            CatalogMutation::Retire { key } => format!("retire '{}'", key),
            CatalogMutation::Deactivate { key } => format!("deactivate '{}'", key),
            CatalogMutation::RequireOff { key } => format!("unrequire '{}'", key),
            CatalogMutation::UpdateDefault { key, .. } => format!("update default of '{}'", key),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationPhase {
    /// Read-only scan for faults; nothing has been written yet
    Checking,
    /// Batches are being rewritten; `cursor` marks the last committed instance
    Applying,
    Completed,
    Aborted,
}

impl PropagationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropagationPhase::Checking => "checking",
            PropagationPhase::Applying => "applying",
            PropagationPhase::Completed => "completed",
            PropagationPhase::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "checking" => Some(PropagationPhase::Checking),
            "applying" => Some(PropagationPhase::Applying),
            "completed" => Some(PropagationPhase::Completed),
            "aborted" => Some(PropagationPhase::Aborted),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, PropagationPhase::Completed | PropagationPhase::Aborted)
    }
}

/// Running totals of a propagation, persisted with every batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub scanned: usize,
    pub updated: usize,
    /// Values rewritten into a new type
    #[serde(default)]
    pub converted: usize,
    /// Instances whose value could not be converted (best-effort retype)
    pub flagged_instances: Vec<Id>,
    /// Instances whose overflow entry moved into the formal partition
    pub promoted_instances: Vec<Id>,
}

impl PropagationReport {
    pub fn absorb(&mut self, other: PropagationReport) {
        self.scanned += other.scanned;
        self.updated += other.updated;
        self.converted += other.converted;
        self.flagged_instances.extend(other.flagged_instances);
        self.promoted_instances.extend(other.promoted_instances);
    }
}

/// Durable record of one catalog mutation and its progress over the category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationJob {
    pub id: Id,
    pub category: CategoryRef,
    pub mutation: CatalogMutation,
    /// Definition row as it reads once the job completes
    pub target: AttributeDefinition,
    pub phase: PropagationPhase,
    /// Last instance id committed by the apply phase
    pub cursor: Option<Id>,
    /// Category schema version observed when the job was submitted
    pub base_version: i64,
    pub report: PropagationReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PropagationJob {
    pub fn new(
        category: CategoryRef,
        mutation: CatalogMutation,
        target: AttributeDefinition,
        base_version: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: crate::model::generate_id(),
            category,
            mutation,
            target,
            phase: PropagationPhase::Checking,
            cursor: None,
            base_version,
            report: PropagationReport::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of a retype, returned to the catalog administration caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetypeReport {
    pub propagation_id: Id,
    pub definition: AttributeDefinition,
    pub key: String,
    pub policy: ConversionPolicy,
    pub converted: usize,
    /// Exactly the instances left unconverted and flagged for remediation
    pub failed_instance_ids: Vec<Id>,
}
