use crate::model::{CategoryRef, Id, InstanceRef, ValueType};
use itertools::Itertools;
use thiserror::Error;

/// A single problem found in a candidate spec map
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("attribute '{key}' expects {expected}, got {got}")]
    TypeMismatch {
        key: String,
        expected: ValueType,
        got: serde_json::Value,
    },

    #[error("attribute '{key}' does not allow {value}; allowed: {}", .allowed.join(", "))]
    InvalidEnumValue {
        key: String,
        value: serde_json::Value,
        allowed: Vec<String>,
    },

    #[error("attribute '{0}' is not defined for this category")]
    UnknownAttributeKey(String),

    #[error("overflow entry '{0}' collides with a catalog definition")]
    OverflowKeyConflict(String),

    #[error("required attribute '{0}' has no value and no default")]
    MissingRequired(String),

    #[error("overflow bucket must be an object")]
    MalformedOverflow,
}

/// Every problem of a rejected candidate, reported together
#[derive(Debug, Clone, PartialEq, Error)]
#[error("spec rejected for {category}: {}", .errors.iter().map(|e| e.to_string()).join("; "))]
pub struct SpecRejection {
    pub category: CategoryRef,
    pub errors: Vec<ValidationError>,
}

impl SpecRejection {
    pub fn has(&self, predicate: impl Fn(&ValidationError) -> bool) -> bool {
        self.errors.iter().any(predicate)
    }
}

/// Failures of catalog administration; the triggering change is rolled back
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("category {0} not found")]
    CategoryNotFound(CategoryRef),

    #[error("category {0} already exists")]
    CategoryExists(CategoryRef),

    #[error("definition '{key}' not found in {category}")]
    DefinitionNotFound { category: CategoryRef, key: String },

    #[error("definition '{key}' is not active in {category}")]
    DefinitionInactive { category: CategoryRef, key: String },

    #[error("definition '{key}' in {category} must be deactivated first")]
    DefinitionStillActive { category: CategoryRef, key: String },

    #[error("definition '{key}' already exists in {category}")]
    DuplicateKey { category: CategoryRef, key: String },

    #[error("cannot rename to '{key}': already defined in {category}")]
    KeyCollision { category: CategoryRef, key: String },

    #[error("'{0}' is reserved for the overflow bucket")]
    ReservedKey(String),

    #[error("invalid default for '{key}': {reason}")]
    InvalidDefault { key: String, reason: String },

    #[error("values of '{key}' cannot be converted to {target} in: {}", .instance_ids.join(", "))]
    IncompatibleType {
        key: String,
        target: ValueType,
        instance_ids: Vec<Id>,
    },

    #[error("rename collides with existing value in instance {0}")]
    RenameCollision(Id),

    #[error("overflow bucket of instance {instance_id} already holds '{key}'")]
    OverflowCollision { instance_id: Id, key: String },

    #[error("category {category} is locked by propagation {propagation_id}")]
    MutationInProgress {
        category: CategoryRef,
        propagation_id: Id,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Rejected(#[from] SpecRejection),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// The active definition set changed between validation and commit
    #[error("schema of {category} changed (validated against v{expected}, now v{found}); retry")]
    StaleSchema {
        category: CategoryRef,
        expected: i64,
        found: i64,
    },

    /// A batch failed; the job resumes from `cursor` on the next run
    #[error("propagation {propagation_id} interrupted after {cursor:?}: {reason}")]
    PropagationFault {
        propagation_id: Id,
        cursor: Option<Id>,
        reason: String,
    },

    #[error("instance {0} already has specs; category change is unsupported")]
    CategoryChangeUnsupported(InstanceRef),

    #[error("instance {instance} has no overflow entry '{key}'")]
    OverflowEntryNotFound { instance: InstanceRef, key: String },

    #[error("instance {0} not found")]
    InstanceNotFound(InstanceRef),

    #[error("instance {0} already registered")]
    InstanceExists(InstanceRef),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn as_catalog(&self) -> Option<&CatalogError> {
        match self {
            EngineError::Catalog(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_rejection(&self) -> Option<&SpecRejection> {
        match self {
            EngineError::Rejected(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the caller may simply retry with fresh catalog state
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StaleSchema { .. } | EngineError::PropagationFault { .. }
        ) || matches!(self, EngineError::Catalog(CatalogError::MutationInProgress { .. }))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
