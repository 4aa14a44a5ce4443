pub mod config;
pub mod error;
pub mod logic;
pub mod model;
pub mod seed;
pub mod store;

pub use error::{CatalogError, EngineError, EngineResult, SpecRejection, ValidationError};

pub use logic::{
    AuditFinding, AuditFindingKind, AuditResult, CatalogSnapshot, DefinitionCatalog,
    InstanceSpecService, Propagator, SpecAuditor, SpecValidator,
};

// Export all model types
pub use model::*;

// Export store types
pub use store::{MemoryStore, PostgresStore, Store};
