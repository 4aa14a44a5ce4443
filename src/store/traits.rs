use crate::error::EngineResult;
use crate::model::{
    AttributeDefinition, Category, CategoryRef, EntityKind, Id, InstanceRef, InstanceSpec,
    PropagationJob, PropagationReport,
};

/// Catalog rows: categories and their attribute definitions
#[async_trait::async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_category(&self, category: &CategoryRef) -> EngineResult<Option<Category>>;
    async fn list_categories(&self, kind: EntityKind) -> EngineResult<Vec<Category>>;
    /// Fails with `CategoryExists` if the category is already present
    async fn insert_category(&self, category: Category) -> EngineResult<()>;
    /// Every definition of the category, retired ones included, in insertion order
    async fn list_definitions(&self, category: &CategoryRef)
        -> EngineResult<Vec<AttributeDefinition>>;
    /// Upsert a definition whose change needs no instance rewrite. Commits only
    /// if the category is still at `expected_version` and not propagating;
    /// bumps the schema version.
    async fn apply_definition_change(
        &self,
        definition: AttributeDefinition,
        expected_version: i64,
    ) -> EngineResult<Category>;
}

/// Spec documents of material and equipment records
#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get_instance_spec(&self, instance: &InstanceRef) -> EngineResult<Option<InstanceSpec>>;
    /// Instances of `category` with id greater than `after`, ordered by id
    async fn list_instance_batch(
        &self,
        category: &CategoryRef,
        after: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<InstanceSpec>>;
    /// Fails with `InstanceExists`, or `StaleSchema` if the category moved past `expected_version`
    async fn insert_instance_spec(&self, spec: InstanceSpec, expected_version: i64)
        -> EngineResult<()>;
    /// Fails with `InstanceNotFound`, or `StaleSchema` if the category moved past `expected_version`
    async fn update_instance_spec(&self, spec: InstanceSpec, expected_version: i64)
        -> EngineResult<()>;
    async fn delete_instance_spec(&self, instance: &InstanceRef) -> EngineResult<bool>;
}

/// Durable propagation jobs. Each method is one transaction.
#[async_trait::async_trait]
pub trait PropagationStore: Send + Sync {
    /// Take the category's mutation lock: the category must be at
    /// `job.base_version` with no running propagation. Records the job, marks
    /// the category and bumps its schema version.
    async fn begin_propagation(&self, job: PropagationJob) -> EngineResult<PropagationJob>;
    async fn get_propagation(&self, id: &Id) -> EngineResult<Option<PropagationJob>>;
    async fn list_unfinished_propagations(&self) -> EngineResult<Vec<PropagationJob>>;
    /// Checking -> Applying
    async fn start_applying(&self, id: &Id) -> EngineResult<()>;
    /// Persist one rewritten batch together with the new cursor and cumulative report
    async fn commit_propagation_batch(
        &self,
        id: &Id,
        updates: Vec<InstanceSpec>,
        cursor: Id,
        report: PropagationReport,
    ) -> EngineResult<()>;
    /// Write the job's target definition, bump the version, release the category
    async fn complete_propagation(&self, id: &Id) -> EngineResult<PropagationJob>;
    /// Release the category without touching the catalog
    async fn abort_propagation(&self, id: &Id, reason: String) -> EngineResult<PropagationJob>;
}

pub trait Store: CatalogStore + InstanceStore + PropagationStore + Send + Sync {}
