use std::collections::BTreeMap;

use anyhow::anyhow;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{CatalogError, EngineError, EngineResult};
use crate::model::{
    AttributeDefinition, Category, CategoryRef, EntityKind, Id, InstanceRef, InstanceSpec,
    PropagationJob, PropagationPhase, PropagationReport,
};
use crate::store::traits::{CatalogStore, InstanceStore, PropagationStore, Store};

#[derive(Debug, Default)]
struct MemoryState {
    categories: BTreeMap<CategoryRef, Category>,
    /// Insertion order doubles as display order
    definitions: Vec<AttributeDefinition>,
    instances: BTreeMap<InstanceRef, InstanceSpec>,
    propagations: BTreeMap<Id, PropagationJob>,
}

impl MemoryState {
    fn category_mut(&mut self, category: &CategoryRef) -> EngineResult<&mut Category> {
        self.categories
            .get_mut(category)
            .ok_or_else(|| CatalogError::CategoryNotFound(category.clone()).into())
    }

    /// Instance writes commit only against an idle category at the version they validated against
    fn check_writable(&self, category: &CategoryRef, expected_version: i64) -> EngineResult<()> {
        let current = self
            .categories
            .get(category)
            .ok_or_else(|| CatalogError::CategoryNotFound(category.clone()))?;
        if current.is_propagating() || current.schema_version != expected_version {
            return Err(EngineError::StaleSchema {
                category: category.clone(),
                expected: expected_version,
                found: current.schema_version,
            });
        }
        Ok(())
    }

    fn upsert_definition(&mut self, definition: AttributeDefinition) {
        match self.definitions.iter_mut().find(|d| d.id == definition.id) {
            Some(existing) => *existing = definition,
            None => self.definitions.push(definition),
        }
    }

    fn job_mut(&mut self, id: &Id) -> EngineResult<&mut PropagationJob> {
        self.propagations
            .get_mut(id)
            .ok_or_else(|| EngineError::Store(anyhow!("Propagation not found: {}", id)))
    }

    fn release_category(&mut self, category: &CategoryRef, job_id: &Id) -> EngineResult<()> {
        let cat = self.category_mut(category)?;
        if cat.active_propagation.as_ref() == Some(job_id) {
            cat.active_propagation = None;
        }
        cat.schema_version += 1;
        cat.updated_at = Utc::now();
        Ok(())
    }
}

/// In-process store guarded by a single mutex; every trait method is atomic.
///
/// Batch commits can be made to fail on demand to exercise resumption.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    /// Number of batch commits still allowed before the next one fails
    batch_budget: Mutex<Option<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `successful` batch commits through, then fail the next one
    pub fn fail_batch_commit_after(&self, successful: usize) {
        *self.batch_budget.lock() = Some(successful);
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    fn take_batch_budget(&self) -> EngineResult<()> {
        let mut budget = self.batch_budget.lock();
        match *budget {
            Some(0) => {
                *budget = None;
                Err(EngineError::Store(anyhow!("injected batch commit failure")))
            }
            Some(n) => {
                *budget = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl CatalogStore for MemoryStore {
    async fn get_category(&self, category: &CategoryRef) -> EngineResult<Option<Category>> {
        Ok(self.state.lock().categories.get(category).cloned())
    }

    async fn list_categories(&self, kind: EntityKind) -> EngineResult<Vec<Category>> {
        Ok(self
            .state
            .lock()
            .categories
            .values()
            .filter(|c| c.category.kind == kind)
            .cloned()
            .collect())
    }

    async fn insert_category(&self, category: Category) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.categories.contains_key(&category.category) {
            return Err(CatalogError::CategoryExists(category.category).into());
        }
        state.categories.insert(category.category.clone(), category);
        Ok(())
    }

    async fn list_definitions(
        &self,
        category: &CategoryRef,
    ) -> EngineResult<Vec<AttributeDefinition>> {
        Ok(self
            .state
            .lock()
            .definitions
            .iter()
            .filter(|d| &d.category == category)
            .cloned()
            .collect())
    }

    async fn apply_definition_change(
        &self,
        definition: AttributeDefinition,
        expected_version: i64,
    ) -> EngineResult<Category> {
        let mut state = self.state.lock();
        let category = definition.category.clone();
        {
            let cat = state.category_mut(&category)?;
            if let Some(job) = &cat.active_propagation {
                return Err(CatalogError::MutationInProgress {
                    category,
                    propagation_id: job.clone(),
                }
                .into());
            }
            if cat.schema_version != expected_version {
                return Err(EngineError::StaleSchema {
                    category,
                    expected: expected_version,
                    found: cat.schema_version,
                });
            }
        }

        state.upsert_definition(definition);
        let cat = state.category_mut(&category)?;
        cat.schema_version += 1;
        cat.updated_at = Utc::now();
        Ok(cat.clone())
    }
}

#[async_trait::async_trait]
impl InstanceStore for MemoryStore {
    async fn get_instance_spec(&self, instance: &InstanceRef) -> EngineResult<Option<InstanceSpec>> {
        Ok(self.state.lock().instances.get(instance).cloned())
    }

    async fn list_instance_batch(
        &self,
        category: &CategoryRef,
        after: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<InstanceSpec>> {
        let state = self.state.lock();
        Ok(state
            .instances
            .values()
            .filter(|s| s.instance.kind == category.kind && s.category == category.name)
            .filter(|s| after.map_or(true, |a| s.instance.id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_instance_spec(
        &self,
        spec: InstanceSpec,
        expected_version: i64,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        if state.instances.contains_key(&spec.instance) {
            return Err(EngineError::InstanceExists(spec.instance));
        }
        state.check_writable(&spec.category_ref(), expected_version)?;
        state.instances.insert(spec.instance.clone(), spec);
        Ok(())
    }

    async fn update_instance_spec(
        &self,
        spec: InstanceSpec,
        expected_version: i64,
    ) -> EngineResult<()> {
        let mut state = self.state.lock();
        if !state.instances.contains_key(&spec.instance) {
            return Err(EngineError::InstanceNotFound(spec.instance));
        }
        state.check_writable(&spec.category_ref(), expected_version)?;
        state.instances.insert(spec.instance.clone(), spec);
        Ok(())
    }

    async fn delete_instance_spec(&self, instance: &InstanceRef) -> EngineResult<bool> {
        Ok(self.state.lock().instances.remove(instance).is_some())
    }
}

#[async_trait::async_trait]
impl PropagationStore for MemoryStore {
    async fn begin_propagation(&self, job: PropagationJob) -> EngineResult<PropagationJob> {
        let mut state = self.state.lock();
        let cat = state.category_mut(&job.category)?;
        if let Some(running) = &cat.active_propagation {
            return Err(CatalogError::MutationInProgress {
                category: job.category.clone(),
                propagation_id: running.clone(),
            }
            .into());
        }
        if cat.schema_version != job.base_version {
            return Err(EngineError::StaleSchema {
                category: job.category.clone(),
                expected: job.base_version,
                found: cat.schema_version,
            });
        }
        cat.active_propagation = Some(job.id.clone());
        cat.schema_version += 1;
        cat.updated_at = Utc::now();

        state.propagations.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_propagation(&self, id: &Id) -> EngineResult<Option<PropagationJob>> {
        Ok(self.state.lock().propagations.get(id).cloned())
    }

    async fn list_unfinished_propagations(&self) -> EngineResult<Vec<PropagationJob>> {
        let state = self.state.lock();
        let mut jobs: Vec<PropagationJob> = state
            .propagations
            .values()
            .filter(|j| !j.phase.is_finished())
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn start_applying(&self, id: &Id) -> EngineResult<()> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.phase = PropagationPhase::Applying;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn commit_propagation_batch(
        &self,
        id: &Id,
        updates: Vec<InstanceSpec>,
        cursor: Id,
        report: PropagationReport,
    ) -> EngineResult<()> {
        self.take_batch_budget()?;

        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        if job.phase != PropagationPhase::Applying {
            return Err(EngineError::Store(anyhow!(
                "Propagation {} is {}, not applying",
                id,
                job.phase.as_str()
            )));
        }
        job.cursor = Some(cursor);
        job.report = report;
        job.updated_at = Utc::now();

        // Records removed since the batch was read stay removed
        for spec in updates {
            if let Some(slot) = state.instances.get_mut(&spec.instance) {
                *slot = spec;
            }
        }
        Ok(())
    }

    async fn complete_propagation(&self, id: &Id) -> EngineResult<PropagationJob> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.phase = PropagationPhase::Completed;
        job.updated_at = Utc::now();
        let job = job.clone();

        state.upsert_definition(job.target.clone());
        state.release_category(&job.category, &job.id)?;
        Ok(job)
    }

    async fn abort_propagation(&self, id: &Id, reason: String) -> EngineResult<PropagationJob> {
        let mut state = self.state.lock();
        let job = state.job_mut(id)?;
        job.phase = PropagationPhase::Aborted;
        job.error = Some(reason);
        job.updated_at = Utc::now();
        let job = job.clone();

        state.release_category(&job.category, &job.id)?;
        Ok(job)
    }
}

impl Store for MemoryStore {}
