use chrono::Utc;
use log::{debug, info};

use crate::error::{CatalogError, EngineError, EngineResult};
use crate::logic::catalog::DefinitionCatalog;
use crate::logic::validate::{CatalogSnapshot, SpecValidator};
use crate::model::{
    AttributeDefinition, AttributeReading, AttributeStatus, CategoryRef, DefinitionState,
    InstanceRef, InstanceSpec, NewAttributeDefinition, OverflowRouting, Promotion, SpecMap,
    ValidatedSpec,
};
use crate::store::traits::Store;

/// Reads and writes the spec documents of material and equipment records
pub struct InstanceSpecService<'a, S: Store> {
    store: &'a S,
    catalog: DefinitionCatalog<'a, S>,
}

impl<'a, S: Store> InstanceSpecService<'a, S> {
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            catalog: DefinitionCatalog::new(store, batch_size),
        }
    }

    pub fn catalog(&self) -> &DefinitionCatalog<'a, S> {
        &self.catalog
    }

    pub async fn read(&self, instance: &InstanceRef) -> EngineResult<InstanceSpec> {
        self.store
            .get_instance_spec(instance)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance.clone()))
    }

    /// Every stored attribute tagged with its standing in the current catalog.
    /// Formal attributes come in catalog order, overflow entries last.
    pub async fn read_annotated(
        &self,
        instance: &InstanceRef,
    ) -> EngineResult<Vec<AttributeReading>> {
        let spec = self.read(instance).await?;
        let snapshot = self.catalog.snapshot(&spec.category_ref()).await?;
        Ok(annotate(&spec, &snapshot))
    }

    /// Create the spec document of a new record, backfilling required defaults
    pub async fn register_instance(
        &self,
        instance: InstanceRef,
        category: &str,
        candidate: &SpecMap,
        routing: OverflowRouting,
    ) -> EngineResult<InstanceSpec> {
        let category_ref = CategoryRef::new(instance.kind, category);
        let snapshot = self.catalog.snapshot(&category_ref).await?;
        let validated = SpecValidator::new(&snapshot).validate(candidate, routing)?;

        let mut spec = InstanceSpec::new(instance, category.to_string());
        spec.document.formal = validated.formal;
        spec.document.merge_overflow(&validated.overflow);

        self.store
            .insert_instance_spec(spec.clone(), validated.schema_version)
            .await?;
        info!("Registered {} in {}", spec.instance, category_ref);
        Ok(spec)
    }

    pub async fn remove_instance(&self, instance: &InstanceRef) -> EngineResult<()> {
        if !self.store.delete_instance_spec(instance).await? {
            return Err(EngineError::InstanceNotFound(instance.clone()));
        }
        info!("Removed spec of {}", instance);
        Ok(())
    }

    /// Validate and persist a candidate map.
    ///
    /// The formal partition is replaced as a whole; the overflow bucket is
    /// merged key-wise. Fails with `StaleSchema` if the catalog changed
    /// between validation and commit.
    pub async fn write(
        &self,
        instance: &InstanceRef,
        candidate: &SpecMap,
        routing: OverflowRouting,
    ) -> EngineResult<ValidatedSpec> {
        let current = self.read(instance).await?;
        let snapshot = self.catalog.snapshot(&current.category_ref()).await?;
        let validated = SpecValidator::new(&snapshot).validate(candidate, routing)?;

        self.commit(current, &snapshot, &validated).await?;
        Ok(validated)
    }

    /// Persist a spec validated earlier, e.g. by [`DefinitionCatalog::validate`]
    pub async fn commit_validated(
        &self,
        instance: &InstanceRef,
        validated: &ValidatedSpec,
    ) -> EngineResult<InstanceSpec> {
        let current = self.read(instance).await?;
        if current.category_ref() != validated.category {
            return Err(EngineError::CategoryChangeUnsupported(instance.clone()));
        }

        let snapshot = self.catalog.snapshot(&validated.category).await?;
        if snapshot.schema_version() != validated.schema_version {
            return Err(EngineError::StaleSchema {
                category: validated.category.clone(),
                expected: validated.schema_version,
                found: snapshot.schema_version(),
            });
        }
        self.commit(current, &snapshot, validated).await
    }

    /// Promote one overflow entry of `instance` into a new definition of its
    /// category. The entry's value becomes this instance's formal value;
    /// other instances get the definition's default if it is required.
    pub async fn move_to_formal(
        &self,
        instance: &InstanceRef,
        overflow_key: &str,
        new_def: NewAttributeDefinition,
    ) -> EngineResult<AttributeDefinition> {
        let spec = self.read(instance).await?;
        if !spec.document.overflow.contains_key(overflow_key) {
            return Err(EngineError::OverflowEntryNotFound {
                instance: instance.clone(),
                key: overflow_key.to_string(),
            });
        }

        let promotion = Promotion {
            instance_id: instance.id.clone(),
            overflow_key: overflow_key.to_string(),
        };
        self.catalog
            .create_definition_promoting(&spec.category_ref(), new_def, Some(promotion))
            .await
    }

    /// Move a record to another category of its namespace. Only records
    /// without any stored attribute may move.
    pub async fn reassign_category(
        &self,
        instance: &InstanceRef,
        category: &str,
    ) -> EngineResult<InstanceSpec> {
        let current = self.read(instance).await?;
        if current.category == category {
            return Ok(current);
        }
        if !current.document.is_empty() {
            return Err(EngineError::CategoryChangeUnsupported(instance.clone()));
        }

        let previous = self.catalog.get_category(&current.category_ref()).await?;
        if let Some(running) = previous.active_propagation {
            return Err(CatalogError::MutationInProgress {
                category: previous.category,
                propagation_id: running,
            }
            .into());
        }

        let target = CategoryRef::new(instance.kind, category);
        let snapshot = self.catalog.snapshot(&target).await?;
        let validated =
            SpecValidator::new(&snapshot).validate(&SpecMap::new(), OverflowRouting::Reject)?;

        let mut moved = current;
        moved.category = category.to_string();
        moved.document.formal = validated.formal;
        moved.flags.clear();
        moved.updated_at = Utc::now();

        self.store
            .update_instance_spec(moved.clone(), validated.schema_version)
            .await?;
        info!("Moved {} to {}", instance, target);
        Ok(moved)
    }

    async fn commit(
        &self,
        current: InstanceSpec,
        snapshot: &CatalogSnapshot,
        validated: &ValidatedSpec,
    ) -> EngineResult<InstanceSpec> {
        let mut next = current;

        // Deprecated values cannot be written but survive a full replace
        let carried: SpecMap = next
            .document
            .formal
            .iter()
            .filter(|(key, _)| {
                snapshot
                    .find(key)
                    .is_some_and(|d| d.state() == DefinitionState::Deprecated)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut formal = validated.formal.clone();
        formal.extend(carried);
        next.document.formal = formal;
        next.document.merge_overflow(&validated.overflow);

        // A rewritten or dropped key clears its remediation flag
        next.flags.retain(|f| {
            next.document.formal.contains_key(&f.key) && !validated.formal.contains_key(&f.key)
        });
        next.updated_at = Utc::now();

        self.store
            .update_instance_spec(next.clone(), validated.schema_version)
            .await?;
        debug!(
            "Wrote spec of {} against schema v{}",
            next.instance, validated.schema_version
        );
        Ok(next)
    }
}

fn annotate(spec: &InstanceSpec, snapshot: &CatalogSnapshot) -> Vec<AttributeReading> {
    let mut readings = Vec::new();

    for def in &snapshot.definitions {
        let Some(value) = spec.document.formal.get(&def.key) else {
            continue;
        };
        let status = match def.state() {
            DefinitionState::Active if spec.is_flagged(&def.key) => AttributeStatus::Flagged,
            DefinitionState::Active => AttributeStatus::Active,
            DefinitionState::Deprecated | DefinitionState::Retired => AttributeStatus::Deprecated,
        };
        readings.push(AttributeReading {
            key: def.key.clone(),
            value: value.clone(),
            status,
            display_name: Some(def.display_name.clone()),
            unit: def.unit.clone(),
        });
    }

    for (key, value) in &spec.document.formal {
        if snapshot.find(key).is_none() {
            readings.push(AttributeReading {
                key: key.clone(),
                value: value.clone(),
                status: AttributeStatus::Orphaned,
                display_name: None,
                unit: None,
            });
        }
    }

    for (key, value) in &spec.document.overflow {
        readings.push(AttributeReading {
            key: key.clone(),
            value: value.clone(),
            status: AttributeStatus::Overflow,
            display_name: None,
            unit: None,
        });
    }

    readings
}
