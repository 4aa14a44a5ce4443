use chrono::Utc;
use log::info;
use serde_json::Value;

use crate::error::{CatalogError, EngineResult};
use crate::logic::coerce::coerce_value;
use crate::logic::propagate::Propagator;
use crate::logic::validate::{CatalogSnapshot, SpecValidator};
use crate::model::{
    describe_value, AttributeDefinition, CatalogMutation, Category, CategoryRef, CoercionMode,
    ConversionPolicy, EntityKind, NewAttributeDefinition, OverflowRouting, PropagationJob,
    Promotion, RetypeReport, SpecMap, ValidatedSpec, ValueType, OVERFLOW_KEY,
};
use crate::store::traits::Store;

/// Category administration: the single source of schema truth.
///
/// Changes that touch stored instances are handed to the [`Propagator`] and
/// only become visible once every instance of the category has been rewritten.
pub struct DefinitionCatalog<'a, S: Store> {
    store: &'a S,
    batch_size: usize,
    actor: String,
}

impl<'a, S: Store> DefinitionCatalog<'a, S> {
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            batch_size,
            actor: "system".to_string(),
        }
    }

    /// Stamp definition audit fields with `user_id`
    pub fn acting_as(mut self, user_id: impl Into<String>) -> Self {
        self.actor = user_id.into();
        self
    }

    pub async fn create_category(
        &self,
        category: CategoryRef,
        description: Option<String>,
    ) -> EngineResult<Category> {
        let created = Category::new(category, description);
        self.store.insert_category(created.clone()).await?;
        info!("Created category {}", created.category);
        Ok(created)
    }

    pub async fn get_category(&self, category: &CategoryRef) -> EngineResult<Category> {
        self.store
            .get_category(category)
            .await?
            .ok_or_else(|| CatalogError::CategoryNotFound(category.clone()).into())
    }

    pub async fn list_categories(&self, kind: EntityKind) -> EngineResult<Vec<Category>> {
        self.store.list_categories(kind).await
    }

    /// Category row plus its live definitions, read together
    pub async fn snapshot(&self, category: &CategoryRef) -> EngineResult<CatalogSnapshot> {
        let category_row = self.get_category(category).await?;
        let definitions = self
            .store
            .list_definitions(category)
            .await?
            .into_iter()
            .filter(|d| d.is_live())
            .collect();
        Ok(CatalogSnapshot {
            category: category_row,
            definitions,
        })
    }

    /// Active definitions in insertion order
    pub async fn get_active_definitions(
        &self,
        category: &CategoryRef,
    ) -> EngineResult<Vec<AttributeDefinition>> {
        let snapshot = self.snapshot(category).await?;
        Ok(snapshot.active().cloned().collect())
    }

    /// Active or deprecated definition under `key`
    pub async fn get_definition(
        &self,
        category: &CategoryRef,
        key: &str,
    ) -> EngineResult<Option<AttributeDefinition>> {
        let snapshot = self.snapshot(category).await?;
        Ok(snapshot.find(key).cloned())
    }

    /// Every definition ever recorded for the category, retired ones included
    pub async fn definition_history(
        &self,
        category: &CategoryRef,
    ) -> EngineResult<Vec<AttributeDefinition>> {
        self.get_category(category).await?;
        self.store.list_definitions(category).await
    }

    pub async fn validate(
        &self,
        category: &CategoryRef,
        candidate: &SpecMap,
        routing: OverflowRouting,
    ) -> EngineResult<ValidatedSpec> {
        let snapshot = self.snapshot(category).await?;
        Ok(SpecValidator::new(&snapshot).validate(candidate, routing)?)
    }

    /// Add a definition. Same-named overflow entries of existing instances are
    /// promoted into the formal partition; a required definition backfills
    /// its default everywhere else.
    pub async fn create_definition(
        &self,
        category: &CategoryRef,
        new_def: NewAttributeDefinition,
    ) -> EngineResult<AttributeDefinition> {
        self.create_definition_promoting(category, new_def, None)
            .await
    }

    pub(crate) async fn create_definition_promoting(
        &self,
        category: &CategoryRef,
        new_def: NewAttributeDefinition,
        promote: Option<Promotion>,
    ) -> EngineResult<AttributeDefinition> {
        let snapshot = self.idle_snapshot(category).await?;

        check_key_format(&new_def.key)?;
        if snapshot.find(&new_def.key).is_some() {
            return Err(CatalogError::DuplicateKey {
                category: category.clone(),
                key: new_def.key.clone(),
            }
            .into());
        }

        let default_value = normalize_default(
            &new_def.key,
            &new_def.value_type,
            new_def.required,
            new_def.default_value.clone(),
        )?;
        let mut target = AttributeDefinition::from_new(category.clone(), new_def, self.actor.clone());
        target.default_value = default_value;

        let mutation = CatalogMutation::Create {
            key: target.key.clone(),
            value_type: target.value_type.clone(),
            required: target.required,
            default_value: target.default_value.clone(),
            promote,
        };
        self.propagate(&snapshot, mutation, target.clone()).await?;
        Ok(target)
    }

    /// Rename a definition in place; every instance moves its value to the new key
    pub async fn rename_definition(
        &self,
        category: &CategoryRef,
        old_key: &str,
        new_key: &str,
    ) -> EngineResult<AttributeDefinition> {
        let snapshot = self.idle_snapshot(category).await?;
        let current = self.active_definition(&snapshot, old_key)?;
        if old_key == new_key {
            return Ok(current.clone());
        }

        check_key_format(new_key)?;
        if snapshot.find(new_key).is_some() {
            return Err(CatalogError::KeyCollision {
                category: category.clone(),
                key: new_key.to_string(),
            }
            .into());
        }

        let mut target = current.touched(&self.actor);
        if target.display_name == old_key {
            target.display_name = new_key.to_string();
        }
        target.key = new_key.to_string();

        let mutation = CatalogMutation::Rename {
            old_key: old_key.to_string(),
            new_key: new_key.to_string(),
        };
        self.propagate(&snapshot, mutation, target.clone()).await?;
        Ok(target)
    }

    /// Change the value type of a definition.
    ///
    /// `Strict` commits only if every stored value already reads as the new
    /// type and fails with `IncompatibleType` otherwise. `BestEffort` converts
    /// what it can and flags the rest, listing them in the report.
    pub async fn retype_definition(
        &self,
        category: &CategoryRef,
        key: &str,
        new_type: ValueType,
        policy: ConversionPolicy,
    ) -> EngineResult<RetypeReport> {
        let snapshot = self.idle_snapshot(category).await?;
        let current = self.active_definition(&snapshot, key)?;

        let mut target = current.touched(&self.actor);
        target.default_value = match &current.default_value {
            Some(default) => Some(coerce_value(default, &new_type, CoercionMode::Lenient).map_err(
                |_| CatalogError::InvalidDefault {
                    key: key.to_string(),
                    reason: format!(
                        "current default {} cannot be converted to {}",
                        describe_value(default),
                        new_type
                    ),
                },
            )?),
            None => None,
        };
        target.value_type = new_type.clone();

        let mutation = CatalogMutation::Retype {
            key: key.to_string(),
            new_type,
            policy,
        };
        let job = self.propagate(&snapshot, mutation, target.clone()).await?;

        Ok(RetypeReport {
            propagation_id: job.id,
            definition: target,
            key: key.to_string(),
            policy,
            converted: job.report.converted,
            failed_instance_ids: job.report.flagged_instances,
        })
    }

    /// Soft-delete: stored values stay readable as deprecated attributes but
    /// new writes may no longer use the key
    pub async fn deactivate_definition(
        &self,
        category: &CategoryRef,
        key: &str,
    ) -> EngineResult<AttributeDefinition> {
        let snapshot = self.idle_snapshot(category).await?;
        let current = self.live_definition(&snapshot, key)?;
        if !current.active {
            return Ok(current.clone());
        }

        let mut target = current.touched(&self.actor);
        target.active = false;
        self.apply_direct(&snapshot, CatalogMutation::Deactivate { key: key.to_string() }, target)
            .await
    }

    /// Turning `required` on backfills the default into every instance lacking
    /// the key before new validations observe the flag
    pub async fn toggle_required(
        &self,
        category: &CategoryRef,
        key: &str,
        required: bool,
    ) -> EngineResult<AttributeDefinition> {
        let snapshot = self.idle_snapshot(category).await?;
        let current = self.active_definition(&snapshot, key)?;
        if current.required == required {
            return Ok(current.clone());
        }

        let mut target = current.touched(&self.actor);
        target.required = required;

        if !required {
            return self
                .apply_direct(&snapshot, CatalogMutation::RequireOff { key: key.to_string() }, target)
                .await;
        }

        let default_value = normalize_default(key, &current.value_type, true, current.default_value.clone())?
            .ok_or_else(|| CatalogError::InvalidDefault {
                key: key.to_string(),
                reason: "a required definition needs a non-null default".to_string(),
            })?;
        target.default_value = Some(default_value.clone());

        let mutation = CatalogMutation::RequireOn {
            key: key.to_string(),
            default_value,
        };
        self.propagate(&snapshot, mutation, target.clone()).await?;
        Ok(target)
    }

    /// Replace the backfill value. Already stored values are left alone.
    pub async fn update_default(
        &self,
        category: &CategoryRef,
        key: &str,
        default_value: Option<Value>,
    ) -> EngineResult<AttributeDefinition> {
        let snapshot = self.idle_snapshot(category).await?;
        let current = self.active_definition(&snapshot, key)?;

        let mut target = current.touched(&self.actor);
        target.default_value =
            normalize_default(key, &current.value_type, current.required, default_value)?;

        let mutation = CatalogMutation::UpdateDefault {
            key: key.to_string(),
            default_value: target.default_value.clone(),
        };
        self.apply_direct(&snapshot, mutation, target).await
    }

    /// Migrate instances off a deactivated definition: stored values move to
    /// the overflow bucket and the definition becomes an archival record
    pub async fn retire_definition(
        &self,
        category: &CategoryRef,
        key: &str,
    ) -> EngineResult<AttributeDefinition> {
        let snapshot = self.idle_snapshot(category).await?;
        let current = self.live_definition(&snapshot, key)?;
        if current.active {
            return Err(CatalogError::DefinitionStillActive {
                category: category.clone(),
                key: key.to_string(),
            }
            .into());
        }

        let mut target = current.touched(&self.actor);
        target.retired_at = Some(Utc::now());

        let mutation = CatalogMutation::Retire { key: key.to_string() };
        self.propagate(&snapshot, mutation, target.clone()).await?;
        Ok(target)
    }

    /// Snapshot of a category that no propagation currently holds
    async fn idle_snapshot(&self, category: &CategoryRef) -> EngineResult<CatalogSnapshot> {
        let snapshot = self.snapshot(category).await?;
        if let Some(running) = &snapshot.category.active_propagation {
            return Err(CatalogError::MutationInProgress {
                category: category.clone(),
                propagation_id: running.clone(),
            }
            .into());
        }
        Ok(snapshot)
    }

    fn live_definition<'s>(
        &self,
        snapshot: &'s CatalogSnapshot,
        key: &str,
    ) -> EngineResult<&'s AttributeDefinition> {
        snapshot.find(key).ok_or_else(|| {
            CatalogError::DefinitionNotFound {
                category: snapshot.category_ref().clone(),
                key: key.to_string(),
            }
            .into()
        })
    }

    fn active_definition<'s>(
        &self,
        snapshot: &'s CatalogSnapshot,
        key: &str,
    ) -> EngineResult<&'s AttributeDefinition> {
        let definition = self.live_definition(snapshot, key)?;
        if !definition.is_active() {
            return Err(CatalogError::DefinitionInactive {
                category: snapshot.category_ref().clone(),
                key: key.to_string(),
            }
            .into());
        }
        Ok(definition)
    }

    async fn propagate(
        &self,
        snapshot: &CatalogSnapshot,
        mutation: CatalogMutation,
        target: AttributeDefinition,
    ) -> EngineResult<PropagationJob> {
        let job = PropagationJob::new(
            snapshot.category_ref().clone(),
            mutation,
            target,
            snapshot.schema_version(),
        );
        Propagator::new(self.store, self.batch_size).submit(job).await
    }

    async fn apply_direct(
        &self,
        snapshot: &CatalogSnapshot,
        mutation: CatalogMutation,
        target: AttributeDefinition,
    ) -> EngineResult<AttributeDefinition> {
        debug_assert!(!mutation.needs_instance_pass());
        let category = self
            .store
            .apply_definition_change(target.clone(), snapshot.schema_version())
            .await?;
        info!(
            "Applied {} on {} (schema v{})",
            mutation.label(),
            category.category,
            category.schema_version
        );
        Ok(target)
    }
}

fn check_key_format(key: &str) -> EngineResult<()> {
    if key == OVERFLOW_KEY {
        return Err(CatalogError::ReservedKey(key.to_string()).into());
    }
    Ok(())
}

/// Canonical default for a definition: null means none, anything else must
/// coerce to the value type, and required definitions must have one
fn normalize_default(
    key: &str,
    value_type: &ValueType,
    required: bool,
    default_value: Option<Value>,
) -> Result<Option<Value>, CatalogError> {
    let normalized = match default_value.filter(|v| !v.is_null()) {
        Some(value) => Some(
            coerce_value(&value, value_type, CoercionMode::Lenient).map_err(|_| {
                CatalogError::InvalidDefault {
                    key: key.to_string(),
                    reason: format!("{} is not a valid {}", describe_value(&value), value_type),
                }
            })?,
        ),
        None => None,
    };

    if required && normalized.is_none() {
        return Err(CatalogError::InvalidDefault {
            key: key.to_string(),
            reason: "a required definition needs a non-null default".to_string(),
        });
    }
    Ok(normalized)
}
