use anyhow::{anyhow, Context, Result};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};

use crate::error::{CatalogError, EngineError, EngineResult};
use crate::model::{
    AttributeDefinition, Category, CategoryRef, EntityKind, Id, InstanceRef, InstanceSpec,
    PropagationJob, PropagationPhase, PropagationReport, SpecDocument,
};
use crate::store::traits::{CatalogStore, InstanceStore, PropagationStore, Store};

const CATEGORY_COLUMNS: &str =
    "entity_kind, name, description, schema_version, active_propagation, created_at, updated_at";

const DEFINITION_COLUMNS: &str = "id, entity_kind, category, key, display_name, unit, description, \
     sort_order, value_type, required, default_value, active, retired_at, created_by, created_at, \
     updated_by, updated_at";

const INSTANCE_COLUMNS: &str = "entity_kind, instance_id, category, document, flags, updated_at";

const PROPAGATION_COLUMNS: &str = "id, entity_kind, category, mutation, target, phase, cursor, \
     base_version, report, error, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn category_from_row(row: &PgRow) -> Result<Category> {
    let kind: String = row.try_get("entity_kind")?;
    Ok(Category {
        category: CategoryRef::new(kind.parse()?, row.try_get::<String, _>("name")?),
        description: row.try_get("description")?,
        schema_version: row.try_get("schema_version")?,
        active_propagation: row.try_get("active_propagation")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn definition_from_row(row: &PgRow) -> Result<AttributeDefinition> {
    let kind: String = row.try_get("entity_kind")?;
    let value_type: serde_json::Value = row.try_get("value_type")?;
    Ok(AttributeDefinition {
        id: row.try_get("id")?,
        category: CategoryRef::new(kind.parse()?, row.try_get::<String, _>("category")?),
        key: row.try_get("key")?,
        display_name: row.try_get("display_name")?,
        unit: row.try_get("unit")?,
        description: row.try_get("description")?,
        sort_order: row.try_get("sort_order")?,
        value_type: serde_json::from_value(value_type).context("Failed to deserialize value type")?,
        required: row.try_get("required")?,
        default_value: row.try_get("default_value")?,
        active: row.try_get("active")?,
        retired_at: row.try_get("retired_at")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_by: row.try_get("updated_by")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn instance_from_row(row: &PgRow) -> Result<InstanceSpec> {
    let kind: String = row.try_get("entity_kind")?;
    let document: serde_json::Value = row.try_get("document")?;
    let flags: serde_json::Value = row.try_get("flags")?;
    Ok(InstanceSpec {
        instance: InstanceRef::new(kind.parse()?, row.try_get::<String, _>("instance_id")?),
        category: row.try_get("category")?,
        document: serde_json::from_value::<SpecDocument>(document)
            .context("Failed to deserialize spec document")?,
        flags: serde_json::from_value(flags).context("Failed to deserialize spec flags")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn propagation_from_row(row: &PgRow) -> Result<PropagationJob> {
    let kind: String = row.try_get("entity_kind")?;
    let phase: String = row.try_get("phase")?;
    let mutation: serde_json::Value = row.try_get("mutation")?;
    let target: serde_json::Value = row.try_get("target")?;
    let report: serde_json::Value = row.try_get("report")?;
    Ok(PropagationJob {
        id: row.try_get("id")?,
        category: CategoryRef::new(kind.parse()?, row.try_get::<String, _>("category")?),
        mutation: serde_json::from_value(mutation).context("Failed to deserialize mutation")?,
        target: serde_json::from_value(target).context("Failed to deserialize target definition")?,
        phase: PropagationPhase::parse(&phase)
            .ok_or_else(|| anyhow!("Unknown propagation phase '{}'", phase))?,
        cursor: row.try_get("cursor")?,
        base_version: row.try_get("base_version")?,
        report: serde_json::from_value(report).unwrap_or_default(),
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Row-lock a category inside a transaction. `FOR UPDATE` is the catalog
/// mutation lock; instance writes take `FOR SHARE` so they serialize against it.
async fn lock_category(
    conn: &mut PgConnection,
    category: &CategoryRef,
    exclusive: bool,
) -> EngineResult<Category> {
    let sql = format!(
        "SELECT {} FROM spec_categories WHERE entity_kind = $1 AND name = $2 {}",
        CATEGORY_COLUMNS,
        if exclusive { "FOR UPDATE" } else { "FOR SHARE" }
    );
    let row = sqlx::query(&sql)
        .bind(category.kind.as_str())
        .bind(&category.name)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock category")?;

    match row {
        Some(row) => Ok(category_from_row(&row)?),
        None => Err(CatalogError::CategoryNotFound(category.clone()).into()),
    }
}

async fn check_writable(
    conn: &mut PgConnection,
    category: &CategoryRef,
    expected_version: i64,
) -> EngineResult<()> {
    let current = lock_category(conn, category, false).await?;
    if current.is_propagating() || current.schema_version != expected_version {
        return Err(EngineError::StaleSchema {
            category: category.clone(),
            expected: expected_version,
            found: current.schema_version,
        });
    }
    Ok(())
}

async fn upsert_definition(conn: &mut PgConnection, def: &AttributeDefinition) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO spec_definitions (id, entity_kind, category, key, display_name, unit, description,
            sort_order, value_type, required, default_value, active, retired_at, created_by,
            created_at, updated_by, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        ON CONFLICT (id) DO UPDATE SET
            key = EXCLUDED.key,
            display_name = EXCLUDED.display_name,
            unit = EXCLUDED.unit,
            description = EXCLUDED.description,
            sort_order = EXCLUDED.sort_order,
            value_type = EXCLUDED.value_type,
            required = EXCLUDED.required,
            default_value = EXCLUDED.default_value,
            active = EXCLUDED.active,
            retired_at = EXCLUDED.retired_at,
            updated_by = EXCLUDED.updated_by,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&def.id)
    .bind(def.category.kind.as_str())
    .bind(&def.category.name)
    .bind(&def.key)
    .bind(&def.display_name)
    .bind(&def.unit)
    .bind(&def.description)
    .bind(def.sort_order)
    .bind(serde_json::to_value(&def.value_type)?)
    .bind(def.required)
    .bind(&def.default_value)
    .bind(def.active)
    .bind(def.retired_at)
    .bind(&def.created_by)
    .bind(def.created_at)
    .bind(&def.updated_by)
    .bind(def.updated_at)
    .execute(&mut *conn)
    .await
    .context("Failed to upsert definition")?;

    Ok(())
}

async fn bump_category(
    conn: &mut PgConnection,
    category: &CategoryRef,
    active_propagation: Option<&Id>,
) -> Result<Category> {
    let sql = format!(
        r#"
        UPDATE spec_categories
        SET schema_version = schema_version + 1, active_propagation = $3, updated_at = NOW()
        WHERE entity_kind = $1 AND name = $2
        RETURNING {}
        "#,
        CATEGORY_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(category.kind.as_str())
        .bind(&category.name)
        .bind(active_propagation)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to bump category schema version")?;
    category_from_row(&row)
}

async fn lock_propagation(conn: &mut PgConnection, id: &Id) -> EngineResult<PropagationJob> {
    let sql = format!(
        "SELECT {} FROM spec_propagations WHERE id = $1 FOR UPDATE",
        PROPAGATION_COLUMNS
    );
    let row = sqlx::query(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock propagation")?
        .ok_or_else(|| anyhow!("Propagation not found: {}", id))?;
    Ok(propagation_from_row(&row)?)
}

async fn finish_propagation(
    conn: &mut PgConnection,
    id: &Id,
    phase: PropagationPhase,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE spec_propagations SET phase = $2, error = $3, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(phase.as_str())
    .bind(error)
    .execute(&mut *conn)
    .await
    .context("Failed to finish propagation")?;
    Ok(())
}

#[async_trait::async_trait]
impl CatalogStore for PostgresStore {
    async fn get_category(&self, category: &CategoryRef) -> EngineResult<Option<Category>> {
        let sql = format!(
            "SELECT {} FROM spec_categories WHERE entity_kind = $1 AND name = $2",
            CATEGORY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(category.kind.as_str())
            .bind(&category.name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch category")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(category_from_row(&row)?))
    }

    async fn list_categories(&self, kind: EntityKind) -> EngineResult<Vec<Category>> {
        let sql = format!(
            "SELECT {} FROM spec_categories WHERE entity_kind = $1 ORDER BY name",
            CATEGORY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list categories")?;

        let categories = rows
            .iter()
            .map(category_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(categories)
    }

    async fn insert_category(&self, category: Category) -> EngineResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO spec_categories (entity_kind, name, description, schema_version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (entity_kind, name) DO NOTHING
            "#,
        )
        .bind(category.category.kind.as_str())
        .bind(&category.category.name)
        .bind(&category.description)
        .bind(category.schema_version)
        .bind(category.created_at)
        .bind(category.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert category")?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::CategoryExists(category.category).into());
        }
        Ok(())
    }

    async fn list_definitions(
        &self,
        category: &CategoryRef,
    ) -> EngineResult<Vec<AttributeDefinition>> {
        let sql = format!(
            "SELECT {} FROM spec_definitions WHERE entity_kind = $1 AND category = $2 ORDER BY seq",
            DEFINITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(category.kind.as_str())
            .bind(&category.name)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list definitions")?;

        let definitions = rows
            .iter()
            .map(definition_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(definitions)
    }

    async fn apply_definition_change(
        &self,
        definition: AttributeDefinition,
        expected_version: i64,
    ) -> EngineResult<Category> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let current = lock_category(&mut tx, &definition.category, true).await?;
        if let Some(running) = current.active_propagation {
            return Err(CatalogError::MutationInProgress {
                category: definition.category.clone(),
                propagation_id: running,
            }
            .into());
        }
        if current.schema_version != expected_version {
            return Err(EngineError::StaleSchema {
                category: definition.category.clone(),
                expected: expected_version,
                found: current.schema_version,
            });
        }

        upsert_definition(&mut tx, &definition).await?;
        let category = bump_category(&mut tx, &definition.category, None).await?;

        tx.commit().await.context("Failed to commit definition change")?;
        Ok(category)
    }
}

#[async_trait::async_trait]
impl InstanceStore for PostgresStore {
    async fn get_instance_spec(&self, instance: &InstanceRef) -> EngineResult<Option<InstanceSpec>> {
        let sql = format!(
            "SELECT {} FROM spec_instances WHERE entity_kind = $1 AND instance_id = $2",
            INSTANCE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(instance.kind.as_str())
            .bind(&instance.id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch instance spec")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(instance_from_row(&row)?))
    }

    async fn list_instance_batch(
        &self,
        category: &CategoryRef,
        after: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<InstanceSpec>> {
        let sql = format!(
            r#"
            SELECT {} FROM spec_instances
            WHERE entity_kind = $1 AND category = $2 AND ($3::TEXT IS NULL OR instance_id > $3)
            ORDER BY instance_id
            LIMIT $4
            "#,
            INSTANCE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(category.kind.as_str())
            .bind(&category.name)
            .bind(after)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list instance batch")?;

        let specs = rows
            .iter()
            .map(instance_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(specs)
    }

    async fn insert_instance_spec(
        &self,
        spec: InstanceSpec,
        expected_version: i64,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        check_writable(&mut tx, &spec.category_ref(), expected_version).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO spec_instances (entity_kind, instance_id, category, document, flags, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (entity_kind, instance_id) DO NOTHING
            "#,
        )
        .bind(spec.instance.kind.as_str())
        .bind(&spec.instance.id)
        .bind(&spec.category)
        .bind(serde_json::to_value(&spec.document).context("Failed to serialize spec document")?)
        .bind(serde_json::to_value(&spec.flags).context("Failed to serialize spec flags")?)
        .bind(spec.updated_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert instance spec")?;

        if result.rows_affected() == 0 {
            return Err(EngineError::InstanceExists(spec.instance));
        }
        tx.commit().await.context("Failed to commit instance spec")?;
        Ok(())
    }

    async fn update_instance_spec(
        &self,
        spec: InstanceSpec,
        expected_version: i64,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;
        check_writable(&mut tx, &spec.category_ref(), expected_version).await?;

        let result = sqlx::query(
            r#"
            UPDATE spec_instances
            SET category = $3, document = $4, flags = $5, updated_at = $6
            WHERE entity_kind = $1 AND instance_id = $2
            "#,
        )
        .bind(spec.instance.kind.as_str())
        .bind(&spec.instance.id)
        .bind(&spec.category)
        .bind(serde_json::to_value(&spec.document).context("Failed to serialize spec document")?)
        .bind(serde_json::to_value(&spec.flags).context("Failed to serialize spec flags")?)
        .bind(spec.updated_at)
        .execute(&mut *tx)
        .await
        .context("Failed to update instance spec")?;

        if result.rows_affected() == 0 {
            return Err(EngineError::InstanceNotFound(spec.instance));
        }
        tx.commit().await.context("Failed to commit instance spec")?;
        Ok(())
    }

    async fn delete_instance_spec(&self, instance: &InstanceRef) -> EngineResult<bool> {
        let result =
            sqlx::query("DELETE FROM spec_instances WHERE entity_kind = $1 AND instance_id = $2")
                .bind(instance.kind.as_str())
                .bind(&instance.id)
                .execute(&self.pool)
                .await
                .context("Failed to delete instance spec")?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait::async_trait]
impl PropagationStore for PostgresStore {
    async fn begin_propagation(&self, job: PropagationJob) -> EngineResult<PropagationJob> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let current = lock_category(&mut tx, &job.category, true).await?;
        if let Some(running) = current.active_propagation {
            return Err(CatalogError::MutationInProgress {
                category: job.category.clone(),
                propagation_id: running,
            }
            .into());
        }
        if current.schema_version != job.base_version {
            return Err(EngineError::StaleSchema {
                category: job.category.clone(),
                expected: job.base_version,
                found: current.schema_version,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO spec_propagations (id, entity_kind, category, mutation, target, phase, cursor,
                base_version, report, error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&job.id)
        .bind(job.category.kind.as_str())
        .bind(&job.category.name)
        .bind(serde_json::to_value(&job.mutation).context("Failed to serialize mutation")?)
        .bind(serde_json::to_value(&job.target).context("Failed to serialize target definition")?)
        .bind(job.phase.as_str())
        .bind(&job.cursor)
        .bind(job.base_version)
        .bind(serde_json::to_value(&job.report).context("Failed to serialize report")?)
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert propagation")?;

        bump_category(&mut tx, &job.category, Some(&job.id)).await?;

        tx.commit().await.context("Failed to commit propagation start")?;
        Ok(job)
    }

    async fn get_propagation(&self, id: &Id) -> EngineResult<Option<PropagationJob>> {
        let sql = format!(
            "SELECT {} FROM spec_propagations WHERE id = $1",
            PROPAGATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch propagation")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(propagation_from_row(&row)?))
    }

    async fn list_unfinished_propagations(&self) -> EngineResult<Vec<PropagationJob>> {
        let sql = format!(
            "SELECT {} FROM spec_propagations WHERE phase IN ('checking', 'applying') ORDER BY created_at",
            PROPAGATION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list unfinished propagations")?;

        let jobs = rows
            .iter()
            .map(propagation_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok(jobs)
    }

    async fn start_applying(&self, id: &Id) -> EngineResult<()> {
        sqlx::query(
            "UPDATE spec_propagations SET phase = 'applying', updated_at = NOW() WHERE id = $1 AND phase = 'checking'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark propagation applying")?;
        Ok(())
    }

    async fn commit_propagation_batch(
        &self,
        id: &Id,
        updates: Vec<InstanceSpec>,
        cursor: Id,
        report: PropagationReport,
    ) -> EngineResult<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let job = lock_propagation(&mut tx, id).await?;
        if job.phase != PropagationPhase::Applying {
            return Err(anyhow!("Propagation {} is {}, not applying", id, job.phase.as_str()).into());
        }

        for spec in &updates {
            sqlx::query(
                r#"
                UPDATE spec_instances SET document = $3, flags = $4, updated_at = $5
                WHERE entity_kind = $1 AND instance_id = $2
                "#,
            )
            .bind(spec.instance.kind.as_str())
            .bind(&spec.instance.id)
            .bind(serde_json::to_value(&spec.document).context("Failed to serialize spec document")?)
            .bind(serde_json::to_value(&spec.flags).context("Failed to serialize spec flags")?)
            .bind(spec.updated_at)
            .execute(&mut *tx)
            .await
            .context("Failed to rewrite instance spec")?;
        }

        sqlx::query(
            "UPDATE spec_propagations SET cursor = $2, report = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(&cursor)
        .bind(serde_json::to_value(&report).context("Failed to serialize report")?)
        .execute(&mut *tx)
        .await
        .context("Failed to advance propagation cursor")?;

        tx.commit().await.context("Failed to commit propagation batch")?;
        Ok(())
    }

    async fn complete_propagation(&self, id: &Id) -> EngineResult<PropagationJob> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let mut job = lock_propagation(&mut tx, id).await?;
        lock_category(&mut tx, &job.category, true).await?;
        upsert_definition(&mut tx, &job.target).await?;
        bump_category(&mut tx, &job.category, None).await?;
        finish_propagation(&mut tx, id, PropagationPhase::Completed, None).await?;

        tx.commit().await.context("Failed to commit propagation completion")?;
        job.phase = PropagationPhase::Completed;
        Ok(job)
    }

    async fn abort_propagation(&self, id: &Id, reason: String) -> EngineResult<PropagationJob> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let mut job = lock_propagation(&mut tx, id).await?;
        lock_category(&mut tx, &job.category, true).await?;
        bump_category(&mut tx, &job.category, None).await?;
        finish_propagation(&mut tx, id, PropagationPhase::Aborted, Some(&reason)).await?;

        tx.commit().await.context("Failed to commit propagation abort")?;
        job.phase = PropagationPhase::Aborted;
        job.error = Some(reason);
        Ok(job)
    }
}

impl Store for PostgresStore {}
