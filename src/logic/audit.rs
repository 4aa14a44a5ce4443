use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::logic::catalog::DefinitionCatalog;
use crate::logic::coerce::conforms;
use crate::logic::validate::CatalogSnapshot;
use crate::model::{CategoryRef, DefinitionState, EntityKind, Id, InstanceSpec, OVERFLOW_KEY};
use crate::store::traits::Store;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditResult {
    pub category: CategoryRef,
    pub schema_version: i64,
    pub valid: bool,
    pub findings: Vec<AuditFinding>,
    pub warnings: Vec<AuditFinding>,
    pub instance_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditFinding {
    pub instance_id: Option<Id>,
    pub kind: AuditFindingKind,
    pub message: String,
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditFindingKind {
    /// Formal key with no live definition
    UndefinedKey,
    /// Key present in both the formal partition and the overflow bucket
    PartitionOverlap,
    /// Overflow entry named like a live definition
    OverflowShadowsDefinition,
    MissingRequired,
    /// Formal value not in the canonical form of its type
    TypeDrift,
    /// Value under a deactivated definition, awaiting retirement
    DeprecatedValue,
    /// Value left unconverted by a best-effort retype
    FlaggedValue,
    /// A propagation is still rewriting the category
    PropagationPending,
}

/// Read-only consistency check of stored specs against the catalog
pub struct SpecAuditor<'a, S: Store> {
    store: &'a S,
    catalog: DefinitionCatalog<'a, S>,
    batch_size: usize,
}

impl<'a, S: Store> SpecAuditor<'a, S> {
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            catalog: DefinitionCatalog::new(store, batch_size),
            batch_size: batch_size.max(1),
        }
    }

    /// Audit every category of both namespaces
    pub async fn audit_all(&self) -> EngineResult<Vec<AuditResult>> {
        let mut results = Vec::new();
        for kind in [EntityKind::Material, EntityKind::Equipment] {
            for category in self.catalog.list_categories(kind).await? {
                results.push(self.audit_category(&category.category).await?);
            }
        }
        Ok(results)
    }

    pub async fn audit_category(&self, category: &CategoryRef) -> EngineResult<AuditResult> {
        let snapshot = self.catalog.snapshot(category).await?;
        let mut result = AuditResult {
            category: category.clone(),
            schema_version: snapshot.schema_version(),
            valid: true,
            findings: Vec::new(),
            warnings: Vec::new(),
            instance_count: 0,
        };

        if let Some(running) = &snapshot.category.active_propagation {
            result.warnings.push(AuditFinding {
                instance_id: None,
                kind: AuditFindingKind::PropagationPending,
                message: format!("Propagation {} has not finished", running),
                key: None,
            });
        }

        let mut cursor: Option<Id> = None;
        loop {
            let batch = self
                .store
                .list_instance_batch(category, cursor.as_deref(), self.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.instance.id.clone());

            for spec in &batch {
                result.instance_count += 1;
                Self::audit_instance(spec, &snapshot, &mut result);
            }
        }

        result.valid = result.findings.is_empty();
        Ok(result)
    }

    fn audit_instance(spec: &InstanceSpec, snapshot: &CatalogSnapshot, result: &mut AuditResult) {
        let instance_id = &spec.instance.id;
        let mut finding = |kind: AuditFindingKind, key: &str, message: String| {
            let entry = AuditFinding {
                instance_id: Some(instance_id.clone()),
                kind,
                message,
                key: Some(key.to_string()),
            };
            match kind {
                AuditFindingKind::DeprecatedValue | AuditFindingKind::FlaggedValue => {
                    result.warnings.push(entry)
                }
                _ => result.findings.push(entry),
            }
        };

        for (key, value) in &spec.document.formal {
            match snapshot.find(key) {
                None => finding(
                    AuditFindingKind::UndefinedKey,
                    key,
                    format!("'{}' is not defined for {}", key, snapshot.category_ref()),
                ),
                Some(def) if def.state() == DefinitionState::Deprecated => finding(
                    AuditFindingKind::DeprecatedValue,
                    key,
                    format!("'{}' is deactivated", key),
                ),
                Some(def) if !conforms(value, &def.value_type) => {
                    if spec.is_flagged(key) {
                        finding(
                            AuditFindingKind::FlaggedValue,
                            key,
                            format!("'{}' awaits remediation as {}", key, def.value_type),
                        )
                    } else {
                        finding(
                            AuditFindingKind::TypeDrift,
                            key,
                            format!("'{}' holds {} which is not a {}", key, value, def.value_type),
                        )
                    }
                }
                Some(_) => {}
            }
        }

        for key in spec.document.overlapping_keys() {
            finding(
                AuditFindingKind::PartitionOverlap,
                &key,
                format!("'{}' appears in both formal and overflow sections", key),
            );
        }

        for key in spec.document.overflow.keys() {
            if key == OVERFLOW_KEY || snapshot.find(key).is_some() {
                finding(
                    AuditFindingKind::OverflowShadowsDefinition,
                    key,
                    format!("overflow entry '{}' collides with a definition", key),
                );
            }
        }

        for def in snapshot.active().filter(|d| d.required) {
            if !spec.document.formal.contains_key(&def.key) {
                finding(
                    AuditFindingKind::MissingRequired,
                    &def.key,
                    format!("required '{}' is missing", def.key),
                );
            }
        }
    }
}
