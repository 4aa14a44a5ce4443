use chrono::Utc;
use log::{debug, error, info, warn};

use crate::error::{CatalogError, EngineError, EngineResult};
use crate::logic::coerce::coerce_value;
use crate::model::{
    CatalogMutation, CoercionMode, ConversionPolicy, Id, InstanceSpec, PropagationJob,
    PropagationPhase, PropagationReport, SpecFlag,
};
use crate::store::traits::Store;

/// Drives catalog mutations across every instance of a category.
///
/// A job first scans the category read-only (`Checking`); any collision or
/// incompatibility aborts it before a single instance is touched. It then
/// rewrites instances in id-ordered batches (`Applying`), persisting the
/// cursor with every batch, and only completes the catalog change once the
/// cursor has passed the last instance. Interrupted jobs resume from their
/// recorded phase and cursor.
pub struct Propagator<'a, S: Store> {
    store: &'a S,
    batch_size: usize,
}

impl<'a, S: Store> Propagator<'a, S> {
    pub fn new(store: &'a S, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Take the category lock for `job` and run it to completion
    pub async fn submit(&self, job: PropagationJob) -> EngineResult<PropagationJob> {
        let job = self.store.begin_propagation(job).await?;
        info!(
            "Propagation {} started on {}: {}",
            job.id,
            job.category,
            job.mutation.label()
        );
        self.run(job).await
    }

    /// Continue one stored job from wherever it stopped
    pub async fn resume(&self, id: &Id) -> EngineResult<PropagationJob> {
        let job = self
            .store
            .get_propagation(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Propagation not found: {}", id))?;

        if job.phase.is_finished() {
            return Ok(job);
        }
        info!(
            "Resuming propagation {} on {} in phase {} after {:?}",
            job.id,
            job.category,
            job.phase.as_str(),
            job.cursor
        );
        self.run(job).await
    }

    /// Resume every unfinished job. Failures are logged and left for the next
    /// invocation; the returned list holds each job as stored afterwards.
    pub async fn resume_pending(&self) -> EngineResult<Vec<PropagationJob>> {
        let pending = self.store.list_unfinished_propagations().await?;
        if pending.is_empty() {
            debug!("No unfinished propagations");
            return Ok(Vec::new());
        }

        let mut outcomes = Vec::with_capacity(pending.len());
        for job in pending {
            let id = job.id.clone();
            match self.resume(&id).await {
                Ok(done) => outcomes.push(done),
                Err(e) => {
                    error!("Propagation {} did not finish: {}", id, e);
                    if let Some(stored) = self.store.get_propagation(&id).await? {
                        outcomes.push(stored);
                    }
                }
            }
        }
        Ok(outcomes)
    }

    async fn run(&self, mut job: PropagationJob) -> EngineResult<PropagationJob> {
        if job.phase == PropagationPhase::Checking {
            if let Some(fault) = self.check(&job).await? {
                warn!("Propagation {} aborted: {}", job.id, fault);
                self.store
                    .abort_propagation(&job.id, fault.to_string())
                    .await?;
                return Err(fault.into());
            }
            self.store.start_applying(&job.id).await?;
            job.phase = PropagationPhase::Applying;
        }

        if job.phase == PropagationPhase::Applying {
            self.apply(&mut job).await?;
        }

        let done = self.store.complete_propagation(&job.id).await?;
        info!(
            "Propagation {} completed on {}: scanned {}, updated {}, flagged {}",
            done.id,
            done.category,
            job.report.scanned,
            job.report.updated,
            job.report.flagged_instances.len()
        );
        Ok(done)
    }

    /// Read-only pass over the category. Returns the fault that must abort the job.
    async fn check(&self, job: &PropagationJob) -> EngineResult<Option<CatalogError>> {
        if !matches!(
            job.mutation,
            CatalogMutation::Create { .. }
                | CatalogMutation::Rename { .. }
                | CatalogMutation::Retype {
                    policy: ConversionPolicy::Strict,
                    ..
                }
                | CatalogMutation::Retire { .. }
        ) {
            return Ok(None);
        }

        let mut incompatible: Vec<Id> = Vec::new();
        let mut cursor: Option<Id> = None;
        loop {
            let batch = self
                .store
                .list_instance_batch(&job.category, cursor.as_deref(), self.batch_size)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            cursor = Some(last.instance.id.clone());

            for spec in &batch {
                match check_instance(&job.mutation, spec) {
                    Some(InstanceFault::Incompatible) => incompatible.push(spec.instance.id.clone()),
                    Some(InstanceFault::Fatal(fault)) => return Ok(Some(fault)),
                    None => {}
                }
            }
        }

        if incompatible.is_empty() {
            return Ok(None);
        }
        let (key, target) = match &job.mutation {
            CatalogMutation::Create { key, value_type, .. } => (key.clone(), value_type.clone()),
            CatalogMutation::Retype { key, new_type, .. } => (key.clone(), new_type.clone()),
            _ => return Ok(None),
        };
        Ok(Some(CatalogError::IncompatibleType {
            key,
            target,
            instance_ids: incompatible,
        }))
    }

    async fn apply(&self, job: &mut PropagationJob) -> EngineResult<()> {
        loop {
            let fault = |reason: String| EngineError::PropagationFault {
                propagation_id: job.id.clone(),
                cursor: job.cursor.clone(),
                reason,
            };

            let batch = self
                .store
                .list_instance_batch(&job.category, job.cursor.as_deref(), self.batch_size)
                .await
                .map_err(|e| fault(e.to_string()))?;
            let Some(last) = batch.last().map(|s| s.instance.id.clone()) else {
                break;
            };

            let mut batch_report = PropagationReport::default();
            let updates: Vec<InstanceSpec> = batch
                .iter()
                .filter_map(|spec| rewrite(&*job, spec, &mut batch_report))
                .collect();

            let mut report = job.report.clone();
            report.absorb(batch_report);

            if let Err(e) = self
                .store
                .commit_propagation_batch(&job.id, updates, last.clone(), report.clone())
                .await
            {
                error!(
                    "Propagation {} failed to commit batch ending at {}: {}",
                    job.id, last, e
                );
                return Err(fault(e.to_string()));
            }

            info!(
                "Propagation {} committed batch up to {} ({} scanned, {} updated)",
                job.id, last, report.scanned, report.updated
            );
            job.cursor = Some(last);
            job.report = report;
        }
        Ok(())
    }
}

enum InstanceFault {
    /// Value cannot take the target type; collected across the whole category
    Incompatible,
    /// Stops the scan immediately
    Fatal(CatalogError),
}

fn check_instance(mutation: &CatalogMutation, spec: &InstanceSpec) -> Option<InstanceFault> {
    let doc = &spec.document;
    let instance_id = &spec.instance.id;

    match mutation {
        CatalogMutation::Create {
            key,
            value_type,
            promote,
            ..
        } => {
            let named = promote
                .as_ref()
                .filter(|p| &p.instance_id == instance_id && &p.overflow_key != key);
            if let Some(promotion) = named {
                if doc.overflow.contains_key(key) {
                    return Some(InstanceFault::Fatal(CatalogError::OverflowCollision {
                        instance_id: instance_id.clone(),
                        key: key.clone(),
                    }));
                }
                let value = doc.overflow.get(&promotion.overflow_key)?;
                return coerce_value(value, value_type, CoercionMode::Lenient)
                    .err()
                    .map(|_| InstanceFault::Incompatible);
            }
            let value = doc.overflow.get(key)?;
            coerce_value(value, value_type, CoercionMode::Lenient)
                .err()
                .map(|_| InstanceFault::Incompatible)
        }
        CatalogMutation::Rename { new_key, .. } => {
            if doc.formal.contains_key(new_key) || doc.overflow.contains_key(new_key) {
                Some(InstanceFault::Fatal(CatalogError::RenameCollision(
                    instance_id.clone(),
                )))
            } else {
                None
            }
        }
        CatalogMutation::Retype {
            key,
            new_type,
            policy,
        } => {
            let value = doc.formal.get(key)?;
            coerce_value(value, new_type, CoercionMode::from(*policy))
                .err()
                .map(|_| InstanceFault::Incompatible)
        }
        CatalogMutation::Retire { key } => {
            if doc.formal.contains_key(key) && doc.overflow.contains_key(key) {
                Some(InstanceFault::Fatal(CatalogError::OverflowCollision {
                    instance_id: instance_id.clone(),
                    key: key.clone(),
                }))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Apply the job's mutation to one instance. `None` when nothing changes,
/// which keeps re-running a batch idempotent.
fn rewrite(
    job: &PropagationJob,
    spec: &InstanceSpec,
    report: &mut PropagationReport,
) -> Option<InstanceSpec> {
    report.scanned += 1;
    let mut next = spec.clone();
    let doc = &mut next.document;
    let instance_id = &spec.instance.id;

    match &job.mutation {
        CatalogMutation::Create {
            key,
            value_type,
            required,
            default_value,
            promote,
        } => {
            let source = promote
                .as_ref()
                .filter(|p| &p.instance_id == instance_id)
                .map(|p| p.overflow_key.as_str())
                .unwrap_or(key.as_str());

            let promoted = doc
                .overflow
                .get(source)
                .and_then(|raw| coerce_value(raw, value_type, CoercionMode::Lenient).ok());
            if let Some(value) = promoted {
                doc.overflow.remove(source);
                doc.formal.insert(key.clone(), value);
                report.promoted_instances.push(instance_id.clone());
            }
            if *required && !doc.formal.contains_key(key) {
                if let Some(default) = default_value {
                    doc.formal.insert(key.clone(), default.clone());
                }
            }
        }
        CatalogMutation::RequireOn { key, default_value } => {
            if !doc.formal.contains_key(key) {
                doc.formal.insert(key.clone(), default_value.clone());
            }
        }
        CatalogMutation::Rename { old_key, new_key } => {
            if let Some(value) = doc.formal.remove(old_key) {
                doc.formal.insert(new_key.clone(), value);
            }
            for flag in next.flags.iter_mut().filter(|f| &f.key == old_key) {
                flag.key = new_key.clone();
            }
        }
        CatalogMutation::Retype {
            key,
            new_type,
            policy,
        } => {
            if let Some(raw) = doc.formal.get(key).cloned() {
                match coerce_value(&raw, new_type, CoercionMode::from(*policy)) {
                    Ok(value) => {
                        doc.formal.insert(key.clone(), value);
                        next.flags.retain(|f| &f.key != key);
                        report.converted += 1;
                    }
                    Err(_) => {
                        next.flags.retain(|f| &f.key != key);
                        next.flags.push(SpecFlag {
                            key: key.clone(),
                            reason: format!("value cannot be converted to {}", new_type),
                            propagation_id: job.id.clone(),
                            flagged_at: Utc::now(),
                        });
                        report.flagged_instances.push(instance_id.clone());
                    }
                }
            }
        }
        CatalogMutation::Retire { key } => {
            if let Some(value) = doc.formal.remove(key) {
                doc.overflow.insert(key.clone(), value);
            }
            next.flags.retain(|f| &f.key != key);
        }
        CatalogMutation::Deactivate { .. }
        | CatalogMutation::RequireOff { .. }
        | CatalogMutation::UpdateDefault { .. } => {}
    }

    if next.document == spec.document && next.flags == spec.flags {
        return None;
    }
    next.updated_at = Utc::now();
    report.updated += 1;
    Some(next)
}
