use facility_spec_engine::logic::{DefinitionCatalog, InstanceSpecService, Propagator, SpecAuditor};
use facility_spec_engine::model::{
    AttributeStatus, CatalogMutation, CategoryRef, ConversionPolicy, InstanceRef,
    NewAttributeDefinition, OverflowRouting, PropagationJob, PropagationPhase, SpecMap, ValueType,
};
use facility_spec_engine::store::{CatalogStore, InstanceStore, MemoryStore, PropagationStore};
use facility_spec_engine::{CatalogError, EngineError, ValidationError};
use serde_json::{json, Value};

const BATCH: usize = 3;

fn pump() -> CategoryRef {
    CategoryRef::equipment("pump")
}

fn equipment(id: &str) -> InstanceRef {
    InstanceRef::equipment(id)
}

fn spec(value: Value) -> SpecMap {
    serde_json::from_value(value).unwrap()
}

/// Store with an equipment/pump category defining `flow_rate: number`
async fn pump_store() -> MemoryStore {
    let store = MemoryStore::new();
    let catalog = DefinitionCatalog::new(&store, BATCH);
    catalog.create_category(pump(), None).await.unwrap();
    catalog
        .create_definition(&pump(), NewAttributeDefinition::new("flow_rate", ValueType::Number))
        .await
        .unwrap();
    store
}

async fn register(store: &MemoryStore, id: &str, value: Value) {
    InstanceSpecService::new(store, BATCH)
        .register_instance(equipment(id), "pump", &spec(value), OverflowRouting::Reject)
        .await
        .unwrap();
}

async fn formal_value(store: &MemoryStore, id: &str, key: &str) -> Option<Value> {
    let spec = InstanceSpecService::new(store, BATCH)
        .read(&equipment(id))
        .await
        .unwrap();
    spec.document.formal.get(key).cloned()
}

#[tokio::test]
async fn test_pump_write_scenario() {
    let store = pump_store().await;
    let service = InstanceSpecService::new(&store, BATCH);
    register(&store, "e-1", json!({})).await;
    let e1 = equipment("e-1");

    let validated = service
        .write(&e1, &spec(json!({"flow_rate": "12.5"})), OverflowRouting::Reject)
        .await
        .unwrap();
    assert_eq!(validated.formal.get("flow_rate"), Some(&json!(12.5)));
    assert_eq!(formal_value(&store, "e-1", "flow_rate").await, Some(json!(12.5)));

    let err = service
        .write(&e1, &spec(json!({"flow_rate": "fast"})), OverflowRouting::Reject)
        .await
        .unwrap_err();
    let rejection = err.as_rejection().unwrap();
    assert!(rejection.has(|e| matches!(e, ValidationError::TypeMismatch { key, .. } if key == "flow_rate")));

    let err = service
        .write(&e1, &spec(json!({"voltage": 220})), OverflowRouting::Reject)
        .await
        .unwrap_err();
    assert_eq!(
        err.as_rejection().unwrap().errors,
        vec![ValidationError::UnknownAttributeKey("voltage".into())]
    );
    // Rejections leave the stored spec untouched
    assert_eq!(formal_value(&store, "e-1", "flow_rate").await, Some(json!(12.5)));

    service
        .write(&e1, &spec(json!({"voltage": 220})), OverflowRouting::RouteUnknown)
        .await
        .unwrap();
    let stored = service.read(&e1).await.unwrap();
    assert!(!stored.document.formal.contains_key("voltage"));
    assert_eq!(stored.document.overflow.get("voltage"), Some(&json!(220)));
    // Full replace: flow_rate was not part of the last write
    assert!(stored.document.formal.is_empty());
}

#[tokio::test]
async fn test_overflow_bucket_merges_key_wise() {
    let store = pump_store().await;
    let service = InstanceSpecService::new(&store, BATCH);
    register(
        &store,
        "e-1",
        json!({"flow_rate": 1, "_overflow": {"color": "red", "voltage": 110}}),
    )
    .await;
    let e1 = equipment("e-1");

    service
        .write(
            &e1,
            &spec(json!({"flow_rate": 3, "_overflow": {"voltage": 220, "color": null, "note": "spare"}})),
            OverflowRouting::Reject,
        )
        .await
        .unwrap();
    service
        .write(&e1, &spec(json!({"flow_rate": 4})), OverflowRouting::Reject)
        .await
        .unwrap();

    let stored = service.read(&e1).await.unwrap();
    assert_eq!(stored.document.formal, spec(json!({"flow_rate": 4})));
    assert_eq!(
        stored.document.overflow,
        spec(json!({"voltage": 220, "note": "spare"}))
    );
    assert!(stored.document.overlapping_keys().is_empty());
}

#[tokio::test]
async fn test_write_then_read_revalidates_identically() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    catalog
        .create_definition(&pump(), NewAttributeDefinition::new("commissioned", ValueType::Date))
        .await
        .unwrap();
    catalog
        .create_definition(
            &pump(),
            NewAttributeDefinition::new("stages", ValueType::Number).required(json!(1)),
        )
        .await
        .unwrap();

    register(&store, "e-1", json!({})).await;
    let service = InstanceSpecService::new(&store, BATCH);
    service
        .write(
            &equipment("e-1"),
            &spec(json!({"flow_rate": " 7 ", "commissioned": "2021/6/3", "_overflow": {"tag": "A1"}})),
            OverflowRouting::Reject,
        )
        .await
        .unwrap();

    let stored = service.read(&equipment("e-1")).await.unwrap();
    assert_eq!(
        stored.document.formal,
        spec(json!({"flow_rate": 7, "commissioned": "2021-06-03", "stages": 1}))
    );

    let again = catalog
        .validate(&pump(), &stored.document.to_candidate(), OverflowRouting::Reject)
        .await
        .unwrap();
    assert_eq!(again.formal, stored.document.formal);
    assert_eq!(again.overflow, stored.document.overflow);
    assert!(again.injected_defaults.is_empty());
}

#[tokio::test]
async fn test_rename_collision_leaves_every_instance_untouched() {
    let store = pump_store().await;
    for i in 0..10 {
        let id = format!("e-{:02}", i);
        if i == 7 {
            register(&store, &id, json!({"flow_rate": i, "_overflow": {"flowrate_lpm": 70}})).await;
        } else {
            register(&store, &id, json!({"flow_rate": i})).await;
        }
    }
    let catalog = DefinitionCatalog::new(&store, BATCH);

    let err = catalog
        .rename_definition(&pump(), "flow_rate", "flowrate_lpm")
        .await
        .unwrap_err();
    assert_eq!(
        err.as_catalog(),
        Some(&CatalogError::RenameCollision("e-07".to_string()))
    );

    for i in 0..10 {
        let id = format!("e-{:02}", i);
        assert_eq!(formal_value(&store, &id, "flow_rate").await, Some(json!(i)));
        assert_eq!(formal_value(&store, &id, "flowrate_lpm").await, None);
    }
    assert!(catalog.get_definition(&pump(), "flow_rate").await.unwrap().is_some());
    assert!(catalog.get_definition(&pump(), "flowrate_lpm").await.unwrap().is_none());
    assert!(!catalog.get_category(&pump()).await.unwrap().is_propagating());

    // Clearing the colliding overflow entry lets the rename go through everywhere
    InstanceSpecService::new(&store, BATCH)
        .write(
            &equipment("e-07"),
            &spec(json!({"flow_rate": 7, "_overflow": {"flowrate_lpm": null}})),
            OverflowRouting::Reject,
        )
        .await
        .unwrap();
    let renamed = catalog
        .rename_definition(&pump(), "flow_rate", "flowrate_lpm")
        .await
        .unwrap();
    assert_eq!(renamed.key, "flowrate_lpm");

    for i in 0..10 {
        let id = format!("e-{:02}", i);
        assert_eq!(formal_value(&store, &id, "flowrate_lpm").await, Some(json!(i)));
        assert_eq!(formal_value(&store, &id, "flow_rate").await, None);
    }
}

#[tokio::test]
async fn test_rename_collision_in_last_batch_of_large_category() {
    let store = pump_store().await;
    let last = 999;
    for i in 0..=last {
        let id = format!("e-{:04}", i);
        if i == last {
            register(&store, &id, json!({"flow_rate": i, "_overflow": {"flowrate_lpm": 1}})).await;
        } else {
            register(&store, &id, json!({"flow_rate": i})).await;
        }
    }
    let catalog = DefinitionCatalog::new(&store, BATCH);

    let err = catalog
        .rename_definition(&pump(), "flow_rate", "flowrate_lpm")
        .await
        .unwrap_err();
    assert_eq!(
        err.as_catalog(),
        Some(&CatalogError::RenameCollision("e-0999".to_string()))
    );

    let mut cursor: Option<String> = None;
    let mut seen = 0;
    loop {
        let batch = store
            .list_instance_batch(&pump(), cursor.as_deref(), 100)
            .await
            .unwrap();
        let Some(tail) = batch.last() else {
            break;
        };
        cursor = Some(tail.instance.id.clone());
        for spec in &batch {
            assert!(spec.document.formal.contains_key("flow_rate"));
            assert!(!spec.document.formal.contains_key("flowrate_lpm"));
            seen += 1;
        }
    }
    assert_eq!(seen, last + 1);
    assert!(store.list_unfinished_propagations().await.unwrap().is_empty());
    assert!(!catalog.get_category(&pump()).await.unwrap().is_propagating());
}

#[tokio::test]
async fn test_strict_retype_is_all_or_nothing_and_best_effort_flags() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    catalog
        .create_definition(&pump(), NewAttributeDefinition::new("rating", ValueType::String))
        .await
        .unwrap();
    register(&store, "e-1", json!({"rating": "10"})).await;
    register(&store, "e-2", json!({"rating": "20"})).await;
    register(&store, "e-3", json!({"rating": "high"})).await;
    register(&store, "e-4", json!({"flow_rate": 5})).await;
    // Parses as a number but would not survive the conversion verbatim
    register(&store, "e-5", json!({"rating": "007"})).await;

    let err = catalog
        .retype_definition(&pump(), "rating", ValueType::Number, ConversionPolicy::Strict)
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_catalog(),
        Some(CatalogError::IncompatibleType { instance_ids, .. })
            if instance_ids == &vec!["e-3".to_string(), "e-5".to_string()]
    ));
    assert_eq!(formal_value(&store, "e-1", "rating").await, Some(json!("10")));
    assert_eq!(formal_value(&store, "e-5", "rating").await, Some(json!("007")));
    let unchanged = catalog.get_definition(&pump(), "rating").await.unwrap().unwrap();
    assert_eq!(unchanged.value_type, ValueType::String);

    let report = catalog
        .retype_definition(&pump(), "rating", ValueType::Number, ConversionPolicy::BestEffort)
        .await
        .unwrap();
    assert_eq!(report.failed_instance_ids, vec!["e-3".to_string()]);
    assert_eq!(report.converted, 3);
    assert_eq!(report.definition.value_type, ValueType::Number);

    assert_eq!(formal_value(&store, "e-1", "rating").await, Some(json!(10)));
    assert_eq!(formal_value(&store, "e-2", "rating").await, Some(json!(20)));
    assert_eq!(formal_value(&store, "e-3", "rating").await, Some(json!("high")));
    assert_eq!(formal_value(&store, "e-5", "rating").await, Some(json!(7)));

    let service = InstanceSpecService::new(&store, BATCH);
    let readings = service.read_annotated(&equipment("e-3")).await.unwrap();
    let rating = readings.iter().find(|r| r.key == "rating").unwrap();
    assert_eq!(rating.status, AttributeStatus::Flagged);

    let audit = SpecAuditor::new(&store, BATCH)
        .audit_category(&pump())
        .await
        .unwrap();
    assert!(audit.valid);
    assert_eq!(audit.warnings.len(), 1);

    // Remediation: rewriting the value clears the flag
    service
        .write(&equipment("e-3"), &spec(json!({"rating": 5})), OverflowRouting::Reject)
        .await
        .unwrap();
    assert!(service.read(&equipment("e-3")).await.unwrap().flags.is_empty());
}

#[tokio::test]
async fn test_toggle_required_backfills_once() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    catalog
        .create_definition(
            &pump(),
            NewAttributeDefinition::new("stages", ValueType::Number).with_default(json!(0)),
        )
        .await
        .unwrap();
    register(&store, "e-1", json!({"stages": 3})).await;
    register(&store, "e-2", json!({})).await;
    register(&store, "e-3", json!({"flow_rate": 9})).await;

    let stages = catalog.toggle_required(&pump(), "stages", true).await.unwrap();
    assert!(stages.required);
    assert_eq!(formal_value(&store, "e-1", "stages").await, Some(json!(3)));
    assert_eq!(formal_value(&store, "e-2", "stages").await, Some(json!(0)));
    assert_eq!(formal_value(&store, "e-3", "stages").await, Some(json!(0)));

    let before = store.list_instance_batch(&pump(), None, 100).await.unwrap();

    // Run the same backfill again
    let category = store.get_category(&pump()).await.unwrap().unwrap();
    let job = PropagationJob::new(
        pump(),
        CatalogMutation::RequireOn {
            key: "stages".into(),
            default_value: json!(0),
        },
        stages,
        category.schema_version,
    );
    let rerun = Propagator::new(&store, BATCH).submit(job).await.unwrap();
    assert_eq!(rerun.phase, PropagationPhase::Completed);
    assert_eq!(rerun.report.scanned, 3);
    assert_eq!(rerun.report.updated, 0);

    let after = store.list_instance_batch(&pump(), None, 100).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_toggle_required_without_default_is_refused() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);

    let err = catalog
        .toggle_required(&pump(), "flow_rate", true)
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_catalog(),
        Some(CatalogError::InvalidDefault { key, .. }) if key == "flow_rate"
    ));
    let def = catalog.get_definition(&pump(), "flow_rate").await.unwrap().unwrap();
    assert!(!def.required);
}

#[tokio::test]
async fn test_update_default_leaves_stored_values() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    catalog
        .create_definition(
            &pump(),
            NewAttributeDefinition::new("stages", ValueType::Number).required(json!(1)),
        )
        .await
        .unwrap();
    register(&store, "e-1", json!({})).await;

    let stages = catalog
        .update_default(&pump(), "stages", Some(json!("2")))
        .await
        .unwrap();
    assert_eq!(stages.default_value, Some(json!(2)));
    assert_eq!(formal_value(&store, "e-1", "stages").await, Some(json!(1)));

    register(&store, "e-2", json!({})).await;
    assert_eq!(formal_value(&store, "e-2", "stages").await, Some(json!(2)));

    let err = catalog
        .update_default(&pump(), "stages", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_catalog(),
        Some(CatalogError::InvalidDefault { .. })
    ));
}

#[tokio::test]
async fn test_definition_preconditions() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    catalog
        .create_definition(&pump(), NewAttributeDefinition::new("rpm", ValueType::Number))
        .await
        .unwrap();

    let err = catalog
        .create_definition(&pump(), NewAttributeDefinition::new("flow_rate", ValueType::String))
        .await
        .unwrap_err();
    assert!(matches!(err.as_catalog(), Some(CatalogError::DuplicateKey { .. })));

    let err = catalog
        .create_definition(&pump(), NewAttributeDefinition::new("_overflow", ValueType::String))
        .await
        .unwrap_err();
    assert!(matches!(err.as_catalog(), Some(CatalogError::ReservedKey(_))));

    let required_without_default = NewAttributeDefinition {
        required: true,
        ..NewAttributeDefinition::new("stages", ValueType::Number)
    };
    let err = catalog
        .create_definition(&pump(), required_without_default)
        .await
        .unwrap_err();
    assert!(matches!(err.as_catalog(), Some(CatalogError::InvalidDefault { .. })));

    let err = catalog
        .create_definition(
            &pump(),
            NewAttributeDefinition::new("seal", ValueType::enumeration(["mechanical", "packing"]))
                .with_default(json!("magnetic")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.as_catalog(), Some(CatalogError::InvalidDefault { .. })));

    let err = catalog
        .rename_definition(&pump(), "flow_rate", "rpm")
        .await
        .unwrap_err();
    assert!(matches!(err.as_catalog(), Some(CatalogError::KeyCollision { .. })));

    let err = catalog
        .rename_definition(&pump(), "missing", "other")
        .await
        .unwrap_err();
    assert!(matches!(err.as_catalog(), Some(CatalogError::DefinitionNotFound { .. })));

    let active: Vec<_> = catalog
        .get_active_definitions(&pump())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.key)
        .collect();
    assert_eq!(active, vec!["flow_rate".to_string(), "rpm".to_string()]);
}

#[tokio::test]
async fn test_deactivate_then_retire_keeps_values() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    let service = InstanceSpecService::new(&store, BATCH);
    catalog
        .create_definition(&pump(), NewAttributeDefinition::new("rpm", ValueType::Number))
        .await
        .unwrap();
    register(&store, "e-1", json!({"flow_rate": 1, "rpm": 1450})).await;
    let e1 = equipment("e-1");

    let err = catalog.retire_definition(&pump(), "rpm").await.unwrap_err();
    assert!(matches!(err.as_catalog(), Some(CatalogError::DefinitionStillActive { .. })));

    let rpm = catalog.deactivate_definition(&pump(), "rpm").await.unwrap();
    assert!(!rpm.active);
    let active: Vec<_> = catalog
        .get_active_definitions(&pump())
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.key)
        .collect();
    assert_eq!(active, vec!["flow_rate".to_string()]);

    let readings = service.read_annotated(&e1).await.unwrap();
    let rpm_reading = readings.iter().find(|r| r.key == "rpm").unwrap();
    assert_eq!(rpm_reading.status, AttributeStatus::Deprecated);
    assert_eq!(rpm_reading.value, json!(1450));

    // Not writable any more, but carried across full-replace writes
    let err = service
        .write(&e1, &spec(json!({"rpm": 1500})), OverflowRouting::RouteUnknown)
        .await
        .unwrap_err();
    assert!(err
        .as_rejection()
        .unwrap()
        .has(|e| matches!(e, ValidationError::UnknownAttributeKey(k) if k == "rpm")));
    service
        .write(&e1, &spec(json!({"flow_rate": 2})), OverflowRouting::Reject)
        .await
        .unwrap();
    assert_eq!(formal_value(&store, "e-1", "rpm").await, Some(json!(1450)));

    catalog.retire_definition(&pump(), "rpm").await.unwrap();
    let stored = service.read(&e1).await.unwrap();
    assert!(!stored.document.formal.contains_key("rpm"));
    assert_eq!(stored.document.overflow.get("rpm"), Some(&json!(1450)));
    assert!(catalog.get_definition(&pump(), "rpm").await.unwrap().is_none());

    let history = catalog.definition_history(&pump()).await.unwrap();
    assert!(history.iter().any(|d| d.key == "rpm" && d.retired_at.is_some()));

    // A new definition under the same key picks the parked value back up
    catalog
        .create_definition(&pump(), NewAttributeDefinition::new("rpm", ValueType::Number))
        .await
        .unwrap();
    let stored = service.read(&e1).await.unwrap();
    assert_eq!(stored.document.formal.get("rpm"), Some(&json!(1450)));
    assert!(!stored.document.overflow.contains_key("rpm"));
}

#[tokio::test]
async fn test_move_to_formal_promotes_overflow_entry() {
    let store = pump_store().await;
    register(&store, "e-1", json!({"_overflow": {"voltage": "400", "color": "blue"}})).await;
    register(&store, "e-2", json!({"flow_rate": 3})).await;
    let service = InstanceSpecService::new(&store, BATCH);

    let def = service
        .move_to_formal(
            &equipment("e-1"),
            "voltage",
            NewAttributeDefinition::new("supply_voltage", ValueType::Number).required(json!(230)),
        )
        .await
        .unwrap();
    assert_eq!(def.key, "supply_voltage");

    let origin = service.read(&equipment("e-1")).await.unwrap();
    assert_eq!(origin.document.formal.get("supply_voltage"), Some(&json!(400)));
    assert!(!origin.document.overflow.contains_key("voltage"));
    assert_eq!(origin.document.overflow.get("color"), Some(&json!("blue")));

    assert_eq!(formal_value(&store, "e-2", "supply_voltage").await, Some(json!(230)));

    let err = service
        .move_to_formal(
            &equipment("e-2"),
            "voltage",
            NewAttributeDefinition::new("other", ValueType::Number),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::OverflowEntryNotFound { .. }));
}

#[tokio::test]
async fn test_commit_after_catalog_change_is_stale() {
    let store = pump_store().await;
    register(&store, "e-1", json!({"flow_rate": 1})).await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    let service = InstanceSpecService::new(&store, BATCH);

    let validated = catalog
        .validate(&pump(), &spec(json!({"flow_rate": 2})), OverflowRouting::Reject)
        .await
        .unwrap();
    catalog
        .create_definition(&pump(), NewAttributeDefinition::new("head", ValueType::Number))
        .await
        .unwrap();

    let err = service
        .commit_validated(&equipment("e-1"), &validated)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleSchema { .. }));
    assert!(err.is_retryable());
    assert_eq!(formal_value(&store, "e-1", "flow_rate").await, Some(json!(1)));

    service
        .write(&equipment("e-1"), &spec(json!({"flow_rate": 2})), OverflowRouting::Reject)
        .await
        .unwrap();
    assert_eq!(formal_value(&store, "e-1", "flow_rate").await, Some(json!(2)));
}

#[tokio::test]
async fn test_running_propagation_locks_category() {
    let store = pump_store().await;
    register(&store, "e-1", json!({"flow_rate": 1})).await;
    register(&store, "e-2", json!({})).await;
    let catalog = DefinitionCatalog::new(&store, BATCH);

    let mut target = catalog.get_definition(&pump(), "flow_rate").await.unwrap().unwrap();
    target.required = true;
    target.default_value = Some(json!(0));
    let category = catalog.get_category(&pump()).await.unwrap();
    let job = PropagationJob::new(
        pump(),
        CatalogMutation::RequireOn {
            key: "flow_rate".into(),
            default_value: json!(0),
        },
        target,
        category.schema_version,
    );
    let job = store.begin_propagation(job).await.unwrap();

    let err = catalog
        .create_definition(&pump(), NewAttributeDefinition::new("head", ValueType::Number))
        .await
        .unwrap_err();
    assert!(matches!(
        err.as_catalog(),
        Some(CatalogError::MutationInProgress { propagation_id, .. }) if propagation_id == &job.id
    ));

    let service = InstanceSpecService::new(&store, BATCH);
    let err = service
        .write(&equipment("e-1"), &spec(json!({"flow_rate": 5})), OverflowRouting::Reject)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleSchema { .. }));

    let outcomes = Propagator::new(&store, BATCH).resume_pending().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].phase, PropagationPhase::Completed);
    assert_eq!(formal_value(&store, "e-2", "flow_rate").await, Some(json!(0)));

    service
        .write(&equipment("e-1"), &spec(json!({"flow_rate": 5})), OverflowRouting::Reject)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_interrupted_propagation_resumes_from_cursor() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    catalog
        .create_definition(
            &pump(),
            NewAttributeDefinition::new("stages", ValueType::Number).with_default(json!(0)),
        )
        .await
        .unwrap();
    for i in 0..10 {
        register(&store, &format!("e-{:02}", i), json!({"flow_rate": i})).await;
    }

    store.fail_batch_commit_after(1);
    let err = catalog
        .toggle_required(&pump(), "stages", true)
        .await
        .unwrap_err();
    match &err {
        EngineError::PropagationFault { cursor, .. } => {
            assert_eq!(cursor.as_deref(), Some("e-02"))
        }
        other => panic!("expected a propagation fault, got {:?}", other),
    }
    assert!(err.is_retryable());

    // First batch is in, the rest is not, and the flag is not observable yet
    assert_eq!(formal_value(&store, "e-00", "stages").await, Some(json!(0)));
    assert_eq!(formal_value(&store, "e-03", "stages").await, None);
    let stages = catalog.get_definition(&pump(), "stages").await.unwrap().unwrap();
    assert!(!stages.required);
    assert!(catalog.get_category(&pump()).await.unwrap().is_propagating());

    let outcomes = Propagator::new(&store, BATCH).resume_pending().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].phase, PropagationPhase::Completed);
    assert_eq!(outcomes[0].report.updated, 10);

    for i in 0..10 {
        let id = format!("e-{:02}", i);
        assert_eq!(formal_value(&store, &id, "stages").await, Some(json!(0)));
    }
    let stages = catalog.get_definition(&pump(), "stages").await.unwrap().unwrap();
    assert!(stages.required);
    assert!(store.list_unfinished_propagations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_category_change_requires_empty_spec() {
    let store = pump_store().await;
    let catalog = DefinitionCatalog::new(&store, BATCH);
    let valve = CategoryRef::equipment("valve");
    catalog.create_category(valve.clone(), None).await.unwrap();
    catalog
        .create_definition(
            &valve,
            NewAttributeDefinition::new("size", ValueType::String).required(json!("DN50")),
        )
        .await
        .unwrap();

    register(&store, "e-1", json!({"flow_rate": 1})).await;
    register(&store, "e-2", json!({})).await;
    let service = InstanceSpecService::new(&store, BATCH);

    let err = service
        .reassign_category(&equipment("e-1"), "valve")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CategoryChangeUnsupported(_)));
    assert_eq!(service.read(&equipment("e-1")).await.unwrap().category, "pump");

    let moved = service
        .reassign_category(&equipment("e-2"), "valve")
        .await
        .unwrap();
    assert_eq!(moved.category, "valve");
    assert_eq!(moved.document.formal, spec(json!({"size": "DN50"})));

    let validated = catalog
        .validate(&pump(), &spec(json!({"flow_rate": 4})), OverflowRouting::Reject)
        .await
        .unwrap();
    let err = service
        .commit_validated(&equipment("e-2"), &validated)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CategoryChangeUnsupported(_)));
}

#[tokio::test]
async fn test_register_and_remove_instance() {
    let store = pump_store().await;
    let service = InstanceSpecService::new(&store, BATCH);

    register(&store, "e-1", json!({"flow_rate": "8"})).await;
    assert_eq!(store.instance_count(), 1);

    let err = service
        .register_instance(equipment("e-1"), "pump", &SpecMap::new(), OverflowRouting::Reject)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InstanceExists(_)));

    let err = service
        .register_instance(equipment("e-9"), "compressor", &SpecMap::new(), OverflowRouting::Reject)
        .await
        .unwrap_err();
    assert!(matches!(err.as_catalog(), Some(CatalogError::CategoryNotFound(_))));

    service.remove_instance(&equipment("e-1")).await.unwrap();
    assert_eq!(store.instance_count(), 0);
    let err = service.read(&equipment("e-1")).await.unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotFound(_)));
    let err = service.remove_instance(&equipment("e-1")).await.unwrap_err();
    assert!(matches!(err, EngineError::InstanceNotFound(_)));
}

#[tokio::test]
async fn test_seed_data_passes_audit() {
    let store = MemoryStore::new();
    facility_spec_engine::seed::load_seed_data(&store, BATCH).await.unwrap();
    // Loading twice is a no-op
    facility_spec_engine::seed::load_seed_data(&store, BATCH).await.unwrap();

    let results = SpecAuditor::new(&store, BATCH).audit_all().await.unwrap();
    assert_eq!(results.len(), 2);
    for result in &results {
        assert!(result.valid, "{} has findings: {:?}", result.category, result.findings);
    }
    assert_eq!(store.instance_count(), 5);

    let reagent = InstanceSpecService::new(&store, BATCH)
        .read(&InstanceRef::material("R-0002"))
        .await
        .unwrap();
    assert_eq!(reagent.document.formal.get("grade"), Some(&json!("technical")));
    assert_eq!(reagent.document.formal.get("purity"), Some(&json!(95)));
}
