use anyhow::{Context, Result};
use log::info;
use serde_json::json;

use crate::logic::{DefinitionCatalog, InstanceSpecService};
use crate::model::{
    CategoryRef, InstanceRef, NewAttributeDefinition, OverflowRouting, SpecMap, ValueType,
};
use crate::store::traits::Store;

/// Demo catalog: one equipment and one material category with a handful of
/// records, including an overflow entry awaiting promotion. Skipped when the
/// categories already exist.
pub async fn load_seed_data<S: Store>(store: &S, batch_size: usize) -> Result<()> {
    let catalog = DefinitionCatalog::new(store, batch_size);

    let pump = CategoryRef::equipment("pump");
    if store.get_category(&pump).await?.is_none() {
        load_pump_category(store, &catalog, batch_size, &pump).await?;
    }

    let reagent = CategoryRef::material("reagent");
    if store.get_category(&reagent).await?.is_none() {
        load_reagent_category(store, &catalog, batch_size, &reagent).await?;
    }

    Ok(())
}

fn spec_map(value: serde_json::Value) -> Result<SpecMap> {
    serde_json::from_value(value).context("Seed spec must be a JSON object")
}

async fn load_pump_category<S: Store>(
    store: &S,
    catalog: &DefinitionCatalog<'_, S>,
    batch_size: usize,
    pump: &CategoryRef,
) -> Result<()> {
    catalog
        .create_category(pump.clone(), Some("Centrifugal and positive displacement pumps".into()))
        .await?;

    let definitions = vec![
        NewAttributeDefinition::new("flow_rate", ValueType::Number)
            .with_unit("l/min")
            .with_display_name("Flow rate"),
        NewAttributeDefinition::new("head", ValueType::Number).with_unit("m"),
        NewAttributeDefinition::new("seal", ValueType::enumeration(["mechanical", "packing", "magnetic"])),
        NewAttributeDefinition::new("stages", ValueType::Number).required(json!(1)),
        NewAttributeDefinition::new("atex_certified", ValueType::Boolean).with_default(json!(false)),
        NewAttributeDefinition::new("commissioned", ValueType::Date),
    ];
    for def in definitions {
        catalog.create_definition(pump, def).await?;
    }

    let specs = InstanceSpecService::new(store, batch_size);
    let records = vec![
        ("P-101", json!({"flow_rate": 120, "head": 32.5, "seal": "mechanical", "commissioned": "2019-04-02"})),
        ("P-102", json!({"flow_rate": "85", "seal": "packing", "stages": 2})),
        ("P-201", json!({"flow_rate": 40, "atex_certified": "yes", "_overflow": {"voltage": 400}})),
    ];
    for (id, spec) in records {
        specs
            .register_instance(InstanceRef::equipment(id), &pump.name, &spec_map(spec)?, OverflowRouting::Reject)
            .await?;
    }

    info!("Seeded category {}", pump);
    Ok(())
}

async fn load_reagent_category<S: Store>(
    store: &S,
    catalog: &DefinitionCatalog<'_, S>,
    batch_size: usize,
    reagent: &CategoryRef,
) -> Result<()> {
    catalog
        .create_category(reagent.clone(), Some("Laboratory reagents".into()))
        .await?;

    let definitions = vec![
        NewAttributeDefinition::new("purity", ValueType::Number).with_unit("%"),
        NewAttributeDefinition::new("grade", ValueType::enumeration(["ACS", "HPLC", "technical"]))
            .required(json!("technical")),
        NewAttributeDefinition::new("expiry", ValueType::Date).with_display_name("Expiry date"),
        NewAttributeDefinition::new("cas_number", ValueType::String).with_display_name("CAS number"),
    ];
    for def in definitions {
        catalog.create_definition(reagent, def).await?;
    }

    let specs = InstanceSpecService::new(store, batch_size);
    let records = vec![
        ("R-0001", json!({"purity": 99.8, "grade": "HPLC", "expiry": "2026/11/30", "cas_number": "67-56-1"})),
        ("R-0002", json!({"purity": "95", "cas_number": "64-17-5"})),
    ];
    for (id, spec) in records {
        specs
            .register_instance(InstanceRef::material(id), &reagent.name, &spec_map(spec)?, OverflowRouting::Reject)
            .await?;
    }

    info!("Seeded category {}", reagent);
    Ok(())
}
