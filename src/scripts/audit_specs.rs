use anyhow::{Context, Result};
use facility_spec_engine::config::AppConfig;
use facility_spec_engine::logic::SpecAuditor;
use facility_spec_engine::store::PostgresStore;

/// Report closed-world violations of every category without modifying data.
/// Exits non-zero when any category has findings.
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("sqlx", log::LevelFilter::Warn)
        .init();

    let config = AppConfig::load()?;
    let database_url = config.database_url()?;
    let store = PostgresStore::new(&database_url, config.max_connections())
        .await
        .context("DATABASE_URL must point at the spec database")?;

    println!("Auditing instance specs...");
    let results = SpecAuditor::new(&store, config.batch_size()).audit_all().await?;

    let mut failing = 0;
    for result in &results {
        let status = if result.valid { "ok" } else { "INVALID" };
        println!(
            "{} (schema v{}): {} instances, {} findings, {} warnings [{}]",
            result.category,
            result.schema_version,
            result.instance_count,
            result.findings.len(),
            result.warnings.len(),
            status
        );
        for finding in result.findings.iter().chain(result.warnings.iter()) {
            println!(
                "  {:?} {}: {}",
                finding.kind,
                finding.instance_id.as_deref().unwrap_or("-"),
                finding.message
            );
        }
        if !result.valid {
            failing += 1;
        }
    }

    println!("\n{} categories audited, {} invalid", results.len(), failing);
    if failing > 0 {
        std::process::exit(1);
    }
    Ok(())
}
