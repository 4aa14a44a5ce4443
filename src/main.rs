use facility_spec_engine::config::AppConfig;
use facility_spec_engine::logic::Propagator;
use facility_spec_engine::seed;
use facility_spec_engine::store::PostgresStore;
use log::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .parse_default_env()
        .init();

    let config = AppConfig::load()?;
    info!(
        "Configuration loaded: batch_size={}, resume_on_startup={}",
        config.batch_size(),
        config.propagation.resume_on_startup
    );

    info!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let store = PostgresStore::new(&database_url, config.max_connections()).await?;

    info!("Running database migrations...");
    store.migrate().await?;

    if std::env::var("LOAD_SEED_DATA").unwrap_or_default() == "true" {
        info!("Loading seed data...");
        seed::load_seed_data(&store, config.batch_size()).await?;
        info!("Seed data loaded successfully");
    }

    if config.propagation.resume_on_startup {
        let outcomes = Propagator::new(&store, config.batch_size())
            .resume_pending()
            .await?;
        for job in &outcomes {
            if job.phase.is_finished() {
                info!("Propagation {} on {} is {}", job.id, job.category, job.phase.as_str());
            } else {
                warn!(
                    "Propagation {} on {} still {} at {:?}",
                    job.id,
                    job.category,
                    job.phase.as_str(),
                    job.cursor
                );
            }
        }
    }

    Ok(())
}
