use clap::Parser;

use stardag_registry::api::{self, AppState};
use stardag_registry::config::ServerConfig;
use stardag_registry::store::Store;

#[derive(Debug, Parser)]
#[command(name = "stardag-registry", about = "Stardag build registry server")]
struct Cli {
    /// Bind address, e.g. 0.0.0.0:8080 (overrides STARDAG_REGISTRY_BIND).
    #[arg(long)]
    bind: Option<String>,

    /// Database file path (overrides STARDAG_REGISTRY_DB).
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    /// Log level filter.
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    simple_logger::SimpleLogger::new()
        .with_level(cli.log_level)
        .init()?;

    let mut config = ServerConfig::from_env();
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let store = Store::open(&config.db_path)?;

    // Periodic sweep of expired lock rows. Correctness never depends on
    // it; acquires silently take over expired leases either way.
    let sweep_store = store.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            match sweep_store.cleanup_expired_locks(None) {
                Ok(0) => {}
                Ok(swept) => log::debug!("swept {swept} expired lock(s)"),
                Err(e) => log::warn!("lock sweep failed: {e}"),
            }
        }
    });

    let state = AppState::new(store, config);
    api::serve(state).await?;
    Ok(())
}
