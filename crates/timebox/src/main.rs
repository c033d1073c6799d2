use std::process;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

use timebox::cli::{Cli, Commands};
use timebox::config;
use timebox::error::AppError;
use timebox::paths::AppPaths;
use timebox::services::{
    BackendRegistry, BatchDispatcher, HttpRecognitionClient, ImmediateEmbeddingStage,
    LmdbWorkStore, OcrScheduler, SchedulerConfig, WorkStore,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(&cli));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Run => run_scheduler().await,
        Commands::Status => print_status().await,
    }
}

async fn run_scheduler() -> Result<(), AppError> {
    let cfg = config::load()?;
    let paths = AppPaths::new(&cfg.storage.path)?;

    let registry = Arc::new(BackendRegistry::from_settings(&cfg.backends)?);
    tracing::info!(backends = registry.len(), "backend pool configured");

    let store: Arc<dyn WorkStore> = Arc::new(LmdbWorkStore::open(&paths)?);
    let client = Arc::new(HttpRecognitionClient::new(paths.upload_dir()?));
    let dispatcher = BatchDispatcher::new(registry, client);

    let scheduler = OcrScheduler::new(
        store,
        dispatcher,
        Arc::new(ImmediateEmbeddingStage),
        SchedulerConfig::from(&cfg.scheduler),
    );
    scheduler.start();

    tokio::signal::ctrl_c().await.map_err(AppError::Signal)?;
    tracing::info!("interrupt received, draining current cycle");
    scheduler.shutdown().await;
    Ok(())
}

async fn print_status() -> Result<(), AppError> {
    let cfg = config::load()?;
    let paths = AppPaths::new(&cfg.storage.path)?;
    let store = LmdbWorkStore::open(&paths)?;
    let stats = store.stats().await?;

    println!("total items:          {}", stats.total);
    println!("pending recognition:  {}", stats.pending_recognition);
    println!("pending embedding:    {}", stats.pending_embedding);
    println!("fully indexed:        {}", stats.indexed);
    Ok(())
}
