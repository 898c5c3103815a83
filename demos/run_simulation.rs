use color_eyre::eyre::Result;
use config::Config;
use manager::Manager;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    init()?;

    let config = Config {
        max_processes: 12,
        max_simultaneous: 8,
        max_resources: 5,
        instances_per_resource: 10,
        max_runtime_seconds: 10,
        ..Config::default()
    };

    let manager = Manager::new(config)?;
    let shutdown = manager.shutdown_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("ctrl-c received, requesting shutdown");
        shutdown.cancel();
    });

    let stats = manager.run().await;
    tracing::info!(?stats, "simulation finished");

    Ok(())
}

/// Initializes logging.
fn init() -> Result<()> {
    color_eyre::install()?;

    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    Ok(())
}
