use color_eyre::eyre::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initializes logs and traces for the integration tests. Safe to call more
/// than once per process; a second global subscriber install is ignored.
pub fn init() -> Result<()> {
    let _ = color_eyre::install();

    let subscriber = FmtSubscriber::builder().with_max_level(Level::WARN).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    Ok(())
}

/// A small configuration that keeps a full run within a couple of seconds of
/// wall-clock time, used by every integration test in this file.
pub fn fast_config() -> config::Config {
    config::Config {
        max_processes: 10,
        max_simultaneous: 6,
        max_resources: 4,
        instances_per_resource: 4,
        launch_interval_ms: 0,
        child_time_limit_seconds: 1,
        max_runtime_seconds: 3,
        sim_speed_factor: 80.0,
        ..config::Config::default()
    }
}
