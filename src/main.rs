use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{
    EnvFilter,
    prelude::*,
};

use demoflow::orchestrator::{
    self,
    RunError,
};
use demoflow::settings::Settings;

fn main() {
    dotenv::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("DEMOFLOW_CONFIG").ok())
        .unwrap_or_else(|| "demoflow.json".to_string());
    let settings = match Settings::load(Path::new(&config_path)) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("failed to load configuration {config_path}: {err:#}");
            std::process::exit(1);
        }
    };

    if let Err(err) = init_tracing(&settings) {
        eprintln!("failed to initialize logging: {err:#}");
        std::process::exit(1);
    }

    match orchestrator::run(settings) {
        Ok(()) => {}
        Err(err @ RunError::Chat(_)) => {
            tracing::error!("{err}");
            std::process::exit(2);
        }
        Err(err) => {
            tracing::error!("{err}");
            std::process::exit(1);
        }
    }
}

/// Console logging honors `RUST_LOG` (default `info`); warnings and errors
/// are additionally appended to `{state}/errors.log` for the operator.
fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    std::fs::create_dir_all(&settings.state_directory)?;
    let errors_log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(settings.state_directory.join("errors.log"))?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(errors_log))
                .with_filter(LevelFilter::WARN),
        )
        .init();
    Ok(())
}
