mod error;
mod http;
mod models;

use log::{error, info};
use models::config::Config;
use models::context::{Context, ContextPointer};
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use std::sync::Arc;

use crate::error::DaemonError;

const DEFAULT_CONFIG_PATH: &str = "sync-daemon.yaml";

#[cfg(unix)]
async fn run(context: ContextPointer) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut toggle = signal(SignalKind::user_defined1())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.map_err(DaemonError::from),
            _ = toggle.recv() => {
                context.toggle_visibility();
            }
        }
    }
}

#[cfg(not(unix))]
async fn run(_context: ContextPointer) -> Result<(), DaemonError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = launch().await {
        error!("{}", e);
        eprintln!("sync-daemon: {}", e);
        std::process::exit(1);
    }
}

async fn launch() -> Result<(), DaemonError> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&path)?;

    TermLogger::init(
        config.log_level_filter(),
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;
    info!("Loaded configuration from {}", path);

    let context = Arc::new(Context::new(config)?);
    context.start_polling()?;

    let result = run(context.clone()).await;
    info!("Stopping sync-daemon");
    context.shutdown();
    result
}
