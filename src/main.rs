mod demo;

use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use snag_config::logging::{self, DEFAULT_MAX_LOG_FILES, DEFAULT_MAX_LOG_SIZE};
use snag_config::{load_config, Config, SnagPaths};
use snag_core::probe::Runtime;
use snag_core::{Engine, EngineOptions, Transport};
use snag_ui::{ConsoleTransport, RemoteFactory, RemoteTransport};

/// Send tracing output to the rotated log file so it never mixes with the
/// debugger console.
fn init_logging(config: &Config, paths: &SnagPaths) -> Result<()> {
    let log_path = logging::log_file_path(&config.log, paths);
    logging::ensure_log_dir(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    logging::rotate_log_files(&log_path, DEFAULT_MAX_LOG_SIZE, DEFAULT_MAX_LOG_FILES)
        .context("failed to rotate log files")?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(logging::filter_directives(config.log.level)))
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn open_transport(config: &Config) -> Result<Box<dyn Transport>> {
    if config.remote.open.is_none() {
        return Ok(Box::new(ConsoleTransport::stdio()));
    }
    let remote = RemoteTransport::bind(config).context("failed to open the debug port")?;
    eprintln!("snag: {} (pid {})", remote.name(), std::process::id());
    Ok(Box::new(remote))
}

fn run() -> Result<()> {
    let paths = SnagPaths::new().context("failed to locate the home directory")?;
    let project_dir = std::env::current_dir().ok();
    let config = match load_config(&paths.config_dir(), project_dir.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("snag: config load failed, using defaults: {e}");
            Config::default()
        }
    };
    init_logging(&config, &paths)?;
    info!("snag {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = Runtime::new();
    let transport = open_transport(&config)?;
    let engine = Engine::start(
        config,
        runtime.instrumentation(),
        transport,
        EngineOptions {
            factory: Some(Box::new(RemoteFactory)),
            on_exit: None,
        },
    )
    .context("failed to start the debugger")?;

    if let Err(e) = runtime.run("main", demo::program) {
        error!("demo program failed: {}", e);
        eprintln!("snag: program raised {e}");
    }
    engine.shutdown().context("debugger did not shut down cleanly")?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("snag: {:#}", e);
        std::process::exit(1);
    }
}
