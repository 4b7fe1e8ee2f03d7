//! cad-bridge: dispatch bridge for single-threaded CAD automation APIs
//!
//! Accepts JSON tool-call requests over HTTP and marshals host-API work onto
//! the single execution thread the host CAD application permits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use cad_bridge::config;
use cad_bridge::dispatch::loader::{ModuleLoader, ModuleManifest};
use cad_bridge::dispatch::queue::DrainLoop;
use cad_bridge::dispatch::Dispatcher;
use cad_bridge::providers::{builtin_providers, SystemProvider};
use cad_bridge::server;

/// Dispatch bridge exposing a single-threaded CAD automation API to remote
/// tool callers.
///
/// Routes and validates requests on network threads; executes host-API work
/// serially on a dedicated host thread.
#[derive(Parser, Debug)]
#[command(name = "cad-bridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long)]
    quiet: bool,
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN, // Default to warn for unknown levels
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Entry point for the cad-bridge server.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let config_path = args.config.as_deref();
    let cfg = match config::load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if config_path.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nExpected config at: {}", default_path.display());
                }
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting cad-bridge server"
    );

    // The dispatch context: built once, passed by reference everywhere.
    let dispatcher = Arc::new(Dispatcher::new(cfg.errors.history_capacity));
    let health = Arc::new(RwLock::new(None));

    // Built-in introspection capabilities register through the same provider
    // contract site modules use.
    let system = SystemProvider::new(Arc::clone(&health));
    let builtin_manifest = ModuleManifest {
        name: "system".to_string(),
        entry: Some("system".to_string()),
        dependencies: Vec::new(),
        description: Some("built-in dispatcher introspection".to_string()),
        settings: None,
    };
    let providers = builtin_providers(system);
    if let Err(e) = providers["system"].register(&dispatcher, &builtin_manifest) {
        error!(error = %e, "Failed to register built-in capabilities");
        return ExitCode::FAILURE;
    }

    // Site modules from the configured category roots.
    let mut loader = ModuleLoader::new(cfg.modules.roots.clone(), cfg.modules.recovery_mode);
    for (key, provider) in providers {
        loader.add_provider(key, provider);
    }
    let discovered = loader.discover();
    let summary = loader.load_all(&dispatcher);
    *health.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(summary);
    info!(
        discovered,
        loaded = summary.loaded_modules,
        failed = summary.failed_modules,
        health = ?summary.health,
        "Module loading complete"
    );

    for issue in dispatcher.with_router(cad_bridge::dispatch::router::Router::validate) {
        tracing::warn!(%issue, "Route validation issue");
    }

    // The host execution thread: the only place host-API calls happen.
    let drain = DrainLoop::new(
        Arc::clone(dispatcher.queue()),
        Duration::from_millis(cfg.queue.poll_interval_ms),
    );
    let stop_handle = drain.stop_handle();
    let drain_thread = drain.spawn();

    // Serve until a shutdown signal arrives.
    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to create Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(server::serve(Arc::clone(&dispatcher), &addr));

    // Shutdown ordering matters: refuse new enqueues, stop the drain loop
    // after its current pass, then let it clear the remainder before the
    // host session goes away.
    dispatcher.queue().close();
    stop_handle.stop();
    if drain_thread.join().is_err() {
        error!("Host drain thread panicked during shutdown");
    }

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn log_level_resolution() {
        assert_eq!(get_log_level(0, true, "debug"), Level::ERROR);
        assert_eq!(get_log_level(0, false, "debug"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "bogus"), Level::WARN);
        assert_eq!(get_log_level(1, false, "warn"), Level::INFO);
        assert_eq!(get_log_level(3, false, "warn"), Level::TRACE);
    }
}
