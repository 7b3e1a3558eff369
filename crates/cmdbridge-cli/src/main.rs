//! `cmdbridge` – command request/response bridge daemon.
//!
//! Loads `~/.cmdbridge/config.toml` (or `--config <path>`), connects to the
//! external MQTT broker and the internal message bus, and translates command
//! requests between the two until Ctrl-C.

mod config;
mod daemon;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "cmdbridge", version, about = "Bridge external MQTT command requests onto the internal message bus")]
struct Args {
    /// Configuration file (defaults to ~/.cmdbridge/config.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Write a default configuration file and exit.
    #[arg(long, conflicts_with = "check")]
    init: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _telemetry = telemetry::init_tracing("cmdbridge");

    let path = args.config.unwrap_or_else(config::config_path);

    if args.init {
        if path.exists() {
            error!(path = %path.display(), "config file already exists, not overwriting");
            return ExitCode::FAILURE;
        }
        return match config::save_to(&config::Config::default(), &path) {
            Ok(()) => {
                info!(path = %path.display(), "wrote default configuration");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "could not write configuration");
                ExitCode::FAILURE
            }
        };
    }

    let cfg = match config::load_from(&path) {
        Ok(Some(cfg)) => {
            info!(path = %path.display(), "configuration loaded");
            cfg
        }
        Ok(None) => {
            warn!(path = %path.display(), "config file not found, using defaults");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            if let Err(e) = cfg.validate() {
                error!(error = %e, "invalid configuration");
                return ExitCode::FAILURE;
            }
            cfg
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if args.check {
        info!(devices = cfg.devices.len(), "configuration is valid");
        return ExitCode::SUCCESS;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "could not start the async runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(daemon::run(cfg, shutdown_rx)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command bridge failed");
            ExitCode::FAILURE
        }
    }
}
