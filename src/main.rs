#![allow(missing_docs)]

//! Straylight entry point: config, logging, driver selection, wiring, and
//! graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::sync::{oneshot, watch};
use tracing::info;

use straylight::account::Account;
use straylight::config::{Config, DriverConfig, HandlerConfig, Paths};
use straylight::dispatcher::Dispatcher;
use straylight::driver::console::ConsoleDriver;
use straylight::driver::dbus::DBusDriver;
use straylight::driver::jsonrpc::JsonRpcDriver;
use straylight::driver::Driver;
use straylight::logging;
use straylight::message::Message;
use straylight::module::echo::Echo;
use straylight::module::periodic::Periodic;
use straylight::module::Module;
use straylight::perioder::Perioder;

#[derive(Parser, Debug)]
#[command(name = "straylight", version, about = "Signal messenger bot gateway")]
struct Cli {
    /// Configuration file (default: XDG config dir).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Console-only logging; skip the JSON file layer.
    #[arg(long)]
    plain_logs: bool,
}

fn build_driver(config: &DriverConfig) -> Arc<dyn Driver> {
    match config {
        DriverConfig::Console { number } => Arc::new(ConsoleDriver::new(number.clone())),
        DriverConfig::Dbus { bus } => Arc::new(DBusDriver::new(*bus)),
        DriverConfig::Jsonrpc { socket, number } => {
            Arc::new(JsonRpcDriver::new(socket.clone(), number.clone()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = Paths::resolve()?;
    std::fs::create_dir_all(paths.data_dir())
        .with_context(|| format!("creating data directory {}", paths.data_dir().display()))?;

    let _logging_guard = if cli.plain_logs {
        logging::init_plain();
        None
    } else {
        Some(logging::init_production(&paths.logs_dir())?)
    };

    // Invalid configuration is fail-fast: nothing below runs on guesses.
    let config = Config::load(cli.config.as_deref(), &paths)?;

    let driver = build_driver(&config.driver);
    let account = Arc::new(
        Account::new(driver)
            .await
            .context("connecting to messenger transport")?,
    );

    // The perioder outlives every event; a single root channel tears all
    // of them down on shutdown.
    let (perioder, perioder_handle) = Perioder::<Message>::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(perioder.run(shutdown_rx));

    let mut modules: Vec<(Arc<dyn Module>, HandlerConfig)> = Vec::new();
    for (name, handler) in &config.modules {
        let module: Arc<dyn Module> = match name.as_str() {
            "echo" => Arc::new(Echo::new(paths.module_state("echo"))),
            "periodic" => Arc::new(Periodic::new(
                paths.module_state("periodic"),
                perioder_handle.clone(),
            )),
            other => return Err(anyhow!("unknown module {other:?} in config")),
        };
        modules.push((module, handler.clone()));
    }

    let dispatcher = Dispatcher::new(Arc::clone(&account), config.users.clone(), modules)
        .context("building dispatcher")?;
    dispatcher
        .start()
        .await
        .context("starting dispatcher modules")?;

    let (ready_tx, ready_rx) = oneshot::channel();
    account.listen_with_ready(ready_tx);
    let _ = ready_rx.await;
    info!("straylight ready");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    // Modules persist their state before the scheduler and driver go away.
    dispatcher.close().await;
    let _ = shutdown_tx.send(true);
    account.close().await;

    info!("straylight shut down cleanly");
    Ok(())
}
