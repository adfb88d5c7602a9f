mod cli;
mod error;

use crate::cli::{Cli, Command, Target};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use dmirror_config::Config;
use dmirror_replicate::ClientHandle;
use dmirror_replicate::memory::MemoryClient;
use dmirror_rpc::{Client, ConnectOptions};
use dmirror_service::{MirroringService, Options};
use dmirror_store::Location;
use exn::ResultExt;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        },
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    init_logging(&config.log.level);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Mirror(Target { key, kind }) => print(connect(&config).await?.mirror(key.as_str(), kind).await),
        Command::Unmirror(Target { key, kind }) => print(connect(&config).await?.unmirror(key.as_str(), kind).await),
        Command::Status(Target { key, kind }) => print(connect(&config).await?.status(key.as_str(), kind).await),
        Command::List => print(connect(&config).await?.list().await),
        Command::Stop => {
            connect(&config).await?.stop().await.or_raise(|| ErrorKind::Command)?;
            tracing::info!(endpoint = %config.server.endpoint(), "Service is stopping");
            Ok(())
        },
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn serve(config: Config) -> Result<()> {
    let database = config.storage.location().or_raise(|| ErrorKind::Config)?;
    if let Location::File(path) = &database
        && let Some(parent) = path.parent()
    {
        std::fs::create_dir_all(parent).or_raise(|| ErrorKind::DataDirectory)?;
    }
    let options = Options {
        endpoint: config.server.endpoint(),
        probe_timeout: config.server.probe_timeout(),
        database,
        namespace: config.storage.namespace,
        version: config.storage.version,
        strict_recovery: config.recovery.strict,
    };

    tracing::warn!("Using the in-process replication client; logs are tracked but nothing is fetched from peers");
    let client: ClientHandle = Arc::new(MemoryClient::default());
    let service = MirroringService::open(options, client).await.or_raise(|| ErrorKind::Service)?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "Could not listen for interrupts");
            }
            tracing::info!("Interrupted, shutting down");
            service.close().await.or_raise(|| ErrorKind::Service)?;
        },
        () = service.stopped() => tracing::info!("Stopped by client"),
    }
    Ok(())
}

async fn connect(config: &Config) -> Result<Client> {
    Client::connect(config.server.endpoint(), ConnectOptions::default()).await.or_raise(|| ErrorKind::Command)
}

fn print<T: Serialize>(result: dmirror_rpc::error::Result<T>) -> Result<()> {
    let value = result.or_raise(|| ErrorKind::Command)?;
    let json = serde_json::to_string_pretty(&value).or_raise(|| ErrorKind::Command)?;
    println!("{json}");
    Ok(())
}
