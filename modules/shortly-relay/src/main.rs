use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::FutureExt;
use tracing_subscriber::EnvFilter;

mod config;
mod transport;
mod worker;

use config::RelayConfig;
use transport::QueueTransport;
use worker::{Relay, Shutdown};

#[derive(Parser)]
#[command(name = "shortly-relay", about = "Outbox dispatch and change consumption for Shortly services")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply database migrations and exit
    Migrate,
    /// Publish unsent outbox records on an interval
    Dispatch,
    /// Pull and apply messages from the service's queues
    Consume {
        /// Queue to consume (repeatable). Defaults to every queue the service consumes.
        #[arg(long = "queue")]
        queues: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config::log_json_from_env() {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    let config = RelayConfig::from_env()?;
    tracing::info!(service = %config.service, "Starting shortly-relay");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    if let Command::Migrate = cli.command {
        shortly_replication::postgres::migrate(&pool).await?;
        tracing::info!("Migrations complete");
        return Ok(());
    }

    let client = queue_client::QueueClient::new(
        &config.queue_api_url,
        config.queue_api_token.as_deref(),
    )?;
    let transport = QueueTransport::new(client, config.retry_delay);
    let relay = Relay::new(config, pool, transport);
    let shutdown = shutdown_signal();

    match cli.command {
        Command::Migrate => {}
        Command::Dispatch => relay.run_dispatch(shutdown).await,
        Command::Consume { queues } => relay.run_consume(&queues, shutdown).await?,
    }

    tracing::info!("shortly-relay stopped");
    Ok(())
}

fn shutdown_signal() -> Shutdown {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown requested");
    }
    .boxed()
    .shared()
}
