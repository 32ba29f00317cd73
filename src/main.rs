//! parley entrypoint: load state, start the writer, outbound worker and
//! scheduler driver, then serve the webhook (or long-poll in development).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use parley::config::Config;
use parley::engine::store::{Db, MemStore};
use parley::engine::Driver;
use parley::storage::{self, Storage};
use parley::telegram::{self, BotApi, OutboundWorker, WebhookState};

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Pairs users with opposing opinions for one-on-one voice calls")]
struct Cli {
    /// Telegram bot token
    #[arg(long, env = "PARLEY_BOT_TOKEN", hide_env_values = true)]
    bot_token: Option<String>,

    /// Secret path segment for the webhook endpoint
    #[arg(long, env = "PARLEY_WEBHOOK_SECRET", hide_env_values = true)]
    webhook_secret: Option<String>,

    /// SQLite database URL
    #[arg(long, env = "PARLEY_DATABASE_URL")]
    database_url: Option<String>,

    /// Webhook listener address
    #[arg(long, env = "PARLEY_BIND")]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the webhook endpoint (default)
    Serve,
    /// Long-poll getUpdates instead of serving a webhook (development)
    Poll,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::resolve(
        cli.bot_token,
        cli.webhook_secret,
        cli.database_url,
        cli.bind,
    )?;

    // Boot order matters: every state row is in memory before the driver
    // dispatches anything.
    let storage = Storage::open(&config.database_url)
        .await
        .with_context(|| format!("opening database {}", config.database_url))?;
    let states = storage.load_all().await.context("loading user states")?;
    tracing::info!("loaded {} user states", states.len());
    let mem = MemStore::rebuild(states);
    let (writer, _writer_task) = storage::spawn_writer(storage);
    let db = Db::with_writer(mem, writer);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    let api = BotApi::new(&config.bot_token);
    tokio::spawn(OutboundWorker::new(api.clone(), outbound_rx, shutdown_rx.clone()).run());
    let mut driver_task =
        tokio::spawn(Driver::new(db, inbound_rx, outbound_tx, shutdown_rx.clone()).run());

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let secret = config
                .webhook_secret
                .clone()
                .context("PARLEY_WEBHOOK_SECRET is required to serve the webhook")?;
            let app = telegram::router(WebhookState {
                secret,
                inbound: inbound_tx,
            });
            let listener = tokio::net::TcpListener::bind(config.bind)
                .await
                .with_context(|| format!("binding {}", config.bind))?;
            tracing::info!("webhook listening on {}", config.bind);
            let server = async move { axum::serve(listener, app).await };
            tokio::select! {
                result = server => {
                    result.context("webhook server failed")?;
                }
                result = &mut driver_task => {
                    shutdown_tx.send(true).ok();
                    result.context("driver task panicked")??;
                    anyhow::bail!("scheduler driver exited unexpectedly");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                }
            }
        }
        Commands::Poll => {
            let poll_task = tokio::spawn(telegram::poll_updates(
                api,
                inbound_tx,
                shutdown_rx.clone(),
            ));
            tokio::select! {
                result = &mut driver_task => {
                    shutdown_tx.send(true).ok();
                    result.context("driver task panicked")??;
                    anyhow::bail!("scheduler driver exited unexpectedly");
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                }
            }
            poll_task.abort();
        }
    }

    shutdown_tx.send(true).ok();
    Ok(())
}
