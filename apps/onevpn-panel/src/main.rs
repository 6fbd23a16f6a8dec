mod bot;
mod cli;
mod clock;
mod config;
mod error;
mod handlers;
mod services;
mod state;
mod utils;

#[cfg(test)]
mod testing;

use std::io;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use onevpn_db::db::init_db;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use config::PanelConfig;
use state::AppState;

#[derive(Parser)]
#[command(name = "onevpn")]
#[command(about = "1VPN billing and provisioning panel", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API, the bot and the daily biller
    Serve,
    /// Run the daily billing sweep once (no-op if today is already billed)
    Sweep,
    /// Show or change the per-device daily price
    Price {
        #[command(subcommand)]
        subcommand: PriceCommands,
    },
    /// Recompute one user's subscription and push it to the backend
    Reconcile {
        /// Telegram id of the user
        telegram_id: String,
    },
}

#[derive(Subcommand)]
enum PriceCommands {
    Get,
    Set {
        /// New price, e.g. 7.5
        price: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        println!("Warning: failed to load .env file: {}", e);
    }

    let cli = Cli::parse();

    let file_appender = tracing_appender::rolling::never(".", "panel.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "onevpn_panel=debug,onevpn_db=info,axum=info,tower_http=info,sqlx=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("TLS crypto provider already installed");
    }

    let config = PanelConfig::load()?;
    let pool = init_db(&config.database_url).await?;
    info!("Database initialized");
    let state = AppState::build(config, pool)?;
    state.ensure_wireguard_pool().await?;

    match cli.command {
        Commands::Serve => run_server(state).await?,
        Commands::Sweep => cli::run_sweep(&state).await?,
        Commands::Price { subcommand } => match subcommand {
            PriceCommands::Get => cli::show_price(&state).await?,
            PriceCommands::Set { price } => cli::set_price(&state, &price).await?,
        },
        Commands::Reconcile { telegram_id } => cli::reconcile_user(&state, &telegram_id).await?,
    }

    Ok(())
}

async fn run_server(state: AppState) -> Result<()> {
    tokio::spawn(state.biller.clone().start());

    match state.bot.clone() {
        Some(bot) => {
            let bot_state = state.clone();
            tokio::spawn(async move {
                bot::run_bot(bot, bot_state).await;
                error!("Bot stopped; the HTTP API keeps running");
            });
        }
        None => info!("BOT_TOKEN not set, running without the Telegram bot"),
    }

    let addr: SocketAddr = state
        .config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", state.config.listen_addr))?;
    let app = handlers::router(state);

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
