use clap::Parser;
use std::path::PathBuf;

use mira_domain::config::Config;
use mira_gateway::api;
use mira_gateway::state::AppState;

#[derive(Parser)]
#[command(name = "mira", about = "MIRA personal assistant gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mira=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    let bind = format!("{}:{}", cfg.server.host, cfg.server.port);

    let state = AppState::build(cfg)?;
    state.spawn_background_tasks();

    let router = api::router(state);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "MIRA gateway listening");
    axum::serve(listener, router).await?;
    Ok(())
}
