use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use bingo_road::{
    build_router,
    cli::{self, Cli, Commands},
    config::Config,
    metrics, telemetry, AppState,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let mut config = Config::from_env();
    cli.apply_overrides(&mut config);
    telemetry::init_tracing(&config.log_filter);

    let result = match cli.command {
        Some(Commands::Watch {
            url,
            code,
            player_id,
        }) => cli::run_watch(url, code, player_id).await,
        None => serve(config).await,
    };
    if let Err(err) = result {
        error!("bingo-road exited with error: {:#}", err);
        std::process::exit(1);
    }
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting Bingo Road session server on port {}", config.port);
    match &config.redis_url {
        Some(url) => info!("Redis URL: {}", url),
        None => info!("No REDIS_URL set; keeping sessions in memory"),
    }
    info!("Session TTL: {} seconds", config.session_ttl_seconds);

    let state = AppState::from_config(&config)
        .await
        .context("failed to initialise session store")?
        .with_prometheus(metrics::install());
    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Bingo Road listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("Bingo Road stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
}
