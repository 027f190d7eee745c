use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use causeway_relay::{
    app,
    cli::{Cli, Commands},
    Config, SignalingState,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if let Some(Commands::Check { url, channel }) = cli.command {
        if let Err(e) = causeway_relay::cli::run_check(url, channel).await {
            error!("check failed: {e}");
            std::process::exit(1);
        }
        return;
    }

    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    info!(
        "starting causeway relay on {}:{} (heartbeat timeout {}s)",
        config.bind_addr, config.port, config.heartbeat_timeout_seconds
    );

    let state = SignalingState::new(&config);
    let router = app(state);

    let addr = format!("{}:{}", config.bind_addr, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("causeway relay listening on {addr}");

    if let Err(e) = axum::serve(listener, router).await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
