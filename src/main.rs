use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stt_relay::{AppState, RelayConfig, create_router};

#[derive(Parser, Debug)]
#[command(name = "stt-relay", about = "Telephony audio to transcription relay", version)]
struct Cli {
    /// Listen host; overrides RELAY_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Listen port; overrides RELAY_PORT.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    let cli = Cli::parse();
    let mut config = RelayConfig::from_env()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    if !config.upstream.enabled() {
        warn!("DEEPGRAM_API_KEY is not set; transcription is disabled");
    }

    let address = config.address();
    let state = AppState::new(config);
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!(%address, "relay listening");

    let registry = state.registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let closed = registry.close_all("shutdown");
            info!(sessions = closed, "shutting down");
        })
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
