use anyhow::{anyhow, Context, Result};
use gcs_bigquery_loader::{app, client, server};
use std::env::var;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

/// Resolve on CTRL-C or, on unix, on SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Couldn't listen for CTRL-C: {:?}", e);
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Couldn't listen for SIGTERM: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => (),
        _ = terminate => (),
    }
    info!("Shutting down");
}

/// Run an HTTP server that receives storage events from Eventarc,
/// loads each new object into BigQuery, and audits every attempt.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    app::init()?;
    client::init(app::current().settings.bigquery_location.clone())?;

    let port = var("PORT")
        .unwrap_or(String::from("8080"))
        .parse::<u16>()
        .context("PORT must be a number")?;
    let router = server::router(app::current(), client::current());
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "Listening for storage events");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow!("{:?}", e))
}
