use std::sync::Arc;

use anyhow::Context;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use lambda_mcp_proxy::auth;
use lambda_mcp_proxy::config::ProxyConfig;
use lambda_mcp_proxy::http::SignedTransport;
use lambda_mcp_proxy::proxy::Proxy;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = ProxyConfig::from_env()?;
    let credential =
        auth::resolve_credential(&config.region).context("resolving AWS credential")?;
    let transport =
        SignedTransport::new(&config, credential).context("building signed transport")?;

    tracing::info!(
        endpoint = %config.endpoint,
        region = %config.region,
        max_concurrency = config.max_concurrency,
        "proxy starting"
    );

    let proxy = Proxy::new(config, Arc::new(transport));
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    // Signal teardown goes through the same drain as end of stream, so
    // pending ids always get their cancellation record.
    proxy
        .run_until(stdin, stdout, shutdown_signal())
        .await
        .context("session failed")?;
    tracing::info!("session ended, exiting");
    Ok(())
}

/// Logs go to stderr only: stdout carries the protocol stream and a single
/// stray line would corrupt framing.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lambda_mcp_proxy=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
