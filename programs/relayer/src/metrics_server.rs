//! Serves the Prometheus metrics on `/metrics`.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};
use ibc_header_relayer_core::{config::MetricsConfig, metrics::encode_metrics};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use warp::{http::StatusCode, Filter};

/// Bind the metrics server and serve it in the background until `cancel` fires.
///
/// Returns the bound address and the server task.
///
/// # Errors
/// Returns an error if the configured address is invalid or cannot be bound.
pub async fn start_metrics_server(
    config: &MetricsConfig,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let ip: IpAddr = config
        .address
        .parse()
        .with_context(|| format!("invalid metrics address {}", config.address))?;
    let listener = TcpListener::bind(SocketAddr::new(ip, config.port))
        .await
        .with_context(|| {
            format!(
                "failed to bind the metrics server to {}:{}",
                config.address, config.port
            )
        })?;
    let addr = listener.local_addr()?;

    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .map(|| match encode_metrics() {
            Ok(body) => warp::reply::with_status(body, StatusCode::OK),
            Err(err) => {
                tracing::error!(error = %err, "Failed to encode metrics");
                warp::reply::with_status(err.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
            }
        })
        .boxed();

    tracing::info!("Metrics available at http://{addr}/metrics");
    let server = tokio::spawn(async move {
        warp::serve(metrics_route)
            .incoming(listener)
            .graceful(cancel.cancelled_owned())
            .run()
            .await;
        tracing::debug!("Metrics server stopped");
    });

    Ok((addr, server))
}
