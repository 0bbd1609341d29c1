use clap::Parser;
use ibc_header_relayer::cli::{Commands, RelayerCli};
use ibc_header_relayer::metrics_server::start_metrics_server;
use ibc_header_relayer::observability::init_observability;
use ibc_header_relayer::shutdown::spawn_shutdown_handler;
use ibc_header_relayer_core::{config::RelayerConfig, relayer::Relayer};
use ibc_header_relayer_lib::error::RelayerError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = RelayerCli::parse();
    let mut config = RelayerConfig::from_file(&cli.config)?;

    match &cli.command {
        Commands::Start(args) | Commands::KeepUpdateClient { args, .. } => args.apply(&mut config),
        Commands::UpdateClient { retry, .. } => {
            if let Some(retry) = retry {
                config.global.max_attempts = *retry;
            }
        }
    }
    config.validate()?;

    let _guard = init_observability(&config.observability)?;
    info!(
        "Observability initialized with level: {}",
        config.observability.level()
    );

    let relayer = Relayer::from_config(&config)?;
    let cancel = CancellationToken::new();
    spawn_shutdown_handler(cancel.clone())?;

    match cli.command {
        Commands::Start(_) => {
            let metrics_server = if config.metrics.enabled {
                Some(start_metrics_server(&config.metrics, cancel.clone()).await?.1)
            } else {
                None
            };

            let started = relayer.run_all(cancel.clone()).await;
            let interrupted = cancel.is_cancelled();
            cancel.cancel();
            if let Some(server) = metrics_server {
                server.await?;
            }

            if started == 0 && !interrupted {
                warn!(
                    configured = relayer.pairs().len(),
                    "None of the configured paths could be started"
                );
            }
            info!(started, "Relayer stopped");
        }
        Commands::KeepUpdateClient { path, .. } => {
            let metrics_server = if config.metrics.enabled {
                Some(start_metrics_server(&config.metrics, cancel.clone()).await?.1)
            } else {
                None
            };

            let result = relayer.keep_update_client(&path, &cancel).await;
            cancel.cancel();
            if let Some(server) = metrics_server {
                server.await?;
            }

            match result {
                Ok(()) | Err(RelayerError::Cancelled) => info!(%path, "Relayer stopped"),
                Err(err) => return Err(err.into()),
            }
        }
        Commands::UpdateClient { path, .. } => {
            let tx_hash = relayer.update_client(&path, &cancel).await?;
            info!(%path, %tx_hash, "Updated client");
        }
    }

    Ok(())
}
