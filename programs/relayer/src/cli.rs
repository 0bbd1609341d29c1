//! Defines the command line interface of the relayer.

use std::time::Duration;

use clap::Parser;
use ibc_header_relayer_core::config::RelayerConfig;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "relayer",
    version,
    about = "IBC header relayer - keeps light clients of counterparty chains up to date",
    long_about = "Creates a light client of the counterparty chain on each configured path if none exists,\nthen periodically submits newer counterparty headers to it."
)]
/// The command line interface for the relayer.
pub struct RelayerCli {
    /// The configuration file for the relayer.
    #[clap(long, global = true, default_value = "relayer.json")]
    pub config: String,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// The subcommands for the relayer.
#[derive(Clone, Debug, Parser)]
pub enum Commands {
    /// Bootstrap every configured path and keep updating its client.
    Start(LoopArgs),

    /// Bootstrap one path and keep updating its client.
    KeepUpdateClient {
        /// The name of the path.
        path: String,

        #[command(flatten)]
        args: LoopArgs,
    },

    /// Update the client of one path once.
    UpdateClient {
        /// The name of the path.
        path: String,

        /// How many times a remote call is attempted, overriding the configuration.
        #[clap(long)]
        retry: Option<u32>,
    },
}

/// Overrides of the update loop settings.
#[derive(Clone, Debug, Default, clap::Args)]
pub struct LoopArgs {
    /// The interval between two updates, e.g. `10m`.
    #[clap(long, value_parser = parse_duration)]
    pub interval: Option<Duration>,

    /// How many times a remote call is attempted.
    #[clap(long)]
    pub retry: Option<u32>,
}

impl LoopArgs {
    /// Apply the overrides to `config`.
    pub fn apply(&self, config: &mut RelayerConfig) {
        if let Some(interval) = self.interval {
            config.global.interval = interval;
        }
        if let Some(retry) = self.retry {
            config.global.max_attempts = retry;
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(s)
}
