//! Defines the top level configuration for the relayer.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use ibc_header_relayer_lib::{
    cosmos::{tx::GasPrice, CosmosChainConfig, DEFAULT_CONFIRMATION_TIMEOUT},
    retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY},
    update::DEFAULT_UPDATE_INTERVAL,
};
use thiserror::Error;
use tracing::Level;

/// Name of the relayer home directory under the user's home.
pub const DEFAULT_HOME_DIR: &str = ".relayer";
/// Name of the client id database under the relayer home.
pub const CLIENT_ID_DB_DIR: &str = "db";
/// Name of the keyring directory under the relayer home.
pub const KEYS_DIR: &str = "keys";

const DEFAULT_GAS_LIMIT: u64 = 500_000;

/// The top level configuration for the relayer.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct RelayerConfig {
    /// Settings shared by every path.
    #[serde(default)]
    pub global: GlobalConfig,
    /// The chains, by name.
    pub chains: BTreeMap<String, ChainConfig>,
    /// The paths to relay, by name.
    pub paths: BTreeMap<String, PathConfig>,
    /// The logging and tracing configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// The metrics endpoint configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Settings shared by every path.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct GlobalConfig {
    /// The relayer home, holding the keyring and the client id database.
    pub home: PathBuf,
    /// The memo attached to every transaction.
    pub memo: String,
    /// The interval between two client updates.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How many times a remote call is attempted.
    pub max_attempts: u32,
    /// The delay between two attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            memo: String::new(),
            interval: DEFAULT_UPDATE_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// The configuration of a Cosmos SDK chain.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct ChainConfig {
    /// The chain id.
    pub chain_id: String,
    /// The CometBFT RPC endpoint.
    pub rpc_url: String,
    /// The name of the signing key.
    pub key: String,
    /// The bech32 prefix of account addresses.
    pub account_prefix: String,
    /// The gas limit of every transaction.
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    /// The gas price, e.g. `0.002ubbn`.
    pub gas_price: String,
    /// How long to wait for a transaction to be included.
    #[serde(default = "default_confirmation_timeout", with = "humantime_serde")]
    pub confirmation_timeout: Duration,
}

/// A path: the `src` chain hosts a light client of the `dst` chain.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[allow(clippy::module_name_repetitions)]
pub struct PathConfig {
    /// The chain id of the home chain.
    pub src: String,
    /// The chain id of the counterparty chain.
    pub dst: String,
    /// The id of an existing client of `dst` on `src`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// The format of the log lines written to stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi line, human friendly.
    #[default]
    Pretty,
    /// One line per event.
    Compact,
    /// Newline delimited JSON.
    Json,
}

/// The logging and tracing configuration.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct ObservabilityConfig {
    /// The log level.
    pub level: String,
    /// The format of the log lines.
    pub log_format: LogFormat,
    /// Whether to export spans and logs over OTLP.
    pub use_otel: bool,
    /// The service name reported to OpenTelemetry.
    pub service_name: String,
    /// The OTLP endpoint, the exporter default if unset.
    pub otel_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_format: LogFormat::default(),
            use_otel: false,
            service_name: "ibc-header-relayer".to_string(),
            otel_endpoint: None,
        }
    }
}

impl ObservabilityConfig {
    /// Returns the log level.
    #[must_use]
    pub fn level(&self) -> Level {
        Level::from_str(&self.level).unwrap_or(Level::INFO)
    }
}

/// The metrics endpoint configuration.
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(default)]
#[allow(clippy::module_name_repetitions)]
pub struct MetricsConfig {
    /// Whether to serve `/metrics`.
    pub enabled: bool,
    /// The address to bind to.
    pub address: String,
    /// The port to bind to.
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "0.0.0.0".to_string(),
            port: 2112,
        }
    }
}

/// Errors that can occur loading the relayer config.
#[derive(Debug, Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        /// The config file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The JSON does not match the expected shape.
    #[error("config error at {path}: {message}")]
    Parse {
        /// The JSON path of the failing value.
        path: String,
        /// The deserializer message.
        message: String,
    },
    /// Two chain entries share a chain id.
    #[error("chain id {0} is configured more than once")]
    DuplicateChainId(String),
    /// A path relays a chain to itself.
    #[error("path {0} has the same source and destination chain")]
    SelfPath(String),
    /// A chain entry has an invalid gas price.
    #[error("chain {chain} has an invalid gas price: {reason}")]
    InvalidGasPrice {
        /// The chain name.
        chain: String,
        /// Why the gas price was rejected.
        reason: String,
    },
    /// Any other invalid value.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Parse a configuration value from JSON while producing detailed path-aware error messages.
///
/// # Errors
/// Returns [`ConfigError::Parse`] with the JSON path of the failure.
pub fn parse_config<T>(json: &str) -> Result<T, ConfigError>
where
    T: serde::de::DeserializeOwned,
{
    let mut deserializer = serde_json::Deserializer::from_str(json);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|e| ConfigError::Parse {
        path: e.path().to_string(),
        message: e.into_inner().to_string(),
    })
}

impl FromStr for RelayerConfig {
    type Err = ConfigError;

    fn from_str(json: &str) -> Result<Self, Self::Err> {
        let mut config: Self = parse_config(json)?;
        config.global.home = expand_home(&config.global.home);
        config.validate()?;
        Ok(config)
    }
}

impl RelayerConfig {
    /// Load and validate the configuration at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        json.parse()
    }

    /// Check the values the deserializer cannot.
    ///
    /// A path naming a chain that is not configured is kept: the relayer skips that path
    /// when it is assembled.
    ///
    /// # Errors
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "global.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.global.interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "global.interval".to_string(),
                reason: "must not be zero".to_string(),
            });
        }

        let mut chain_ids = HashSet::new();
        for (name, chain) in &self.chains {
            if !chain_ids.insert(chain.chain_id.as_str()) {
                return Err(ConfigError::DuplicateChainId(chain.chain_id.clone()));
            }
            chain
                .gas_price()
                .map_err(|e| ConfigError::InvalidGasPrice {
                    chain: name.clone(),
                    reason: format!("{e:#}"),
                })?;
        }

        for (name, path) in &self.paths {
            if path.src == path.dst {
                return Err(ConfigError::SelfPath(name.clone()));
            }
        }

        Ok(())
    }

    /// The chain configured with `chain_id`.
    #[must_use]
    pub fn chain(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains.values().find(|chain| chain.chain_id == chain_id)
    }

    /// The retry policy applied to remote calls.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.global.max_attempts, self.global.retry_delay)
    }

    /// The keyring directory.
    #[must_use]
    pub fn keys_dir(&self) -> PathBuf {
        self.global.home.join(KEYS_DIR)
    }

    /// The client id database.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.global.home.join(CLIENT_ID_DB_DIR)
    }
}

impl ChainConfig {
    /// The parsed gas price.
    ///
    /// # Errors
    /// Returns an error if the gas price is not of the form `<amount><denom>`.
    pub fn gas_price(&self) -> anyhow::Result<GasPrice> {
        self.gas_price.parse()
    }

    /// The provider configuration of this chain.
    ///
    /// # Errors
    /// Returns an error if the gas price is invalid.
    pub fn to_cosmos_config(&self, keys_dir: PathBuf) -> anyhow::Result<CosmosChainConfig> {
        Ok(CosmosChainConfig {
            chain_id: self.chain_id.clone(),
            rpc_url: self.rpc_url.clone(),
            account_prefix: self.account_prefix.clone(),
            gas_limit: self.gas_limit,
            gas_price: self.gas_price()?,
            confirmation_timeout: self.confirmation_timeout,
            keys_dir,
        })
    }
}

const fn default_gas_limit() -> u64 {
    DEFAULT_GAS_LIMIT
}

const fn default_confirmation_timeout() -> Duration {
    DEFAULT_CONFIRMATION_TIMEOUT
}

fn default_home() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(DEFAULT_HOME_DIR)
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}
