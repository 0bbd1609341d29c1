#![doc = include_str!("../README.md")]
#![deny(
    missing_docs,
    clippy::nursery,
    clippy::pedantic,
    warnings,
    unused_crate_dependencies
)]

pub mod bootstrap;
pub mod chain;
pub mod client_id_store;
pub mod cosmos;
pub mod error;
pub mod keyring_lock;
pub mod metrics;
pub mod retry;
pub mod scheduler;
pub mod update;

#[cfg(test)]
pub(crate) mod mock;
