//! The IBC header relayer binary: command line, observability, metrics endpoint and shutdown
//! handling around [`ibc_header_relayer_core::relayer::Relayer`].

#![deny(clippy::nursery, clippy::pedantic)]
#![warn(missing_docs)]

pub mod cli;
pub mod metrics_server;
pub mod observability;
pub mod shutdown;
