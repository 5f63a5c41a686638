//! Core engine for orchestrating a local fleet of validator processes.
//!
//! The [`cluster::Cluster`] owns every node record (identity, process handle,
//! ports, directories, merged configuration) and is mutated only by whoever
//! holds it exclusively. The [`provisioner`] module drives the multi-phase
//! workflows that combine process lifecycle with transactions submitted
//! through a [`wallet::Wallet`] to the live platform chain.

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod genesis;
pub mod identity;
pub mod ids;
pub mod node;
pub mod ports;
pub mod process;
pub mod provisioner;
pub mod snapshot;
pub mod wallet;

pub use cluster::{Cluster, ClusterInfo};
pub use error::{Error, Result};

/// Environment variable naming the default validator binary.
pub const EXEC_PATH_ENV_VAR: &str = "LUXGO_EXEC_PATH";
/// Environment variable naming the default VM plugin directory.
pub const PLUGIN_DIR_ENV_VAR: &str = "LUXGO_PLUGIN_PATH";

/// Prefix of the generated root data directory.
pub const ROOT_DIR_PREFIX: &str = "network-runner-root-data";
