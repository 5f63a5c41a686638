use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::ids::Id;
use crate::ports::PortPolicy;

/// Number of nodes started when the request does not say otherwise.
pub const DEFAULT_NUM_NODES: usize = 5;

/// How long cluster start waits for the whole fleet to report healthy.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(120);

pub type FlagMap = Map<String, Value>;

/// Per-node configuration. Flags set here take precedence over the cluster
/// defaults, which in turn take precedence over the node's config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub flags: FlagMap,
    /// Staking certificate, PEM. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staking_cert: Option<String>,
    /// Staking private key, PEM. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staking_key: Option<String>,
    /// BLS signing key, base64. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bls_signing_key: Option<String>,
    /// Per-chain config file contents, keyed by chain alias.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub chain_config_files: BTreeMap<String, String>,
    /// Per-chain upgrade file contents, keyed by chain alias.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upgrade_config_files: BTreeMap<String, String>,
    /// Per-subnet config file contents, keyed by subnet id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subnet_config_files: BTreeMap<String, String>,
}

impl NodeConfig {
    pub fn named(name: impl Into<String>) -> Self {
        NodeConfig {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Inputs of a cluster start.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub binary_path: PathBuf,
    pub num_nodes: usize,
    /// Genesis document. Generated from the fleet's identities when absent.
    pub genesis: Option<String>,
    pub root_data_dir: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
    /// Flags applied to every node, below per-node flags in precedence.
    pub global_flags: FlagMap,
    pub chain_config_files: BTreeMap<String, String>,
    pub upgrade_config_files: BTreeMap<String, String>,
    pub subnet_config_files: BTreeMap<String, String>,
    /// Full node configs keyed by node name; when non-empty these define the
    /// fleet instead of `node1..nodeN`.
    pub custom_node_configs: BTreeMap<String, NodeConfig>,
    pub port_policy: PortPolicy,
}

impl StartOptions {
    pub fn new(binary_path: impl Into<PathBuf>) -> Self {
        StartOptions {
            binary_path: binary_path.into(),
            num_nodes: DEFAULT_NUM_NODES,
            genesis: None,
            root_data_dir: None,
            plugin_dir: None,
            global_flags: Map::new(),
            chain_config_files: BTreeMap::new(),
            upgrade_config_files: BTreeMap::new(),
            subnet_config_files: BTreeMap::new(),
            custom_node_configs: BTreeMap::new(),
            port_policy: PortPolicy::Static,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 && self.custom_node_configs.is_empty() {
            return Err(Error::Validation("num_nodes must be positive".into()));
        }
        if !self.binary_path.exists() {
            return Err(Error::Resource(format!(
                "binary {:?} not found",
                self.binary_path
            )));
        }
        if let Some(dir) = &self.plugin_dir {
            if !dir.exists() {
                return Err(Error::Resource(format!("plugin dir {:?} not found", dir)));
            }
        }
        Ok(())
    }
}

/// Inputs of an in-place node restart. Identity, directories and ports are
/// always preserved; everything here is an optional replacement.
#[derive(Debug, Clone, Default)]
pub struct RestartOptions {
    pub binary_path: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
    pub track_subnets: Option<String>,
    pub chain_config_files: BTreeMap<String, String>,
    pub upgrade_config_files: BTreeMap<String, String>,
    pub subnet_config_files: BTreeMap<String, String>,
    pub global_flags: FlagMap,
}

/// Merge flag maps in ascending precedence: later maps win.
pub fn merge_flags(layers: &[&FlagMap]) -> FlagMap {
    let mut merged = Map::new();
    for layer in layers {
        for (k, v) in layer.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Fetch a string flag from a flag map, if present.
pub fn string_flag(flags: &FlagMap, key: &str) -> Option<String> {
    flags.get(key).and_then(Value::as_str).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Provisioning specs
// ---------------------------------------------------------------------------

/// A set of validators agreeing to run one or more blockchains.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetSpec {
    /// Participant node names. Empty means every node in the cluster.
    #[serde(default)]
    pub participants: Vec<String>,
    /// Subnet config file contents written to every participant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_config: Option<String>,
}

/// A blockchain to create: a VM instance bound to a subnet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockchainSpec {
    pub vm_name: String,
    /// Genesis contents handed to the VM.
    pub genesis: String,
    /// Pre-existing subnet to install onto. Mutually exclusive with
    /// `subnet_spec`; when both are absent a fresh default subnet is created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<Id>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_spec: Option<SubnetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_upgrade: Option<String>,
    /// Per-node chain config overriding `chain_config`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub per_node_chain_config: BTreeMap<String, String>,
    /// Optional alias registered on every node once the chain exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain_alias: Option<String>,
}

impl BlockchainSpec {
    pub fn validate(&self) -> Result<()> {
        if self.vm_name.is_empty() {
            return Err(Error::Validation("blockchain spec has no VM name".into()));
        }
        if self.subnet_id.is_some() && self.subnet_spec.is_some() {
            return Err(Error::Validation(format!(
                "blockchain spec for {} sets both subnet id and subnet spec",
                self.vm_name
            )));
        }
        crate::ids::vm_id(&self.vm_name).map(|_| ())
    }
}

/// Economic parameters binding a subnet to a custom staking asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticSubnetSpec {
    pub subnet_id: Id,
    pub asset_name: String,
    pub asset_symbol: String,
    pub initial_supply: u64,
    pub max_supply: u64,
    pub min_consumption_rate: u64,
    pub max_consumption_rate: u64,
    pub min_validator_stake: u64,
    pub max_validator_stake: u64,
    pub min_delegator_stake: u64,
    pub min_stake_duration_secs: u64,
    pub max_stake_duration_secs: u64,
    pub min_delegation_fee: u32,
    pub max_validator_weight_factor: u8,
    pub uptime_requirement: u32,
}

/// A validator to stake on an elastic subnet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionlessValidatorSpec {
    pub subnet_id: Id,
    pub node_name: String,
    pub staked_amount: u64,
    pub asset_id: Id,
    /// RFC 3339. Defaults to now plus a small offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// Defaults to the node's primary-network validation end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stake_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveSubnetValidatorSpec {
    pub subnet_id: Id,
    pub node_names: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flags(pairs: &[(&str, &str)]) -> FlagMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v)))
            .collect()
    }

    #[test]
    fn test_merge_flags_precedence() {
        let config_file = flags(&[("w", "z"), ("keep", "file")]);
        let cluster = flags(&[("w", "x"), ("other", "cluster")]);
        let node = flags(&[("w", "y")]);

        let merged = merge_flags(&[&config_file, &cluster, &node]);
        assert_eq!(string_flag(&merged, "w").as_deref(), Some("y"));
        assert_eq!(string_flag(&merged, "other").as_deref(), Some("cluster"));
        assert_eq!(string_flag(&merged, "keep").as_deref(), Some("file"));
    }

    #[test]
    fn test_blockchain_spec_rejects_both_subnet_fields() {
        let spec = BlockchainSpec {
            vm_name: "subnetevm".into(),
            genesis: "{}".into(),
            subnet_id: Some(Id::EMPTY),
            subnet_spec: Some(SubnetSpec::default()),
            chain_config: None,
            network_upgrade: None,
            per_node_chain_config: BTreeMap::new(),
            blockchain_alias: None,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_blockchain_spec_rejects_long_vm_name() {
        let spec = BlockchainSpec {
            vm_name: "v".repeat(40),
            genesis: "{}".into(),
            subnet_id: None,
            subnet_spec: None,
            chain_config: None,
            network_upgrade: None,
            per_node_chain_config: BTreeMap::new(),
            blockchain_alias: None,
        };
        assert!(spec.validate().is_err());
    }
}
