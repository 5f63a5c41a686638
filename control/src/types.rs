use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use netrunner_network::cluster::ClusterInfo;
use netrunner_network::config::{
    BlockchainSpec, ElasticSubnetSpec, PermissionlessValidatorSpec, RemoveSubnetValidatorSpec,
    SubnetSpec,
};

// ============================================================================
// Generic envelopes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfoResponse {
    pub cluster_info: ClusterInfo,
}

// ============================================================================
// Ping / version
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcVersionResponse {
    pub version: u32,
}

// ============================================================================
// Cluster lifecycle
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub exec_path: String,
    #[serde(default)]
    pub num_nodes: Option<u32>,
    /// JSON object of flags applied to every node.
    #[serde(default)]
    pub global_node_config: Option<String>,
    #[serde(default)]
    pub genesis: Option<String>,
    #[serde(default)]
    pub root_data_dir: Option<String>,
    #[serde(default)]
    pub plugin_dir: Option<String>,
    #[serde(default)]
    pub chain_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub upgrade_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub subnet_configs: BTreeMap<String, String>,
    /// Node name to JSON object of that node's flags.
    #[serde(default)]
    pub custom_node_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub blockchain_specs: Vec<BlockchainSpec>,
    #[serde(default)]
    pub reassign_ports_if_used: bool,
    #[serde(default)]
    pub dynamic_ports: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrisResponse {
    pub uris: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatusRequest {
    /// Push interval in nanoseconds.
    pub push_interval_ns: u64,
}

// ============================================================================
// Node membership
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddNodeRequest {
    pub name: String,
    #[serde(default)]
    pub exec_path: Option<String>,
    /// JSON object of node flags.
    #[serde(default)]
    pub node_config: Option<String>,
    #[serde(default)]
    pub chain_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub upgrade_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub subnet_configs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeNameRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartNodeRequest {
    pub name: String,
    #[serde(default)]
    pub exec_path: Option<String>,
    #[serde(default)]
    pub plugin_dir: Option<String>,
    #[serde(default)]
    pub track_subnets: Option<String>,
    #[serde(default)]
    pub chain_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub upgrade_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub subnet_configs: BTreeMap<String, String>,
}

// ============================================================================
// Provisioning
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBlockchainsRequest {
    pub blockchain_specs: Vec<BlockchainSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBlockchainsResponse {
    pub cluster_info: ClusterInfo,
    pub chain_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubnetsRequest {
    pub subnet_specs: Vec<SubnetSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSubnetsResponse {
    pub cluster_info: ClusterInfo,
    pub subnet_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformElasticSubnetsRequest {
    pub elastic_subnet_specs: Vec<ElasticSubnetSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformElasticSubnetsResponse {
    pub cluster_info: ClusterInfo,
    pub tx_ids: Vec<String>,
    pub asset_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPermissionlessValidatorRequest {
    pub validator_specs: Vec<PermissionlessValidatorSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveSubnetValidatorRequest {
    pub validator_specs: Vec<RemoveSubnetValidatorSpec>,
}

// ============================================================================
// Test peers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachPeerRequest {
    pub node_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachPeerResponse {
    pub cluster_info: ClusterInfo,
    pub peer_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutboundMessageRequest {
    pub node_name: String,
    pub peer_id: String,
    pub op: u32,
    /// Message body, base64.
    pub bytes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOutboundMessageResponse {
    pub sent: bool,
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotNameRequest {
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSnapshotRequest {
    pub snapshot_name: String,
    #[serde(default)]
    pub exec_path: Option<String>,
    #[serde(default)]
    pub plugin_dir: Option<String>,
    #[serde(default)]
    pub root_data_dir: Option<String>,
    /// JSON object of flags applied to every node.
    #[serde(default)]
    pub global_node_config: Option<String>,
    #[serde(default)]
    pub chain_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub upgrade_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub subnet_configs: BTreeMap<String, String>,
    #[serde(default)]
    pub reassign_ports_if_used: bool,
    #[serde(default)]
    pub dynamic_ports: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetSnapshotNamesResponse {
    pub snapshot_names: Vec<String>,
}
