use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use netrunner_network::api::NodeApiClient;
use netrunner_network::cluster::{Cluster, ClusterInfo};
use netrunner_network::config::{FlagMap, NodeConfig, RestartOptions, StartOptions, DEFAULT_START_TIMEOUT};
use netrunner_network::error::Error as NetworkError;
use netrunner_network::ports::PortPolicy;
use netrunner_network::provisioner::Provisioner;
use netrunner_network::snapshot::{LoadOverrides, SnapshotManager};

use crate::types::*;

/// Cadence of the health polling behind `WaitForHealthy`.
const WAIT_FOR_HEALTHY_POLL_FREQUENCY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ControlError {
    /// A writer RPC arrived in the wrong state.
    #[error("failed precondition: {0}")]
    Precondition(String),
    /// The fleet carries a fault; writers are refused until `Stop`.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Cluster lifecycle as seen by the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Empty,
    Provisioning,
    Running,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub snapshots_dir: PathBuf,
    /// Default root for generated cluster state; each start may override it.
    pub root_data_dir: Option<PathBuf>,
}

/// The control service: owns the one cluster, serializes every mutating
/// workflow on a single lock, and publishes `ClusterInfo` snapshots for
/// lock-free readers.
pub struct ControlService {
    cluster: Mutex<Option<Cluster>>,
    state: RwLock<State>,
    info_tx: watch::Sender<ClusterInfo>,
    snapshots: SnapshotManager,
    root_data_dir: Option<PathBuf>,
}

impl ControlService {
    pub fn new(config: ServiceConfig) -> Self {
        let (info_tx, _) = watch::channel(ClusterInfo::default());
        ControlService {
            cluster: Mutex::new(None),
            state: RwLock::new(State::Empty),
            info_tx,
            snapshots: SnapshotManager::new(config.snapshots_dir),
            root_data_dir: config.root_data_dir,
        }
    }

    pub fn state(&self) -> State {
        *self.state.read().unwrap()
    }

    fn set_state(&self, state: State) {
        *self.state.write().unwrap() = state;
    }

    /// Latest published cluster snapshot.
    pub fn latest_info(&self) -> ClusterInfo {
        self.info_tx.subscribe().borrow().clone()
    }

    /// Subscribe to published snapshots; used by status streamers.
    pub fn subscribe(&self) -> watch::Receiver<ClusterInfo> {
        self.info_tx.subscribe()
    }

    async fn publish(&self, cluster: &Cluster) -> ClusterInfo {
        let healthy = cluster.check_healthy().await;
        let info = cluster.cluster_info(healthy);
        let _ = self.info_tx.send(info.clone());
        info
    }

    fn publish_empty(&self) {
        let _ = self.info_tx.send(ClusterInfo::default());
    }

    // ------------------------------------------------------------------
    // Ping / version
    // ------------------------------------------------------------------

    pub fn ping(&self) -> PingResponse {
        PingResponse {
            pid: std::process::id(),
        }
    }

    pub fn rpc_version(&self) -> RpcVersionResponse {
        RpcVersionResponse {
            version: crate::RPC_VERSION,
        }
    }

    // ------------------------------------------------------------------
    // Cluster lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self, req: StartRequest) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        if guard.is_some() {
            return Err(ControlError::Precondition(
                "cluster is already running; stop it first".into(),
            ));
        }
        info!("starting cluster, exec = {}", req.exec_path);
        self.set_state(State::Provisioning);

        let blockchain_specs = req.blockchain_specs.clone();
        let started = async {
            let opts = self.build_start_options(req)?;
            Ok::<_, ControlError>(Cluster::start(opts, DEFAULT_START_TIMEOUT).await?)
        }
        .await;

        let cluster = match started {
            Ok(cluster) => cluster,
            Err(e) => {
                self.set_state(State::Empty);
                self.publish_empty();
                return Err(e);
            }
        };
        let cluster = guard.insert(cluster);
        self.set_state(State::Running);

        if !blockchain_specs.is_empty() {
            if let Err(e) = Provisioner::new(cluster)
                .create_blockchains(blockchain_specs)
                .await
            {
                // The fleet is up; committed side effects are kept and
                // reported alongside the error.
                warn!("blockchain provisioning during start failed: {}", e);
                self.publish(cluster).await;
                return Err(e.into());
            }
        }
        let cluster_info = self.publish(cluster).await;
        Ok(ClusterInfoResponse { cluster_info })
    }

    pub async fn stop(&self) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let Some(mut cluster) = guard.take() else {
            return Err(ControlError::Precondition("no cluster is running".into()));
        };
        cluster.stop_all().await;
        let cluster_info = cluster.cluster_info(false);
        self.set_state(State::Empty);
        self.publish_empty();
        Ok(ClusterInfoResponse { cluster_info })
    }

    pub async fn health(&self) -> ControlResult<ClusterInfoResponse> {
        if self.state() == State::Empty {
            return Err(ControlError::Precondition("no cluster is running".into()));
        }
        let mut info = self.latest_info();
        let mut healthy = !info.node_infos.is_empty();
        for node in info.node_infos.values() {
            if node.paused {
                continue;
            }
            if !matches!(NodeApiClient::new(&node.uri).health().await, Ok(true)) {
                healthy = false;
                break;
            }
        }
        info.healthy = healthy;
        Ok(ClusterInfoResponse { cluster_info: info })
    }

    pub async fn wait_for_healthy(&self) -> ControlResult<ClusterInfoResponse> {
        let deadline = tokio::time::Instant::now() + DEFAULT_START_TIMEOUT;
        loop {
            let response = self.health().await?;
            if response.cluster_info.healthy {
                return Ok(response);
            }
            if tokio::time::Instant::now() + WAIT_FOR_HEALTHY_POLL_FREQUENCY > deadline {
                return Err(NetworkError::Timeout("waiting for fleet health".into()).into());
            }
            tokio::time::sleep(WAIT_FOR_HEALTHY_POLL_FREQUENCY).await;
        }
    }

    pub fn uris(&self) -> UrisResponse {
        let info = self.latest_info();
        let uris = info
            .node_infos
            .values()
            .filter(|n| !n.paused)
            .map(|n| n.uri.clone())
            .collect();
        UrisResponse { uris }
    }

    pub fn status(&self) -> ClusterInfoResponse {
        ClusterInfoResponse {
            cluster_info: self.latest_info(),
        }
    }

    // ------------------------------------------------------------------
    // Node membership
    // ------------------------------------------------------------------

    pub async fn add_node(&self, req: AddNodeRequest) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        let mut config = NodeConfig::named(req.name);
        if let Some(exec) = req.exec_path {
            config.binary_path = Some(exec.into());
        }
        if let Some(raw) = req.node_config {
            config.flags = parse_flags(&raw)?;
        }
        config.chain_config_files = req.chain_configs;
        config.upgrade_config_files = req.upgrade_configs;
        config.subnet_config_files = req.subnet_configs;

        cluster.add_node(config).await?;
        let cluster_info = self.publish(cluster).await;
        Ok(ClusterInfoResponse { cluster_info })
    }

    pub async fn remove_node(&self, req: NodeNameRequest) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        cluster.remove_node(&req.name).await?;
        let cluster_info = self.publish(cluster).await;
        Ok(ClusterInfoResponse { cluster_info })
    }

    pub async fn restart_node(&self, req: RestartNodeRequest) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        let opts = RestartOptions {
            binary_path: req.exec_path.map(PathBuf::from),
            plugin_dir: req.plugin_dir.map(PathBuf::from),
            track_subnets: req.track_subnets,
            chain_config_files: req.chain_configs,
            upgrade_config_files: req.upgrade_configs,
            subnet_config_files: req.subnet_configs,
            global_flags: FlagMap::new(),
        };
        cluster.restart_node(&req.name, opts).await?;
        cluster.await_healthy(DEFAULT_START_TIMEOUT).await?;
        let cluster_info = self.publish(cluster).await;
        Ok(ClusterInfoResponse { cluster_info })
    }

    pub async fn pause_node(&self, req: NodeNameRequest) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        cluster.pause_node(&req.name)?;
        let cluster_info = self.publish(cluster).await;
        Ok(ClusterInfoResponse { cluster_info })
    }

    pub async fn resume_node(&self, req: NodeNameRequest) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        cluster.resume_node(&req.name)?;
        let cluster_info = self.publish(cluster).await;
        Ok(ClusterInfoResponse { cluster_info })
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    pub async fn create_subnets(
        &self,
        req: CreateSubnetsRequest,
    ) -> ControlResult<CreateSubnetsResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        let subnet_ids = Provisioner::new(cluster).create_subnets(req.subnet_specs).await?;
        let cluster_info = self.publish(cluster).await;
        Ok(CreateSubnetsResponse {
            cluster_info,
            subnet_ids: subnet_ids.iter().map(|id| id.to_string()).collect(),
        })
    }

    pub async fn create_blockchains(
        &self,
        req: CreateBlockchainsRequest,
    ) -> ControlResult<CreateBlockchainsResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        let chains = Provisioner::new(cluster)
            .create_blockchains(req.blockchain_specs)
            .await?;
        let cluster_info = self.publish(cluster).await;
        Ok(CreateBlockchainsResponse {
            cluster_info,
            chain_ids: chains.iter().map(|c| c.chain_id.to_string()).collect(),
        })
    }

    pub async fn transform_elastic_subnets(
        &self,
        req: TransformElasticSubnetsRequest,
    ) -> ControlResult<TransformElasticSubnetsResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        let transformed = Provisioner::new(cluster)
            .transform_elastic_subnets(req.elastic_subnet_specs)
            .await?;
        let cluster_info = self.publish(cluster).await;
        Ok(TransformElasticSubnetsResponse {
            cluster_info,
            tx_ids: transformed.iter().map(|(tx, _)| tx.to_string()).collect(),
            asset_ids: transformed
                .iter()
                .map(|(_, asset)| asset.to_string())
                .collect(),
        })
    }

    pub async fn add_permissionless_validator(
        &self,
        req: AddPermissionlessValidatorRequest,
    ) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        Provisioner::new(cluster)
            .add_permissionless_validators(req.validator_specs)
            .await?;
        let cluster_info = self.publish(cluster).await;
        Ok(ClusterInfoResponse { cluster_info })
    }

    pub async fn remove_subnet_validator(
        &self,
        req: RemoveSubnetValidatorRequest,
    ) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        Provisioner::new(cluster)
            .remove_subnet_validators(req.validator_specs)
            .await?;
        let cluster_info = self.publish(cluster).await;
        Ok(ClusterInfoResponse { cluster_info })
    }

    // ------------------------------------------------------------------
    // Test peers
    // ------------------------------------------------------------------

    pub async fn attach_peer(&self, req: AttachPeerRequest) -> ControlResult<AttachPeerResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        let peer_id = cluster.attach_peer(&req.node_name).await?;
        let cluster_info = self.publish(cluster).await;
        Ok(AttachPeerResponse {
            cluster_info,
            peer_id,
        })
    }

    pub async fn send_outbound_message(
        &self,
        req: SendOutboundMessageRequest,
    ) -> ControlResult<SendOutboundMessageResponse> {
        let mut guard = self.cluster.lock().await;
        let cluster = writable(&mut guard)?;
        let body = BASE64
            .decode(&req.bytes)
            .map_err(|e| NetworkError::Validation(format!("invalid message bytes: {}", e)))?;
        cluster
            .send_outbound_message(&req.node_name, &req.peer_id, req.op, &body)
            .await?;
        Ok(SendOutboundMessageResponse { sent: true })
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub async fn save_snapshot(&self, req: SnapshotNameRequest) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        let Some(cluster) = guard.as_mut() else {
            return Err(ControlError::Precondition("no cluster is running".into()));
        };
        self.snapshots.save(cluster, &req.snapshot_name).await?;
        let cluster_info = cluster.cluster_info(false);
        let _ = self.info_tx.send(cluster_info.clone());
        Ok(ClusterInfoResponse { cluster_info })
    }

    pub async fn load_snapshot(&self, req: LoadSnapshotRequest) -> ControlResult<ClusterInfoResponse> {
        let mut guard = self.cluster.lock().await;
        if guard.is_some() {
            return Err(ControlError::Precondition(
                "cluster is already running; stop it first".into(),
            ));
        }
        self.set_state(State::Provisioning);

        let loaded = async {
            let mut overrides = LoadOverrides {
                binary_path: req.exec_path.map(PathBuf::from),
                plugin_dir: req.plugin_dir.map(PathBuf::from),
                root_data_dir: req.root_data_dir.map(PathBuf::from),
                port_policy: Some(port_policy(req.reassign_ports_if_used, req.dynamic_ports)),
                ..Default::default()
            };
            if let Some(raw) = req.global_node_config {
                overrides.global_flags = parse_flags(&raw)?;
            }
            overrides.chain_config_files = req.chain_configs;
            overrides.upgrade_config_files = req.upgrade_configs;
            overrides.subnet_config_files = req.subnet_configs;

            let cluster = self.snapshots.load(&req.snapshot_name, overrides).await?;
            cluster.await_healthy(DEFAULT_START_TIMEOUT).await?;
            Ok::<_, ControlError>(cluster)
        }
        .await;

        match loaded {
            Ok(cluster) => {
                let cluster = guard.insert(cluster);
                self.set_state(State::Running);
                let cluster_info = self.publish(cluster).await;
                Ok(ClusterInfoResponse { cluster_info })
            }
            Err(e) => {
                self.set_state(State::Empty);
                self.publish_empty();
                Err(e)
            }
        }
    }

    pub async fn remove_snapshot(&self, req: SnapshotNameRequest) -> ControlResult<()> {
        let _guard = self.cluster.lock().await;
        self.snapshots.remove(&req.snapshot_name)?;
        Ok(())
    }

    pub fn snapshot_names(&self) -> ControlResult<GetSnapshotNamesResponse> {
        Ok(GetSnapshotNamesResponse {
            snapshot_names: self.snapshots.list()?,
        })
    }

    // ------------------------------------------------------------------

    fn build_start_options(&self, req: StartRequest) -> ControlResult<StartOptions> {
        let mut opts = StartOptions::new(req.exec_path);
        if let Some(num_nodes) = req.num_nodes {
            opts.num_nodes = num_nodes as usize;
        }
        opts.genesis = req.genesis;
        opts.root_data_dir = req
            .root_data_dir
            .map(PathBuf::from)
            .or_else(|| self.root_data_dir.clone());
        opts.plugin_dir = req.plugin_dir.map(PathBuf::from);
        if let Some(raw) = req.global_node_config {
            opts.global_flags = parse_flags(&raw)?;
        }
        opts.chain_config_files = req.chain_configs;
        opts.upgrade_config_files = req.upgrade_configs;
        opts.subnet_config_files = req.subnet_configs;
        for (name, raw) in req.custom_node_configs {
            let mut config = NodeConfig::named(name.clone());
            config.flags = parse_flags(&raw)?;
            opts.custom_node_configs.insert(name, config);
        }
        opts.port_policy = port_policy(req.reassign_ports_if_used, req.dynamic_ports);
        Ok(opts)
    }
}

/// Writer-side access to the running cluster: rejects when there is none,
/// and refuses with `unavailable` while the fleet carries a process fault.
fn writable<'g>(guard: &'g mut Option<Cluster>) -> ControlResult<&'g mut Cluster> {
    let cluster = guard
        .as_mut()
        .ok_or_else(|| ControlError::Precondition("no cluster is running".into()))?;
    if let Some(fault) = cluster.fault() {
        return Err(ControlError::Unavailable(fault));
    }
    Ok(cluster)
}

fn parse_flags(raw: &str) -> ControlResult<FlagMap> {
    let flags: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)
        .map_err(|e| NetworkError::Validation(format!("invalid node config: {}", e)))?;
    Ok(flags.into_iter().collect())
}

fn port_policy(reassign_ports_if_used: bool, dynamic_ports: bool) -> PortPolicy {
    if dynamic_ports {
        PortPolicy::Dynamic
    } else if reassign_ports_if_used {
        PortPolicy::ReassignIfUsed
    } else {
        PortPolicy::Static
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service(dir: &TempDir) -> ControlService {
        ControlService::new(ServiceConfig {
            snapshots_dir: dir.path().join("snapshots"),
            root_data_dir: Some(dir.path().join("data")),
        })
    }

    #[tokio::test]
    async fn test_writer_ops_rejected_when_empty() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        assert_eq!(service.state(), State::Empty);

        let err = service.stop().await;
        assert!(matches!(err, Err(ControlError::Precondition(_))));

        let err = service
            .add_node(AddNodeRequest {
                name: "n6".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(err, Err(ControlError::Precondition(_))));

        let err = service
            .create_subnets(CreateSubnetsRequest {
                subnet_specs: vec![],
            })
            .await;
        assert!(matches!(err, Err(ControlError::Precondition(_))));

        let err = service.health().await;
        assert!(matches!(err, Err(ControlError::Precondition(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_missing_binary() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let err = service
            .start(StartRequest {
                exec_path: "/nonexistent/luxd".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(
            err,
            Err(ControlError::Network(NetworkError::Resource(_)))
        ));
        // A failed start leaves the service empty.
        assert_eq!(service.state(), State::Empty);
    }

    #[tokio::test]
    async fn test_snapshot_surface_when_empty() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        assert!(service.snapshot_names().unwrap().snapshot_names.is_empty());
        let err = service
            .remove_snapshot(SnapshotNameRequest {
                snapshot_name: "missing".into(),
            })
            .await;
        assert!(matches!(
            err,
            Err(ControlError::Network(NetworkError::SnapshotNotFound(_)))
        ));
        let err = service
            .save_snapshot(SnapshotNameRequest {
                snapshot_name: "snap".into(),
            })
            .await;
        assert!(matches!(err, Err(ControlError::Precondition(_))));
    }

    #[tokio::test]
    async fn test_ping_and_version() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        assert_eq!(service.ping().pid, std::process::id());
        assert_eq!(service.rpc_version().version, crate::RPC_VERSION);
    }

    #[tokio::test]
    async fn test_status_empty_publishes_default() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let status = service.status();
        assert!(status.cluster_info.node_names.is_empty());
        assert!(!status.cluster_info.healthy);
    }

    #[test]
    fn test_port_policy_mapping() {
        assert_eq!(port_policy(false, false), PortPolicy::Static);
        assert_eq!(port_policy(true, false), PortPolicy::ReassignIfUsed);
        assert_eq!(port_policy(false, true), PortPolicy::Dynamic);
        assert_eq!(port_policy(true, true), PortPolicy::Dynamic);
    }

    #[test]
    fn test_parse_flags_rejects_garbage() {
        assert!(parse_flags("not json").is_err());
        assert!(parse_flags("{\"a\":1}").is_ok());
    }
}
