//! The cluster: single authoritative registry of node records plus the
//! lifecycle operations over them. Whoever owns the `Cluster` owns every
//! node; concurrent readers consume published [`ClusterInfo`] snapshots
//! instead of touching the registry.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::api::NodeApiClient;
use crate::config::{merge_flags, FlagMap, NodeConfig, RestartOptions, StartOptions};
use crate::error::{Error, Result};
use crate::genesis;
use crate::identity::StakingIdentity;
use crate::ids::Id;
use crate::node::{AttachedPeer, Node};
use crate::ports::{NodePorts, PortAllocator, PortPolicy};
use crate::process::{self, DEFAULT_STOP_TIMEOUT};

/// Cadence of fleet health polling.
pub const HEALTH_POLL_FREQUENCY: Duration = Duration::from_secs(1);
/// How many running nodes a new node bootstraps against.
const BEACON_COUNT: usize = 3;

const NODE_NAME_PREFIX: &str = "node";

// ---------------------------------------------------------------------------
// Published state
// ---------------------------------------------------------------------------

/// Copy-on-publish snapshot of the whole cluster, consumed by status readers
/// and stream subscribers without taking the writer lock.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub node_names: Vec<String>,
    pub node_infos: BTreeMap<String, NodeInfo>,
    pub healthy: bool,
    pub custom_chains_healthy: bool,
    pub custom_chains: BTreeMap<String, CustomChainInfo>,
    pub subnets: BTreeMap<String, SubnetInfo>,
    /// Attached test peers per node name.
    pub attached_peers: BTreeMap<String, Vec<String>>,
    pub root_data_dir: String,
    pub network_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: String,
    pub exec_path: String,
    pub uri: String,
    pub id: String,
    pub data_dir: String,
    pub db_dir: String,
    pub logs_dir: String,
    pub plugin_dir: String,
    pub track_subnets: String,
    /// Serialized merged flags.
    pub config: String,
    pub paused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomChainInfo {
    pub chain_name: String,
    pub vm_id: Id,
    pub subnet_id: Id,
    pub chain_id: Id,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubnetInfo {
    pub is_elastic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elastic_subnet_id: Option<Id>,
    pub subnet_participants: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SubnetState {
    pub participants: Vec<String>,
    pub elastic_subnet_id: Option<Id>,
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

pub struct Cluster {
    network_id: u32,
    genesis: String,
    root_data_dir: PathBuf,
    /// True when this process created the root dir and may delete it on a
    /// failed start.
    owns_root_dir: bool,
    pub(crate) binary_path: PathBuf,
    pub(crate) plugin_dir: Option<PathBuf>,
    pub(crate) flags: FlagMap,
    pub(crate) chain_config_files: BTreeMap<String, String>,
    pub(crate) upgrade_config_files: BTreeMap<String, String>,
    pub(crate) subnet_config_files: BTreeMap<String, String>,
    port_policy: PortPolicy,
    pub(crate) nodes: BTreeMap<String, Node>,
    pub(crate) subnets: BTreeMap<Id, SubnetState>,
    pub(crate) custom_chains: BTreeMap<Id, CustomChainInfo>,
    pub(crate) custom_chains_healthy: bool,
    stop_tx: watch::Sender<bool>,
    fault: Arc<StdMutex<Option<String>>>,
}

impl Cluster {
    /// Start a whole cluster: allocate identities and ports, materialize the
    /// on-disk layout, spawn every node and wait for fleet health. Any
    /// failure kills whatever was launched and removes generated state.
    pub async fn start(opts: StartOptions, health_timeout: Duration) -> Result<Cluster> {
        let mut cluster = Cluster::prepare(opts)?;
        let launched = async {
            cluster.launch_all().await?;
            cluster.await_healthy(health_timeout).await
        }
        .await;
        if let Err(e) = launched {
            warn!("cluster start failed, tearing down: {}", e);
            cluster.teardown().await;
            return Err(e);
        }
        Ok(cluster)
    }

    /// Build every node record and its on-disk state without spawning.
    pub fn prepare(opts: StartOptions) -> Result<Cluster> {
        opts.validate()?;

        let (root_data_dir, owns_root_dir) = match &opts.root_data_dir {
            Some(dir) => (dir.clone(), false),
            None => {
                let stamp = time::OffsetDateTime::now_utc().unix_timestamp();
                let dir = std::env::temp_dir().join(format!("{}_{}", crate::ROOT_DIR_PREFIX, stamp));
                (dir, true)
            }
        };
        std::fs::create_dir_all(&root_data_dir).map_err(Error::io(&root_data_dir))?;

        // Fleet definition: explicit configs win over generated names.
        let node_configs: Vec<NodeConfig> = if opts.custom_node_configs.is_empty() {
            (1..=opts.num_nodes)
                .map(|i| NodeConfig::named(format!("{}{}", NODE_NAME_PREFIX, i)))
                .collect()
        } else {
            opts.custom_node_configs.values().cloned().collect()
        };
        let mut seen = HashSet::new();
        for config in &node_configs {
            if config.name.is_empty() {
                return Err(Error::Validation("node config with empty name".into()));
            }
            if !seen.insert(config.name.clone()) {
                return Err(Error::Validation(format!(
                    "duplicate node name {}",
                    config.name
                )));
            }
        }

        let identities = node_configs
            .iter()
            .map(|config| identity_for(config))
            .collect::<Result<Vec<_>>>()?;

        let genesis = match &opts.genesis {
            Some(doc) => {
                genesis::network_id_from_genesis(doc)?;
                doc.clone()
            }
            None => {
                let node_ids: Vec<_> = identities.iter().map(|id| id.node_id.clone()).collect();
                genesis::new_genesis(genesis::DEFAULT_NETWORK_ID, &node_ids)?
            }
        };
        let network_id = genesis::network_id_from_genesis(&genesis)?;

        let allocator = PortAllocator::new(opts.port_policy);
        let batch = allocator.allocate(node_configs.len(), 0, &HashSet::new())?;
        let ports = batch.into_ports();

        let (stop_tx, _) = watch::channel(false);
        let mut cluster = Cluster {
            network_id,
            genesis,
            root_data_dir,
            owns_root_dir,
            binary_path: opts.binary_path,
            plugin_dir: opts.plugin_dir,
            flags: opts.global_flags,
            chain_config_files: opts.chain_config_files,
            upgrade_config_files: opts.upgrade_config_files,
            subnet_config_files: opts.subnet_config_files,
            port_policy: opts.port_policy,
            nodes: BTreeMap::new(),
            subnets: BTreeMap::new(),
            custom_chains: BTreeMap::new(),
            custom_chains_healthy: false,
            stop_tx,
            fault: Arc::new(StdMutex::new(None)),
        };

        for (index, config) in node_configs.into_iter().enumerate() {
            let node = cluster.build_node(config, identities[index].clone(), ports[index])?;
            cluster.nodes.insert(node.name.clone(), node);
        }
        Ok(cluster)
    }

    fn build_node(
        &self,
        config: NodeConfig,
        identity: StakingIdentity,
        ports: NodePorts,
    ) -> Result<Node> {
        let mut chain_config_files = self.chain_config_files.clone();
        chain_config_files.extend(config.chain_config_files);
        let mut upgrade_config_files = self.upgrade_config_files.clone();
        upgrade_config_files.extend(config.upgrade_config_files);
        let mut subnet_config_files = self.subnet_config_files.clone();
        subnet_config_files.extend(config.subnet_config_files);

        let http_host = crate::config::string_flag(&config.flags, crate::node::HTTP_HOST_KEY)
            .or_else(|| crate::config::string_flag(&self.flags, crate::node::HTTP_HOST_KEY))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let node = Node {
            data_dir: self.root_data_dir.join(&config.name),
            name: config.name,
            identity,
            binary_path: config
                .binary_path
                .unwrap_or_else(|| self.binary_path.clone()),
            plugin_dir: self.plugin_dir.clone(),
            api_port: ports.api,
            p2p_port: ports.p2p,
            http_host,
            flags: config.flags,
            chain_config_files,
            upgrade_config_files,
            subnet_config_files,
            process: None,
            paused: false,
            attached_peers: BTreeMap::new(),
        };
        node.write_files(&self.genesis, &self.flags)?;
        Ok(node)
    }

    /// Spawn every prepared node concurrently.
    pub async fn launch_all(&mut self) -> Result<()> {
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        let mut spawns = Vec::with_capacity(names.len());
        for name in &names {
            let node = &self.nodes[name];
            let args = node.build_args(&self.flags, self.network_id, &self.beacons_for(name));
            let binary = node.binary_path.clone();
            let log_path = node.logs_dir().join("main.log");
            spawns.push(async move { process::spawn(&binary, &args, &log_path).await });
        }
        // Register every child that did spawn even when a sibling failed, so
        // a teardown after a partial launch reaps all of them.
        let results = futures::future::join_all(spawns).await;
        let mut first_err = None;
        for (name, result) in names.into_iter().zip(results) {
            match result {
                Ok(proc) => {
                    self.watch_exit(&name, &proc);
                    info!("launched node, name = {}, pid = {}", name, proc.pid());
                    if let Some(node) = self.nodes.get_mut(&name) {
                        node.process = Some(proc);
                    }
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn beacons_for(&self, name: &str) -> Vec<(String, crate::ids::NodeId)> {
        self.nodes
            .values()
            .filter(|n| n.name != name)
            .take(BEACON_COUNT)
            .map(|n| (format!("127.0.0.1:{}", n.p2p_port), n.node_id().clone()))
            .collect()
    }

    /// Surface unexpected child exits as a cluster fault.
    fn watch_exit(&self, name: &str, proc: &process::NodeProcess) {
        let mut exit_rx = proc.subscribe_exit();
        let stopping = proc.stopping_handle();
        let fault = self.fault.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            loop {
                if exit_rx.borrow().is_some() {
                    break;
                }
                if exit_rx.changed().await.is_err() {
                    return;
                }
            }
            if !stopping.load(std::sync::atomic::Ordering::SeqCst) {
                let code = exit_rx.borrow().unwrap_or(-1);
                warn!("node {} exited unexpectedly with code {}", name, code);
                *fault.lock().unwrap() =
                    Some(format!("node {} exited unexpectedly (code {})", name, code));
            }
        });
    }

    // -- accessors ---------------------------------------------------------

    pub fn network_id(&self) -> u32 {
        self.network_id
    }

    pub fn genesis(&self) -> &str {
        &self.genesis
    }

    pub fn root_data_dir(&self) -> &PathBuf {
        &self.root_data_dir
    }

    pub fn binary_path(&self) -> &PathBuf {
        &self.binary_path
    }

    pub fn flags(&self) -> &FlagMap {
        &self.flags
    }

    pub fn node_names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn node(&self, name: &str) -> Result<&Node> {
        self.nodes
            .get(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    pub fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.lock().unwrap().clone()
    }

    /// Subscribe to the cluster-stop signal; polling loops abort when it
    /// fires.
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// URIs of every running, non-paused node.
    pub fn uris(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.is_running() && !n.paused)
            .map(Node::uri)
            .collect()
    }

    /// The API endpoint workflows bind their clients to: the running,
    /// non-paused node with the lowest API port.
    pub fn client_uri(&self) -> Result<String> {
        self.nodes
            .values()
            .filter(|n| n.is_running() && !n.paused)
            .min_by_key(|n| n.api_port)
            .map(Node::uri)
            .ok_or_else(|| Error::Process("no running node to serve API calls".into()))
    }

    fn in_use_ports(&self) -> HashSet<u16> {
        self.nodes
            .values()
            .flat_map(|n| [n.api_port, n.p2p_port])
            .collect()
    }

    // -- membership --------------------------------------------------------

    /// Add and spawn one node. The record is registered only after a
    /// successful spawn, so a failure leaves the registry untouched.
    pub async fn add_node(&mut self, config: NodeConfig) -> Result<String> {
        if config.name.is_empty() {
            return Err(Error::Validation("node config with empty name".into()));
        }
        if self.has_node(&config.name) {
            return Err(Error::NodeAlreadyExists(config.name));
        }

        let identity = identity_for(&config)?;
        let allocator = PortAllocator::new(self.port_policy);
        let batch = allocator.allocate(1, self.nodes.len(), &self.in_use_ports())?;
        let ports = batch.into_ports()[0];

        let name = config.name.clone();
        let mut node = self.build_node(config, identity, ports)?;
        let args = node.build_args(&self.flags, self.network_id, &self.beacons_for(&name));
        let proc = process::spawn(
            &node.binary_path,
            &args,
            &node.logs_dir().join("main.log"),
        )
        .await?;
        self.watch_exit(&name, &proc);
        info!("added node, name = {}, pid = {}", name, proc.pid());
        node.process = Some(proc);
        self.nodes.insert(name.clone(), node);
        Ok(name)
    }

    /// Stop a node and drop its record. Its data dir is left on disk.
    pub async fn remove_node(&mut self, name: &str) -> Result<()> {
        let mut node = self
            .nodes
            .remove(name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        if let Some(mut proc) = node.process.take() {
            proc.stop(DEFAULT_STOP_TIMEOUT).await?;
        }
        info!("removed node, name = {}", name);
        Ok(())
    }

    /// Suspend a node's process. The record keeps its ports and data; API
    /// driven operations skip it until resumed.
    pub fn pause_node(&mut self, name: &str) -> Result<()> {
        let node = self.node_mut(name)?;
        if node.paused {
            return Ok(());
        }
        let proc = node
            .process
            .as_ref()
            .filter(|p| p.is_alive())
            .ok_or_else(|| Error::Process(format!("node {} is not running", name)))?;
        proc.pause()?;
        node.paused = true;
        info!("paused node, name = {}", name);
        Ok(())
    }

    pub fn resume_node(&mut self, name: &str) -> Result<()> {
        let node = self.node_mut(name)?;
        if !node.paused {
            return Err(Error::Process(format!("node {} is not paused", name)));
        }
        let proc = node
            .process
            .as_ref()
            .ok_or_else(|| Error::Process(format!("node {} has no process", name)))?;
        proc.resume()?;
        node.paused = false;
        info!("resumed node, name = {}", name);
        Ok(())
    }

    /// Restart a node in place: same identity, directories and ports; binary
    /// path, plugin dir, tracked subnets, config files and flags may change.
    pub async fn restart_node(&mut self, name: &str, opts: RestartOptions) -> Result<()> {
        let network_id = self.network_id;
        let genesis = self.genesis.clone();
        let cluster_flags = self.flags.clone();
        let beacons = self.beacons_for(name);

        let node = self.node_mut(name)?;
        if let Some(mut proc) = node.process.take() {
            proc.stop(DEFAULT_STOP_TIMEOUT).await?;
        }
        node.paused = false;

        if let Some(binary) = opts.binary_path {
            node.binary_path = binary;
        }
        if let Some(plugin_dir) = opts.plugin_dir {
            node.plugin_dir = Some(plugin_dir);
        }
        if let Some(tracked) = opts.track_subnets {
            node.set_tracked_subnets(tracked);
        }
        node.chain_config_files.extend(opts.chain_config_files);
        node.upgrade_config_files.extend(opts.upgrade_config_files);
        node.subnet_config_files.extend(opts.subnet_config_files);
        if !opts.global_flags.is_empty() {
            node.flags = merge_flags(&[&node.flags, &opts.global_flags]);
        }

        node.write_files(&genesis, &cluster_flags)?;
        let args = node.build_args(&cluster_flags, network_id, &beacons);
        let binary = node.binary_path.clone();
        let log_path = node.logs_dir().join("main.log");

        let proc = process::spawn(&binary, &args, &log_path).await?;
        self.watch_exit(name, &proc);
        info!("restarted node, name = {}, pid = {}", name, proc.pid());
        self.node_mut(name)?.process = Some(proc);
        Ok(())
    }

    /// Signal shutdown to background waiters and stop every node, by sorted
    /// name.
    pub async fn stop_all(&mut self) {
        let _ = self.stop_tx.send(true);
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in names {
            if let Some(node) = self.nodes.get_mut(&name) {
                if let Some(mut proc) = node.process.take() {
                    if let Err(e) = proc.stop(DEFAULT_STOP_TIMEOUT).await {
                        warn!("failed to stop node {}: {}", name, e);
                    }
                }
            }
        }
        info!("cluster stopped");
    }

    /// Stop everything and delete generated on-disk state. User-supplied
    /// directories are preserved.
    pub async fn teardown(&mut self) {
        self.stop_all().await;
        if self.owns_root_dir {
            if let Err(e) = std::fs::remove_dir_all(&self.root_data_dir) {
                warn!(
                    "failed to remove root data dir {:?}: {}",
                    self.root_data_dir, e
                );
            }
        }
    }

    // -- health ------------------------------------------------------------

    /// True when every non-paused node is running and its API reports
    /// healthy.
    pub async fn check_healthy(&self) -> bool {
        if self.fault().is_some() {
            return false;
        }
        for node in self.nodes.values() {
            if node.paused {
                continue;
            }
            if !node.is_running() {
                return false;
            }
            let client = NodeApiClient::new(&node.uri());
            match client.health().await {
                Ok(true) => {}
                _ => return false,
            }
        }
        true
    }

    /// Poll until the fleet is healthy, the timeout fires, or the cluster is
    /// stopped.
    pub async fn await_healthy(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut stop_rx = self.stop_signal();
        loop {
            if *stop_rx.borrow() {
                return Err(Error::Aborted);
            }
            if let Some(fault) = self.fault() {
                return Err(Error::Process(fault));
            }
            if self.check_healthy().await {
                return Ok(());
            }
            if tokio::time::Instant::now() + HEALTH_POLL_FREQUENCY > deadline {
                return Err(Error::Timeout("waiting for fleet health".into()));
            }
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return Err(Error::Aborted);
                    }
                }
                _ = tokio::time::sleep(HEALTH_POLL_FREQUENCY) => {}
            }
        }
    }

    // -- test peers --------------------------------------------------------

    /// Attach a test peer to a node's p2p port, returning the peer id.
    pub async fn attach_peer(&mut self, node_name: &str) -> Result<String> {
        let node = self.node_mut(node_name)?;
        let peer = AttachedPeer::attach(node.p2p_port).await?;
        let peer_id = peer.id.to_string();
        node.attached_peers.insert(peer_id.clone(), peer);
        Ok(peer_id)
    }

    pub async fn send_outbound_message(
        &mut self,
        node_name: &str,
        peer_id: &str,
        op: u32,
        body: &[u8],
    ) -> Result<()> {
        let node = self.node_mut(node_name)?;
        let peer = node.attached_peers.get_mut(peer_id).ok_or_else(|| {
            Error::Validation(format!(
                "peer {} is not attached to node {}",
                peer_id, node_name
            ))
        })?;
        peer.send(op, body).await
    }

    // -- publication -------------------------------------------------------

    /// Build a publication snapshot. `healthy` is supplied by the caller so
    /// publication itself never blocks on API polling.
    pub fn cluster_info(&self, healthy: bool) -> ClusterInfo {
        let mut info = ClusterInfo {
            node_names: self.node_names(),
            healthy,
            custom_chains_healthy: self.custom_chains_healthy,
            root_data_dir: self.root_data_dir.to_string_lossy().into_owned(),
            network_id: self.network_id,
            ..Default::default()
        };
        for (name, node) in &self.nodes {
            let merged = node.merged_flags(&self.flags);
            info.node_infos.insert(
                name.clone(),
                NodeInfo {
                    name: name.clone(),
                    exec_path: node.binary_path.to_string_lossy().into_owned(),
                    uri: node.uri(),
                    id: node.node_id().to_string(),
                    data_dir: node.data_dir.to_string_lossy().into_owned(),
                    db_dir: node.db_dir().to_string_lossy().into_owned(),
                    logs_dir: node.logs_dir().to_string_lossy().into_owned(),
                    plugin_dir: node
                        .plugin_dir
                        .as_ref()
                        .map(|d| d.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    track_subnets: node.tracked_subnets(),
                    config: serde_json::Value::Object(merged).to_string(),
                    paused: node.paused,
                },
            );
            if !node.attached_peers.is_empty() {
                info.attached_peers
                    .insert(name.clone(), node.attached_peers.keys().cloned().collect());
            }
        }
        for (chain_id, chain) in &self.custom_chains {
            info.custom_chains.insert(chain_id.to_string(), chain.clone());
        }
        for (subnet_id, state) in &self.subnets {
            info.subnets.insert(
                subnet_id.to_string(),
                SubnetInfo {
                    is_elastic: state.elastic_subnet_id.is_some(),
                    elastic_subnet_id: state.elastic_subnet_id,
                    subnet_participants: state.participants.clone(),
                },
            );
        }
        info
    }

    /// The recorded subnet → elastic-transform tx mapping.
    pub fn elastic_subnet_ids(&self) -> BTreeMap<Id, Id> {
        self.subnets
            .iter()
            .filter_map(|(id, state)| state.elastic_subnet_id.map(|e| (*id, e)))
            .collect()
    }

    pub(crate) fn restore_elastic_subnet_ids(&mut self, mapping: &BTreeMap<Id, Id>) {
        for (subnet_id, elastic_id) in mapping {
            self.subnets
                .entry(*subnet_id)
                .or_default()
                .elastic_subnet_id = Some(*elastic_id);
        }
    }
}

fn identity_for(config: &NodeConfig) -> Result<StakingIdentity> {
    match (&config.staking_cert, &config.staking_key, &config.bls_signing_key) {
        (Some(cert), Some(key), Some(bls)) => StakingIdentity::from_material(cert, key, bls),
        (None, None, None) => StakingIdentity::generate(),
        _ => Err(Error::Validation(format!(
            "node {} must supply all of staking cert, key and BLS key, or none",
            config.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// A stand-in validator that ignores the flag set it is spawned with.
    fn fake_node_binary(dir: &TempDir, script: &str) -> PathBuf {
        let path = dir.path().join("fake-node.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn sleep_start_options(dir: &TempDir, num_nodes: usize) -> StartOptions {
        let mut opts = StartOptions::new(fake_node_binary(dir, "exec sleep 30"));
        opts.num_nodes = num_nodes;
        opts.root_data_dir = Some(dir.path().join("data"));
        opts.port_policy = PortPolicy::Dynamic;
        opts
    }

    #[test]
    fn test_prepare_default_names() {
        let dir = TempDir::new().unwrap();
        let mut opts = sleep_start_options(&dir, crate::config::DEFAULT_NUM_NODES);
        opts.port_policy = PortPolicy::Dynamic;
        let cluster = Cluster::prepare(opts).unwrap();
        assert_eq!(
            cluster.node_names(),
            vec!["node1", "node2", "node3", "node4", "node5"]
        );
    }

    #[test]
    fn test_prepare_rejects_duplicate_ports_never_happens() {
        let dir = TempDir::new().unwrap();
        let opts = sleep_start_options(&dir, 4);
        let cluster = Cluster::prepare(opts).unwrap();
        let mut seen = HashSet::new();
        for node in cluster.nodes.values() {
            assert!(seen.insert(node.api_port));
            assert!(seen.insert(node.p2p_port));
        }
    }

    #[test]
    fn test_prepare_writes_node_dirs() {
        let dir = TempDir::new().unwrap();
        let opts = sleep_start_options(&dir, 2);
        let cluster = Cluster::prepare(opts).unwrap();
        let root = cluster.root_data_dir().clone();
        for name in cluster.node_names() {
            assert!(root.join(&name).join("staker.crt").exists());
            assert!(root.join(&name).join("config.json").exists());
        }
    }

    #[test]
    fn test_custom_identity_survives_prepare() {
        let dir = TempDir::new().unwrap();
        let identity = StakingIdentity::generate().unwrap();
        let mut config = NodeConfig::named("alpha");
        config.staking_cert = Some(identity.cert_pem.clone());
        config.staking_key = Some(identity.key_pem.clone());
        config.bls_signing_key = Some(identity.bls_signing_key.clone());

        let mut opts = sleep_start_options(&dir, 0);
        opts.custom_node_configs.insert("alpha".into(), config);
        let cluster = Cluster::prepare(opts).unwrap();
        assert_eq!(*cluster.node("alpha").unwrap().node_id(), identity.node_id);
    }

    #[test]
    fn test_partial_identity_material_rejected() {
        let dir = TempDir::new().unwrap();
        let identity = StakingIdentity::generate().unwrap();
        let mut config = NodeConfig::named("alpha");
        config.staking_cert = Some(identity.cert_pem);

        let mut opts = sleep_start_options(&dir, 0);
        opts.custom_node_configs.insert("alpha".into(), config);
        assert!(Cluster::prepare(opts).is_err());
    }

    #[tokio::test]
    async fn test_launch_add_remove_pause_resume() {
        let dir = TempDir::new().unwrap();
        let mut cluster = Cluster::prepare(sleep_start_options(&dir, 2)).unwrap();
        cluster.launch_all().await.unwrap();
        assert!(cluster.node("node1").unwrap().is_running());

        let name = cluster
            .add_node(NodeConfig::named("node3"))
            .await
            .unwrap();
        assert_eq!(name, "node3");
        assert!(cluster.node("node3").unwrap().is_running());

        // Node id is stable across restart.
        let id_before = cluster.node("node3").unwrap().node_id().clone();
        cluster
            .restart_node("node3", RestartOptions::default())
            .await
            .unwrap();
        assert_eq!(*cluster.node("node3").unwrap().node_id(), id_before);
        assert!(cluster.node("node3").unwrap().is_running());

        cluster.pause_node("node2").unwrap();
        assert!(cluster.node("node2").unwrap().paused);
        cluster.resume_node("node2").unwrap();
        assert!(!cluster.node("node2").unwrap().paused);

        cluster.remove_node("node1").await.unwrap();
        assert!(!cluster.has_node("node1"));
        assert_eq!(cluster.node_names(), vec!["node2", "node3"]);

        cluster.stop_all().await;
    }

    #[tokio::test]
    async fn test_client_uri_prefers_lowest_api_port() {
        let dir = TempDir::new().unwrap();
        let mut cluster = Cluster::prepare(sleep_start_options(&dir, 3)).unwrap();
        cluster.launch_all().await.unwrap();

        let lowest = cluster
            .nodes
            .values()
            .map(|n| n.api_port)
            .min()
            .unwrap();
        let uri = cluster.client_uri().unwrap();
        assert!(uri.ends_with(&format!(":{}", lowest)));
        cluster.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_signal_aborts_waiters() {
        let dir = TempDir::new().unwrap();
        let mut cluster = Cluster::prepare(sleep_start_options(&dir, 1)).unwrap();
        cluster.launch_all().await.unwrap();

        let mut stop_rx = cluster.stop_signal();
        cluster.stop_all().await;
        assert!(*stop_rx.borrow_and_update());
        let err = cluster.await_healthy(Duration::from_secs(2)).await;
        assert!(matches!(err, Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn test_unexpected_exit_sets_fault() {
        let dir = TempDir::new().unwrap();
        let mut opts = sleep_start_options(&dir, 1);
        opts.binary_path = fake_node_binary(&dir, "exit 7");
        let mut cluster = Cluster::prepare(opts).unwrap();
        cluster.launch_all().await.unwrap();

        // Wait for the exit watcher to observe the crash.
        for _ in 0..50 {
            if cluster.fault().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(cluster.fault().is_some());
        cluster.stop_all().await;
    }
}
