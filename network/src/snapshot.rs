//! Named snapshots: atomic save/load/list/remove of a whole cluster's
//! on-disk state plus a manifest sufficient to recreate it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cluster::{Cluster, CustomChainInfo};
use crate::config::{FlagMap, NodeConfig, StartOptions};
use crate::error::{Error, Result};
use crate::ids::Id;
use crate::ports::PortPolicy;

const MANIFEST_FILE: &str = "manifest.json";
const DB_SUBDIR: &str = "db";

/// Full description of a cluster at save time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub network_id: u32,
    pub genesis: String,
    pub binary_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_dir: Option<PathBuf>,
    #[serde(default)]
    pub flags: FlagMap,
    #[serde(default)]
    pub chain_config_files: BTreeMap<String, String>,
    #[serde(default)]
    pub upgrade_config_files: BTreeMap<String, String>,
    #[serde(default)]
    pub subnet_config_files: BTreeMap<String, String>,
    /// Per-node durable configuration, including identity material.
    pub nodes: Vec<NodeConfig>,
    /// Ports held at save time, keyed by node name.
    pub node_ports: BTreeMap<String, SavedPorts>,
    #[serde(default)]
    pub subnet_id_to_elastic_subnet_id: BTreeMap<Id, Id>,
    #[serde(default)]
    pub subnet_participants: BTreeMap<Id, Vec<String>>,
    #[serde(default)]
    pub custom_chains: Vec<CustomChainInfo>,
    #[serde(default)]
    pub custom_chains_healthy: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SavedPorts {
    pub api: u16,
    pub p2p: u16,
}

/// Per-load replacements for saved configuration.
#[derive(Debug, Clone, Default)]
pub struct LoadOverrides {
    pub binary_path: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
    pub root_data_dir: Option<PathBuf>,
    pub global_flags: FlagMap,
    pub chain_config_files: BTreeMap<String, String>,
    pub upgrade_config_files: BTreeMap<String, String>,
    pub subnet_config_files: BTreeMap<String, String>,
    pub port_policy: Option<PortPolicy>,
}

pub struct SnapshotManager {
    snapshots_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(snapshots_dir: impl Into<PathBuf>) -> Self {
        SnapshotManager {
            snapshots_dir: snapshots_dir.into(),
        }
    }

    fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.snapshots_dir.join(name)
    }

    /// Halt every node and capture the cluster under `name`. The snapshot is
    /// staged in a temp dir and finalized with an atomic rename; an existing
    /// name is never overwritten. The cluster is left stopped.
    pub async fn save(&self, cluster: &mut Cluster, name: &str) -> Result<()> {
        validate_name(name)?;
        let final_dir = self.snapshot_dir(name);
        if final_dir.exists() {
            return Err(Error::SnapshotAlreadyExists(name.to_string()));
        }
        std::fs::create_dir_all(&self.snapshots_dir).map_err(Error::io(&self.snapshots_dir))?;

        info!("saving snapshot, name = {}", name);
        cluster.stop_all().await;

        let staging = self.snapshots_dir.join(format!(".tmp-{}", name));
        if staging.exists() {
            std::fs::remove_dir_all(&staging).map_err(Error::io(&staging))?;
        }
        std::fs::create_dir_all(&staging).map_err(Error::io(&staging))?;

        let manifest = manifest_of(cluster);
        let manifest_path = staging.join(MANIFEST_FILE);
        std::fs::write(
            &manifest_path,
            serde_json::to_vec_pretty(&manifest)
                .map_err(|e| Error::Validation(format!("couldn't serialize manifest: {}", e)))?,
        )
        .map_err(Error::io(&manifest_path))?;

        for (node_name, node) in &cluster.nodes {
            let src = node.db_dir();
            let dst = staging.join(DB_SUBDIR).join(node_name);
            copy_dir_all(&src, &dst)?;
        }

        std::fs::rename(&staging, &final_dir).map_err(Error::io(&final_dir))?;
        info!("snapshot saved, name = {}", name);
        Ok(())
    }

    /// Rebuild a cluster from a snapshot: restore identity and db state per
    /// node, then spawn everything. The caller owns the following health
    /// barrier.
    pub async fn load(&self, name: &str, overrides: LoadOverrides) -> Result<Cluster> {
        let dir = self.snapshot_dir(name);
        if !dir.exists() {
            return Err(Error::SnapshotNotFound(name.to_string()));
        }
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read(&manifest_path).map_err(Error::io(&manifest_path))?;
        let manifest: SnapshotManifest = serde_json::from_slice(&raw)
            .map_err(|e| Error::Validation(format!("couldn't parse manifest: {}", e)))?;

        info!("loading snapshot, name = {}", name);
        let override_binary = overrides.binary_path.is_some();
        let mut opts = StartOptions::new(
            overrides
                .binary_path
                .unwrap_or_else(|| manifest.binary_path.clone()),
        );
        opts.genesis = Some(manifest.genesis.clone());
        opts.plugin_dir = overrides.plugin_dir.or_else(|| manifest.plugin_dir.clone());
        opts.root_data_dir = overrides.root_data_dir;
        opts.port_policy = overrides.port_policy.unwrap_or_default();
        opts.global_flags =
            crate::config::merge_flags(&[&manifest.flags, &overrides.global_flags]);
        opts.chain_config_files = manifest.chain_config_files.clone();
        opts.chain_config_files
            .extend(overrides.chain_config_files.clone());
        opts.upgrade_config_files = manifest.upgrade_config_files.clone();
        opts.upgrade_config_files
            .extend(overrides.upgrade_config_files.clone());
        opts.subnet_config_files = manifest.subnet_config_files.clone();
        opts.subnet_config_files
            .extend(overrides.subnet_config_files.clone());
        for node in &manifest.nodes {
            let mut config = node.clone();
            if override_binary {
                // The per-load binary replaces whatever the nodes ran before.
                config.binary_path = None;
            }
            opts.custom_node_configs.insert(config.name.clone(), config);
        }

        let mut cluster = Cluster::prepare(opts)?;

        // Reinstall each node's database before anything runs.
        for node_name in cluster.node_names() {
            let src = dir.join(DB_SUBDIR).join(&node_name);
            if !src.exists() {
                continue;
            }
            let dst = cluster.node(&node_name)?.db_dir();
            if dst.exists() {
                std::fs::remove_dir_all(&dst).map_err(Error::io(&dst))?;
            }
            copy_dir_all(&src, &dst)?;
        }

        cluster.restore_elastic_subnet_ids(&manifest.subnet_id_to_elastic_subnet_id);
        for (subnet_id, participants) in &manifest.subnet_participants {
            cluster.subnets.entry(*subnet_id).or_default().participants =
                participants.clone();
        }
        for chain in &manifest.custom_chains {
            cluster.custom_chains.insert(chain.chain_id, chain.clone());
        }
        cluster.custom_chains_healthy = manifest.custom_chains_healthy;

        cluster.launch_all().await?;
        info!("snapshot loaded, name = {}", name);
        Ok(cluster)
    }

    pub fn list(&self) -> Result<Vec<String>> {
        if !self.snapshots_dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let entries =
            std::fs::read_dir(&self.snapshots_dir).map_err(Error::io(&self.snapshots_dir))?;
        for entry in entries {
            let entry = entry.map_err(Error::io(&self.snapshots_dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.path().is_dir() && !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let dir = self.snapshot_dir(name);
        if !dir.exists() {
            return Err(Error::SnapshotNotFound(name.to_string()));
        }
        std::fs::remove_dir_all(&dir).map_err(Error::io(&dir))?;
        info!("snapshot removed, name = {}", name);
        Ok(())
    }
}

fn manifest_of(cluster: &Cluster) -> SnapshotManifest {
    SnapshotManifest {
        network_id: cluster.network_id(),
        genesis: cluster.genesis().to_string(),
        binary_path: cluster.binary_path.clone(),
        plugin_dir: cluster.plugin_dir.clone(),
        flags: cluster.flags.clone(),
        chain_config_files: cluster.chain_config_files.clone(),
        upgrade_config_files: cluster.upgrade_config_files.clone(),
        subnet_config_files: cluster.subnet_config_files.clone(),
        nodes: cluster.nodes.values().map(|n| n.to_config()).collect(),
        node_ports: cluster
            .nodes
            .iter()
            .map(|(name, node)| {
                (
                    name.clone(),
                    SavedPorts {
                        api: node.api_port,
                        p2p: node.p2p_port,
                    },
                )
            })
            .collect(),
        subnet_id_to_elastic_subnet_id: cluster.elastic_subnet_ids(),
        subnet_participants: cluster
            .subnets
            .iter()
            .map(|(id, state)| (*id, state.participants.clone()))
            .collect(),
        custom_chains: cluster.custom_chains.values().cloned().collect(),
        custom_chains_healthy: cluster.custom_chains_healthy,
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(std::path::MAIN_SEPARATOR)
        || name.contains("..")
    {
        return Err(Error::Validation(format!("invalid snapshot name {:?}", name)));
    }
    Ok(())
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(Error::io(dst))?;
    if !src.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(src).map_err(Error::io(src))? {
        let entry = entry.map_err(Error::io(src))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir_all(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).map_err(Error::io(&from))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_node_binary(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("fake-node.sh");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    async fn running_cluster(dir: &TempDir) -> Cluster {
        let mut opts = StartOptions::new(fake_node_binary(dir));
        opts.num_nodes = 2;
        opts.root_data_dir = Some(dir.path().join("data"));
        opts.port_policy = PortPolicy::Dynamic;
        let mut cluster = Cluster::prepare(opts).unwrap();
        cluster.launch_all().await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshots"));
        let mut cluster = running_cluster(&dir).await;

        // Give one node durable state to carry across the round trip.
        let marker = cluster.node("node1").unwrap().db_dir().join("marker");
        std::fs::write(&marker, b"state").unwrap();
        cluster
            .node_mut("node2")
            .unwrap()
            .set_tracked_subnets("aa".repeat(32));
        let ids_before: Vec<_> = cluster
            .node_names()
            .iter()
            .map(|n| cluster.node(n).unwrap().node_id().clone())
            .collect();

        manager.save(&mut cluster, "snap1").await.unwrap();
        assert_eq!(manager.list().unwrap(), vec!["snap1"]);

        let mut overrides = LoadOverrides::default();
        overrides.root_data_dir = Some(dir.path().join("restored"));
        overrides.port_policy = Some(PortPolicy::Dynamic);
        let mut restored = manager.load("snap1", overrides).await.unwrap();

        assert_eq!(restored.node_names(), vec!["node1", "node2"]);
        let ids_after: Vec<_> = restored
            .node_names()
            .iter()
            .map(|n| restored.node(n).unwrap().node_id().clone())
            .collect();
        assert_eq!(ids_before, ids_after);
        assert_eq!(
            restored.node("node2").unwrap().tracked_subnets(),
            "aa".repeat(32)
        );
        assert!(restored
            .node("node1")
            .unwrap()
            .db_dir()
            .join("marker")
            .exists());

        restored.stop_all().await;
    }

    #[tokio::test]
    async fn test_save_rejects_existing_name() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshots"));
        let mut cluster = running_cluster(&dir).await;
        manager.save(&mut cluster, "snap1").await.unwrap();

        let mut cluster2 = running_cluster(&dir).await;
        let err = manager.save(&mut cluster2, "snap1").await;
        assert!(matches!(err, Err(Error::SnapshotAlreadyExists(_))));
        cluster2.stop_all().await;
    }

    #[tokio::test]
    async fn test_elastic_map_survives_round_trip() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshots"));
        let mut cluster = running_cluster(&dir).await;

        let subnet = crate::ids::vm_id("somesubnet").unwrap();
        let elastic = crate::ids::vm_id("elastictx").unwrap();
        cluster.subnets.entry(subnet).or_default().elastic_subnet_id = Some(elastic);

        manager.save(&mut cluster, "snap-elastic").await.unwrap();
        let mut overrides = LoadOverrides::default();
        overrides.root_data_dir = Some(dir.path().join("restored"));
        overrides.port_policy = Some(PortPolicy::Dynamic);
        let mut restored = manager.load("snap-elastic", overrides).await.unwrap();

        let mapping = restored.elastic_subnet_ids();
        assert_eq!(mapping.get(&subnet), Some(&elastic));
        restored.stop_all().await;
    }

    #[test]
    fn test_list_empty_and_remove_missing() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshots"));
        assert!(manager.list().unwrap().is_empty());
        assert!(matches!(
            manager.remove("nope"),
            Err(Error::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshots"));
        for bad in ["", ".hidden", "a/b", "a..b"] {
            assert!(matches!(
                manager.remove(bad),
                Err(Error::Validation(_)) | Err(Error::SnapshotNotFound(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_remove_after_save() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshots"));
        let mut cluster = running_cluster(&dir).await;
        manager.save(&mut cluster, "gone").await.unwrap();
        manager.remove("gone").unwrap();
        assert!(manager.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_saved_cluster_is_stopped() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshots"));
        let mut cluster = running_cluster(&dir).await;
        manager.save(&mut cluster, "stopped").await.unwrap();
        for name in cluster.node_names() {
            assert!(!cluster.node(&name).unwrap().is_running());
        }
    }
}
