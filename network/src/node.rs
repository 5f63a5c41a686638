use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::{merge_flags, string_flag, FlagMap, NodeConfig};
use crate::error::{Error, Result};
use crate::identity::StakingIdentity;
use crate::ids::NodeId;
use crate::process::NodeProcess;

// Flag keys of the validator binary that the supervisor derives itself.
pub const DATA_DIR_KEY: &str = "data-dir";
pub const DB_DIR_KEY: &str = "db-dir";
pub const LOG_DIR_KEY: &str = "log-dir";
pub const PLUGIN_DIR_KEY: &str = "plugin-dir";
pub const HTTP_HOST_KEY: &str = "http-host";
pub const HTTP_PORT_KEY: &str = "http-port";
pub const STAKING_PORT_KEY: &str = "staking-port";
pub const BOOTSTRAP_IPS_KEY: &str = "bootstrap-ips";
pub const BOOTSTRAP_IDS_KEY: &str = "bootstrap-ids";
pub const NETWORK_ID_KEY: &str = "network-id";
pub const TRACK_SUBNETS_KEY: &str = "track-subnets";
pub const STAKING_CERT_FILE_KEY: &str = "staking-tls-cert-file";
pub const STAKING_KEY_FILE_KEY: &str = "staking-tls-key-file";
pub const STAKING_SIGNER_KEY_FILE_KEY: &str = "staking-signer-key-file";
pub const CONFIG_FILE_KEY: &str = "config-file";
pub const GENESIS_FILE_KEY: &str = "genesis-file";

const STAKING_CERT_FILE: &str = "staker.crt";
const STAKING_KEY_FILE: &str = "staker.key";
const STAKING_SIGNER_KEY_FILE: &str = "signer.key";
const CONFIG_FILE: &str = "config.json";
const GENESIS_FILE: &str = "genesis.json";

/// A node record. Owned exclusively by the cluster; the record owns its
/// process and directories.
pub struct Node {
    pub name: String,
    pub identity: StakingIdentity,
    pub binary_path: PathBuf,
    pub plugin_dir: Option<PathBuf>,
    pub api_port: u16,
    pub p2p_port: u16,
    pub http_host: String,
    pub data_dir: PathBuf,
    /// Node-level flags; override the cluster defaults.
    pub flags: FlagMap,
    pub chain_config_files: BTreeMap<String, String>,
    pub upgrade_config_files: BTreeMap<String, String>,
    pub subnet_config_files: BTreeMap<String, String>,
    pub process: Option<NodeProcess>,
    pub paused: bool,
    pub attached_peers: BTreeMap<String, AttachedPeer>,
}

impl Node {
    pub fn node_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.data_dir.join("configs")
    }

    pub fn uri(&self) -> String {
        let host = if self.http_host == "0.0.0.0" {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        };
        format!("http://{}:{}", host, self.api_port)
    }

    pub fn is_running(&self) -> bool {
        self.process.as_ref().is_some_and(NodeProcess::is_alive)
    }

    pub fn tracked_subnets(&self) -> String {
        string_flag(&self.flags, TRACK_SUBNETS_KEY).unwrap_or_default()
    }

    pub fn set_tracked_subnets(&mut self, tracked: String) {
        self.flags
            .insert(TRACK_SUBNETS_KEY.to_string(), Value::String(tracked));
    }

    /// Export the node's durable configuration, e.g. for a snapshot manifest.
    pub fn to_config(&self) -> NodeConfig {
        NodeConfig {
            name: self.name.clone(),
            binary_path: Some(self.binary_path.clone()),
            flags: self.flags.clone(),
            staking_cert: Some(self.identity.cert_pem.clone()),
            staking_key: Some(self.identity.key_pem.clone()),
            bls_signing_key: Some(self.identity.bls_signing_key.clone()),
            chain_config_files: self.chain_config_files.clone(),
            upgrade_config_files: self.upgrade_config_files.clone(),
            subnet_config_files: self.subnet_config_files.clone(),
        }
    }

    /// Materialize the node's on-disk state: directories, staking material
    /// (mode 0600), genesis, chain/upgrade/subnet config files and the merged
    /// flag file.
    pub fn write_files(&self, genesis: &str, cluster_flags: &FlagMap) -> Result<()> {
        for dir in [&self.data_dir, &self.db_dir(), &self.logs_dir()] {
            std::fs::create_dir_all(dir).map_err(Error::io(dir))?;
        }

        write_secret(&self.data_dir.join(STAKING_CERT_FILE), &self.identity.cert_pem)?;
        write_secret(&self.data_dir.join(STAKING_KEY_FILE), &self.identity.key_pem)?;
        write_secret(
            &self.data_dir.join(STAKING_SIGNER_KEY_FILE),
            &self.identity.bls_signing_key,
        )?;

        let genesis_path = self.data_dir.join(GENESIS_FILE);
        std::fs::write(&genesis_path, genesis).map_err(Error::io(&genesis_path))?;

        let chains_dir = self.configs_dir().join("chains");
        for (alias, contents) in &self.chain_config_files {
            let dir = chains_dir.join(alias);
            std::fs::create_dir_all(&dir).map_err(Error::io(&dir))?;
            let path = dir.join("config.json");
            std::fs::write(&path, contents).map_err(Error::io(&path))?;
        }
        for (alias, contents) in &self.upgrade_config_files {
            let dir = chains_dir.join(alias);
            std::fs::create_dir_all(&dir).map_err(Error::io(&dir))?;
            let path = dir.join("upgrade.json");
            std::fs::write(&path, contents).map_err(Error::io(&path))?;
        }

        let subnets_dir = self.configs_dir().join("subnets");
        if !self.subnet_config_files.is_empty() {
            std::fs::create_dir_all(&subnets_dir).map_err(Error::io(&subnets_dir))?;
        }
        for (subnet_id, contents) in &self.subnet_config_files {
            let path = subnets_dir.join(format!("{}.json", subnet_id));
            std::fs::write(&path, contents).map_err(Error::io(&path))?;
        }

        let config_path = self.data_dir.join(CONFIG_FILE);
        let merged = Value::Object(self.merged_flags(cluster_flags));
        let contents = serde_json::to_vec_pretty(&merged)
            .map_err(|e| Error::Validation(format!("couldn't serialize node config: {}", e)))?;
        std::fs::write(&config_path, contents).map_err(Error::io(&config_path))?;

        Ok(())
    }

    /// The full flag set handed to the child: cluster defaults, then node
    /// flags, then the values only the supervisor can derive.
    pub fn merged_flags(&self, cluster_flags: &FlagMap) -> FlagMap {
        let mut merged = merge_flags(&[cluster_flags, &self.flags]);
        let derived: [(&str, Value); 9] = [
            (DATA_DIR_KEY, path_value(&self.data_dir)),
            (DB_DIR_KEY, path_value(&self.db_dir())),
            (LOG_DIR_KEY, path_value(&self.logs_dir())),
            (HTTP_HOST_KEY, Value::String(self.http_host.clone())),
            (HTTP_PORT_KEY, Value::from(self.api_port)),
            (STAKING_PORT_KEY, Value::from(self.p2p_port)),
            (
                STAKING_CERT_FILE_KEY,
                path_value(&self.data_dir.join(STAKING_CERT_FILE)),
            ),
            (
                STAKING_KEY_FILE_KEY,
                path_value(&self.data_dir.join(STAKING_KEY_FILE)),
            ),
            (
                STAKING_SIGNER_KEY_FILE_KEY,
                path_value(&self.data_dir.join(STAKING_SIGNER_KEY_FILE)),
            ),
        ];
        for (key, value) in derived {
            merged.insert(key.to_string(), value);
        }
        if let Some(plugin_dir) = &self.plugin_dir {
            merged.insert(PLUGIN_DIR_KEY.to_string(), path_value(plugin_dir));
        }
        merged.insert(
            GENESIS_FILE_KEY.to_string(),
            path_value(&self.data_dir.join(GENESIS_FILE)),
        );
        merged.insert(
            CONFIG_FILE_KEY.to_string(),
            path_value(&self.data_dir.join(CONFIG_FILE)),
        );
        merged
    }

    /// Render the command line. `bootstrap` lists `(ip:port, node id)` pairs
    /// of already-running beacons; empty for the first node.
    pub fn build_args(
        &self,
        cluster_flags: &FlagMap,
        network_id: u32,
        bootstrap: &[(String, NodeId)],
    ) -> Vec<String> {
        let mut merged = self.merged_flags(cluster_flags);
        merged.insert(NETWORK_ID_KEY.to_string(), Value::from(network_id));
        let ips: Vec<String> = bootstrap.iter().map(|(ip, _)| ip.clone()).collect();
        let ids: Vec<String> = bootstrap.iter().map(|(_, id)| id.to_string()).collect();
        merged.insert(BOOTSTRAP_IPS_KEY.to_string(), Value::String(ips.join(",")));
        merged.insert(BOOTSTRAP_IDS_KEY.to_string(), Value::String(ids.join(",")));

        // Sorted for a deterministic command line.
        let sorted: BTreeMap<_, _> = merged.into_iter().collect();
        sorted
            .into_iter()
            .map(|(key, value)| format!("--{}={}", key, render_flag(&value)))
            .collect()
    }
}

fn render_flag(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn path_value(path: &Path) -> Value {
    Value::String(path.to_string_lossy().into_owned())
}

fn write_secret(path: &Path, contents: &str) -> Result<()> {
    std::fs::write(path, contents).map_err(Error::io(path))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(Error::io(path))?;
    }
    Ok(())
}

/// A test peer borrowed against the node's p2p port. The handshake itself is
/// the transport layer's business; the record owns the connection and frames
/// outbound test messages.
pub struct AttachedPeer {
    pub id: NodeId,
    stream: TcpStream,
}

impl AttachedPeer {
    /// Dial the node's p2p port and register under a freshly generated
    /// peer identity.
    pub async fn attach(p2p_port: u16) -> Result<AttachedPeer> {
        let identity = StakingIdentity::generate()?;
        let stream = TcpStream::connect(("127.0.0.1", p2p_port))
            .await
            .map_err(|e| Error::Upstream(format!("failed to dial p2p port {}: {}", p2p_port, e)))?;
        Ok(AttachedPeer {
            id: identity.node_id,
            stream,
        })
    }

    /// Send one framed message: length, op code, body.
    pub async fn send(&mut self, op: u32, body: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(8 + body.len());
        frame.extend_from_slice(&(body.len() as u32 + 4).to_be_bytes());
        frame.extend_from_slice(&op.to_be_bytes());
        frame.extend_from_slice(body);
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| Error::Upstream(format!("failed to send to peer {}: {}", self.id, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_node(dir: &TempDir) -> Node {
        Node {
            name: "node1".into(),
            identity: StakingIdentity::generate().unwrap(),
            binary_path: "/usr/local/bin/luxd".into(),
            plugin_dir: None,
            api_port: 9650,
            p2p_port: 9651,
            http_host: "127.0.0.1".into(),
            data_dir: dir.path().join("node1"),
            flags: FlagMap::new(),
            chain_config_files: BTreeMap::new(),
            upgrade_config_files: BTreeMap::new(),
            subnet_config_files: BTreeMap::new(),
            process: None,
            paused: false,
            attached_peers: BTreeMap::new(),
        }
    }

    #[test]
    fn test_node_flags_override_cluster_flags() {
        let dir = TempDir::new().unwrap();
        let mut node = test_node(&dir);
        node.flags
            .insert("log-level".into(), json!("debug"));
        let mut cluster_flags = FlagMap::new();
        cluster_flags.insert("log-level".into(), json!("info"));
        cluster_flags.insert("index-enabled".into(), json!(true));

        let merged = node.merged_flags(&cluster_flags);
        assert_eq!(merged["log-level"], json!("debug"));
        assert_eq!(merged["index-enabled"], json!(true));
    }

    #[test]
    fn test_derived_flags_present_in_args() {
        let dir = TempDir::new().unwrap();
        let node = test_node(&dir);
        let args = node.build_args(&FlagMap::new(), 1337, &[]);
        assert!(args.iter().any(|a| a == "--http-port=9650"));
        assert!(args.iter().any(|a| a == "--staking-port=9651"));
        assert!(args.iter().any(|a| a == "--network-id=1337"));
        assert!(args.iter().any(|a| a == "--bootstrap-ips="));
        assert!(args.iter().any(|a| a.starts_with("--staking-tls-cert-file=")));
    }

    #[test]
    fn test_bootstrap_args_joined() {
        let dir = TempDir::new().unwrap();
        let node = test_node(&dir);
        let beacon = StakingIdentity::generate().unwrap();
        let args = node.build_args(
            &FlagMap::new(),
            1337,
            &[("127.0.0.1:9651".into(), beacon.node_id.clone())],
        );
        assert!(args.iter().any(|a| a == "--bootstrap-ips=127.0.0.1:9651"));
        assert!(args
            .iter()
            .any(|a| *a == format!("--bootstrap-ids={}", beacon.node_id)));
    }

    #[test]
    fn test_write_files_layout() {
        let dir = TempDir::new().unwrap();
        let mut node = test_node(&dir);
        node.chain_config_files
            .insert("C".into(), "{\"x\":1}".into());
        node.upgrade_config_files
            .insert("C".into(), "{}".into());
        node.subnet_config_files
            .insert("ab".repeat(32), "{}".into());

        node.write_files("{\"networkID\":1337}", &FlagMap::new())
            .unwrap();

        let base = dir.path().join("node1");
        assert!(base.join("staker.crt").exists());
        assert!(base.join("staker.key").exists());
        assert!(base.join("signer.key").exists());
        assert!(base.join("genesis.json").exists());
        assert!(base.join("config.json").exists());
        assert!(base.join("configs/chains/C/config.json").exists());
        assert!(base.join("configs/chains/C/upgrade.json").exists());
        assert!(base
            .join(format!("configs/subnets/{}.json", "ab".repeat(32)))
            .exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(base.join("staker.key"))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_uri_host_selection() {
        let dir = TempDir::new().unwrap();
        let mut node = test_node(&dir);
        assert_eq!(node.uri(), "http://127.0.0.1:9650");
        node.http_host = "0.0.0.0".into();
        assert_eq!(node.uri(), "http://0.0.0.0:9650");
    }
}
