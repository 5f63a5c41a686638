//! Multi-phase provisioning workflows: subnet creation, blockchain
//! installation, elastic-subnet transforms and permissionless validator
//! management. Each workflow owns one wallet gateway for its lifetime and
//! mutates the cluster registry it borrows; on-chain side effects that were
//! committed before an abort are kept and reported.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::api::NodeApiClient;
use crate::cluster::{Cluster, CustomChainInfo};
use crate::config::{
    BlockchainSpec, ElasticSubnetSpec, NodeConfig, PermissionlessValidatorSpec,
    RemoveSubnetValidatorSpec, RestartOptions, SubnetSpec, DEFAULT_START_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::ids::{vm_id, Id, NodeId};
use crate::wallet::{HttpWallet, PreparedTx, Wallet};

/// Offset of primary validation start from the current time.
pub const VALIDATION_START_OFFSET: Duration = Duration::from_secs(20);
/// Offset of permissionless validation start from the current time.
pub const PERMISSIONLESS_VALIDATION_START_OFFSET: Duration = Duration::from_secs(30);
/// Duration of primary network validation.
pub const VALIDATION_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// Weight assigned to subnet validators.
pub const SUBNET_VALIDATORS_WEIGHT: u64 = 1000;
/// Stake bound to each primary-network validator registration.
pub const PRIMARY_VALIDATOR_STAKE: u64 = 2_000_000_000_000;
/// Asset denomination used for elastic-subnet staking tokens.
pub const ELASTIC_ASSET_DENOMINATION: u8 = 9;

/// Check period for blockchain logs while waiting for custom chains.
pub const BLOCKCHAIN_LOG_PULL_FREQUENCY: Duration = Duration::from_secs(1);
/// Check period while waiting for validator membership.
pub const WAIT_FOR_VALIDATORS_PULL_FREQUENCY: Duration = Duration::from_secs(1);
/// Upper bound on a single membership or log-readiness wait.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

pub struct Provisioner<'a> {
    cluster: &'a mut Cluster,
}

impl<'a> Provisioner<'a> {
    pub fn new(cluster: &'a mut Cluster) -> Self {
        Provisioner { cluster }
    }

    // ------------------------------------------------------------------
    // Subnet creation (§ subnet workflow)
    // ------------------------------------------------------------------

    /// Create one subnet per spec and make every participant a validator of
    /// it, restarting participants so they track the new subnets.
    pub async fn create_subnets(&mut self, mut specs: Vec<SubnetSpec>) -> Result<Vec<Id>> {
        info!("create subnets, count = {}", specs.len());
        self.fill_participants(&mut specs);
        self.ensure_participants_running(&specs).await?;

        let uri = self.cluster.client_uri()?;
        let platform = NodeApiClient::new(&uri);
        let mut wallet = HttpWallet::connect(&uri, &[]).await?;

        self.add_primary_validators(&platform, &wallet).await?;
        let subnet_ids = self.issue_create_subnet_txs(&wallet, specs.len()).await?;
        self.set_subnet_config_files(&subnet_ids, &specs)?;
        self.wait_primary_validators(&platform).await?;
        self.add_subnet_validators(&platform, &wallet, &subnet_ids, &specs)
            .await?;

        self.restart_for_tracked_subnets(RestartCause::NewSubnets {
            subnet_ids: &subnet_ids,
            specs: &specs,
            config_updated: &HashSet::new(),
        })
        .await?;
        wallet.rebind(&self.cluster.client_uri()?);

        self.wait_subnet_validators(&subnet_ids, &specs).await?;
        self.register_subnets(&subnet_ids, &specs);
        Ok(subnet_ids)
    }

    // ------------------------------------------------------------------
    // Blockchain provisioning (§ blockchain workflow)
    // ------------------------------------------------------------------

    /// Install custom blockchains, creating any subnets their specs imply.
    /// Returns per-chain info; the chain id is the create-chain tx id, known
    /// before issuance so on-disk artifacts can be named after it.
    pub async fn create_blockchains(
        &mut self,
        mut chain_specs: Vec<BlockchainSpec>,
    ) -> Result<Vec<CustomChainInfo>> {
        info!("create and install custom chains, count = {}", chain_specs.len());
        for spec in &chain_specs {
            spec.validate()?;
        }

        // Subnets referenced by id must be loadable into the wallet.
        let preload: Vec<Id> = chain_specs.iter().filter_map(|s| s.subnet_id).collect();

        // Chains without a subnet id get a fresh subnet from their nested
        // spec, or an empty default.
        let mut subnet_specs: Vec<SubnetSpec> = chain_specs
            .iter()
            .filter(|s| s.subnet_id.is_none())
            .map(|s| s.subnet_spec.clone().unwrap_or_default())
            .collect();
        self.fill_participants(&mut subnet_specs);
        self.ensure_participants_running(&subnet_specs).await?;

        let uri = self.cluster.client_uri()?;
        let platform = NodeApiClient::new(&uri);
        let mut wallet = HttpWallet::connect(&uri, &preload).await?;

        self.add_primary_validators(&platform, &wallet).await?;
        let subnet_ids = self
            .issue_create_subnet_txs(&wallet, subnet_specs.len())
            .await?;
        self.set_subnet_config_files(&subnet_ids, &subnet_specs)?;

        // Hand the created subnets back to the chains that needed one.
        let mut next = subnet_ids.iter();
        for spec in chain_specs.iter_mut() {
            if spec.subnet_id.is_none() {
                spec.subnet_id = next.next().copied();
            }
        }

        self.wait_primary_validators(&platform).await?;
        self.add_subnet_validators(&platform, &wallet, &subnet_ids, &subnet_specs)
            .await?;

        // Build every create-chain tx up front: the tx ids are the chain
        // ids, and the config files below are keyed by them.
        let mut prepared: Vec<PreparedTx> = Vec::with_capacity(chain_specs.len());
        for spec in &chain_specs {
            let id = vm_id(&spec.vm_name)?;
            let subnet_id = chain_subnet_id(spec)?;
            let tx = wallet
                .build_create_chain(&subnet_id, &spec.vm_name, &id, &spec.genesis)
                .await?;
            info!(
                "built create-chain tx, vm = {}, chain = {}",
                spec.vm_name, tx.id
            );
            prepared.push(tx);
        }

        let config_updated = self
            .set_blockchain_config_files(&chain_specs, &prepared, &subnet_ids, &subnet_specs)
            .await?;

        if !subnet_specs.is_empty() || !config_updated.is_empty() {
            self.restart_for_tracked_subnets(RestartCause::NewSubnets {
                subnet_ids: &subnet_ids,
                specs: &subnet_specs,
                config_updated: &config_updated,
            })
            .await?;
            wallet.rebind(&self.cluster.client_uri()?);
        }

        self.reload_vm_plugins().await?;
        self.wait_subnet_validators(&subnet_ids, &subnet_specs).await?;

        // Issue the queued txs only after every participant validates its
        // subnet.
        for tx in &prepared {
            wallet.issue_tx(tx).await?;
            info!("created blockchain, chain = {}", tx.id);
        }

        self.register_subnets(&subnet_ids, &subnet_specs);
        let mut chain_infos = Vec::with_capacity(chain_specs.len());
        for (spec, tx) in chain_specs.iter().zip(&prepared) {
            let chain = CustomChainInfo {
                chain_name: spec.vm_name.clone(),
                vm_id: vm_id(&spec.vm_name)?,
                subnet_id: chain_subnet_id(spec)?,
                chain_id: tx.id,
            };
            self.cluster.custom_chains.insert(tx.id, chain.clone());
            chain_infos.push(chain);
        }

        self.register_blockchain_aliases(&chain_specs, &prepared).await?;
        self.wait_custom_chains_ready(&chain_infos).await?;
        self.cluster.custom_chains_healthy = true;
        info!("all custom chains are running");
        Ok(chain_infos)
    }

    // ------------------------------------------------------------------
    // Elastic subnet transform
    // ------------------------------------------------------------------

    /// Transform subnets to use a custom staking asset. Returns the
    /// transform tx id and the asset id per spec.
    pub async fn transform_elastic_subnets(
        &mut self,
        specs: Vec<ElasticSubnetSpec>,
    ) -> Result<Vec<(Id, Id)>> {
        info!("transform elastic subnets, count = {}", specs.len());
        let preload: Vec<Id> = specs.iter().map(|s| s.subnet_id).collect();
        let uri = self.cluster.client_uri()?;
        let wallet = HttpWallet::connect(&uri, &preload).await?;

        let mut out = Vec::with_capacity(specs.len());
        for spec in &specs {
            info!("transforming subnet {}", spec.subnet_id);
            let asset_id = wallet
                .create_asset(
                    &spec.asset_name,
                    &spec.asset_symbol,
                    ELASTIC_ASSET_DENOMINATION,
                    spec.max_supply,
                )
                .await?;
            info!("created asset, id = {}", asset_id);
            wallet.export_to_platform(&asset_id, spec.max_supply).await?;
            wallet.import_from_exchange().await?;
            let elastic_id = wallet.transform_subnet(spec, &asset_id).await?;
            info!(
                "subnet transformed into elastic subnet, subnet = {}, tx = {}",
                spec.subnet_id, elastic_id
            );
            self.cluster
                .subnets
                .entry(spec.subnet_id)
                .or_default()
                .elastic_subnet_id = Some(elastic_id);
            out.push((elastic_id, asset_id));
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Permissionless validators
    // ------------------------------------------------------------------

    pub async fn add_permissionless_validators(
        &mut self,
        specs: Vec<PermissionlessValidatorSpec>,
    ) -> Result<()> {
        info!("add permissionless validators, count = {}", specs.len());
        let preload: Vec<Id> = specs.iter().map(|s| s.subnet_id).collect();

        // Spawn any missing named nodes first.
        for spec in &specs {
            if !self.cluster.has_node(&spec.node_name) {
                info!("adding new participant {}", spec.node_name);
                self.cluster
                    .add_node(NodeConfig::named(spec.node_name.clone()))
                    .await?;
            }
        }
        self.cluster.await_healthy(DEFAULT_START_TIMEOUT).await?;

        let uri = self.cluster.client_uri()?;
        let platform = NodeApiClient::new(&uri);
        let wallet = HttpWallet::connect(&uri, &preload).await?;

        self.add_primary_validators(&platform, &wallet).await?;
        self.wait_primary_validators(&platform).await?;

        let primary_end_times: BTreeMap<NodeId, u64> = platform
            .current_validators(&Id::EMPTY)
            .await?
            .into_iter()
            .map(|v| (v.node_id, v.end_time))
            .collect();

        for spec in &specs {
            let node_id = self.cluster.node(&spec.node_name)?.node_id().clone();
            let (start, end) = permissionless_validation_window(
                spec,
                primary_end_times.get(&node_id).copied(),
                now_unix(),
            )?;
            let tx_id = wallet
                .add_permissionless_validator(
                    &spec.subnet_id,
                    &node_id,
                    &spec.asset_id,
                    spec.staked_amount,
                    start,
                    end,
                )
                .await?;
            info!(
                "validator added as permissionless validator, node = {}, tx = {}",
                spec.node_name, tx_id
            );
        }

        self.restart_for_tracked_subnets(RestartCause::AddValidators(&specs))
            .await
    }

    pub async fn remove_subnet_validators(
        &mut self,
        specs: Vec<RemoveSubnetValidatorSpec>,
    ) -> Result<()> {
        info!("remove subnet validators, count = {}", specs.len());
        let preload: Vec<Id> = specs.iter().map(|s| s.subnet_id).collect();
        let uri = self.cluster.client_uri()?;
        let platform = NodeApiClient::new(&uri);
        let wallet = HttpWallet::connect(&uri, &preload).await?;

        for spec in &specs {
            let validators: HashSet<NodeId> = platform
                .current_validators(&spec.subnet_id)
                .await?
                .into_iter()
                .map(|v| v.node_id)
                .collect();
            for node_name in &spec.node_names {
                let node_id = self.cluster.node(node_name)?.node_id().clone();
                if !validators.contains(&node_id) {
                    return Err(Error::Validation(format!(
                        "node {} is currently not a subnet validator of subnet {}",
                        node_name, spec.subnet_id
                    )));
                }
                let tx_id = wallet
                    .remove_subnet_validator(&spec.subnet_id, &node_id)
                    .await?;
                info!(
                    "removed node as subnet validator, node = {}, subnet = {}, tx = {}",
                    node_name, spec.subnet_id, tx_id
                );
            }
        }

        self.restart_for_tracked_subnets(RestartCause::RemoveValidators(&specs))
            .await
    }

    // ------------------------------------------------------------------
    // Shared phases
    // ------------------------------------------------------------------

    /// Empty participant lists mean every node in the cluster.
    fn fill_participants(&self, specs: &mut [SubnetSpec]) {
        let all_names = self.cluster.node_names();
        for spec in specs {
            if spec.participants.is_empty() {
                spec.participants = all_names.clone();
            }
        }
    }

    /// Spawn declared participants that are not in the registry, then wait
    /// for fleet health.
    async fn ensure_participants_running(&mut self, specs: &[SubnetSpec]) -> Result<()> {
        let mut missing: BTreeSet<String> = BTreeSet::new();
        for spec in specs {
            for name in &spec.participants {
                if !self.cluster.has_node(name) {
                    missing.insert(name.clone());
                }
            }
        }
        for name in missing {
            info!("adding new participant {}", name);
            self.cluster.add_node(NodeConfig::named(name)).await?;
        }
        self.cluster.await_healthy(DEFAULT_START_TIMEOUT).await
    }

    /// Make every node a primary-network validator if it is not already:
    /// validation starts as soon as possible and lasts as long as accepted.
    async fn add_primary_validators<W: Wallet + ?Sized>(
        &mut self,
        platform: &NodeApiClient,
        wallet: &W,
    ) -> Result<()> {
        info!("adding the nodes as primary network validators");
        let current: HashSet<NodeId> = platform
            .current_validators(&Id::EMPTY)
            .await?
            .into_iter()
            .map(|v| v.node_id)
            .collect();
        let now = now_unix();
        let start = now + VALIDATION_START_OFFSET.as_secs();
        let end = now + VALIDATION_DURATION.as_secs();

        let nodes: Vec<(String, NodeId, String)> = self
            .cluster
            .nodes
            .iter()
            .map(|(name, node)| {
                (
                    name.clone(),
                    node.node_id().clone(),
                    node.identity.bls_signing_key.clone(),
                )
            })
            .collect();
        for (name, node_id, bls_key) in nodes {
            if current.contains(&node_id) {
                continue;
            }
            let tx_id = wallet
                .add_primary_validator(&node_id, start, end, PRIMARY_VALIDATOR_STAKE, &bls_key)
                .await?;
            info!(
                "added node as primary network validator, node = {}, tx = {}",
                name, tx_id
            );
        }
        Ok(())
    }

    async fn issue_create_subnet_txs<W: Wallet + ?Sized>(
        &mut self,
        wallet: &W,
        count: usize,
    ) -> Result<Vec<Id>> {
        info!("creating subnets, count = {}", count);
        let mut subnet_ids = Vec::with_capacity(count);
        for _ in 0..count {
            let subnet_id = wallet.create_subnet().await?;
            info!("created subnet tx, subnet = {}", subnet_id);
            subnet_ids.push(subnet_id);
        }
        Ok(subnet_ids)
    }

    /// Write per-subnet config files into every participant's record.
    fn set_subnet_config_files(&mut self, subnet_ids: &[Id], specs: &[SubnetSpec]) -> Result<()> {
        for (subnet_id, spec) in subnet_ids.iter().zip(specs) {
            let Some(config) = &spec.subnet_config else {
                continue;
            };
            for name in &spec.participants {
                let node = self.cluster.node_mut(name)?;
                node.subnet_config_files
                    .insert(subnet_id.to_string(), config.clone());
            }
        }
        Ok(())
    }

    /// Make subnet participants validators of their subnet if not already;
    /// validation ends when the node's primary validation ends.
    async fn add_subnet_validators<W: Wallet + ?Sized>(
        &mut self,
        platform: &NodeApiClient,
        wallet: &W,
        subnet_ids: &[Id],
        specs: &[SubnetSpec],
    ) -> Result<()> {
        info!("adding the nodes as subnet validators");
        for (subnet_id, spec) in subnet_ids.iter().zip(specs) {
            let primary_end_times: BTreeMap<NodeId, u64> = platform
                .current_validators(&Id::EMPTY)
                .await?
                .into_iter()
                .map(|v| (v.node_id, v.end_time))
                .collect();
            let subnet_validators: HashSet<NodeId> = platform
                .current_validators(subnet_id)
                .await?
                .into_iter()
                .map(|v| v.node_id)
                .collect();
            for name in &spec.participants {
                let node_id = self.cluster.node(name)?.node_id().clone();
                if subnet_validators.contains(&node_id) {
                    continue;
                }
                let start = now_unix() + VALIDATION_START_OFFSET.as_secs();
                let end = primary_end_times.get(&node_id).copied().ok_or_else(|| {
                    Error::Upstream(format!("node {} has no primary validation end time", name))
                })?;
                let tx_id = wallet
                    .add_subnet_validator(subnet_id, &node_id, start, end, SUBNET_VALIDATORS_WEIGHT)
                    .await?;
                info!(
                    "added node as subnet validator, node = {}, subnet = {}, tx = {}",
                    name, subnet_id, tx_id
                );
            }
        }
        Ok(())
    }

    /// Wait until every cluster node validates the primary network.
    async fn wait_primary_validators(&self, platform: &NodeApiClient) -> Result<()> {
        info!("waiting for the nodes to become primary validators");
        let node_ids: Vec<NodeId> = self
            .cluster
            .nodes
            .values()
            .map(|n| n.node_id().clone())
            .collect();
        self.wait_for_membership(platform, Id::EMPTY, &node_ids).await
    }

    /// Wait until all declared participants validate their subnets.
    async fn wait_subnet_validators(&self, subnet_ids: &[Id], specs: &[SubnetSpec]) -> Result<()> {
        info!("waiting for the nodes to become subnet validators");
        let uri = self.cluster.client_uri()?;
        let platform = NodeApiClient::new(&uri);
        for (subnet_id, spec) in subnet_ids.iter().zip(specs) {
            let mut node_ids = Vec::with_capacity(spec.participants.len());
            for name in &spec.participants {
                node_ids.push(self.cluster.node(name)?.node_id().clone());
            }
            self.wait_for_membership(&platform, *subnet_id, &node_ids).await?;
        }
        Ok(())
    }

    async fn wait_for_membership(
        &self,
        platform: &NodeApiClient,
        subnet_id: Id,
        node_ids: &[NodeId],
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WAIT_TIMEOUT;
        let mut stop_rx = self.cluster.stop_signal();
        loop {
            if *stop_rx.borrow() {
                return Err(Error::Aborted);
            }
            let validators: HashSet<NodeId> = platform
                .current_validators(&subnet_id)
                .await?
                .into_iter()
                .map(|v| v.node_id)
                .collect();
            if node_ids.iter().all(|id| validators.contains(id)) {
                return Ok(());
            }
            if tokio::time::Instant::now() + WAIT_FOR_VALIDATORS_PULL_FREQUENCY > deadline {
                return Err(Error::Timeout(format!(
                    "waiting for validators of subnet {}",
                    subnet_id
                )));
            }
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        return Err(Error::Aborted);
                    }
                }
                _ = tokio::time::sleep(WAIT_FOR_VALIDATORS_PULL_FREQUENCY) => {}
            }
        }
    }

    /// Write per-chain config and upgrade files into every participant,
    /// keyed by the chain's tx-id alias. Returns the nodes whose on-disk
    /// config changed and therefore need a restart.
    async fn set_blockchain_config_files(
        &mut self,
        chain_specs: &[BlockchainSpec],
        prepared: &[PreparedTx],
        new_subnet_ids: &[Id],
        new_subnet_specs: &[SubnetSpec],
    ) -> Result<HashSet<String>> {
        info!("creating config files for each custom chain");
        let mut to_restart = HashSet::new();
        for (spec, tx) in chain_specs.iter().zip(prepared) {
            let subnet_id = chain_subnet_id(spec)?;
            let mut participants: Vec<String> = Vec::new();
            for (new_id, new_spec) in new_subnet_ids.iter().zip(new_subnet_specs) {
                if *new_id == subnet_id {
                    participants = new_spec.participants.clone();
                }
            }
            if participants.is_empty() {
                participants = self.subnet_validator_names(&subnet_id).await?;
            }

            let chain_alias = tx.id.to_string();
            if spec.chain_config.is_some() || !spec.per_node_chain_config.is_empty() {
                for name in &participants {
                    let config = spec
                        .per_node_chain_config
                        .get(name)
                        .or(spec.chain_config.as_ref())
                        .cloned();
                    if let Some(config) = config {
                        let node = self.cluster.node_mut(name)?;
                        node.chain_config_files.insert(chain_alias.clone(), config);
                        to_restart.insert(name.clone());
                    }
                }
            }
            if let Some(upgrade) = &spec.network_upgrade {
                for name in &participants {
                    let node = self.cluster.node_mut(name)?;
                    node.upgrade_config_files
                        .insert(chain_alias.clone(), upgrade.clone());
                    to_restart.insert(name.clone());
                }
            }
        }
        Ok(to_restart)
    }

    /// Map a subnet's current validators back to node names. Every validator
    /// must be a node of this cluster.
    async fn subnet_validator_names(&self, subnet_id: &Id) -> Result<Vec<String>> {
        let uri = self.cluster.client_uri()?;
        let platform = NodeApiClient::new(&uri);
        let validators = platform.current_validators(subnet_id).await?;
        let mut names = Vec::with_capacity(validators.len());
        for validator in &validators {
            let name = self
                .cluster
                .nodes
                .values()
                .find(|n| n.node_id() == &validator.node_id)
                .map(|n| n.name.clone());
            match name {
                Some(name) => names.push(name),
                None => {
                    return Err(Error::Validation(format!(
                        "not all validators for subnet {} are present in network",
                        subnet_id
                    )))
                }
            }
        }
        Ok(names)
    }

    /// Rolling restart, sequential by sorted node name, updating each node's
    /// tracked-subnets flag per the cause. Paused nodes keep their updated
    /// flag but are not restarted. Ends with a fleet health barrier.
    async fn restart_for_tracked_subnets(&mut self, cause: RestartCause<'_>) -> Result<()> {
        info!("restarting network");
        let names = self.cluster.node_names();
        for name in names {
            let (tracked, changed) = {
                let node = self.cluster.node(&name)?;
                let current = node.tracked_subnets();
                let (add, remove) = cause.delta_for(&name);
                let updated = compute_tracked_subnets(&current, &add, &remove);
                let mut needs = updated != current;
                if let RestartCause::NewSubnets { config_updated, .. } = &cause {
                    needs |= config_updated.contains(&name);
                }
                (updated, needs)
            };

            self.cluster.node_mut(&name)?.set_tracked_subnets(tracked.clone());
            if !changed || self.cluster.node(&name)?.paused {
                continue;
            }
            info!("restarting node {} to track subnets {:?}", name, tracked);
            self.cluster
                .restart_node(
                    &name,
                    RestartOptions {
                        track_subnets: Some(tracked),
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.cluster.await_healthy(DEFAULT_START_TIMEOUT).await
    }

    /// Ask every running node to rescan its VM plugin directory.
    async fn reload_vm_plugins(&self) -> Result<()> {
        info!("reloading plugin binaries");
        for node in self.cluster.nodes.values() {
            if node.paused || !node.is_running() {
                continue;
            }
            NodeApiClient::new(&node.uri()).load_vms().await?;
        }
        Ok(())
    }

    /// Register optional aliases for created chains on every running node.
    async fn register_blockchain_aliases(
        &self,
        chain_specs: &[BlockchainSpec],
        prepared: &[PreparedTx],
    ) -> Result<()> {
        info!("registering blockchain aliases");
        for (spec, tx) in chain_specs.iter().zip(prepared) {
            let Some(alias) = &spec.blockchain_alias else {
                continue;
            };
            info!("registering blockchain alias {} for chain {}", alias, tx.id);
            for node in self.cluster.nodes.values() {
                if node.paused || !node.is_running() {
                    continue;
                }
                NodeApiClient::new(&node.uri())
                    .alias_chain(&tx.id, alias)
                    .await
                    .map_err(|e| {
                        Error::Upstream(format!(
                            "failure to register blockchain alias {} on node {}: {}",
                            alias, node.name, e
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Readiness barrier for custom chains: every participant's log dir must
    /// contain `<chain id>.log`.
    async fn wait_custom_chains_ready(&self, chain_infos: &[CustomChainInfo]) -> Result<()> {
        info!("waiting for custom chains to report healthy");
        self.cluster.await_healthy(DEFAULT_START_TIMEOUT).await?;

        let mut stop_rx = self.cluster.stop_signal();
        for chain in chain_infos {
            let participants = self.subnet_validator_names(&chain.subnet_id).await?;
            for name in &participants {
                let node = self.cluster.node(name)?;
                if node.paused {
                    continue;
                }
                let log_path = node.logs_dir().join(format!("{}.log", chain.chain_id));
                let deadline = tokio::time::Instant::now() + DEFAULT_WAIT_TIMEOUT;
                loop {
                    if *stop_rx.borrow() {
                        return Err(Error::Aborted);
                    }
                    if log_path.exists() {
                        break;
                    }
                    if tokio::time::Instant::now() + BLOCKCHAIN_LOG_PULL_FREQUENCY > deadline {
                        return Err(Error::Timeout(format!(
                            "waiting for chain {} log on node {}",
                            chain.chain_id, name
                        )));
                    }
                    tokio::select! {
                        changed = stop_rx.changed() => {
                            if changed.is_err() || *stop_rx.borrow() {
                                return Err(Error::Aborted);
                            }
                        }
                        _ = tokio::time::sleep(BLOCKCHAIN_LOG_PULL_FREQUENCY) => {}
                    }
                }
            }
        }
        Ok(())
    }

    fn register_subnets(&mut self, subnet_ids: &[Id], specs: &[SubnetSpec]) {
        for (subnet_id, spec) in subnet_ids.iter().zip(specs) {
            let state = self.cluster.subnets.entry(*subnet_id).or_default();
            state.participants = spec.participants.clone();
        }
    }
}

/// What a rolling restart is adjusting. One cause per restart; mixed causes
/// are unrepresentable.
enum RestartCause<'a> {
    NewSubnets {
        subnet_ids: &'a [Id],
        specs: &'a [SubnetSpec],
        /// Nodes whose chain config files changed on disk.
        config_updated: &'a HashSet<String>,
    },
    AddValidators(&'a [PermissionlessValidatorSpec]),
    RemoveValidators(&'a [RemoveSubnetValidatorSpec]),
}

impl RestartCause<'_> {
    /// Subnets to add to and remove from `node`'s tracked list.
    fn delta_for(&self, node: &str) -> (Vec<Id>, Vec<Id>) {
        let mut add = Vec::new();
        let mut remove = Vec::new();
        match self {
            RestartCause::NewSubnets {
                subnet_ids, specs, ..
            } => {
                for (subnet_id, spec) in subnet_ids.iter().zip(*specs) {
                    if spec.participants.iter().any(|p| p == node) {
                        add.push(*subnet_id);
                    }
                }
            }
            RestartCause::AddValidators(specs) => {
                for spec in *specs {
                    if spec.node_name == node {
                        add.push(spec.subnet_id);
                    }
                }
            }
            RestartCause::RemoveValidators(specs) => {
                for spec in *specs {
                    if spec.node_names.iter().any(|n| n == node) {
                        remove.push(spec.subnet_id);
                    }
                }
            }
        }
        (add, remove)
    }
}

/// The subnet a chain spec installs onto. Filled for every spec once the
/// subnet-creation phase has run.
fn chain_subnet_id(spec: &BlockchainSpec) -> Result<Id> {
    spec.subnet_id.ok_or_else(|| {
        Error::Validation(format!(
            "blockchain spec for {} has no subnet id",
            spec.vm_name
        ))
    })
}

/// Recompute a comma-separated tracked-subnets list, sorted for determinism.
fn compute_tracked_subnets(current: &str, add: &[Id], remove: &[Id]) -> String {
    let mut tracked: BTreeSet<String> = current
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    for id in add {
        tracked.insert(id.to_string());
    }
    for id in remove {
        tracked.remove(&id.to_string());
    }
    tracked.into_iter().collect::<Vec<_>>().join(",")
}

/// Validation window of a permissionless validator: the spec's start or
/// now plus the default offset; the spec's duration from start, or the
/// node's primary-network end time.
fn permissionless_validation_window(
    spec: &PermissionlessValidatorSpec,
    primary_end_time: Option<u64>,
    now: u64,
) -> Result<(u64, u64)> {
    let start = match &spec.start_time {
        Some(raw) => time::OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339)
            .map_err(|e| Error::Validation(format!("invalid start time {:?}: {}", raw, e)))?
            .unix_timestamp() as u64,
        None => now + PERMISSIONLESS_VALIDATION_START_OFFSET.as_secs(),
    };
    let end = match spec.stake_duration_secs {
        Some(duration) => start + duration,
        None => primary_end_time.ok_or_else(|| {
            Error::Upstream(format!(
                "node {} has no primary validation end time",
                spec.node_name
            ))
        })?,
    };
    Ok((start, end))
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_of(name: &str) -> Id {
        vm_id(name).unwrap()
    }

    #[test]
    fn test_compute_tracked_subnets_adds_sorted() {
        let a = id_of("aaa");
        let b = id_of("bbb");
        let tracked = compute_tracked_subnets("", &[b, a], &[]);
        let expected = {
            let mut ids = vec![a.to_string(), b.to_string()];
            ids.sort();
            ids.join(",")
        };
        assert_eq!(tracked, expected);
    }

    #[test]
    fn test_compute_tracked_subnets_removes() {
        let a = id_of("aaa");
        let b = id_of("bbb");
        let initial = compute_tracked_subnets("", &[a, b], &[]);
        let tracked = compute_tracked_subnets(&initial, &[], &[a]);
        assert_eq!(tracked, b.to_string());
    }

    #[test]
    fn test_compute_tracked_subnets_idempotent_add() {
        let a = id_of("aaa");
        let once = compute_tracked_subnets("", &[a], &[]);
        let twice = compute_tracked_subnets(&once, &[a], &[]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_validation_window_defaults() {
        let spec = PermissionlessValidatorSpec {
            subnet_id: id_of("s"),
            node_name: "node1".into(),
            staked_amount: 1,
            asset_id: id_of("a"),
            start_time: None,
            stake_duration_secs: None,
        };
        let now = 1_000_000;
        let (start, end) = permissionless_validation_window(&spec, Some(9_999_999), now).unwrap();
        assert_eq!(
            start,
            now + PERMISSIONLESS_VALIDATION_START_OFFSET.as_secs()
        );
        assert_eq!(end, 9_999_999);
    }

    #[test]
    fn test_validation_window_explicit() {
        let spec = PermissionlessValidatorSpec {
            subnet_id: id_of("s"),
            node_name: "node1".into(),
            staked_amount: 1,
            asset_id: id_of("a"),
            start_time: Some("2026-01-01T00:00:00Z".into()),
            stake_duration_secs: Some(3600),
        };
        let (start, end) = permissionless_validation_window(&spec, None, 0).unwrap();
        assert_eq!(end, start + 3600);
    }

    #[test]
    fn test_validation_window_requires_primary_end_without_duration() {
        let spec = PermissionlessValidatorSpec {
            subnet_id: id_of("s"),
            node_name: "node1".into(),
            staked_amount: 1,
            asset_id: id_of("a"),
            start_time: None,
            stake_duration_secs: None,
        };
        assert!(permissionless_validation_window(&spec, None, 0).is_err());
    }

    #[test]
    fn test_validation_window_rejects_bad_start_time() {
        let spec = PermissionlessValidatorSpec {
            subnet_id: id_of("s"),
            node_name: "node1".into(),
            staked_amount: 1,
            asset_id: id_of("a"),
            start_time: Some("not a time".into()),
            stake_duration_secs: Some(1),
        };
        assert!(permissionless_validation_window(&spec, None, 0).is_err());
    }

    #[test]
    fn test_restart_cause_delta() {
        let subnet = id_of("s");
        let specs = vec![SubnetSpec {
            participants: vec!["node1".into(), "node2".into()],
            subnet_config: None,
        }];
        let ids = vec![subnet];
        let cause = RestartCause::NewSubnets {
            subnet_ids: &ids,
            specs: &specs,
            config_updated: &HashSet::new(),
        };
        let (add, remove) = cause.delta_for("node1");
        assert_eq!(add, vec![subnet]);
        assert!(remove.is_empty());
        let (add, _) = cause.delta_for("node3");
        assert!(add.is_empty());
    }
}
