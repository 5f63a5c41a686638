//! Gateway to the node's wallet endpoints. Transaction construction and
//! signing live in the node wallet; this module owns endpoint selection,
//! issuance timeouts and acceptance polling. A gateway instance belongs to
//! exactly one provisioning workflow and is discarded when it ends.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::ElasticSubnetSpec;
use crate::error::{Error, Result};
use crate::ids::{Id, NodeId};

/// Inner timeout for a single wallet operation.
pub const DEFAULT_WALLET_TIMEOUT: Duration = Duration::from_secs(60);
/// Acceptance poll cadence.
pub const TX_POLL_FREQUENCY: Duration = Duration::from_millis(100);

const P_CHAIN_PATH: &str = "/ext/bc/P";
const P_WALLET_PATH: &str = "/ext/bc/P/wallet";
const X_WALLET_PATH: &str = "/ext/bc/X/wallet";

/// A constructed-but-unissued transaction. The id is final at construction
/// time, which lets workflows name on-disk artifacts after a blockchain
/// before the chain exists.
#[derive(Debug, Clone)]
pub struct PreparedTx {
    pub id: Id,
    pub signed_bytes: String,
}

#[async_trait]
pub trait Wallet: Send + Sync {
    /// Issue a create-subnet tx; the tx id is the subnet id.
    async fn create_subnet(&self) -> Result<Id>;

    /// Stake a node on the primary network. `bls_signer_key` is the node's
    /// BLS signing key from which the wallet derives the proof of possession.
    async fn add_primary_validator(
        &self,
        node_id: &NodeId,
        start: u64,
        end: u64,
        stake: u64,
        bls_signer_key: &str,
    ) -> Result<Id>;

    async fn add_subnet_validator(
        &self,
        subnet_id: &Id,
        node_id: &NodeId,
        start: u64,
        end: u64,
        weight: u64,
    ) -> Result<Id>;

    async fn add_permissionless_validator(
        &self,
        subnet_id: &Id,
        node_id: &NodeId,
        asset_id: &Id,
        staked_amount: u64,
        start: u64,
        end: u64,
    ) -> Result<Id>;

    async fn remove_subnet_validator(&self, subnet_id: &Id, node_id: &NodeId) -> Result<Id>;

    /// Construct a signed create-chain tx without issuing it.
    async fn build_create_chain(
        &self,
        subnet_id: &Id,
        chain_name: &str,
        vm_id: &Id,
        genesis: &str,
    ) -> Result<PreparedTx>;

    /// Issue a previously built tx and wait for acceptance.
    async fn issue_tx(&self, tx: &PreparedTx) -> Result<Id>;

    /// Create an asset on the exchange chain; returns the asset id.
    async fn create_asset(
        &self,
        name: &str,
        symbol: &str,
        denomination: u8,
        max_supply: u64,
    ) -> Result<Id>;

    async fn export_to_platform(&self, asset_id: &Id, amount: u64) -> Result<Id>;

    async fn import_from_exchange(&self) -> Result<Id>;

    async fn transform_subnet(&self, spec: &ElasticSubnetSpec, asset_id: &Id) -> Result<Id>;

    /// Point the gateway at a fresh endpoint after a restart. In-flight
    /// transactions are not retried across the rebind.
    fn rebind(&mut self, uri: &str);
}

pub struct HttpWallet {
    base: String,
    http: reqwest::Client,
}

impl HttpWallet {
    /// Connect against a live API endpoint. `preload_subnets` are fetched
    /// and loaded into the wallet so later txs can reference them.
    pub async fn connect(uri: &str, preload_subnets: &[Id]) -> Result<Self> {
        let wallet = HttpWallet {
            base: uri.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        };
        for subnet_id in preload_subnets {
            wallet.preload_tx(subnet_id).await?;
        }
        Ok(wallet)
    }

    async fn preload_tx(&self, tx_id: &Id) -> Result<()> {
        debug!("preloading tx {}", tx_id);
        let tx: Value = self
            .call(P_CHAIN_PATH, "platform.getTx", json!({ "txID": tx_id }))
            .await?;
        let raw = tx
            .get("tx")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream(format!("platform.getTx returned no tx for {}", tx_id)))?;
        let _: Value = self
            .call(P_WALLET_PATH, "wallet.loadTx", json!({ "tx": raw }))
            .await?;
        Ok(())
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, method: &str, params: Value) -> Result<T> {
        #[derive(Deserialize)]
        struct RpcResponse<T> {
            result: Option<T>,
            error: Option<RpcError>,
        }
        #[derive(Deserialize)]
        struct RpcError {
            code: i64,
            message: String,
        }

        let url = format!("{}{}", self.base, path);
        let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
        let response = self
            .http
            .post(&url)
            .timeout(DEFAULT_WALLET_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{} {}: {}", url, method, e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "{} {} failed: status={} body={}",
                url, method, status, text
            )));
        }
        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("{} {}: invalid response: {}", url, method, e)))?;
        if let Some(err) = parsed.error {
            return Err(Error::Upstream(format!(
                "wallet tx error {}: code={} message={}",
                method, err.code, err.message
            )));
        }
        parsed
            .result
            .ok_or_else(|| Error::Upstream(format!("{} returned no result", method)))
    }

    /// Issue through `method`, then poll the platform chain until the tx is
    /// committed or the inner timeout fires.
    async fn issue(&self, path: &str, method: &str, params: Value) -> Result<Id> {
        let deadline = tokio::time::Instant::now() + DEFAULT_WALLET_TIMEOUT;
        let result: Value = self.call(path, method, params).await?;
        let tx_id: Id = result
            .get("txID")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream(format!("{} returned no txID", method)))?
            .parse()?;
        self.await_accepted(&tx_id, deadline).await?;
        info!("wallet tx accepted, method = {}, tx = {}", method, tx_id);
        Ok(tx_id)
    }

    async fn await_accepted(&self, tx_id: &Id, deadline: tokio::time::Instant) -> Result<()> {
        loop {
            let status: Value = self
                .call(P_CHAIN_PATH, "platform.getTxStatus", json!({ "txID": tx_id }))
                .await?;
            match status.get("status").and_then(Value::as_str) {
                Some("Committed") | Some("Accepted") => return Ok(()),
                Some("Dropped") | Some("Rejected") => {
                    let reason = status
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown");
                    return Err(Error::Upstream(format!(
                        "tx {} rejected: {}",
                        tx_id, reason
                    )));
                }
                _ => {}
            }
            if tokio::time::Instant::now() + TX_POLL_FREQUENCY > deadline {
                return Err(Error::Timeout(format!("waiting for tx {} acceptance", tx_id)));
            }
            tokio::time::sleep(TX_POLL_FREQUENCY).await;
        }
    }
}

#[async_trait]
impl Wallet for HttpWallet {
    async fn create_subnet(&self) -> Result<Id> {
        self.issue(P_WALLET_PATH, "wallet.createSubnet", json!({})).await
    }

    async fn add_primary_validator(
        &self,
        node_id: &NodeId,
        start: u64,
        end: u64,
        stake: u64,
        bls_signer_key: &str,
    ) -> Result<Id> {
        self.issue(
            P_WALLET_PATH,
            "wallet.addPermissionlessValidator",
            json!({
                "nodeID": node_id,
                "startTime": start,
                "endTime": end,
                "stakeAmount": stake,
                "signerKey": bls_signer_key,
                "delegationFeeRate": 100_000,
            }),
        )
        .await
    }

    async fn add_subnet_validator(
        &self,
        subnet_id: &Id,
        node_id: &NodeId,
        start: u64,
        end: u64,
        weight: u64,
    ) -> Result<Id> {
        self.issue(
            P_WALLET_PATH,
            "wallet.addSubnetValidator",
            json!({
                "subnetID": subnet_id,
                "nodeID": node_id,
                "startTime": start,
                "endTime": end,
                "weight": weight,
            }),
        )
        .await
    }

    async fn add_permissionless_validator(
        &self,
        subnet_id: &Id,
        node_id: &NodeId,
        asset_id: &Id,
        staked_amount: u64,
        start: u64,
        end: u64,
    ) -> Result<Id> {
        self.issue(
            P_WALLET_PATH,
            "wallet.addPermissionlessValidator",
            json!({
                "subnetID": subnet_id,
                "nodeID": node_id,
                "assetID": asset_id,
                "stakeAmount": staked_amount,
                "startTime": start,
                "endTime": end,
            }),
        )
        .await
    }

    async fn remove_subnet_validator(&self, subnet_id: &Id, node_id: &NodeId) -> Result<Id> {
        self.issue(
            P_WALLET_PATH,
            "wallet.removeSubnetValidator",
            json!({ "subnetID": subnet_id, "nodeID": node_id }),
        )
        .await
    }

    async fn build_create_chain(
        &self,
        subnet_id: &Id,
        chain_name: &str,
        vm_id: &Id,
        genesis: &str,
    ) -> Result<PreparedTx> {
        let result: Value = self
            .call(
                P_WALLET_PATH,
                "wallet.buildCreateChainTx",
                json!({
                    "subnetID": subnet_id,
                    "chainName": chain_name,
                    "vmID": vm_id,
                    "genesisData": genesis,
                }),
            )
            .await?;
        let id: Id = result
            .get("txID")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream("buildCreateChainTx returned no txID".into()))?
            .parse()?;
        let signed_bytes = result
            .get("tx")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream("buildCreateChainTx returned no tx bytes".into()))?
            .to_string();
        Ok(PreparedTx { id, signed_bytes })
    }

    async fn issue_tx(&self, tx: &PreparedTx) -> Result<Id> {
        let issued = self
            .issue(
                P_WALLET_PATH,
                "wallet.issueTx",
                json!({ "tx": tx.signed_bytes }),
            )
            .await?;
        if issued != tx.id {
            return Err(Error::Upstream(format!(
                "issued tx id {} does not match built id {}",
                issued, tx.id
            )));
        }
        Ok(issued)
    }

    async fn create_asset(
        &self,
        name: &str,
        symbol: &str,
        denomination: u8,
        max_supply: u64,
    ) -> Result<Id> {
        // The whole initial supply is allocated to the wallet's own address
        // so it can be exported and staked.
        let result: Value = self
            .call(
                X_WALLET_PATH,
                "wallet.createAsset",
                json!({
                    "name": name,
                    "symbol": symbol,
                    "denomination": denomination,
                    "initialSupply": max_supply,
                }),
            )
            .await?;
        result
            .get("assetID")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream("createAsset returned no assetID".into()))?
            .parse()
    }

    async fn export_to_platform(&self, asset_id: &Id, amount: u64) -> Result<Id> {
        let result: Value = self
            .call(
                X_WALLET_PATH,
                "wallet.export",
                json!({ "assetID": asset_id, "amount": amount, "to": "P" }),
            )
            .await?;
        result
            .get("txID")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream("export returned no txID".into()))?
            .parse()
    }

    async fn import_from_exchange(&self) -> Result<Id> {
        self.issue(
            P_WALLET_PATH,
            "wallet.import",
            json!({ "sourceChain": "X" }),
        )
        .await
    }

    async fn transform_subnet(&self, spec: &ElasticSubnetSpec, asset_id: &Id) -> Result<Id> {
        self.issue(
            P_WALLET_PATH,
            "wallet.transformSubnet",
            json!({
                "subnetID": spec.subnet_id,
                "assetID": asset_id,
                "initialSupply": spec.initial_supply,
                "maximumSupply": spec.max_supply,
                "minConsumptionRate": spec.min_consumption_rate,
                "maxConsumptionRate": spec.max_consumption_rate,
                "minValidatorStake": spec.min_validator_stake,
                "maxValidatorStake": spec.max_validator_stake,
                "minDelegatorStake": spec.min_delegator_stake,
                "minStakeDuration": spec.min_stake_duration_secs,
                "maxStakeDuration": spec.max_stake_duration_secs,
                "minDelegationFee": spec.min_delegation_fee,
                "maxValidatorWeightFactor": spec.max_validator_weight_factor,
                "uptimeRequirement": spec.uptime_requirement,
            }),
        )
        .await
    }

    fn rebind(&mut self, uri: &str) {
        self.base = uri.trim_end_matches('/').to_string();
    }
}
