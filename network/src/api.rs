//! JSON-RPC adapter for the validator's own HTTP APIs: health, info, admin
//! and platform-chain queries. Wallet-backed issuance lives in [`crate::wallet`].

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::ids::{Id, NodeId};

/// Default timeout of a single node API call.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u32,
    method: &'a str,
    params: Value,
}

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

/// A current validator as reported by `platform.getCurrentValidators`.
#[derive(Debug, Clone)]
pub struct ValidatorInfo {
    pub node_id: NodeId,
    pub end_time: u64,
}

#[derive(Clone)]
pub struct NodeApiClient {
    base: String,
    http: reqwest::Client,
}

impl NodeApiClient {
    pub fn new(uri: &str) -> Self {
        NodeApiClient {
            base: uri.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.base
    }

    /// `health.health`; true when every registered check passes.
    pub async fn health(&self) -> Result<bool> {
        #[derive(Deserialize)]
        struct HealthResult {
            healthy: bool,
        }
        let result: HealthResult = self.call("/ext/health", "health.health", json!({})).await?;
        Ok(result.healthy)
    }

    /// `info.getNetworkID`.
    pub async fn network_id(&self) -> Result<u32> {
        let result: Value = self.call("/ext/info", "info.getNetworkID", json!({})).await?;
        lenient_u64(result.get("networkID"))
            .map(|id| id as u32)
            .ok_or_else(|| Error::Upstream("info.getNetworkID returned no networkID".into()))
    }

    /// `admin.aliasChain`: register `alias` for an existing blockchain.
    pub async fn alias_chain(&self, chain_id: &Id, alias: &str) -> Result<()> {
        let _: Value = self
            .call(
                "/ext/admin",
                "admin.aliasChain",
                json!({ "chain": chain_id, "alias": alias }),
            )
            .await?;
        Ok(())
    }

    /// `admin.loadVMs`: rescan the plugin directory. Fails if any VM binary
    /// could not be loaded.
    pub async fn load_vms(&self) -> Result<()> {
        let result: Value = self.call("/ext/admin", "admin.loadVMs", json!({})).await?;
        if let Some(failed) = result.get("failedVMs").and_then(Value::as_object) {
            if !failed.is_empty() {
                return Err(Error::Upstream(format!(
                    "{} VMs failed to load: {:?}",
                    failed.len(),
                    failed.keys().collect::<Vec<_>>()
                )));
            }
        }
        Ok(())
    }

    /// `platform.getCurrentValidators` for `subnet_id`; the empty id queries
    /// the primary network.
    pub async fn current_validators(&self, subnet_id: &Id) -> Result<Vec<ValidatorInfo>> {
        let params = if subnet_id.is_empty() {
            json!({})
        } else {
            json!({ "subnetID": subnet_id })
        };
        let result: Value = self
            .call("/ext/bc/P", "platform.getCurrentValidators", params)
            .await?;
        parse_validators(&result)
    }

    /// `platform.getTx`: the raw creation tx for an id, used to preload the
    /// wallet with pre-existing subnets.
    pub async fn get_tx(&self, tx_id: &Id) -> Result<String> {
        let result: Value = self
            .call("/ext/bc/P", "platform.getTx", json!({ "txID": tx_id }))
            .await?;
        result
            .get("tx")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Upstream(format!("platform.getTx returned no tx for {}", tx_id)))
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, method: &str, params: Value) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        debug!("node api call {} {}", url, method);
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };
        let response = self
            .http
            .post(&url)
            .timeout(DEFAULT_API_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Upstream(format!("{} {}: {}", url, method, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!(
                "{} {} failed: status={} body={}",
                url, method, status, body
            )));
        }
        let parsed: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("{} {}: invalid response: {}", url, method, e)))?;
        if let Some(err) = parsed.error {
            return Err(Error::Upstream(format!(
                "{} failed: code={} message={}",
                method, err.code, err.message
            )));
        }
        parsed
            .result
            .ok_or_else(|| Error::Upstream(format!("{} returned no result", method)))
    }
}

fn parse_validators(result: &Value) -> Result<Vec<ValidatorInfo>> {
    let Some(entries) = result.get("validators").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    let mut validators = Vec::with_capacity(entries.len());
    for entry in entries {
        let node_id = entry
            .get("nodeID")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Upstream("validator entry without nodeID".into()))?;
        validators.push(ValidatorInfo {
            node_id: node_id.parse()?,
            end_time: lenient_u64(entry.get("endTime")).unwrap_or(0),
        });
    }
    Ok(validators)
}

// Numeric fields arrive as JSON numbers or decimal strings depending on the
// node version.
fn lenient_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validators_mixed_end_time_forms() {
        let result = json!({
            "validators": [
                { "nodeID": "NodeID-aabb", "endTime": 100 },
                { "nodeID": "NodeID-ccdd", "endTime": "200" },
            ]
        });
        let validators = parse_validators(&result).unwrap();
        assert_eq!(validators.len(), 2);
        assert_eq!(validators[0].end_time, 100);
        assert_eq!(validators[1].end_time, 200);
    }

    #[test]
    fn test_parse_validators_absent_list() {
        assert!(parse_validators(&json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_parse_validators_rejects_missing_node_id() {
        let result = json!({ "validators": [ { "endTime": 1 } ] });
        assert!(parse_validators(&result).is_err());
    }
}
