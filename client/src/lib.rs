//! HTTP client for the netrunner control service. One method per RPC; every
//! request is `POST /v1/<service>/<method>` with a JSON body.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use netrunner_control::types::*;
use netrunner_network::cluster::ClusterInfo;
use netrunner_network::config::{
    BlockchainSpec, ElasticSubnetSpec, PermissionlessValidatorSpec, RemoveSubnetValidatorSpec,
    SubnetSpec,
};

/// Workflows can run for minutes; requests get a generous ceiling instead of
/// the transport default.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);

pub struct Client {
    base_url: String,
    http: reqwest::Client,
    user_agent: String,
    closed: Arc<AtomicBool>,
}

impl Client {
    /// Connect to a control server, verifying reachability with a ping
    /// bounded by `dial_timeout`.
    pub async fn new(endpoint: &str, dial_timeout: Duration) -> Result<Self> {
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        let client = Client {
            base_url,
            http,
            user_agent: format!("netrunner/{}", env!("CARGO_PKG_VERSION")),
            closed: Arc::new(AtomicBool::new(false)),
        };
        tokio::time::timeout(dial_timeout, client.ping())
            .await
            .context("Timed out dialing control server")??;
        Ok(client)
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("client is closed");
        }
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {}", url);
        let resp = self
            .http
            .post(&url)
            .header("user-agent", &self.user_agent)
            .header("x-request-id", Uuid::new_v4().to_string())
            .json(body)
            .send()
            .await
            .context("Request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            if let Ok(err) = serde_json::from_slice::<ErrorResponse>(&bytes) {
                anyhow::bail!(
                    "POST {} failed: status={} code={} error={}",
                    url,
                    status.as_u16(),
                    err.code,
                    err.error
                );
            }
            anyhow::bail!(
                "POST {} failed: status={} body={}",
                url,
                status.as_u16(),
                String::from_utf8_lossy(&bytes)
            );
        }
        resp.json().await.context("Failed to parse response")
    }

    // ------------------------------------------------------------------
    // Ping / version
    // ------------------------------------------------------------------

    pub async fn ping(&self) -> Result<PingResponse> {
        self.post("/v1/ping", &serde_json::json!({})).await
    }

    pub async fn rpc_version(&self) -> Result<RpcVersionResponse> {
        self.post("/v1/control/rpcversion", &serde_json::json!({}))
            .await
    }

    // ------------------------------------------------------------------
    // Cluster lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self, req: StartRequest) -> Result<ClusterInfoResponse> {
        self.post("/v1/control/start", &req).await
    }

    pub async fn stop(&self) -> Result<ClusterInfoResponse> {
        self.post("/v1/control/stop", &serde_json::json!({})).await
    }

    pub async fn health(&self) -> Result<ClusterInfoResponse> {
        self.post("/v1/control/health", &serde_json::json!({}))
            .await
    }

    pub async fn wait_for_healthy(&self) -> Result<ClusterInfoResponse> {
        self.post("/v1/control/waitforhealthy", &serde_json::json!({}))
            .await
    }

    pub async fn uris(&self) -> Result<Vec<String>> {
        let resp: UrisResponse = self.post("/v1/control/uris", &serde_json::json!({})).await?;
        Ok(resp.uris)
    }

    pub async fn status(&self) -> Result<ClusterInfoResponse> {
        self.post("/v1/control/status", &serde_json::json!({}))
            .await
    }

    /// Subscribe to the status stream. Frames arrive on the returned channel
    /// until the server hangs up or the client is closed.
    pub async fn stream_status(
        &self,
        push_interval: Duration,
    ) -> Result<mpsc::Receiver<ClusterInfo>> {
        let url = format!("{}/v1/control/streamstatus", self.base_url);
        let req = StreamStatusRequest {
            push_interval_ns: push_interval.as_nanos() as u64,
        };
        let resp = self
            .http
            .post(&url)
            .header("user-agent", &self.user_agent)
            .json(&req)
            .send()
            .await
            .context("Request failed")?;
        if !resp.status().is_success() {
            anyhow::bail!("stream status failed: status={}", resp.status().as_u16());
        }

        let (tx, rx) = mpsc::channel(1);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = stream.next().await {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!("status stream read failed: {}", e);
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match serde_json::from_slice::<ClusterInfo>(&line[..line.len() - 1]) {
                        Ok(info) => {
                            if tx.send(info).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!("failed to parse status frame: {}", e),
                    }
                }
            }
        });
        Ok(rx)
    }

    // ------------------------------------------------------------------
    // Node membership
    // ------------------------------------------------------------------

    pub async fn add_node(&self, req: AddNodeRequest) -> Result<ClusterInfoResponse> {
        self.post("/v1/control/addnode", &req).await
    }

    pub async fn remove_node(&self, name: &str) -> Result<ClusterInfoResponse> {
        self.post(
            "/v1/control/removenode",
            &NodeNameRequest { name: name.into() },
        )
        .await
    }

    pub async fn restart_node(&self, req: RestartNodeRequest) -> Result<ClusterInfoResponse> {
        self.post("/v1/control/restartnode", &req).await
    }

    pub async fn pause_node(&self, name: &str) -> Result<ClusterInfoResponse> {
        self.post(
            "/v1/control/pausenode",
            &NodeNameRequest { name: name.into() },
        )
        .await
    }

    pub async fn resume_node(&self, name: &str) -> Result<ClusterInfoResponse> {
        self.post(
            "/v1/control/resumenode",
            &NodeNameRequest { name: name.into() },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    pub async fn create_subnets(&self, specs: Vec<SubnetSpec>) -> Result<CreateSubnetsResponse> {
        self.post(
            "/v1/control/createsubnets",
            &CreateSubnetsRequest { subnet_specs: specs },
        )
        .await
    }

    pub async fn create_blockchains(
        &self,
        specs: Vec<BlockchainSpec>,
    ) -> Result<CreateBlockchainsResponse> {
        self.post(
            "/v1/control/createblockchains",
            &CreateBlockchainsRequest {
                blockchain_specs: specs,
            },
        )
        .await
    }

    pub async fn transform_elastic_subnets(
        &self,
        specs: Vec<ElasticSubnetSpec>,
    ) -> Result<TransformElasticSubnetsResponse> {
        self.post(
            "/v1/control/transformelasticsubnets",
            &TransformElasticSubnetsRequest {
                elastic_subnet_specs: specs,
            },
        )
        .await
    }

    pub async fn add_permissionless_validator(
        &self,
        specs: Vec<PermissionlessValidatorSpec>,
    ) -> Result<ClusterInfoResponse> {
        self.post(
            "/v1/control/addpermissionlessvalidator",
            &AddPermissionlessValidatorRequest {
                validator_specs: specs,
            },
        )
        .await
    }

    pub async fn remove_subnet_validator(
        &self,
        specs: Vec<RemoveSubnetValidatorSpec>,
    ) -> Result<ClusterInfoResponse> {
        self.post(
            "/v1/control/removesubnetvalidator",
            &RemoveSubnetValidatorRequest {
                validator_specs: specs,
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Test peers
    // ------------------------------------------------------------------

    pub async fn attach_peer(&self, node_name: &str) -> Result<AttachPeerResponse> {
        self.post(
            "/v1/control/attachpeer",
            &AttachPeerRequest {
                node_name: node_name.into(),
            },
        )
        .await
    }

    pub async fn send_outbound_message(
        &self,
        node_name: &str,
        peer_id: &str,
        op: u32,
        body: &[u8],
    ) -> Result<SendOutboundMessageResponse> {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        self.post(
            "/v1/control/sendoutboundmessage",
            &SendOutboundMessageRequest {
                node_name: node_name.into(),
                peer_id: peer_id.into(),
                op,
                bytes: BASE64.encode(body),
            },
        )
        .await
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub async fn save_snapshot(&self, name: &str) -> Result<ClusterInfoResponse> {
        self.post(
            "/v1/control/savesnapshot",
            &SnapshotNameRequest {
                snapshot_name: name.into(),
            },
        )
        .await
    }

    pub async fn load_snapshot(&self, req: LoadSnapshotRequest) -> Result<ClusterInfoResponse> {
        self.post("/v1/control/loadsnapshot", &req).await
    }

    pub async fn remove_snapshot(&self, name: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post(
                "/v1/control/removesnapshot",
                &SnapshotNameRequest {
                    snapshot_name: name.into(),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn get_snapshot_names(&self) -> Result<Vec<String>> {
        let resp: GetSnapshotNamesResponse = self
            .post("/v1/control/getsnapshotnames", &serde_json::json!({}))
            .await?;
        Ok(resp.snapshot_names)
    }

    /// Close the client. Idempotent; in-flight streams wind down.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_unreachable_endpoint_fails() {
        let result = Client::new("127.0.0.1:1", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        // Construct without dialing by building the struct directly.
        let client = Client {
            base_url: "http://127.0.0.1:1".into(),
            http: reqwest::Client::new(),
            user_agent: "netrunner-test".into(),
            closed: Arc::new(AtomicBool::new(false)),
        };
        client.close();
        client.close();
        let err = client.ping().await;
        assert!(err.is_err());
    }
}
