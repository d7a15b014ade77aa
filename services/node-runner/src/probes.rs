//! Reachability probes for the services the node depends on.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Probes run by the start-up check.
#[async_trait]
pub trait EnvironmentProbe: Send + Sync {
    /// Call `eth_blockNumber` on a JSON-RPC endpoint and return the block number.
    async fn check_json_rpc(&self, url: &str) -> Result<u64>;

    /// Submit a no-op alert batch to the publishing API.
    async fn post_test_batch(&self, api_url: &str) -> Result<()>;
}

/// Alert batch request body.
#[derive(Debug, Serialize)]
pub struct AlertBatchRequest {
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Probe implementation over HTTP.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl EnvironmentProbe for HttpProbe {
    async fn check_json_rpc(&self, url: &str) -> Result<u64> {
        debug!(url, "Probing JSON-RPC endpoint");

        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_blockNumber",
            "params": [],
        });
        let response = self.client.post(url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("JSON-RPC endpoint returned {}: {}", status, body);
        }

        let payload: JsonRpcResponse = response.json().await?;
        if let Some(error) = payload.error {
            anyhow::bail!("JSON-RPC error {}: {}", error.code, error.message);
        }
        let result = payload.result.context("JSON-RPC response has no result")?;
        parse_hex_quantity(&result)
    }

    async fn post_test_batch(&self, api_url: &str) -> Result<()> {
        let url = format!("{}/batch", api_url.trim_end_matches('/'));
        debug!(url = %url, "Probing alert batch API");

        let request = AlertBatchRequest {
            reference: "test".to_string(),
        };
        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("batch API returned {}: {}", status, body);
        }
        Ok(())
    }
}

/// Parse a `0x`-prefixed JSON-RPC quantity.
fn parse_hex_quantity(value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .with_context(|| format!("quantity is not hex: {value}"))?;
    u64::from_str_radix(digits, 16).with_context(|| format!("invalid quantity: {value}"))
}
