//! Transfer gateways

use async_trait::async_trait;
use bidloop_core::PendingTransfer;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// What a gateway is asked to send
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Outbox id, doubles as the idempotency key on the network side
    pub transfer_id: String,
    pub source_wallet_id: String,
    pub destination_address: String,
    pub amount: Decimal,
    pub kind: String,
    pub reference_id: String,
}

impl From<&PendingTransfer> for TransferRequest {
    fn from(t: &PendingTransfer) -> Self {
        Self {
            transfer_id: t.id.to_string(),
            source_wallet_id: t.source_wallet_id.clone(),
            destination_address: t.destination_address.clone(),
            amount: t.amount,
            kind: t.kind.to_string(),
            reference_id: t.reference_id.clone(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transfer rejected: {0}")]
    Rejected(String),

    #[error("Invalid gateway response: {0}")]
    InvalidResponse(String),

    #[error("Operation timed out")]
    Timeout,
}

/// Submit a transfer, get back a transaction hash
#[async_trait]
pub trait TransferGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn is_connected(&self) -> bool;

    async fn submit_transfer(&self, request: &TransferRequest) -> Result<String, GatewayError>;
}

/// Gateway that never touches a network; hashes stand in for tx ids
#[derive(Clone, Debug, Default)]
pub struct DryRunGateway;

#[async_trait]
impl TransferGateway for DryRunGateway {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn is_connected(&self) -> bool {
        true
    }

    async fn submit_transfer(&self, request: &TransferRequest) -> Result<String, GatewayError> {
        if request.destination_address.trim().is_empty() {
            return Err(GatewayError::Rejected("empty destination address".into()));
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(request.transfer_id.as_bytes());
        hasher.update(request.destination_address.as_bytes());
        hasher.update(request.amount.to_string().as_bytes());
        Ok(format!("0x{}", hex::encode(hasher.finalize().as_bytes())))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpGatewayConfig {
    /// Endpoint accepting a JSON [`TransferRequest`]
    pub url: String,
    /// Bearer token, if the payout service wants one
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

#[derive(Deserialize)]
struct SubmitResponse {
    tx_hash: Option<String>,
    error: Option<String>,
}

/// Payout service reached over HTTP
pub struct HttpGateway {
    config: HttpGatewayConfig,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl TransferGateway for HttpGateway {
    fn name(&self) -> &str {
        "http"
    }

    async fn is_connected(&self) -> bool {
        self.client.head(&self.config.url).send().await.is_ok()
    }

    async fn submit_transfer(&self, request: &TransferRequest) -> Result<String, GatewayError> {
        let mut builder = self.client.post(&self.config.url).json(request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::ConnectionFailed(e.to_string())
            }
        })?;

        let status = response.status();
        let body: SubmitResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        if !status.is_success() {
            return Err(GatewayError::Rejected(
                body.error.unwrap_or_else(|| status.to_string()),
            ));
        }
        body.tx_hash
            .filter(|h| !h.is_empty())
            .ok_or_else(|| GatewayError::InvalidResponse("missing tx_hash".into()))
    }
}
