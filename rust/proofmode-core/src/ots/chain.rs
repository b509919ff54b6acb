//! Verification of block header attestations against a blockchain.

use super::attestation::{Attestation, Chain};
use super::timestamp::Timestamp;
use crate::config::ChainConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BITCOIN_EXPLORER: &str = "https://blockstream.info/api";
pub const DEFAULT_LITECOIN_EXPLORER: &str = "https://litecoinspace.org/api";

const SOURCE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ChainError {
    /// The block exists but commits to something else. Never retried.
    #[error("{chain} block {height} merkle root does not match the attested digest")]
    MerkleMismatch { chain: Chain, height: u64 },
    #[error("no block header source reachable: {0}")]
    Unreachable(String),
    #[error("unsupported attestation: {0}")]
    Unsupported(String),
    #[error("attested digest must be 32 bytes, got {0}")]
    InvalidDigestLength(usize),
    #[error("invalid block header response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    FullNode,
    LiteClient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: String,
    /// Merkle root in display (byte-reversed) hex.
    pub merkle_root: String,
    pub time: i64,
}

#[async_trait]
pub trait BlockHeaderSource: Send + Sync {
    fn name(&self) -> &str;
    fn trust(&self) -> TrustLevel;
    fn supports(&self, chain: Chain) -> bool;
    async fn block_header(&self, chain: Chain, height: u64) -> Result<BlockHeader, ChainError>;
}

fn http_client() -> Result<reqwest::Client, ChainError> {
    reqwest::Client::builder()
        .timeout(SOURCE_TIMEOUT)
        .build()
        .map_err(|e| ChainError::Unreachable(e.to_string()))
}

pub struct BitcoinRpcSource {
    rpc_url: String,
    rpc_user: String,
    rpc_password: String,
    client: reqwest::Client,
}

impl BitcoinRpcSource {
    pub fn new(rpc_url: String, rpc_user: String, rpc_password: String) -> Result<Self, ChainError> {
        Ok(Self {
            rpc_url,
            rpc_user,
            rpc_password,
            client: http_client()?,
        })
    }

    /// Reads `BITCOIN_RPC_URL`, `BITCOIN_RPC_USER` and `BITCOIN_RPC_PASSWORD`.
    pub fn from_env() -> Option<Self> {
        let rpc_url = std::env::var("BITCOIN_RPC_URL").ok()?;
        let rpc_user = std::env::var("BITCOIN_RPC_USER").unwrap_or_default();
        let rpc_password = std::env::var("BITCOIN_RPC_PASSWORD").unwrap_or_default();
        Self::new(rpc_url, rpc_user, rpc_password).ok()
    }

    async fn rpc_call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ChainError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "proofmode",
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .basic_auth(&self.rpc_user, Some(&self.rpc_password))
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;

        if let Some(error) = result.get("error") {
            if !error.is_null() {
                return Err(ChainError::InvalidResponse(error.to_string()));
            }
        }

        Ok(result["result"].clone())
    }
}

#[async_trait]
impl BlockHeaderSource for BitcoinRpcSource {
    fn name(&self) -> &str {
        "bitcoin-rpc"
    }

    fn trust(&self) -> TrustLevel {
        TrustLevel::FullNode
    }

    fn supports(&self, chain: Chain) -> bool {
        chain == Chain::Bitcoin
    }

    async fn block_header(&self, _chain: Chain, height: u64) -> Result<BlockHeader, ChainError> {
        let hash = self
            .rpc_call("getblockhash", serde_json::json!([height]))
            .await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse("getblockhash: not a string".into()))?
            .to_string();

        let header = self
            .rpc_call("getblockheader", serde_json::json!([hash, true]))
            .await?;
        let merkle_root = header["merkleroot"]
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse("getblockheader: no merkleroot".into()))?
            .to_string();
        let time = header["time"]
            .as_i64()
            .ok_or_else(|| ChainError::InvalidResponse("getblockheader: no time".into()))?;

        Ok(BlockHeader {
            hash,
            merkle_root,
            time,
        })
    }
}

/// Block explorer speaking the Esplora REST API.
pub struct EsploraSource {
    chain: Chain,
    base_url: String,
    client: reqwest::Client,
}

impl EsploraSource {
    pub fn new(chain: Chain, base_url: impl Into<String>) -> Result<Self, ChainError> {
        Ok(Self {
            chain,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: http_client()?,
        })
    }

    pub fn bitcoin(base_url: Option<&str>) -> Result<Self, ChainError> {
        Self::new(Chain::Bitcoin, base_url.unwrap_or(DEFAULT_BITCOIN_EXPLORER))
    }

    pub fn litecoin(base_url: Option<&str>) -> Result<Self, ChainError> {
        Self::new(Chain::Litecoin, base_url.unwrap_or(DEFAULT_LITECOIN_EXPLORER))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ChainError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChainError::Unreachable(format!(
                "{} returned {}",
                self.base_url,
                response.status()
            )));
        }
        Ok(response)
    }
}

#[derive(Deserialize)]
struct EsploraBlock {
    id: String,
    merkle_root: String,
    timestamp: i64,
}

#[async_trait]
impl BlockHeaderSource for EsploraSource {
    fn name(&self) -> &str {
        &self.base_url
    }

    fn trust(&self) -> TrustLevel {
        TrustLevel::LiteClient
    }

    fn supports(&self, chain: Chain) -> bool {
        chain == self.chain
    }

    async fn block_header(&self, _chain: Chain, height: u64) -> Result<BlockHeader, ChainError> {
        let hash = self
            .get(&format!("/block-height/{height}"))
            .await?
            .text()
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;
        let block: EsploraBlock = self
            .get(&format!("/block/{}", hash.trim()))
            .await?
            .json()
            .await
            .map_err(|e| ChainError::InvalidResponse(e.to_string()))?;

        Ok(BlockHeader {
            hash: block.id,
            merkle_root: block.merkle_root,
            time: block.timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedAttestation {
    pub chain: Chain,
    pub height: u64,
    pub time: DateTime<Utc>,
    pub trust: TrustLevel,
    pub source: String,
}

/// Header sources tried in order; full nodes should come first.
pub struct ChainVerifier {
    sources: Vec<Arc<dyn BlockHeaderSource>>,
}

impl ChainVerifier {
    pub fn new(sources: Vec<Arc<dyn BlockHeaderSource>>) -> Self {
        Self { sources }
    }

    pub fn from_config(config: &ChainConfig) -> Result<Self, ChainError> {
        let mut sources: Vec<Arc<dyn BlockHeaderSource>> = Vec::new();

        let rpc = match &config.bitcoin_rpc_url {
            Some(url) => Some(BitcoinRpcSource::new(
                url.clone(),
                config.bitcoin_rpc_user.clone().unwrap_or_default(),
                config.bitcoin_rpc_password.clone().unwrap_or_default(),
            )?),
            None => BitcoinRpcSource::from_env(),
        };
        if let Some(rpc) = rpc {
            sources.push(Arc::new(rpc));
        }

        sources.push(Arc::new(EsploraSource::bitcoin(
            config.bitcoin_explorer_url.as_deref(),
        )?));
        sources.push(Arc::new(EsploraSource::litecoin(
            config.litecoin_explorer_url.as_deref(),
        )?));
        Ok(Self::new(sources))
    }

    pub async fn verify_attestation(
        &self,
        attestation: &Attestation,
        msg: &[u8],
    ) -> Result<VerifiedAttestation, ChainError> {
        let (chain, height) = attestation
            .block()
            .ok_or_else(|| ChainError::Unsupported(attestation.to_string()))?;
        if chain == Chain::Ethereum {
            return Err(ChainError::Unsupported(attestation.to_string()));
        }
        if msg.len() != 32 {
            return Err(ChainError::InvalidDigestLength(msg.len()));
        }
        let expected: Vec<u8> = msg.iter().rev().copied().collect();

        let mut last_error = None;
        for source in self.sources.iter().filter(|s| s.supports(chain)) {
            let header = match source.block_header(chain, height).await {
                Ok(header) => header,
                Err(e) => {
                    log::warn!("{} could not fetch {chain} block {height}: {e}", source.name());
                    last_error = Some(e);
                    continue;
                }
            };

            let merkle_root = match hex::decode(header.merkle_root.trim()) {
                Ok(root) => root,
                Err(e) => {
                    log::warn!("{} returned a bad merkle root: {e}", source.name());
                    last_error = Some(ChainError::InvalidResponse(e.to_string()));
                    continue;
                }
            };
            if merkle_root != expected {
                return Err(ChainError::MerkleMismatch { chain, height });
            }

            let trust = source.trust();
            if trust == TrustLevel::LiteClient {
                log::info!(
                    "{chain} block {height} verified by {} (lite client, not a full node)",
                    source.name()
                );
            }
            let time = DateTime::from_timestamp(header.time, 0).ok_or_else(|| {
                ChainError::InvalidResponse(format!("block time {} out of range", header.time))
            })?;
            return Ok(VerifiedAttestation {
                chain,
                height,
                time,
                trust,
                source: source.name().to_string(),
            });
        }

        Err(ChainError::Unreachable(match last_error {
            Some(e) => e.to_string(),
            None => format!("no source configured for {chain}"),
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Unverifiable {
    pub attestation: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimestampVerification {
    pub verified: Vec<VerifiedAttestation>,
    pub pending: Vec<String>,
    pub unverifiable: Vec<Unverifiable>,
}

impl TimestampVerification {
    pub fn is_verified(&self) -> bool {
        !self.verified.is_empty()
    }

    /// Earliest time the message is proven to have existed.
    pub fn earliest(&self) -> Option<&VerifiedAttestation> {
        self.verified.iter().min_by_key(|v| v.time)
    }
}

/// Checks every attestation in the tree. A merkle mismatch anywhere aborts.
pub async fn verify_timestamp(
    timestamp: &Timestamp,
    verifier: &ChainVerifier,
) -> Result<TimestampVerification, ChainError> {
    let mut result = TimestampVerification::default();

    for (msg, attestation) in timestamp.all_attestations() {
        if let Attestation::Pending { uri } = &attestation {
            result.pending.push(uri.clone());
            continue;
        }
        match verifier.verify_attestation(&attestation, &msg).await {
            Ok(verified) => result.verified.push(verified),
            Err(e @ ChainError::MerkleMismatch { .. }) => return Err(e),
            Err(e) => result.unverifiable.push(Unverifiable {
                attestation: attestation.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    Ok(result)
}
