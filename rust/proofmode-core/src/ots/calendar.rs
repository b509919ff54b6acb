//! Client side of the OpenTimestamps calendar HTTP protocol.

use super::errors::DeserializeError;
use super::ser::Deserializer;
use super::timestamp::Timestamp;
use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CALENDAR_URLS: &[&str] = &[
    "https://a.pool.opentimestamps.org",
    "https://b.pool.opentimestamps.org",
    "https://a.pool.eternitywall.com",
    "https://ots.btc.catallaxy.com",
];

pub const DEFAULT_WHITELIST: &[&str] = &[
    "https://*.calendar.opentimestamps.org",
    "https://*.calendar.eternitywall.com",
    "https://*.calendar.catallaxy.com",
];

pub const MAX_RESPONSE_SIZE: usize = 10_000;
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_secs(20);

const ACCEPT_OTS: &str = "application/vnd.opentimestamps.v1";

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error("network error: {0}")]
    Network(String),
    #[error("calendar timed out")]
    Timeout,
    #[error("calendar returned HTTP {0}")]
    Http(u16),
    #[error("commitment not found")]
    CommitmentNotFound,
    #[error("calendar response exceeds {MAX_RESPONSE_SIZE} bytes")]
    ExceededSize,
    #[error("malformed calendar response: {0}")]
    Deserialize(#[from] DeserializeError),
    #[error("http client error: {0}")]
    Client(String),
}

/// A calendar server that aggregates digests and later answers with proofs.
#[async_trait]
pub trait Calendar: Send + Sync {
    fn url(&self) -> &str;

    /// Submits `digest` and returns the timestamp rooted at it, usually
    /// ending in a pending attestation.
    async fn submit(&self, digest: &[u8]) -> Result<Timestamp, CalendarError>;

    /// Fetches the current timestamp for a previously returned commitment.
    async fn get_timestamp(&self, commitment: &[u8]) -> Result<Timestamp, CalendarError>;
}

pub struct RemoteCalendar {
    url: String,
    client: reqwest::Client,
    signing_key: Option<SigningKey>,
}

impl RemoteCalendar {
    pub fn new(url: impl Into<String>) -> Result<Self, CalendarError> {
        // reqwest 0.11 only has a whole-request timeout; body reads are bounded
        // separately by READ_TIMEOUT.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(CONNECT_TIMEOUT + READ_TIMEOUT)
            .user_agent(concat!("proofmode-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CalendarError::Client(e.to_string()))?;

        Ok(Self {
            url: url.into().trim_end_matches('/').to_string(),
            client,
            signing_key: None,
        })
    }

    /// A private calendar that authenticates submissions with an ed25519 key.
    pub fn private(url: impl Into<String>, seed: &[u8; 32]) -> Result<Self, CalendarError> {
        let mut calendar = Self::new(url)?;
        calendar.signing_key = Some(SigningKey::from_bytes(seed));
        Ok(calendar)
    }

    fn signature_header(&self, digest: &[u8]) -> Option<String> {
        self.signing_key.as_ref().map(|key| {
            let signature = key.sign(hex::encode(digest).as_bytes());
            base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
        })
    }

    async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, CalendarError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(CalendarError::CommitmentNotFound);
        }
        if !status.is_success() {
            return Err(CalendarError::Http(status.as_u16()));
        }
        if response
            .content_length()
            .is_some_and(|len| len > MAX_RESPONSE_SIZE as u64)
        {
            return Err(CalendarError::ExceededSize);
        }

        tokio::time::timeout(READ_TIMEOUT, read_limited(response))
            .await
            .map_err(|_| CalendarError::Timeout)?
    }
}

async fn read_limited(mut response: reqwest::Response) -> Result<Vec<u8>, CalendarError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(network_error)? {
        if body.len() + chunk.len() > MAX_RESPONSE_SIZE {
            return Err(CalendarError::ExceededSize);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn network_error(e: reqwest::Error) -> CalendarError {
    if e.is_timeout() {
        CalendarError::Timeout
    } else {
        CalendarError::Network(e.to_string())
    }
}

/// Parses a calendar answer strictly: the whole body must be one timestamp.
pub fn parse_response(body: &[u8], msg: &[u8]) -> Result<Timestamp, CalendarError> {
    if body.len() > MAX_RESPONSE_SIZE {
        return Err(CalendarError::ExceededSize);
    }
    let mut de = Deserializer::from_slice(body);
    let timestamp = Timestamp::deserialize(&mut de, msg.to_vec())?;
    de.assert_eof()?;
    Ok(timestamp)
}

#[async_trait]
impl Calendar for RemoteCalendar {
    fn url(&self) -> &str {
        &self.url
    }

    async fn submit(&self, digest: &[u8]) -> Result<Timestamp, CalendarError> {
        let mut request = self
            .client
            .post(format!("{}/digest", self.url))
            .header(reqwest::header::ACCEPT, ACCEPT_OTS)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(digest.to_vec());
        if let Some(signature) = self.signature_header(digest) {
            request = request.header("x-signature", signature);
        }

        let response = request.send().await.map_err(network_error)?;
        let body = Self::read_body(response).await?;
        log::debug!("Calendar {} accepted {}", self.url, hex::encode(digest));
        parse_response(&body, digest)
    }

    async fn get_timestamp(&self, commitment: &[u8]) -> Result<Timestamp, CalendarError> {
        let response = self
            .client
            .get(format!("{}/timestamp/{}", self.url, hex::encode(commitment)))
            .header(reqwest::header::ACCEPT, ACCEPT_OTS)
            .send()
            .await
            .map_err(network_error)?;
        let body = Self::read_body(response).await?;
        parse_response(&body, commitment)
    }
}

/// Glob patterns deciding which calendar URIs may be contacted for upgrades.
#[derive(Debug, Clone)]
pub struct UrlWhitelist {
    patterns: Vec<glob::Pattern>,
}

impl UrlWhitelist {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p.as_ref()) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    log::warn!("Ignoring invalid calendar pattern {}: {e}", p.as_ref());
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn add(&mut self, pattern: &str) {
        match glob::Pattern::new(pattern) {
            Ok(p) => self.patterns.push(p),
            Err(e) => log::warn!("Ignoring invalid calendar pattern {pattern}: {e}"),
        }
    }

    pub fn contains(&self, url: &str) -> bool {
        let url = url.trim_end_matches('/');
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.patterns.iter().any(|p| p.matches_with(url, options))
    }
}

impl Default for UrlWhitelist {
    fn default() -> Self {
        Self::new(DEFAULT_WHITELIST)
    }
}
