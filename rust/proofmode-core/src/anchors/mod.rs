//! Notarization providers: services that turn a media digest into an
//! attestation stored next to the proof as `<hash>.<extension>`.

mod ots;

pub use ots::OtsNotarizer;

use crate::config::ProofModeConfig;
use crate::ots::{StampError, TimestampError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotarizeError {
    #[error(transparent)]
    Stamp(#[from] StampError),
    #[error(transparent)]
    Timestamp(#[from] TimestampError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("notarization timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait NotarizationProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Extension of the stored attestation, without the dot.
    fn file_extension(&self) -> &str;
    async fn notarize(&self, digest: &[u8; 32], media: &Path) -> Result<Vec<u8>, NotarizeError>;
}

pub type ProviderHandle = Arc<dyn NotarizationProvider>;

/// Outcome of one provider for one digest.
pub struct Notarization {
    pub provider: String,
    pub extension: String,
    pub result: Result<Vec<u8>, NotarizeError>,
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: Vec<ProviderHandle>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in providers enabled by `config`.
    pub fn from_config(config: &ProofModeConfig) -> Result<Self, StampError> {
        let mut registry = Self::new();
        if config.notarize_ots {
            registry.add_provider(Arc::new(OtsNotarizer::from_config(&config.calendars)?));
        }
        Ok(registry)
    }

    pub fn add_provider(&mut self, provider: ProviderHandle) {
        self.providers.push(provider);
    }

    pub fn providers(&self) -> &[ProviderHandle] {
        &self.providers
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Runs every provider concurrently, each bounded by `timeout`.
    /// Results come back in registration order.
    pub async fn notarize_all(
        &self,
        digest: &[u8; 32],
        media: &Path,
        timeout: Duration,
    ) -> Vec<Notarization> {
        let mut handles = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            let provider = Arc::clone(provider);
            let digest = *digest;
            let media: PathBuf = media.to_path_buf();
            handles.push(tokio::spawn(async move {
                let result =
                    match tokio::time::timeout(timeout, provider.notarize(&digest, &media)).await {
                        Ok(result) => result,
                        Err(_) => Err(NotarizeError::Timeout(timeout)),
                    };
                Notarization {
                    provider: provider.name().to_string(),
                    extension: provider.file_extension().to_string(),
                    result,
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, provider) in handles.into_iter().zip(&self.providers) {
            match handle.await {
                Ok(notarization) => results.push(notarization),
                Err(e) => {
                    log::error!("Notarizer {} panicked: {e}", provider.name());
                    results.push(Notarization {
                        provider: provider.name().to_string(),
                        extension: provider.file_extension().to_string(),
                        result: Err(NotarizeError::Io(std::io::Error::other(e.to_string()))),
                    });
                }
            }
        }
        results
    }
}
