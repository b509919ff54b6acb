use super::{NotarizationProvider, NotarizeError};
use crate::config::CalendarConfig;
use crate::ots::{make_merkle_tree, DetachedTimestampFile, StampError, Stamper};
use async_trait::async_trait;
use std::path::Path;

/// Timestamps a digest on the OpenTimestamps calendars and returns the
/// `.ots` file bytes.
pub struct OtsNotarizer {
    stamper: Stamper,
}

impl OtsNotarizer {
    pub fn new(stamper: Stamper) -> Self {
        Self { stamper }
    }

    pub fn from_config(config: &CalendarConfig) -> Result<Self, StampError> {
        Ok(Self::new(Stamper::from_config(config)?))
    }

    pub fn stamper(&self) -> &Stamper {
        &self.stamper
    }
}

#[async_trait]
impl NotarizationProvider for OtsNotarizer {
    fn name(&self) -> &str {
        "OpenTimestamps"
    }

    fn file_extension(&self) -> &str {
        crate::bundle::OTS_EXTENSION
    }

    async fn notarize(&self, digest: &[u8; 32], _media: &Path) -> Result<Vec<u8>, NotarizeError> {
        // The nonce leaf keeps the digest itself away from the calendars.
        let mut tree = make_merkle_tree(&[digest])?;
        let mut root = tree.root_timestamp();
        let answered = self.stamper.stamp(&mut root).await?;
        tree.attach(&root)?;
        log::info!(
            "OpenTimestamps commitment for {} accepted by {answered} calendars",
            hex::encode(digest)
        );

        let leaf = tree
            .into_timestamps()
            .into_iter()
            .next()
            .ok_or(crate::ots::TimestampError::EmptyMerkleInput)?;
        Ok(DetachedTimestampFile::from_sha256(leaf)?.to_bytes()?)
    }
}
