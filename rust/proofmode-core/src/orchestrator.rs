//! Top-level sequencing: hash, collect metadata, write and sign the bundle,
//! then notarize.

use crate::anchors::{NotarizeError, ProviderRegistry};
use crate::bundle::{BundleError, ProofOutcome, ProofWriter};
use crate::config::ProofModeConfig;
use crate::hashing::{sha256_file, Digest32};
use crate::ots::{make_merkle_tree, DetachedTimestampFile, StampError, Stamper};
use crate::record::{poll_location, MetadataSource, ProofRecordBuilder, StaticMetadata};
use crate::signing::Keystore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug)]
pub struct NotarizationFailure {
    pub provider: String,
    pub error: NotarizeError,
}

#[derive(Debug)]
pub struct GeneratedProof {
    pub digest: Digest32,
    pub outcome: ProofOutcome,
    /// Stored `<hash>.<ext>` files.
    pub notarizations: Vec<PathBuf>,
    pub notarization_errors: Vec<NotarizationFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StampedFile {
    pub path: PathBuf,
    pub digest: String,
    #[serde(skip)]
    pub ots: Vec<u8>,
}

pub struct ProofModeOrchestrator {
    config: ProofModeConfig,
    writer: ProofWriter,
    metadata: Arc<dyn MetadataSource>,
    registry: ProviderRegistry,
    stamper: Option<Stamper>,
}

impl ProofModeOrchestrator {
    pub fn new(
        config: ProofModeConfig,
        keystore: Arc<dyn Keystore>,
        metadata: Arc<dyn MetadataSource>,
        registry: ProviderRegistry,
    ) -> Self {
        let writer = ProofWriter::new(config.proofs_dir(), keystore);
        Self {
            config,
            writer,
            metadata,
            registry,
            stamper: None,
        }
    }

    /// Host metadata, the configured notarizers and a calendar stamper.
    pub fn from_config(
        config: ProofModeConfig,
        keystore: Arc<dyn Keystore>,
    ) -> Result<Self, StampError> {
        let registry = ProviderRegistry::from_config(&config)?;
        let stamper = Stamper::from_config(&config.calendars)?;
        Ok(Self::new(config, keystore, Arc::new(StaticMetadata::host()), registry)
            .with_stamper(stamper))
    }

    pub fn with_stamper(mut self, stamper: Stamper) -> Self {
        self.stamper = Some(stamper);
        self
    }

    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &ProofModeConfig {
        &self.config
    }

    pub fn writer(&self) -> &ProofWriter {
        &self.writer
    }

    /// Proves `media`. Notarizer failures are reported in the result and
    /// never undo the signed bundle.
    pub async fn generate_proof(
        &self,
        media: &Path,
        notes: Option<&str>,
    ) -> Result<GeneratedProof, BundleError> {
        let digest = sha256_file(media)?;
        let modified: DateTime<Utc> = fs::metadata(media)?.modified()?.into();
        log::info!("Generating proof for {} ({})", media.display(), hex::encode(digest));

        let settings = &self.config.metadata;
        let location = if settings.track_location {
            poll_location(
                self.metadata.as_ref(),
                settings.location_poll_attempts,
                settings.location_poll_interval(),
            )
            .await
        } else {
            None
        };
        let cell_info = if settings.track_cell_info {
            self.metadata.cell_info()
        } else {
            None
        };

        let mut builder =
            ProofRecordBuilder::new(digest, media.display().to_string(), modified, Utc::now())
                .device(self.metadata.device())
                .location(location)
                .cell_info(cell_info)
                .safety_check(self.metadata.safety_check())
                .track_device_id(settings.track_device_id);
        if let Some(notes) = notes {
            builder = builder.notes(notes);
        }
        let record = builder.build();

        let outcome = self.writer.write_proof(&digest, &record, media)?;

        let mut notarizations = Vec::new();
        let mut notarization_errors = Vec::new();
        if !self.registry.is_empty() {
            let results = self
                .registry
                .notarize_all(&digest, media, self.config.notarize_timeout())
                .await;
            for n in results {
                match n.result {
                    Ok(bytes) => {
                        match self.writer.write_notarization(&digest, &n.extension, &bytes) {
                            Ok(path) => notarizations.push(path),
                            Err(e) => {
                                log::error!("Could not store {} notarization: {e}", n.provider);
                                notarization_errors.push(NotarizationFailure {
                                    provider: n.provider,
                                    error: NotarizeError::Io(std::io::Error::other(e.to_string())),
                                });
                            }
                        }
                    }
                    Err(error) => {
                        log::warn!("Notarization by {} failed: {error}", n.provider);
                        notarization_errors.push(NotarizationFailure {
                            provider: n.provider,
                            error,
                        });
                    }
                }
            }
        }

        Ok(GeneratedProof {
            digest,
            outcome,
            notarizations,
            notarization_errors,
        })
    }

    /// Timestamps several files with a single calendar round trip.
    pub async fn stamp_files(&self, paths: &[PathBuf]) -> Result<Vec<StampedFile>, NotarizeError> {
        let stamper = self.stamper.as_ref().ok_or(StampError::NoCalendars)?;
        stamp_files(stamper, paths).await
    }
}

/// Builds one Merkle tree over `paths`, stamps its root and returns the
/// `.ots` bytes of every file. Nothing is written to disk.
pub async fn stamp_files(
    stamper: &Stamper,
    paths: &[PathBuf],
) -> Result<Vec<StampedFile>, NotarizeError> {
    let digests = paths
        .iter()
        .map(sha256_file)
        .collect::<Result<Vec<_>, _>>()?;

    let mut tree = make_merkle_tree(digests.as_slice())?;
    let mut root = tree.root_timestamp();
    stamper.stamp(&mut root).await?;
    tree.attach(&root)?;

    let mut stamped = Vec::with_capacity(paths.len());
    for ((path, digest), leaf) in paths.iter().zip(&digests).zip(tree.into_timestamps()) {
        stamped.push(StampedFile {
            path: path.clone(),
            digest: hex::encode(digest),
            ots: DetachedTimestampFile::from_sha256(leaf)?.to_bytes()?,
        });
    }
    log::info!("Stamped {} files in one commitment", stamped.len());
    Ok(stamped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::{NotarizationProvider, NotarizeError};
    use crate::bundle::verify_bundle;
    use crate::ots::{Attestation, Calendar, CalendarError, Timestamp};
    use crate::record::LocationMetadata;
    use crate::signing::{test_keys, FileKeystore};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct PendingCalendar;

    #[async_trait]
    impl Calendar for PendingCalendar {
        fn url(&self) -> &str {
            "https://b.pool.opentimestamps.org"
        }

        async fn submit(&self, digest: &[u8]) -> Result<Timestamp, CalendarError> {
            let mut stamp = Timestamp::new(digest.to_vec());
            stamp.add_attestation(Attestation::Pending {
                uri: self.url().to_string(),
            });
            Ok(stamp)
        }

        async fn get_timestamp(&self, _commitment: &[u8]) -> Result<Timestamp, CalendarError> {
            Err(CalendarError::CommitmentNotFound)
        }
    }

    struct Broken;

    #[async_trait]
    impl NotarizationProvider for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn file_extension(&self) -> &str {
            "gst"
        }

        async fn notarize(&self, _digest: &[u8; 32], _media: &Path) -> Result<Vec<u8>, NotarizeError> {
            Err(NotarizeError::Io(std::io::Error::other("attestation service down")))
        }
    }

    fn orchestrator(tmp: &TempDir, metadata: StaticMetadata) -> ProofModeOrchestrator {
        let (key, _) = test_keys::pair();
        let keystore = FileKeystore::import(
            &tmp.path().join("keys"),
            test_keys::PASSPHRASE,
            "ProofMode <o@h>",
            key.clone(),
        )
        .unwrap();
        let mut config = ProofModeConfig::default_with_dir(tmp.path());
        config.metadata.location_poll_attempts = 1;
        config.metadata.location_poll_interval_ms = 1;
        config.notarize_timeout_secs = 5;

        let stamper = Stamper::new(vec![Arc::new(PendingCalendar)], None).unwrap();
        let mut registry = ProviderRegistry::new();
        registry.add_provider(Arc::new(crate::anchors::OtsNotarizer::new(
            Stamper::new(vec![Arc::new(PendingCalendar)], None).unwrap(),
        )));
        registry.add_provider(Arc::new(Broken));

        ProofModeOrchestrator::new(config, Arc::new(keystore), Arc::new(metadata), registry)
            .with_stamper(stamper)
    }

    fn media(tmp: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = tmp.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    #[tokio::test]
    async fn test_generate_proof_with_notarizations() {
        let tmp = TempDir::new().unwrap();
        let location = LocationMetadata {
            latitude: 52.52,
            longitude: 13.405,
            ..LocationMetadata::default()
        };
        let orch = orchestrator(
            &tmp,
            StaticMetadata {
                location: Some(location),
                cell_info: Some("lte".into()),
                ..StaticMetadata::host()
            },
        );
        let photo = media(&tmp, "photo.jpg", b"jpeg bytes");

        let proof = orch.generate_proof(&photo, Some("at the square")).await.unwrap();
        assert_eq!(proof.notarizations.len(), 1);
        assert!(proof.notarizations[0].extension().is_some_and(|e| e == "ots"));
        assert_eq!(proof.notarization_errors.len(), 1);
        assert_eq!(proof.notarization_errors[0].provider, "broken");

        let hash = hex::encode(proof.digest);
        let csv = fs::read_to_string(proof.outcome.bundle_dir.join(format!("{hash}.proof.csv")))
            .unwrap();
        assert!(csv.contains("52.52"));
        assert!(csv.contains("lte"));
        assert!(csv.contains("at the square"));

        let v = verify_bundle(&proof.outcome.bundle_dir, &hash, &photo).unwrap();
        assert!(v.verified);
        assert_eq!(v.notarizations, ["ots"]);
        assert!(v.ots[0].digest_matches);
    }

    #[tokio::test]
    async fn test_location_tracking_disabled() {
        let tmp = TempDir::new().unwrap();
        let mut orch = orchestrator(
            &tmp,
            StaticMetadata {
                location: Some(LocationMetadata {
                    latitude: 48.8566,
                    ..LocationMetadata::default()
                }),
                ..StaticMetadata::default()
            },
        )
        .with_registry(ProviderRegistry::new());
        orch.config.metadata.track_location = false;
        let photo = media(&tmp, "a.png", b"png");

        let proof = orch.generate_proof(&photo, None).await.unwrap();
        assert!(proof.notarizations.is_empty());
        let hash = hex::encode(proof.digest);
        let json = fs::read_to_string(proof.outcome.bundle_dir.join(format!("{hash}.proof.json")))
            .unwrap();
        assert!(!json.contains("48.8566"));
    }

    #[tokio::test]
    async fn test_missing_media_fails_loudly() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp, StaticMetadata::default());
        let err = orch
            .generate_proof(&tmp.path().join("nope.jpg"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::Io(_)));
    }

    #[tokio::test]
    async fn test_stamp_files_shares_one_commitment() {
        let tmp = TempDir::new().unwrap();
        let orch = orchestrator(&tmp, StaticMetadata::default());
        let paths = vec![
            media(&tmp, "1.txt", b"one"),
            media(&tmp, "2.txt", b"two"),
            media(&tmp, "3.txt", b"three"),
        ];

        let stamped = orch.stamp_files(&paths).await.unwrap();
        assert_eq!(stamped.len(), 3);
        for file in &stamped {
            let ots = DetachedTimestampFile::from_bytes(&file.ots).unwrap();
            assert_eq!(hex::encode(ots.file_digest()), file.digest);
            assert_eq!(ots.timestamp().all_attestations().len(), 1);
        }
        let err = orch.stamp_files(&[tmp.path().join("missing")]).await.unwrap_err();
        assert!(matches!(err, NotarizeError::Io(_)));
    }
}
