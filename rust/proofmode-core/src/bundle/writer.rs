use super::{
    csv_name, csv_signature_name, json_name, json_signature_name, media_signature_name,
    notarization_name, BundleError, BundleStep, PUBLIC_KEY_NAME,
};
use crate::record::{ProofRecord, DELIMITER};
use crate::signing::Keystore;
use dashmap::DashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone)]
pub struct ProofOutcome {
    pub digest: String,
    pub bundle_dir: PathBuf,
    /// False when an existing media signature was kept.
    pub media_signed: bool,
    pub files_written: Vec<PathBuf>,
}

/// Writes bundles under `root/<hash>/`, one writer per digest at a time.
pub struct ProofWriter {
    root: PathBuf,
    keystore: Arc<dyn Keystore>,
    locks: DashMap<[u8; 32], Arc<Mutex<()>>>,
}

impl ProofWriter {
    pub fn new(root: impl Into<PathBuf>, keystore: Arc<dyn Keystore>) -> Self {
        Self {
            root: root.into(),
            keystore,
            locks: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keystore(&self) -> &Arc<dyn Keystore> {
        &self.keystore
    }

    pub fn bundle_dir(&self, digest: &[u8; 32]) -> PathBuf {
        self.root.join(hex::encode(digest))
    }

    fn lock_for(&self, digest: &[u8; 32]) -> Arc<Mutex<()>> {
        Arc::clone(&self.locks.entry(*digest).or_default())
    }

    /// Appends `record` to the bundle of `digest` and refreshes the
    /// signatures. The media file is only signed the first time.
    ///
    /// A failing step leaves earlier files in place.
    pub fn write_proof(
        &self,
        digest: &[u8; 32],
        record: &ProofRecord,
        media: &Path,
    ) -> Result<ProofOutcome, BundleError> {
        let lock = self.lock_for(digest);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let hash = hex::encode(digest);
        let dir = self.bundle_dir(digest);
        let mut outcome = ProofOutcome {
            digest: hash.clone(),
            bundle_dir: dir.clone(),
            media_signed: false,
            files_written: Vec::new(),
        };

        let result = self.write_steps(&hash, &dir, record, media, &mut outcome);
        match result {
            Ok(()) => {
                log::info!(
                    "Proof written for {hash} ({} files)",
                    outcome.files_written.len()
                );
                Ok(outcome)
            }
            Err((step, e)) => {
                log::error!("Proof for {hash} incomplete at '{step}': {e}");
                Err(BundleError::Incomplete {
                    step,
                    source: Box::new(e),
                })
            }
        }
    }

    fn write_steps(
        &self,
        hash: &str,
        dir: &Path,
        record: &ProofRecord,
        media: &Path,
        outcome: &mut ProofOutcome,
    ) -> Result<(), (BundleStep, BundleError)> {
        let at = |step: BundleStep| move |e: BundleError| (step, e);

        fs::create_dir_all(dir)
            .map_err(BundleError::from)
            .map_err(at(BundleStep::AppendCsv))?;

        let csv_path = dir.join(csv_name(hash));
        append_csv(&csv_path, record).map_err(at(BundleStep::AppendCsv))?;
        outcome.files_written.push(csv_path.clone());

        let json_path = dir.join(json_name(hash));
        let json = record
            .to_json()
            .map_err(BundleError::from)
            .map_err(at(BundleStep::AppendJson))?;
        append_line(&json_path, &json).map_err(at(BundleStep::AppendJson))?;
        outcome.files_written.push(json_path.clone());

        let csv_sig = dir.join(csv_signature_name(hash));
        self.sign_file(&csv_path, &csv_sig)
            .map_err(at(BundleStep::SignCsv))?;
        outcome.files_written.push(csv_sig);

        let json_sig = dir.join(json_signature_name(hash));
        self.sign_file(&json_path, &json_sig)
            .map_err(at(BundleStep::SignJson))?;
        outcome.files_written.push(json_sig);

        let media_sig = dir.join(media_signature_name(hash));
        if !media_sig.exists() {
            self.sign_file(media, &media_sig)
                .map_err(at(BundleStep::SignMedia))?;
            outcome.media_signed = true;
            outcome.files_written.push(media_sig);
        } else {
            log::debug!("Keeping existing media signature for {hash}");
        }

        let pubkey = dir.join(PUBLIC_KEY_NAME);
        if !pubkey.exists() {
            fs::write(&pubkey, self.keystore.public_key_armored())
                .map_err(BundleError::from)
                .map_err(at(BundleStep::WritePublicKey))?;
            outcome.files_written.push(pubkey);
        }

        Ok(())
    }

    fn sign_file(&self, content: &Path, signature_path: &Path) -> Result<(), BundleError> {
        let mut file = File::open(content)?;
        let signature = self.keystore.sign(&mut file)?;
        fs::write(signature_path, signature.to_armored()?)?;
        Ok(())
    }

    /// Stores a notarization next to the proof as `<hash>.<extension>`.
    pub fn write_notarization(
        &self,
        digest: &[u8; 32],
        extension: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, BundleError> {
        if extension.is_empty()
            || !extension
                .chars()
                .all(|c| c.is_ascii_alphanumeric())
        {
            return Err(BundleError::InvalidExtension(extension.to_string()));
        }

        let lock = self.lock_for(digest);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let dir = self.bundle_dir(digest);
        fs::create_dir_all(&dir)?;
        let path = dir.join(notarization_name(&hex::encode(digest), extension));
        fs::write(&path, bytes)?;
        log::info!("Stored {extension} notarization at {}", path.display());
        Ok(path)
    }
}

/// Rows always follow the header already in the file. Fields the header
/// lacks are only kept in the json record.
fn append_csv(path: &Path, record: &ProofRecord) -> Result<(), BundleError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    let line = if file.metadata()?.len() == 0 {
        record.to_csv(true)
    } else {
        let mut header = String::new();
        BufReader::new(&file).read_line(&mut header)?;
        let header = header.trim_end_matches(['\r', '\n']);
        if record.csv_header().trim_end() == header {
            record.to_csv(false)
        } else {
            log::warn!(
                "Record columns differ from the header of {}, aligning to the header",
                path.display()
            );
            let columns: Vec<&str> = header.split(DELIMITER).collect();
            record.to_csv_row(&columns)
        }
    };

    file.write_all(line.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn append_line(path: &Path, line: &str) -> Result<(), BundleError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")?;
    file.sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{verify_bundle, BundleFailure};
    use crate::hashing::sha256_file;
    use crate::record::{DeviceMetadata, ProofRecordBuilder};
    use crate::signing::{test_keys, FileKeystore};
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        writer: ProofWriter,
        media: PathBuf,
        digest: [u8; 32],
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let (key, _) = test_keys::pair();
        let keystore = FileKeystore::import(
            &tmp.path().join("keys"),
            test_keys::PASSPHRASE,
            "ProofMode <t@h>",
            key.clone(),
        )
        .unwrap();
        let media = tmp.path().join("photo.jpg");
        fs::write(&media, b"\xff\xd8\xff\xe0 fake jpeg bytes").unwrap();
        let digest = sha256_file(&media).unwrap();
        let writer = ProofWriter::new(tmp.path().join("proofs"), Arc::new(keystore));
        Fixture {
            _tmp: tmp,
            writer,
            media,
            digest,
        }
    }

    fn record(f: &Fixture, notes: &str) -> ProofRecord {
        ProofRecordBuilder::new(f.digest, f.media.display().to_string(), Utc::now(), Utc::now())
            .notes(notes)
            .build()
    }

    #[test]
    fn test_first_proof_writes_every_file() {
        let f = fixture();
        let outcome = f.writer.write_proof(&f.digest, &record(&f, "first"), &f.media).unwrap();
        assert!(outcome.media_signed);
        assert_eq!(outcome.files_written.len(), 6);

        let hash = hex::encode(f.digest);
        for name in [
            media_signature_name(&hash),
            csv_name(&hash),
            csv_signature_name(&hash),
            json_name(&hash),
            json_signature_name(&hash),
            PUBLIC_KEY_NAME.to_string(),
        ] {
            assert!(outcome.bundle_dir.join(&name).exists(), "{name} missing");
        }
    }

    #[test]
    fn test_reproof_keeps_media_signature_and_appends() {
        let f = fixture();
        let first = f.writer.write_proof(&f.digest, &record(&f, "one"), &f.media).unwrap();
        let hash = hex::encode(f.digest);
        let media_sig = first.bundle_dir.join(media_signature_name(&hash));
        let before = fs::read(&media_sig).unwrap();

        let second = f.writer.write_proof(&f.digest, &record(&f, "two"), &f.media).unwrap();
        assert!(!second.media_signed);
        assert_eq!(fs::read(&media_sig).unwrap(), before);

        let csv = fs::read_to_string(first.bundle_dir.join(csv_name(&hash))).unwrap();
        assert_eq!(csv.lines().count(), 3);
        assert!(csv.lines().next().unwrap().starts_with("File Path,"));
        let json = fs::read_to_string(first.bundle_dir.join(json_name(&hash))).unwrap();
        assert_eq!(json.lines().count(), 2);

        // the csv signature covers the whole, appended file
        let verification = verify_bundle(&first.bundle_dir, &hash, &f.media).unwrap();
        assert!(verification.verified, "{:?}", verification.failure);
    }

    #[test]
    fn test_reproof_with_other_columns_follows_header() {
        let f = fixture();
        let plain = record(&f, "without id");
        f.writer.write_proof(&f.digest, &plain, &f.media).unwrap();

        let with_id = ProofRecordBuilder::new(
            f.digest,
            f.media.display().to_string(),
            Utc::now(),
            Utc::now(),
        )
        .track_device_id(true)
        .device(Some(DeviceMetadata {
            device_id: "device-42".into(),
            hardware: "pixel".into(),
            ..DeviceMetadata::default()
        }))
        .notes("with id")
        .build();
        assert_ne!(with_id.csv_header(), plain.csv_header());
        f.writer.write_proof(&f.digest, &with_id, &f.media).unwrap();

        let hash = hex::encode(f.digest);
        let dir = f.writer.bundle_dir(&f.digest);
        let csv = fs::read_to_string(dir.join(csv_name(&hash))).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(format!("{}\n", lines[0]), plain.csv_header());

        let header: Vec<&str> = lines[0].split(',').collect();
        let row: Vec<&str> = lines[2].split(',').collect();
        assert_eq!(row.len(), header.len());
        let column = |name: &str| row[header.iter().position(|h| *h == name).unwrap()];
        assert_eq!(column("Notes"), "with id");
        assert_eq!(column("Hardware"), "pixel");
        assert!(!lines[2].contains("device-42"));

        // the json line keeps every field
        let json = fs::read_to_string(dir.join(json_name(&hash))).unwrap();
        assert!(json.lines().nth(1).unwrap().contains("\"DeviceID\":\"device-42\""));
        assert!(verify_bundle(&dir, &hash, &f.media).unwrap().verified);
    }

    #[test]
    fn test_missing_media_leaves_partial_bundle() {
        let f = fixture();
        let missing = f.media.with_file_name("gone.jpg");
        let err = f.writer.write_proof(&f.digest, &record(&f, "x"), &missing).unwrap_err();
        assert!(matches!(
            err,
            BundleError::Incomplete {
                step: BundleStep::SignMedia,
                ..
            }
        ));

        let hash = hex::encode(f.digest);
        let dir = f.writer.bundle_dir(&f.digest);
        assert!(dir.join(csv_signature_name(&hash)).exists());
        assert!(!dir.join(media_signature_name(&hash)).exists());
        let verification = verify_bundle(&dir, &hash, &f.media).unwrap();
        assert_eq!(
            verification.failure,
            Some(BundleFailure::MissingEntry(crate::bundle::EntryKind::MediaSignature))
        );
    }

    #[test]
    fn test_write_notarization() {
        let f = fixture();
        let path = f.writer.write_notarization(&f.digest, "ots", b"proof").unwrap();
        assert!(path.ends_with(format!("{}.ots", hex::encode(f.digest))));
        assert_eq!(fs::read(path).unwrap(), b"proof");
        assert!(matches!(
            f.writer.write_notarization(&f.digest, "../x", b""),
            Err(BundleError::InvalidExtension(_))
        ));
    }

    #[test]
    fn test_concurrent_writers_serialize_per_digest() {
        let f = fixture();
        let records: Vec<ProofRecord> = (0..8).map(|i| record(&f, &format!("n{i}"))).collect();
        std::thread::scope(|scope| {
            for r in &records {
                let f = &f;
                scope.spawn(move || f.writer.write_proof(&f.digest, r, &f.media).unwrap());
            }
        });

        let hash = hex::encode(f.digest);
        let dir = f.writer.bundle_dir(&f.digest);
        let csv = fs::read_to_string(dir.join(csv_name(&hash))).unwrap();
        assert_eq!(csv.lines().count(), 9);
        assert!(verify_bundle(&dir, &hash, &f.media).unwrap().verified);
    }
}
